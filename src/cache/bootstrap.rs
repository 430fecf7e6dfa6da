// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Lazy per-type table creation.

use super::SqlCache;
use crate::metrics::record_table_created;
use crate::schema::{TableHandle, ON_DEMAND_TYPE};
use crate::storage::traits::CacheError;
use std::sync::Arc;
use tracing::{debug, error};

impl SqlCache {
    /// Resolve a type's tables, creating them (and the on-demand tables) the
    /// first time this instance sees the type.
    ///
    /// DDL failures are logged and leave the type un-created so the next
    /// call tries again; only an invalid type name is an error.
    pub(crate) async fn ensure_tables(&self, cache_type: &str) -> Result<Arc<TableHandle>, CacheError> {
        let handle = self.tables.resolve(cache_type)?;
        if handle.is_created() {
            return Ok(handle);
        }

        self.create_tables(&handle).await;

        if cache_type != ON_DEMAND_TYPE {
            let on_demand = self.tables.resolve(ON_DEMAND_TYPE)?;
            if !on_demand.is_created() {
                self.create_tables(&on_demand).await;
            }
        }
        Ok(handle)
    }

    async fn create_tables(&self, handle: &TableHandle) {
        let dialect = self.backend.dialect();
        let statements = dialect
            .resource_table_ddl(handle.resource())
            .into_iter()
            .chain(dialect.relationship_table_ddl(handle.relationship()));

        for ddl in statements {
            if let Err(e) = sqlx::query(&ddl).execute(self.backend.pool()).await {
                error!(
                    cache_type = %handle.cache_type(),
                    error = %e,
                    "Failed to create cache tables"
                );
                record_table_created(handle.cache_type(), "error");
                return;
            }
        }

        handle.mark_created();
        record_table_created(handle.cache_type(), "success");
        debug!(
            cache_type = %handle.cache_type(),
            resource = %handle.resource(),
            relationship = %handle.relationship(),
            "Cache tables ready"
        );
    }
}
