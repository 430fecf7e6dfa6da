// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Identifier listing, glob filtering and existence checks.
//!
//! All three degrade to an empty list on failure.

use super::SqlCache;
use crate::batching::QueryBatcher;
use crate::metrics::LatencyTimer;
use crate::resilience::retry::retry;
use crate::storage::dialect::{is_wildcard_glob, placeholders};
use crate::storage::sql::text_column;
use crate::storage::traits::CacheError;
use std::collections::HashSet;
use tracing::warn;

impl SqlCache {
    async fn select_ids(
        &self,
        operation: &str,
        sql: &str,
        binds: &[String],
    ) -> Result<Vec<String>, CacheError> {
        let config = self.config();
        let rows = retry(operation, &config.reads.to_retry_config(), || async {
            let mut query = sqlx::query(sql);
            for value in binds {
                query = query.bind(value.as_str());
            }
            query.fetch_all(self.backend.pool()).await.map_err(CacheError::from)
        })
        .await?;
        Ok(rows.iter().filter_map(|row| text_column(row, "id")).collect())
    }

    pub(crate) async fn list_identifiers(&self, cache_type: &str) -> Vec<String> {
        let handle = match self.tables.resolve(cache_type) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(cache_type = %cache_type, error = %e, "Rejected identifier listing");
                return Vec::new();
            }
        };
        let _timer = LatencyTimer::new("get_identifiers");
        let sql = format!("SELECT DISTINCT id FROM {}", handle.resource());

        self.select_ids("get_identifiers", &sql, &[])
            .await
            .unwrap_or_else(|e| {
                self.log_read_failure("get_identifiers", cache_type, &e);
                Vec::new()
            })
    }

    /// Ids matching `glob`. Wildcard globs use the dialect's pattern
    /// matcher; anything else is an exact, case-sensitive id match.
    pub(crate) async fn match_identifiers(&self, cache_type: &str, glob: &str) -> Vec<String> {
        let handle = match self.tables.resolve(cache_type) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(cache_type = %cache_type, error = %e, "Rejected identifier filter");
                return Vec::new();
            }
        };
        let _timer = LatencyTimer::new("filter_identifiers");

        let (predicate, pattern) = if is_wildcard_glob(glob) {
            let (predicate, pattern) = self.backend.dialect().glob_filter(glob);
            (predicate.to_string(), pattern)
        } else {
            ("id = ?".to_string(), glob.to_string())
        };
        let sql = format!("SELECT DISTINCT id FROM {} WHERE {}", handle.resource(), predicate);

        self.select_ids("filter_identifiers", &sql, &[pattern])
            .await
            .unwrap_or_else(|e| {
                self.log_read_failure("filter_identifiers", cache_type, &e);
                Vec::new()
            })
    }

    /// The subset of `ids` present in the type, batched like reads.
    pub(crate) async fn present_identifiers(&self, cache_type: &str, ids: &[String]) -> Vec<String> {
        if ids.is_empty() {
            return Vec::new();
        }
        let handle = match self.tables.resolve(cache_type) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(cache_type = %cache_type, error = %e, "Rejected existence check");
                return Vec::new();
            }
        };
        let _timer = LatencyTimer::new("existing_identifiers");
        let config = self.config();
        let batcher = QueryBatcher::new(config.read_batch(), config.concurrency());
        let table = handle.resource();

        let outcome = batcher
            .run(ids, |chunk| async move {
                let sql = format!(
                    "SELECT DISTINCT id FROM {} WHERE id IN ({})",
                    table,
                    placeholders(chunk.len())
                );
                self.select_ids("existing_identifiers", &sql, chunk).await
            })
            .await;

        if let Some(e) = outcome.first_error() {
            self.log_read_failure("existing_identifiers", cache_type, e);
            return Vec::new();
        }

        let mut seen = HashSet::new();
        outcome
            .results
            .into_iter()
            .flatten()
            .filter(|id| seen.insert(id.clone()))
            .collect()
    }
}
