// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The SQL-backed cache.
//!
//! [`SqlCache`] stores each cache type in its own pair of tables and keeps a
//! relationship graph alongside the entity bodies.
//!
//! # Write disciplines
//!
//! - **Authoritative** writes replace an agent's view of a type: bodies are
//!   hashed, only changed bodies are written, and with `cleanup` every id the
//!   agent stored before but did not send now is deleted.
//! - **Informative** writes only contribute relationships: each edge is
//!   stored as a forward row under the source type and a reverse row under
//!   the related type. With `cleanup`, edges the source key no longer
//!   reports are removed from both sides.
//!
//! # Module layout
//!
//! - `bootstrap`: lazy per-type table creation
//! - `write`: merge, evict and on-demand cleanup
//! - `read`: entity reads and relationship merging
//! - `identifiers`: id listing, glob filtering and existence checks
//!
//! # Example
//!
//! ```rust,no_run
//! use cats_sql::{CacheData, RelationshipFilter, SqlCache, SqlCacheConfig, SqlCacheMetrics, WriteableCache};
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! # async fn example() -> Result<(), cats_sql::CacheError> {
//! let config = SqlCacheConfig {
//!     sql_url: Some("sqlite://cache.db?mode=rwc".into()),
//!     ..Default::default()
//! };
//! let (_tx, rx) = watch::channel(config);
//! let cache = SqlCache::connect(rx, Arc::new(SqlCacheMetrics)).await?;
//!
//! let instance = CacheData::new("i-1").with_relationship("securityGroups", ["sg-1"]);
//! cache
//!     .merge_all_with("instances", Some("clouddriver-agent"), vec![instance], true, true)
//!     .await?;
//!
//! let found = cache.get("instances", "i-1", &RelationshipFilter::all()).await;
//! assert!(found.is_some());
//! # Ok(())
//! # }
//! ```

mod bootstrap;
mod identifiers;
mod read;
pub mod types;
mod write;

use crate::cache_data::{CacheData, RelationshipFilter};
use crate::config::SqlCacheConfig;
use crate::metrics::CacheMetrics;
use crate::schema::TableRegistry;
use crate::storage::dialect::Dialect;
use crate::storage::sql::SqlBackend;
use crate::storage::traits::{CacheError, WriteableCache};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

pub use types::{BatchReport, EvictOutcome, MergeOutcome};

/// Id that stands for "every entry" and is never stored.
pub const ALL_ID: &str = "_ALL_";

/// Agent recorded when none is given or derivable.
pub const UNKNOWN_AGENT: &str = "unknown";

/// SQL-backed implementation of [`WriteableCache`].
pub struct SqlCache {
    backend: SqlBackend,
    tables: TableRegistry,
    config_rx: watch::Receiver<SqlCacheConfig>,
    prefix: String,
    metrics: Arc<dyn CacheMetrics>,
    native_upsert: AtomicBool,
}

impl std::fmt::Debug for SqlCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlCache")
            .field("prefix", &self.prefix)
            .field("dialect", &self.backend.dialect())
            .field("native_upsert", &self.supports_native_upsert())
            .finish()
    }
}

impl SqlCache {
    /// Connect to `sql_url` from the current config.
    pub async fn connect(
        config_rx: watch::Receiver<SqlCacheConfig>,
        metrics: Arc<dyn CacheMetrics>,
    ) -> Result<Self, CacheError> {
        let config = config_rx.borrow().clone();
        let url = config
            .sql_url
            .as_deref()
            .ok_or_else(|| CacheError::Backend("sql_url is not configured".to_string()))?;
        let backend = SqlBackend::connect(url, config.max_connections).await?;
        Ok(Self::with_backend(backend, config_rx, metrics).await)
    }

    /// Build on an already connected backend.
    ///
    /// Upsert capability is taken from `native_upsert` in the config when
    /// set, otherwise probed once here.
    pub async fn with_backend(
        backend: SqlBackend,
        config_rx: watch::Receiver<SqlCacheConfig>,
        metrics: Arc<dyn CacheMetrics>,
    ) -> Self {
        let config = config_rx.borrow().clone();
        let native_upsert = match config.native_upsert {
            Some(forced) => forced,
            None => backend.detect_native_upsert().await,
        };
        info!(
            name = %config.name,
            dialect = ?backend.dialect(),
            native_upsert,
            namespace = ?config.table_namespace,
            "SQL cache ready"
        );

        Self {
            tables: TableRegistry::new(config.table_namespace.as_deref()),
            prefix: config.name,
            backend,
            config_rx,
            metrics,
            native_upsert: AtomicBool::new(native_upsert),
        }
    }

    /// Snapshot of the current runtime config.
    pub fn config(&self) -> SqlCacheConfig {
        self.config_rx.borrow().clone()
    }

    pub fn dialect(&self) -> Dialect {
        self.backend.dialect()
    }

    pub fn backend(&self) -> &SqlBackend {
        &self.backend
    }

    pub fn tables(&self) -> &TableRegistry {
        &self.tables
    }

    /// Whether writes currently use the dialect's native upsert.
    pub fn supports_native_upsert(&self) -> bool {
        self.native_upsert.load(Ordering::Acquire)
    }

    /// Forget which tables were created so the next write re-runs the DDL.
    pub fn clear_created_tables(&self) {
        self.tables.clear_created();
    }
}

/// Current time in epoch millis.
pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl WriteableCache for SqlCache {
    async fn get_all(&self, cache_type: &str, filter: &RelationshipFilter) -> Vec<CacheData> {
        self.read_items(cache_type, None, filter).await
    }

    async fn get_all_by_ids(
        &self,
        cache_type: &str,
        ids: &[String],
        filter: &RelationshipFilter,
    ) -> Vec<CacheData> {
        self.read_items(cache_type, Some(ids), filter).await
    }

    async fn get_identifiers(&self, cache_type: &str) -> Vec<String> {
        self.list_identifiers(cache_type).await
    }

    async fn filter_identifiers(&self, cache_type: &str, glob: &str) -> Vec<String> {
        self.match_identifiers(cache_type, glob).await
    }

    async fn existing_identifiers(&self, cache_type: &str, ids: &[String]) -> Vec<String> {
        self.present_identifiers(cache_type, ids).await
    }

    async fn merge_all_with(
        &self,
        cache_type: &str,
        agent_hint: Option<&str>,
        items: Vec<CacheData>,
        authoritative: bool,
        cleanup: bool,
    ) -> Result<MergeOutcome, CacheError> {
        self.merge_items(cache_type, agent_hint, items, authoritative, cleanup).await
    }

    async fn evict_all(&self, cache_type: &str, ids: &[String]) -> Result<EvictOutcome, CacheError> {
        self.evict_items(cache_type, ids).await
    }
}
