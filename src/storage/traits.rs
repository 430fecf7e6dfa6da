// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use crate::cache::types::{EvictOutcome, MergeOutcome};
use crate::cache_data::{CacheData, RelationshipFilter};
use crate::resilience::retry::Retryable;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Table does not exist: {0}")]
    TableMissing(String),
    #[error("Not supported by this SQL dialect: {0}")]
    DialectUnsupported(String),
    #[error("Invalid cache type '{0}'")]
    InvalidType(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Transient SQL error: {0}")]
    Transient(String),
    #[error("SQL error: {0}")]
    Sql(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl CacheError {
    pub fn is_table_missing(&self) -> bool {
        matches!(self, Self::TableMissing(_))
    }

    /// Classify an error raised by a native upsert statement. Syntax errors
    /// mean the dialect lacks the clause rather than a bad row.
    pub(crate) fn from_upsert(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if is_syntax_error(db.code().as_deref(), db.message()) => {
                Self::DialectUnsupported(db.message().to_string())
            }
            _ => err.into(),
        }
    }
}

fn is_table_missing(code: Option<&str>, message: &str) -> bool {
    code == Some("42S02") || message.contains("doesn't exist") || message.contains("no such table")
}

fn is_syntax_error(code: Option<&str>, message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    (code == Some("42000") && message.contains("syntax")) || message.contains("syntax error")
}

fn is_lock_contention(code: Option<&str>, message: &str) -> bool {
    code == Some("40001")
        || message.contains("database is locked")
        || message.contains("Lock wait timeout")
        || message.contains("Deadlock found")
}

impl From<sqlx::Error> for CacheError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                let code = db.code();
                let message = db.message();
                if is_table_missing(code.as_deref(), message) {
                    Self::TableMissing(message.to_string())
                } else if is_lock_contention(code.as_deref(), message) {
                    Self::Transient(message.to_string())
                } else {
                    Self::Sql(message.to_string())
                }
            }
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Protocol(_) => Self::Transient(err.to_string()),
            _ => Self::Backend(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl Retryable for CacheError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Sql(_))
    }
}

/// The cache contract: typed reads, authoritative and informative writes,
/// evictions and identifier queries.
///
/// Reads never fail; backend errors degrade to an empty result and are
/// logged and reported to metrics. Writes return `Err` only when the whole
/// call failed. Per-batch failures are collected in the returned outcome.
#[async_trait]
pub trait WriteableCache: Send + Sync {
    async fn get(&self, cache_type: &str, id: &str, filter: &RelationshipFilter) -> Option<CacheData> {
        self.get_all_by_ids(cache_type, &[id.to_string()], filter)
            .await
            .into_iter()
            .next()
    }

    /// Every entry of a type.
    async fn get_all(&self, cache_type: &str, filter: &RelationshipFilter) -> Vec<CacheData>;

    async fn get_all_by_ids(
        &self,
        cache_type: &str,
        ids: &[String],
        filter: &RelationshipFilter,
    ) -> Vec<CacheData>;

    async fn get_identifiers(&self, cache_type: &str) -> Vec<String>;

    /// Ids matching a glob (`*`, `?`, `[...]`).
    async fn filter_identifiers(&self, cache_type: &str, glob: &str) -> Vec<String>;

    /// The subset of `ids` that exist.
    async fn existing_identifiers(&self, cache_type: &str, ids: &[String]) -> Vec<String>;

    /// Authoritative write of one entry without cleanup.
    async fn merge(&self, cache_type: &str, item: CacheData) -> Result<MergeOutcome, CacheError> {
        self.merge_all(cache_type, vec![item]).await
    }

    /// Authoritative write without cleanup.
    async fn merge_all(&self, cache_type: &str, items: Vec<CacheData>) -> Result<MergeOutcome, CacheError> {
        self.merge_all_with(cache_type, None, items, true, false).await
    }

    async fn merge_all_with(
        &self,
        cache_type: &str,
        agent_hint: Option<&str>,
        items: Vec<CacheData>,
        authoritative: bool,
        cleanup: bool,
    ) -> Result<MergeOutcome, CacheError>;

    async fn evict(&self, cache_type: &str, id: &str) -> Result<EvictOutcome, CacheError> {
        self.evict_all(cache_type, &[id.to_string()]).await
    }

    async fn evict_all(&self, cache_type: &str, ids: &[String]) -> Result<EvictOutcome, CacheError>;
}
