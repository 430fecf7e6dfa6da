// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the SQL cache.
//!
//! The cache reports per-call statistics to a [`CacheMetrics`] sink. The
//! default [`SqlCacheMetrics`] forwards them to the `metrics` crate; the
//! embedding service chooses the exporter (Prometheus, OTEL, etc.).
//!
//! # Metric Naming Convention
//! - `cats_sql_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `prefix`: cache name from [`crate::SqlCacheConfig::name`]
//! - `type`: cache type
//! - `operation`: merge, evict, get, ...

use metrics::{counter, histogram, Label};
use std::time::{Duration, Instant};

/// Counters for one merge call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub item_count: usize,
    pub items_stored: usize,
    pub relationship_count: usize,
    pub relationships_stored: usize,
    pub select_operations: usize,
    pub write_operations: usize,
    pub delete_operations: usize,
}

/// Counters for one evict call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictStats {
    pub item_count: usize,
    pub items_deleted: usize,
    pub delete_operations: usize,
}

/// Counters for one read call.
///
/// A failed read reports `-1` for the requested size and relationship
/// counts so errored reads can be told apart from empty ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetStats {
    pub item_count: i64,
    pub requested_size: i64,
    pub relationships_requested: i64,
    pub select_operations: i64,
    pub async_fanout: bool,
}

impl GetStats {
    pub(crate) fn errored() -> Self {
        Self {
            item_count: 0,
            requested_size: -1,
            relationships_requested: -1,
            select_operations: -1,
            async_fanout: false,
        }
    }

    pub fn is_errored(&self) -> bool {
        self.requested_size < 0
    }
}

/// Sink for cache statistics.
pub trait CacheMetrics: Send + Sync {
    fn merge(&self, prefix: &str, cache_type: &str, stats: &MergeStats);
    fn evict(&self, prefix: &str, cache_type: &str, stats: &EvictStats);
    fn get(&self, prefix: &str, cache_type: &str, stats: &GetStats);
}

/// [`CacheMetrics`] backed by the `metrics` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlCacheMetrics;

impl CacheMetrics for SqlCacheMetrics {
    fn merge(&self, prefix: &str, cache_type: &str, stats: &MergeStats) {
        let labels = type_labels(prefix, cache_type);
        counter!("cats_sql_merge_items_total", labels.clone()).increment(stats.item_count as u64);
        counter!("cats_sql_merge_items_stored_total", labels.clone()).increment(stats.items_stored as u64);
        counter!("cats_sql_merge_relationships_total", labels.clone())
            .increment(stats.relationship_count as u64);
        counter!("cats_sql_merge_relationships_stored_total", labels.clone())
            .increment(stats.relationships_stored as u64);
        record_operations(prefix, cache_type, "merge", stats.select_operations, stats.write_operations, stats.delete_operations);
    }

    fn evict(&self, prefix: &str, cache_type: &str, stats: &EvictStats) {
        let labels = type_labels(prefix, cache_type);
        counter!("cats_sql_evict_items_total", labels.clone()).increment(stats.item_count as u64);
        counter!("cats_sql_evict_items_deleted_total", labels.clone()).increment(stats.items_deleted as u64);
        record_operations(prefix, cache_type, "evict", 0, 0, stats.delete_operations);
    }

    fn get(&self, prefix: &str, cache_type: &str, stats: &GetStats) {
        if stats.is_errored() {
            counter!(
                "cats_sql_get_errors_total",
                "prefix" => prefix.to_string(),
                "type" => cache_type.to_string()
            )
            .increment(1);
            return;
        }
        let mut labels = type_labels(prefix, cache_type);
        labels.push(Label::new("async", stats.async_fanout.to_string()));
        counter!("cats_sql_get_items_total", labels.clone()).increment(stats.item_count.max(0) as u64);
        counter!("cats_sql_get_requested_total", labels.clone()).increment(stats.requested_size.max(0) as u64);
        counter!("cats_sql_get_relationships_requested_total", labels.clone())
            .increment(stats.relationships_requested.max(0) as u64);
        record_operations(prefix, cache_type, "get", stats.select_operations.max(0) as usize, 0, 0);
    }
}

fn type_labels(prefix: &str, cache_type: &str) -> Vec<Label> {
    vec![
        Label::new("prefix", prefix.to_string()),
        Label::new("type", cache_type.to_string()),
    ]
}

/// Record SQL statement counts for one call.
pub fn record_operations(
    prefix: &str,
    cache_type: &str,
    operation: &str,
    selects: usize,
    writes: usize,
    deletes: usize,
) {
    for (kind, count) in [("select", selects), ("write", writes), ("delete", deletes)] {
        if count == 0 {
            continue;
        }
        counter!(
            "cats_sql_statements_total",
            "prefix" => prefix.to_string(),
            "type" => cache_type.to_string(),
            "operation" => operation.to_string(),
            "kind" => kind
        )
        .increment(count as u64);
    }
}

/// Record operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "cats_sql_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a table bootstrap attempt
pub fn record_table_created(cache_type: &str, status: &str) {
    counter!(
        "cats_sql_tables_created_total",
        "type" => cache_type.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a fallback from native upsert to row-by-row writes
pub fn record_upsert_fallback(cache_type: &str) {
    counter!(
        "cats_sql_upsert_fallback_total",
        "type" => cache_type.to_string()
    )
    .increment(1);
}

/// Guard that records latency when dropped.
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}
