//! Shared fixtures for the integration tests.
//!
//! Every test gets its own SQLite file in a temp directory, so tests run in
//! parallel without sharing tables.

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::watch;

use cats_sql::{
    CacheData, CacheMetrics, EvictStats, GetStats, MergeStats, RetryProperties, SqlCache,
    SqlCacheConfig,
};

pub const AGENT: &str = "clouddriver-agent";

/// A cache plus everything that must outlive it.
pub struct TestCache {
    pub cache: SqlCache,
    pub metrics: Arc<RecordingMetrics>,
    pub config_tx: watch::Sender<SqlCacheConfig>,
    _dir: TempDir,
}

/// Small batches and fast retries so batching paths run on a handful of rows.
pub fn test_config(url: String) -> SqlCacheConfig {
    SqlCacheConfig {
        sql_url: Some(url),
        max_connections: 4,
        read_batch_size: 2,
        write_batch_size: 2,
        max_query_concurrency: 3,
        reads: RetryProperties { max_retries: 2, backoff_ms: 5 },
        transactions: RetryProperties { max_retries: 2, backoff_ms: 5 },
        ..Default::default()
    }
}

pub async fn sqlite_cache() -> TestCache {
    sqlite_cache_with(|_| {}).await
}

pub async fn sqlite_cache_with(tweak: impl FnOnce(&mut SqlCacheConfig)) -> TestCache {
    init_tracing();
    let dir = tempfile::tempdir().expect("temp dir");
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("cache.db").display());

    let mut config = test_config(url);
    tweak(&mut config);

    let (config_tx, config_rx) = watch::channel(config);
    let metrics = Arc::new(RecordingMetrics::default());
    let cache = SqlCache::connect(config_rx, metrics.clone())
        .await
        .expect("connect to sqlite");

    TestCache { cache, metrics, config_tx, _dir: dir }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn instance(id: &str, name: &str, groups: &[&str]) -> CacheData {
    let item = CacheData::new(id).with_attribute("name", json!(name));
    if groups.is_empty() {
        return item;
    }
    item.with_relationship("securityGroups", groups.iter().copied())
}

pub fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

pub fn sorted(mut values: Vec<String>) -> Vec<String> {
    values.sort();
    values
}

/// Metrics sink that keeps every call for assertions.
#[derive(Default)]
pub struct RecordingMetrics {
    pub merges: Mutex<Vec<(String, MergeStats)>>,
    pub evicts: Mutex<Vec<(String, EvictStats)>>,
    pub gets: Mutex<Vec<(String, GetStats)>>,
}

impl RecordingMetrics {
    pub fn last_get(&self) -> Option<(String, GetStats)> {
        self.gets.lock().last().cloned()
    }

    pub fn merge_count(&self) -> usize {
        self.merges.lock().len()
    }
}

impl CacheMetrics for RecordingMetrics {
    fn merge(&self, _prefix: &str, cache_type: &str, stats: &MergeStats) {
        self.merges.lock().push((cache_type.to_string(), *stats));
    }

    fn evict(&self, _prefix: &str, cache_type: &str, stats: &EvictStats) {
        self.evicts.lock().push((cache_type.to_string(), *stats));
    }

    fn get(&self, _prefix: &str, cache_type: &str, stats: &GetStats) {
        self.gets.lock().push((cache_type.to_string(), *stats));
    }
}
