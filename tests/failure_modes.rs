//! Failure-mode tests for the SQL cache.
//!
//! Tables disappearing under a running cache, a closed pool, and rejected
//! type names. Reads must degrade to empty results with errored metrics;
//! writes must surface a `CacheError` without panicking.
//!
//! Run with: `cargo test --test failure_modes`

mod common;

use cats_sql::{CacheData, CacheError, RelationshipFilter, WriteableCache};
use common::{ids, instance, sqlite_cache};

async fn drop_table(cache: &cats_sql::SqlCache, table: &str) {
    sqlx::query(&format!("DROP TABLE {}", table))
        .execute(cache.backend().pool())
        .await
        .unwrap();
}

// =============================================================================
// Missing tables
// =============================================================================

#[tokio::test]
async fn failure_read_of_unknown_type_reports_errored_metrics() {
    let t = sqlite_cache().await;

    let found = t
        .cache
        .get_all_by_ids("neverWritten", &ids(&["a", "b"]), &RelationshipFilter::all())
        .await;
    assert!(found.is_empty());

    let (cache_type, stats) = t.metrics.last_get().unwrap();
    assert_eq!(cache_type, "neverWritten");
    assert!(stats.is_errored());
    assert_eq!(stats.requested_size, -1);
    assert_eq!(stats.relationships_requested, -1);
}

#[tokio::test]
async fn failure_table_dropped_underneath_cache() {
    let t = sqlite_cache().await;
    let cache = &t.cache;

    cache.merge("instances", instance("i-1", "web", &[])).await.unwrap();
    drop_table(cache, "cats_v1_instances").await;

    assert!(cache.get("instances", "i-1", &RelationshipFilter::all()).await.is_none());
    assert!(t.metrics.last_get().unwrap().1.is_errored());
    assert!(cache.get_identifiers("instances").await.is_empty());

    let err = cache.merge("instances", instance("i-1", "web", &[])).await.unwrap_err();
    assert!(err.is_table_missing());

    // Forgetting the created set re-runs the DDL on the next write
    cache.clear_created_tables();
    cache.merge("instances", instance("i-1", "web", &[])).await.unwrap();
    assert_eq!(cache.get_identifiers("instances").await, ids(&["i-1"]));
}

#[tokio::test]
async fn failure_relationship_table_dropped_degrades_reads() {
    let t = sqlite_cache().await;
    let cache = &t.cache;

    cache.merge("instances", instance("i-1", "web", &["sg-1"])).await.unwrap();
    drop_table(cache, "cats_v1_instances_rel").await;

    // Bodies-only reads never touch the relationship table
    let bare = cache.get("instances", "i-1", &RelationshipFilter::none()).await;
    assert!(bare.is_some());

    let with_rels = cache.get("instances", "i-1", &RelationshipFilter::all()).await;
    assert!(with_rels.is_none());
}

#[tokio::test]
async fn failure_evict_from_missing_table_is_reported() {
    let t = sqlite_cache().await;
    let cache = &t.cache;

    cache.merge("instances", instance("i-1", "web", &[])).await.unwrap();
    drop_table(cache, "cats_v1_instances").await;

    let outcome = cache.evict_all("instances", &ids(&["i-1", "i-2", "i-3"])).await.unwrap();
    assert!(!outcome.report.is_success());
    assert_eq!(outcome.report.batches, 2);
    assert_eq!(outcome.report.failed, 3);
    assert_eq!(outcome.stats.items_deleted, 0);
    assert!(outcome.report.errors.iter().all(CacheError::is_table_missing));
}

// =============================================================================
// Closed pool
// =============================================================================

#[tokio::test]
async fn failure_closed_pool_degrades_reads_and_fails_writes() {
    let t = sqlite_cache().await;
    let cache = &t.cache;

    cache.merge("instances", instance("i-1", "web", &[])).await.unwrap();
    cache.backend().pool().close().await;

    assert!(cache.get_all("instances", &RelationshipFilter::all()).await.is_empty());
    assert!(t.metrics.last_get().unwrap().1.is_errored());
    assert!(cache.filter_identifiers("instances", "i-*").await.is_empty());
    assert!(cache
        .existing_identifiers("instances", &ids(&["i-1"]))
        .await
        .is_empty());

    let err = cache.merge("instances", instance("i-2", "api", &[])).await.unwrap_err();
    assert!(matches!(err, CacheError::Transient(_) | CacheError::Backend(_)));
}

// =============================================================================
// Rejected input
// =============================================================================

#[tokio::test]
async fn failure_invalid_type_names_are_rejected() {
    let t = sqlite_cache().await;
    let cache = &t.cache;

    let err = cache.merge("bad type!", CacheData::new("x")).await.unwrap_err();
    assert!(matches!(err, CacheError::InvalidType(_)));

    let long_type = "t".repeat(80);
    let err = cache.merge(&long_type, CacheData::new("x")).await.unwrap_err();
    assert!(matches!(err, CacheError::InvalidType(_)));

    assert!(cache.get_all("bad type!", &RelationshipFilter::all()).await.is_empty());
    assert!(cache.evict("bad type!", "x").await.is_err());
}

#[tokio::test]
async fn failure_relationship_to_invalid_type_is_skipped() {
    let t = sqlite_cache().await;
    let cache = &t.cache;

    cache.merge("instances", CacheData::new("i-1")).await.unwrap();
    let outcome = cache
        .merge_all_with(
            "instances",
            None,
            vec![CacheData::new("i-1")
                .with_relationship("bad type!:agent", ["x"])
                .with_relationship("securityGroups:agent", ["sg-1"])],
            false,
            false,
        )
        .await
        .unwrap();

    // Only the usable edge is written, forward and reverse
    assert_eq!(outcome.stats.relationships_stored, 2);
    let found = cache.get("instances", "i-1", &RelationshipFilter::all()).await.unwrap();
    assert_eq!(found.relationships.len(), 1);
}
