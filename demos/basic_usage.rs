// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic cats-sql usage example.
//!
//! Demonstrates:
//! 1. Opening a cache on a throwaway SQLite file
//! 2. Authoritative writes for two cache types
//! 3. An informative write linking them
//! 4. Reads with and without relationship filters
//! 5. Identifier queries and eviction
//! 6. Displaying the recorded metrics
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use cats_sql::{CacheData, RelationshipFilter, SqlCache, SqlCacheConfig, SqlCacheMetrics, WriteableCache};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt().with_target(false).compact().init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║             cats-sql: Basic Usage Example                     ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Open the cache
    // ─────────────────────────────────────────────────────────────────────────
    let dir = tempfile::tempdir()?;
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("cats.db").display());
    println!("📦 Opening cache at {}", url);

    let config = SqlCacheConfig {
        sql_url: Some(url),
        table_namespace: Some("demo".into()),
        ..Default::default()
    };
    let (_config_tx, config_rx) = watch::channel(config);
    let cache = SqlCache::connect(config_rx, Arc::new(SqlCacheMetrics)).await?;
    println!("   Native upsert: {}", cache.supports_native_upsert());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Authoritative writes
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Writing instances and security groups...");
    let instances: Vec<CacheData> = (1..=3)
        .map(|i| {
            CacheData::new(format!("i-{}", i))
                .with_attribute("name", json!(format!("web-{}", i)))
                .with_attribute("application", json!("frontend"))
        })
        .collect();
    let outcome = cache
        .merge_all_with("instances", Some("aws/InstanceAgent"), instances, true, true)
        .await?;
    println!("   instances: stored {} of {}", outcome.stats.items_stored, outcome.stats.item_count);

    let groups = vec![CacheData::new("sg-1"), CacheData::new("sg-2")];
    cache
        .merge_all_with("securityGroups", Some("aws/SecurityGroupAgent"), groups, true, true)
        .await?;

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Informative write: instance -> security group edges
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔗 Linking instances to security groups...");
    let edges = vec![
        CacheData::new("i-1").with_relationship("securityGroups:aws/InstanceAgent", ["sg-1", "sg-2"]),
        CacheData::new("i-2").with_relationship("securityGroups:aws/InstanceAgent", ["sg-1"]),
    ];
    let outcome = cache.merge_all_with("instances", None, edges, false, true).await?;
    println!("   relationships stored: {}", outcome.stats.relationships_stored);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Reads
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔍 Reading back...");
    if let Some(group) = cache.get("securityGroups", "sg-1", &RelationshipFilter::all()).await {
        println!("   sg-1 -> {:?}", group.relationships);
    }
    if let Some(instance) = cache.get("instances", "i-1", &RelationshipFilter::none()).await {
        println!("   i-1 attributes: {}", serde_json::to_string(&instance.attributes)?);
    }
    let frontend = cache
        .get_all_by_application("instances", "frontend", &RelationshipFilter::all())
        .await;
    println!("   frontend instances: {}", frontend.len());

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Identifiers and eviction
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🗂  Identifiers...");
    println!("   i-*: {:?}", cache.filter_identifiers("instances", "i-*").await);
    cache.evict("instances", "i-3").await?;
    println!("   after evicting i-3: {:?}", cache.get_identifiers("instances").await);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Metrics:");
    dump_metrics(&snapshotter);

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Print captured counters and latency histograms.
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut counters = Vec::new();
    let mut histograms = Vec::new();

    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        match value {
            DebugValue::Counter(v) => counters.push((key.name().to_string(), label_str, v)),
            DebugValue::Histogram(samples) => {
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                histograms.push((key.name().to_string(), label_str, samples.len(), sum));
            }
            DebugValue::Gauge(_) => {}
        }
    }

    counters.sort();
    histograms.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    println!("   ┌─ Counters");
    for (name, labels, value) in &counters {
        println!("   │  └─ {}{} = {}", name, labels, value);
    }
    println!("   └─ Latency");
    for (name, labels, count, sum) in &histograms {
        println!("      └─ {}{} count={} sum={:.4}s", name, labels, count, sum);
    }
}
