// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Merge, evict and on-demand cleanup.

use super::types::{BatchReport, EvictOutcome, MergeOutcome, RelationshipRow, ResourceRow};
use super::{now_millis, SqlCache, ALL_ID, UNKNOWN_AGENT};
use crate::cache_data::{relationship_agent, relationship_type, CacheData};
use crate::config::SqlCacheConfig;
use crate::hashing::{body_hash, shorten_agent};
use crate::metrics::{record_upsert_fallback, EvictStats, LatencyTimer};
use crate::resilience::retry::retry;
use crate::schema::{TableHandle, ON_DEMAND_AGENT, ON_DEMAND_TYPE};
use crate::storage::dialect::{
    placeholders, row_placeholders, Dialect, RELATIONSHIP_COLUMNS, RELATIONSHIP_COLUMN_COUNT,
    RESOURCE_COLUMNS, RESOURCE_COLUMN_COUNT,
};
use crate::storage::sql::text_column;
use crate::storage::traits::CacheError;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Relationship key plus `id|rel_id`.
type EdgeKey = (String, String);

fn edge_key(id: &str, rel_id: &str) -> String {
    format!("{}|{}", id, rel_id)
}

/// A relationship row loaded for diffing.
#[derive(Debug)]
struct StoredEdge {
    uuid: String,
    owner_type: Option<String>,
}

/// Statements for the row-by-row write path.
struct RowStatements {
    probe: String,
    update: String,
    insert: String,
}

impl RowStatements {
    fn new(dialect: Dialect, table: &str) -> Self {
        Self {
            probe: format!(
                "SELECT id FROM {} WHERE id = ? AND agent = ?{}",
                table,
                dialect.row_lock_suffix()
            ),
            update: format!(
                "UPDATE {} SET application = ?, body_hash = ?, body = ?, last_updated = ? WHERE id = ? AND agent = ?",
                table
            ),
            insert: format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                RESOURCE_COLUMNS,
                placeholders(RESOURCE_COLUMN_COUNT)
            ),
        }
    }
}

/// Agent that owns an authoritative batch.
pub(crate) fn resolve_agent(
    cache_type: &str,
    agent_hint: Option<&str>,
    items: &[CacheData],
    max_len: usize,
) -> String {
    if cache_type == ON_DEMAND_TYPE {
        return ON_DEMAND_AGENT.to_string();
    }
    let agent = agent_hint
        .filter(|a| !a.is_empty())
        .or_else(|| {
            items
                .first()
                .and_then(|item| item.relationships.keys().next())
                .map(|key| relationship_agent(key))
        })
        .unwrap_or(UNKNOWN_AGENT);
    shorten_agent(agent, max_len)
}

impl SqlCache {
    #[tracing::instrument(skip(self, items), fields(items = items.len()))]
    pub(crate) async fn merge_items(
        &self,
        cache_type: &str,
        agent_hint: Option<&str>,
        items: Vec<CacheData>,
        authoritative: bool,
        cleanup: bool,
    ) -> Result<MergeOutcome, CacheError> {
        let items: Vec<CacheData> = items.into_iter().filter(|item| item.id != ALL_ID).collect();

        // An authoritative agent reporting nothing still needs its old rows removed
        let empty_cleanup = items.is_empty() && authoritative && cleanup && agent_hint.is_some();
        if cache_type.is_empty() || (items.is_empty() && !empty_cleanup) {
            return Ok(MergeOutcome::default());
        }

        let _timer = LatencyTimer::new("merge");
        let config = self.config();
        let handle = self.ensure_tables(cache_type).await?;

        let outcome = if authoritative {
            self.merge_authoritative(&config, &handle, agent_hint, items, cleanup).await?
        } else {
            self.merge_informative(&config, &handle, items, cleanup).await?
        };

        self.metrics.merge(&self.prefix, cache_type, &outcome.stats);
        if !outcome.report.is_success() {
            warn!(
                cache_type = %cache_type,
                failed = outcome.report.failed,
                errors = outcome.report.errors.len(),
                "Merge completed with failed batches"
            );
        }
        Ok(outcome)
    }

    async fn merge_authoritative(
        &self,
        config: &SqlCacheConfig,
        handle: &TableHandle,
        agent_hint: Option<&str>,
        items: Vec<CacheData>,
        cleanup: bool,
    ) -> Result<MergeOutcome, CacheError> {
        let agent = resolve_agent(handle.cache_type(), agent_hint, &items, config.agent_length());
        let mut outcome = MergeOutcome::default();
        outcome.stats.item_count = items.len();

        let existing = self.load_agent_hashes(config, handle, &agent).await?;
        outcome.stats.select_operations += 1;
        let existing_hashes: HashSet<&str> = existing.iter().map(|(_, hash)| hash.as_str()).collect();

        let now = now_millis();
        let mut seen: HashSet<String> = HashSet::with_capacity(items.len());
        let mut rows = Vec::new();

        for mut item in items {
            if item.id.chars().count() > config.max_id_length {
                error!(
                    cache_type = %handle.cache_type(),
                    id = %item.id,
                    max = config.max_id_length,
                    "Dropping item with over-long id"
                );
                outcome.oversized += 1;
                continue;
            }
            if !seen.insert(item.id.clone()) {
                warn!(cache_type = %handle.cache_type(), id = %item.id, "Duplicate id in batch, skipping");
                outcome.duplicates += 1;
                continue;
            }

            item.prepare_for_storage();
            outcome.stats.relationship_count +=
                item.relationships.values().map(BTreeSet::len).sum::<usize>();

            let body = match serde_json::to_string(&item) {
                Ok(body) => body,
                Err(e) => {
                    error!(cache_type = %handle.cache_type(), id = %item.id, error = %e, "Failed to serialize item");
                    continue;
                }
            };
            let Some(hash) = body_hash(&body) else {
                continue;
            };
            if existing_hashes.contains(hash.as_str()) {
                continue;
            }

            let application = item.application().map(str::to_string);
            rows.push(ResourceRow {
                id: item.id,
                agent: agent.clone(),
                application,
                body_hash: hash,
                body,
                last_updated: now,
            });
        }

        if !rows.is_empty() {
            self.write_resources(config, handle, &rows, &mut outcome).await;
        }

        if cleanup {
            let stale: Vec<String> = existing
                .iter()
                .map(|(id, _)| id)
                .filter(|id| !seen.contains(*id))
                .cloned()
                .collect();
            if !stale.is_empty() {
                debug!(
                    cache_type = %handle.cache_type(),
                    agent = %agent,
                    count = stale.len(),
                    "Removing entries no longer reported by agent"
                );
                let report = self.delete_resources(config, handle, Some(&agent), &stale).await;
                outcome.stats.delete_operations += report.batches;
                outcome.report.absorb(report);
            }
        }

        Ok(outcome)
    }

    async fn load_agent_hashes(
        &self,
        config: &SqlCacheConfig,
        handle: &TableHandle,
        agent: &str,
    ) -> Result<Vec<(String, String)>, CacheError> {
        let sql = format!("SELECT id, body_hash FROM {} WHERE agent = ?", handle.resource());
        let rows = retry("load_agent_hashes", &config.reads.to_retry_config(), || async {
            sqlx::query(&sql)
                .bind(agent)
                .fetch_all(self.backend.pool())
                .await
                .map_err(CacheError::from)
        })
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| Some((text_column(row, "id")?, text_column(row, "body_hash")?)))
            .collect())
    }

    async fn write_resources(
        &self,
        config: &SqlCacheConfig,
        handle: &TableHandle,
        rows: &[ResourceRow],
        outcome: &mut MergeOutcome,
    ) {
        let policy = config.transactions.to_retry_config();

        for chunk in rows.chunks(config.write_batch()) {
            if self.supports_native_upsert() {
                let sql = self.backend.dialect().upsert_resources_sql(handle.resource(), chunk.len());
                match retry("upsert_resources", &policy, || self.upsert_chunk(&sql, chunk)).await {
                    Ok(()) => {
                        outcome.stats.write_operations += 1;
                        outcome.stats.items_stored += chunk.len();
                        outcome.report.record_success(chunk.len());
                        continue;
                    }
                    Err(CacheError::DialectUnsupported(reason)) => {
                        warn!(
                            cache_type = %handle.cache_type(),
                            reason = %reason,
                            "Native upsert rejected, switching to row-by-row writes"
                        );
                        self.native_upsert.store(false, Ordering::Release);
                        record_upsert_fallback(handle.cache_type());
                    }
                    Err(e) => {
                        self.log_write_failure("upsert_resources", handle.cache_type(), &e);
                        outcome.stats.write_operations += 1;
                        outcome.report.record_failure(chunk.len(), e);
                        continue;
                    }
                }
            }
            self.write_rows_individually(config, handle, chunk, outcome).await;
        }
    }

    async fn upsert_chunk(&self, sql: &str, chunk: &[ResourceRow]) -> Result<(), CacheError> {
        let mut query = sqlx::query(sql);
        for row in chunk {
            query = query
                .bind(row.id.as_str())
                .bind(row.agent.as_str())
                .bind(row.application.as_deref())
                .bind(row.body_hash.as_str())
                .bind(row.body.as_str())
                .bind(row.last_updated);
        }
        query
            .execute(self.backend.pool())
            .await
            .map_err(CacheError::from_upsert)?;
        Ok(())
    }

    async fn write_rows_individually(
        &self,
        config: &SqlCacheConfig,
        handle: &TableHandle,
        chunk: &[ResourceRow],
        outcome: &mut MergeOutcome,
    ) {
        let policy = config.transactions.to_retry_config();
        let statements = RowStatements::new(self.backend.dialect(), handle.resource());

        for row in chunk {
            outcome.stats.select_operations += 1;
            outcome.stats.write_operations += 1;
            match retry("write_resource_row", &policy, || self.write_row(&statements, row)).await {
                Ok(()) => {
                    outcome.stats.items_stored += 1;
                    outcome.report.record_success(1);
                }
                Err(e) => {
                    self.log_write_failure("write_resource_row", handle.cache_type(), &e);
                    outcome.report.record_failure(1, e);
                }
            }
        }
    }

    /// Probe, then update or insert, inside one transaction.
    async fn write_row(&self, statements: &RowStatements, row: &ResourceRow) -> Result<(), CacheError> {
        let mut tx = self.backend.pool().begin().await?;

        let existing = sqlx::query(&statements.probe)
            .bind(row.id.as_str())
            .bind(row.agent.as_str())
            .fetch_optional(&mut *tx)
            .await?;

        if existing.is_some() {
            sqlx::query(&statements.update)
                .bind(row.application.as_deref())
                .bind(row.body_hash.as_str())
                .bind(row.body.as_str())
                .bind(row.last_updated)
                .bind(row.id.as_str())
                .bind(row.agent.as_str())
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query(&statements.insert)
                .bind(row.id.as_str())
                .bind(row.agent.as_str())
                .bind(row.application.as_deref())
                .bind(row.body_hash.as_str())
                .bind(row.body.as_str())
                .bind(row.last_updated)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Delete resource rows by id, optionally only those owned by `agent`.
    pub(crate) async fn delete_resources(
        &self,
        config: &SqlCacheConfig,
        handle: &TableHandle,
        agent: Option<&str>,
        ids: &[String],
    ) -> BatchReport {
        let policy = config.transactions.to_retry_config();
        let mut report = BatchReport::default();

        for chunk in ids.chunks(config.write_batch()) {
            let mut sql = format!(
                "DELETE FROM {} WHERE id IN ({})",
                handle.resource(),
                placeholders(chunk.len())
            );
            if agent.is_some() {
                sql.push_str(" AND agent = ?");
            }

            let result = retry("delete_resources", &policy, || async {
                let mut query = sqlx::query(&sql);
                for id in chunk {
                    query = query.bind(id.as_str());
                }
                if let Some(agent) = agent {
                    query = query.bind(agent);
                }
                query.execute(self.backend.pool()).await.map_err(CacheError::from)
            })
            .await;

            match result {
                Ok(_) => report.record_success(chunk.len()),
                Err(e) => {
                    self.log_write_failure("delete_resources", handle.cache_type(), &e);
                    report.record_failure(chunk.len(), e);
                }
            }
        }
        report
    }

    async fn merge_informative(
        &self,
        config: &SqlCacheConfig,
        handle: &TableHandle,
        items: Vec<CacheData>,
        cleanup: bool,
    ) -> Result<MergeOutcome, CacheError> {
        let mut outcome = MergeOutcome::default();
        outcome.stats.item_count = items.len();

        let source_keys: BTreeSet<&str> = items
            .iter()
            .flat_map(|item| item.relationships.keys().map(String::as_str))
            .collect();
        if source_keys.is_empty() {
            warn!(cache_type = %handle.cache_type(), "Informative merge carried no relationships");
            return Ok(outcome);
        }

        let mut related: HashMap<String, Arc<TableHandle>> = HashMap::new();
        for key in &source_keys {
            let rel_type = relationship_type(key);
            if related.contains_key(rel_type) {
                continue;
            }
            match self.ensure_tables(rel_type).await {
                Ok(rel_handle) => {
                    related.insert(rel_type.to_string(), rel_handle);
                }
                Err(e) => warn!(
                    cache_type = %handle.cache_type(),
                    relationship = %key,
                    error = %e,
                    "Skipping relationship with unusable type"
                ),
            }
        }
        let usable_keys: Vec<&str> = source_keys
            .iter()
            .copied()
            .filter(|key| related.contains_key(relationship_type(key)))
            .collect();

        let old_forward = self
            .load_forward_edges(config, handle, &usable_keys, &mut outcome)
            .await?;
        let old_reverse = self
            .load_reverse_edges(config, handle.cache_type(), &related, &usable_keys, &mut outcome)
            .await?;

        let now = now_millis();
        let mut current_forward: HashSet<EdgeKey> = HashSet::new();
        let mut current_reverse: HashSet<EdgeKey> = HashSet::new();
        let mut new_forward: Vec<RelationshipRow> = Vec::new();
        let mut new_reverse: HashMap<String, Vec<RelationshipRow>> = HashMap::new();

        for item in &items {
            for (key, related_ids) in &item.relationships {
                let rel_type = relationship_type(key);
                if !related.contains_key(rel_type) {
                    continue;
                }
                for related_id in related_ids {
                    outcome.stats.relationship_count += 1;

                    let forward = (key.clone(), edge_key(&item.id, related_id));
                    if !old_forward.contains_key(&forward) && current_forward.insert(forward.clone()) {
                        new_forward.push(RelationshipRow {
                            uuid: Uuid::now_v7().to_string(),
                            id: item.id.clone(),
                            rel_id: related_id.clone(),
                            rel_agent: key.clone(),
                            rel_type: rel_type.to_string(),
                            last_updated: now,
                        });
                    }
                    current_forward.insert(forward);

                    let reverse = (key.clone(), edge_key(related_id, &item.id));
                    if !old_reverse.contains_key(&reverse) && current_reverse.insert(reverse.clone()) {
                        new_reverse.entry(rel_type.to_string()).or_default().push(RelationshipRow {
                            uuid: Uuid::now_v7().to_string(),
                            id: related_id.clone(),
                            rel_id: item.id.clone(),
                            rel_agent: key.clone(),
                            rel_type: handle.cache_type().to_string(),
                            last_updated: now,
                        });
                    }
                    current_reverse.insert(reverse);
                }
            }
        }

        self.insert_relationships(config, handle, &new_forward, &mut outcome).await;
        for (rel_type, rows) in &new_reverse {
            if let Some(rel_handle) = related.get(rel_type) {
                self.insert_relationships(config, rel_handle, rows, &mut outcome).await;
            }
        }

        if cleanup {
            // A self-typed edge shares one table with its reverse, so a row is
            // live when either orientation is still current.
            let live = |key: &EdgeKey| current_forward.contains(key) || current_reverse.contains(key);

            let stale_forward: Vec<String> = old_forward
                .iter()
                .filter(|(key, _)| !live(*key))
                .flat_map(|(_, uuids)| uuids.iter().cloned())
                .collect();
            if !stale_forward.is_empty() {
                let report = self.delete_relationships(config, handle, &stale_forward).await;
                outcome.stats.delete_operations += report.batches;
                outcome.report.absorb(report);
            }

            let mut stale_reverse: HashMap<Option<String>, Vec<String>> = HashMap::new();
            for (key, edges) in &old_reverse {
                if live(key) {
                    continue;
                }
                for edge in edges {
                    stale_reverse
                        .entry(edge.owner_type.clone())
                        .or_default()
                        .push(edge.uuid.clone());
                }
            }
            for (owner, uuids) in stale_reverse {
                match owner.as_deref().and_then(|t| related.get(t)) {
                    Some(rel_handle) => {
                        let report = self.delete_relationships(config, rel_handle, &uuids).await;
                        outcome.stats.delete_operations += report.batches;
                        outcome.report.absorb(report);
                    }
                    None => warn!(
                        cache_type = %handle.cache_type(),
                        owner = ?owner,
                        count = uuids.len(),
                        "Unknown owning type for stale reverse relationships, leaving them in place"
                    ),
                }
            }
        }

        Ok(outcome)
    }

    /// Existing forward rows in the source type's table for the given keys.
    ///
    /// Reverse rows other types wrote under the same key carry their own type
    /// in `rel_type` and are skipped.
    async fn load_forward_edges(
        &self,
        config: &SqlCacheConfig,
        handle: &TableHandle,
        keys: &[&str],
        outcome: &mut MergeOutcome,
    ) -> Result<HashMap<EdgeKey, Vec<String>>, CacheError> {
        let policy = config.reads.to_retry_config();
        let mut edges: HashMap<EdgeKey, Vec<String>> = HashMap::new();

        for chunk in keys.chunks(config.read_batch()) {
            let sql = format!(
                "SELECT uuid, id, rel_id, rel_agent, rel_type FROM {} WHERE rel_agent IN ({})",
                handle.relationship(),
                placeholders(chunk.len())
            );
            let rows = retry("load_forward_edges", &policy, || async {
                let mut query = sqlx::query(&sql);
                for key in chunk {
                    query = query.bind(*key);
                }
                query.fetch_all(self.backend.pool()).await.map_err(CacheError::from)
            })
            .await?;
            outcome.stats.select_operations += 1;

            for row in &rows {
                let (Some(uuid), Some(id), Some(rel_id), Some(rel_agent)) = (
                    text_column(row, "uuid"),
                    text_column(row, "id"),
                    text_column(row, "rel_id"),
                    text_column(row, "rel_agent"),
                ) else {
                    continue;
                };
                if text_column(row, "rel_type").as_deref() != Some(relationship_type(&rel_agent)) {
                    continue;
                }
                edges.entry((rel_agent, edge_key(&id, &rel_id))).or_default().push(uuid);
            }
        }
        Ok(edges)
    }

    /// Existing reverse rows written by `source_type` into each related table.
    async fn load_reverse_edges(
        &self,
        config: &SqlCacheConfig,
        source_type: &str,
        related: &HashMap<String, Arc<TableHandle>>,
        keys: &[&str],
        outcome: &mut MergeOutcome,
    ) -> Result<HashMap<EdgeKey, Vec<StoredEdge>>, CacheError> {
        let policy = config.reads.to_retry_config();
        let mut edges: HashMap<EdgeKey, Vec<StoredEdge>> = HashMap::new();

        for (rel_type, rel_handle) in related {
            let type_keys: Vec<&str> = keys
                .iter()
                .copied()
                .filter(|key| relationship_type(key) == rel_type.as_str())
                .collect();

            for chunk in type_keys.chunks(config.read_batch()) {
                let sql = format!(
                    "SELECT uuid, id, rel_id, rel_agent FROM {} WHERE rel_type = ? AND rel_agent IN ({})",
                    rel_handle.relationship(),
                    placeholders(chunk.len())
                );
                let rows = retry("load_reverse_edges", &policy, || async {
                    let mut query = sqlx::query(&sql).bind(source_type);
                    for key in chunk {
                        query = query.bind(*key);
                    }
                    query.fetch_all(self.backend.pool()).await.map_err(CacheError::from)
                })
                .await?;
                outcome.stats.select_operations += 1;

                for row in &rows {
                    let (Some(uuid), Some(id), Some(rel_id)) = (
                        text_column(row, "uuid"),
                        text_column(row, "id"),
                        text_column(row, "rel_id"),
                    ) else {
                        continue;
                    };
                    let rel_agent = text_column(row, "rel_agent").unwrap_or_default();
                    let owner_type = Some(relationship_type(&rel_agent))
                        .filter(|t| !t.is_empty())
                        .map(str::to_string);
                    edges
                        .entry((rel_agent, edge_key(&id, &rel_id)))
                        .or_default()
                        .push(StoredEdge { uuid, owner_type });
                }
            }
        }
        Ok(edges)
    }

    async fn insert_relationships(
        &self,
        config: &SqlCacheConfig,
        handle: &TableHandle,
        rows: &[RelationshipRow],
        outcome: &mut MergeOutcome,
    ) {
        let policy = config.transactions.to_retry_config();

        for chunk in rows.chunks(config.write_batch()) {
            let sql = format!(
                "INSERT INTO {} ({}) VALUES {}",
                handle.relationship(),
                RELATIONSHIP_COLUMNS,
                row_placeholders(chunk.len(), RELATIONSHIP_COLUMN_COUNT)
            );
            let result = retry("insert_relationships", &policy, || async {
                let mut query = sqlx::query(&sql);
                for row in chunk {
                    query = query
                        .bind(row.uuid.as_str())
                        .bind(row.id.as_str())
                        .bind(row.rel_id.as_str())
                        .bind(row.rel_agent.as_str())
                        .bind(row.rel_type.as_str())
                        .bind(row.last_updated);
                }
                query.execute(self.backend.pool()).await.map_err(CacheError::from)
            })
            .await;

            outcome.stats.write_operations += 1;
            match result {
                Ok(_) => {
                    outcome.stats.relationships_stored += chunk.len();
                    outcome.report.record_success(chunk.len());
                }
                Err(e) => {
                    self.log_write_failure("insert_relationships", handle.cache_type(), &e);
                    outcome.report.record_failure(chunk.len(), e);
                }
            }
        }
    }

    async fn delete_relationships(
        &self,
        config: &SqlCacheConfig,
        handle: &TableHandle,
        uuids: &[String],
    ) -> BatchReport {
        let policy = config.transactions.to_retry_config();
        let mut report = BatchReport::default();

        for chunk in uuids.chunks(config.write_batch()) {
            let sql = format!(
                "DELETE FROM {} WHERE uuid IN ({})",
                handle.relationship(),
                placeholders(chunk.len())
            );
            let result = retry("delete_relationships", &policy, || async {
                let mut query = sqlx::query(&sql);
                for uuid in chunk {
                    query = query.bind(uuid.as_str());
                }
                query.execute(self.backend.pool()).await.map_err(CacheError::from)
            })
            .await;

            match result {
                Ok(_) => report.record_success(chunk.len()),
                Err(e) => {
                    self.log_write_failure("delete_relationships", handle.cache_type(), &e);
                    report.record_failure(chunk.len(), e);
                }
            }
        }
        report
    }

    #[tracing::instrument(skip(self, ids), fields(ids = ids.len()))]
    pub(crate) async fn evict_items(&self, cache_type: &str, ids: &[String]) -> Result<EvictOutcome, CacheError> {
        if cache_type.is_empty() || ids.is_empty() {
            return Ok(EvictOutcome::default());
        }

        let _timer = LatencyTimer::new("evict");
        let config = self.config();
        let handle = self.tables.resolve(cache_type)?;
        let report = self.delete_resources(&config, &handle, None, ids).await;

        let outcome = EvictOutcome {
            stats: EvictStats {
                item_count: ids.len(),
                items_deleted: report.succeeded,
                delete_operations: report.batches,
            },
            report,
        };
        self.metrics.evict(&self.prefix, cache_type, &outcome.stats);
        Ok(outcome)
    }

    /// Evict on-demand entries last written more than `max_age` ago.
    /// Returns the number of rows removed.
    pub async fn clean_on_demand(&self, max_age: Duration) -> Result<usize, CacheError> {
        let config = self.config();
        let handle = self.ensure_tables(ON_DEMAND_TYPE).await?;
        let cutoff = now_millis().saturating_sub(max_age.as_millis() as i64);
        let sql = format!("DELETE FROM {} WHERE last_updated < ?", handle.resource());

        let result = retry("clean_on_demand", &config.transactions.to_retry_config(), || async {
            sqlx::query(&sql)
                .bind(cutoff)
                .execute(self.backend.pool())
                .await
                .map_err(CacheError::from)
        })
        .await?;

        let removed = result.rows_affected() as usize;
        if removed > 0 {
            info!(removed, "Evicted stale on-demand entries");
        }
        self.metrics.evict(
            &self.prefix,
            ON_DEMAND_TYPE,
            &EvictStats {
                item_count: removed,
                items_deleted: removed,
                delete_operations: 1,
            },
        );
        Ok(removed)
    }

    fn log_write_failure(&self, operation: &str, cache_type: &str, err: &CacheError) {
        if err.is_table_missing() {
            debug!(operation, cache_type = %cache_type, error = %err, "Table missing during write");
        } else {
            error!(operation, cache_type = %cache_type, error = %err, "Cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TableRegistry;

    #[test]
    fn test_resolve_agent_prefers_hint() {
        let items = vec![CacheData::new("i-1").with_relationship("securityGroups:aws/SgAgent", ["sg-1"])];
        assert_eq!(resolve_agent("instances", Some("clouddriver-agent"), &items, 127), "clouddriver-agent");
    }

    #[test]
    fn test_resolve_agent_from_relationship_key() {
        let items = vec![CacheData::new("i-1").with_relationship("securityGroups:aws/SgAgent", ["sg-1"])];
        assert_eq!(resolve_agent("instances", None, &items, 127), "aws/SgAgent");

        let items = vec![CacheData::new("i-1").with_relationship("securityGroups", ["sg-1"])];
        assert_eq!(resolve_agent("instances", None, &items, 127), "securityGroups");
    }

    #[test]
    fn test_resolve_agent_fallbacks() {
        let items = vec![CacheData::new("i-1")];
        assert_eq!(resolve_agent("instances", None, &items, 127), UNKNOWN_AGENT);
        assert_eq!(resolve_agent("instances", Some(""), &items, 127), UNKNOWN_AGENT);
        assert_eq!(resolve_agent(ON_DEMAND_TYPE, Some("x"), &items, 127), ON_DEMAND_AGENT);
    }

    #[test]
    fn test_resolve_agent_shortens() {
        let long = "a".repeat(300);
        assert_eq!(resolve_agent("instances", Some(long.as_str()), &[], 127).len(), 127);
    }

    #[test]
    fn test_row_statements_lock_per_dialect() {
        let registry = TableRegistry::new(None);
        let handle = registry.resolve("instances").unwrap();

        let mysql = RowStatements::new(Dialect::MySql, handle.resource());
        assert!(mysql.probe.ends_with("FOR UPDATE"));

        let sqlite = RowStatements::new(Dialect::Sqlite, handle.resource());
        assert!(!sqlite.probe.contains("FOR UPDATE"));
        assert_eq!(sqlite.insert.matches('?').count(), RESOURCE_COLUMN_COUNT);
    }

    #[test]
    fn test_edge_key() {
        assert_eq!(edge_key("i-1", "sg-1"), "i-1|sg-1");
    }
}
