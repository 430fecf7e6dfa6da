// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity reads and relationship merging.
//!
//! With a filter that allows relationships, one `UNION ALL` statement per
//! batch returns both entity bodies (only `body` set) and relationship rows
//! (only `id`, `rel_id` and `rel_type` set). Bodies and pointers are then
//! folded together by [`merge_data_and_relationships`].

use super::types::RelPointer;
use super::SqlCache;
use crate::batching::QueryBatcher;
use crate::cache_data::{normalize_relationships, CacheData, RelationshipFilter};
use crate::config::SqlCacheConfig;
use crate::metrics::{GetStats, LatencyTimer};
use crate::resilience::retry::retry;
use crate::schema::TableHandle;
use crate::storage::dialect::{placeholders, Dialect};
use crate::storage::sql::text_column;
use crate::storage::traits::CacheError;
use futures::future::join_all;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error, warn};

/// Bodies and relationship pointers from one batch.
type Fetched = (Vec<CacheData>, Vec<RelPointer>);

/// Build the read statement for one batch.
///
/// `id_count` of `None` reads the whole table.
fn select_sql(
    dialect: Dialect,
    handle: &TableHandle,
    id_count: Option<usize>,
    filter: &RelationshipFilter,
) -> String {
    let id_clause = id_count.map(|n| format!("id IN ({})", placeholders(n)));

    if filter.is_none() {
        return match id_clause {
            Some(clause) => format!("SELECT body FROM {} WHERE {}", handle.resource(), clause),
            None => format!("SELECT body FROM {}", handle.resource()),
        };
    }

    let type_clause = match filter {
        RelationshipFilter::Prefixes(prefixes) => Some(format!(
            "({})",
            prefixes
                .iter()
                .map(|_| dialect.prefix_filter("rel_type"))
                .collect::<Vec<_>>()
                .join(" OR ")
        )),
        RelationshipFilter::All => None,
    };
    let rel_conditions: Vec<String> = id_clause.iter().cloned().chain(type_clause).collect();

    let mut sql = format!(
        "SELECT body, NULL AS id, NULL AS rel_id, NULL AS rel_type FROM {}",
        handle.resource()
    );
    if let Some(clause) = &id_clause {
        sql.push_str(&format!(" WHERE {}", clause));
    }
    sql.push_str(&format!(
        " UNION ALL SELECT NULL AS body, id, rel_id, rel_type FROM {}",
        handle.relationship()
    ));
    if !rel_conditions.is_empty() {
        sql.push_str(&format!(" WHERE {}", rel_conditions.join(" AND ")));
    }
    sql
}

/// Coalesce duplicate bodies and attach relationship pointers.
///
/// First-seen order is kept. Attributes of later copies only fill gaps;
/// relationship sets are unioned. Relationships the filter does not allow
/// are removed from bodies and pointers alike, and pointers to ids with no
/// body are dropped.
pub(crate) fn merge_data_and_relationships(
    data: Vec<CacheData>,
    pointers: Vec<RelPointer>,
    filter: &RelationshipFilter,
) -> Vec<CacheData> {
    let mut order: Vec<String> = Vec::with_capacity(data.len());
    let mut merged: HashMap<String, CacheData> = HashMap::with_capacity(data.len());

    for mut item in data {
        let relationships = std::mem::take(&mut item.relationships);
        item.relationships = if filter.is_none() {
            BTreeMap::new()
        } else {
            normalize_relationships(relationships, filter)
        };

        match merged.entry(item.id.clone()) {
            Entry::Occupied(mut existing) => existing.get_mut().absorb(item),
            Entry::Vacant(slot) => {
                order.push(item.id.clone());
                slot.insert(item);
            }
        }
    }

    for pointer in pointers {
        if !filter.allows(&pointer.rel_type) {
            continue;
        }
        if let Some(item) = merged.get_mut(&pointer.id) {
            item.relationships
                .entry(pointer.rel_type)
                .or_default()
                .insert(pointer.rel_id);
        }
    }

    order.into_iter().filter_map(|id| merged.remove(&id)).collect()
}

impl SqlCache {
    /// Read entries of a type, all of them when `ids` is `None`.
    #[tracing::instrument(skip(self, ids, filter), fields(ids = ids.map(<[String]>::len)))]
    pub(crate) async fn read_items(
        &self,
        cache_type: &str,
        ids: Option<&[String]>,
        filter: &RelationshipFilter,
    ) -> Vec<CacheData> {
        if cache_type.is_empty() || ids.is_some_and(<[String]>::is_empty) {
            return Vec::new();
        }
        let handle = match self.tables.resolve(cache_type) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(cache_type = %cache_type, error = %e, "Rejected read");
                return Vec::new();
            }
        };

        let _timer = LatencyTimer::new("get");
        let config = self.config();

        let (result, batches, fanned_out) = match ids {
            None => (self.fetch(&config, &handle, None, filter).await, 1, false),
            Some(ids) => {
                let batcher = QueryBatcher::new(config.read_batch(), config.concurrency());
                let outcome = batcher
                    .run(ids, |chunk| self.fetch(&config, &handle, Some(chunk), filter))
                    .await;
                let batches = outcome.batches;
                let fanned_out = outcome.fanned_out;
                let result = match outcome.errors.into_iter().next() {
                    Some(e) => Err(e),
                    None => Ok(outcome.results),
                };
                (result.map(flatten), batches, fanned_out)
            }
        };

        match result {
            Ok((data, pointers)) => {
                let relationship_rows = pointers.len();
                let items = merge_data_and_relationships(data, pointers, filter);
                self.metrics.get(
                    &self.prefix,
                    cache_type,
                    &GetStats {
                        item_count: items.len() as i64,
                        requested_size: ids.map_or(items.len(), <[String]>::len) as i64,
                        relationships_requested: relationship_rows as i64,
                        select_operations: batches as i64,
                        async_fanout: fanned_out,
                    },
                );
                items
            }
            Err(e) => {
                self.log_read_failure("get_all", cache_type, &e);
                self.metrics.get(&self.prefix, cache_type, &GetStats::errored());
                Vec::new()
            }
        }
    }

    async fn fetch(
        &self,
        config: &SqlCacheConfig,
        handle: &TableHandle,
        ids: Option<&[String]>,
        filter: &RelationshipFilter,
    ) -> Result<Fetched, CacheError> {
        let dialect = self.backend.dialect();
        let sql = select_sql(dialect, handle, ids.map(<[String]>::len), filter);
        let type_patterns: Vec<String> = match filter {
            RelationshipFilter::Prefixes(prefixes) => {
                prefixes.iter().map(|p| dialect.prefix_pattern(p)).collect()
            }
            RelationshipFilter::All => Vec::new(),
        };
        let with_relationships = !filter.is_none();

        let rows = retry("select_cache_data", &config.reads.to_retry_config(), || async {
            let mut query = sqlx::query(&sql);
            for id in ids.unwrap_or_default() {
                query = query.bind(id.as_str());
            }
            if with_relationships {
                for id in ids.unwrap_or_default() {
                    query = query.bind(id.as_str());
                }
                for prefix in &type_patterns {
                    query = query.bind(prefix.as_str());
                }
            }
            query.fetch_all(self.backend.pool()).await.map_err(CacheError::from)
        })
        .await?;

        let mut data = Vec::new();
        let mut pointers = Vec::new();
        for row in &rows {
            if let Some(body) = text_column(row, "body") {
                match serde_json::from_str::<CacheData>(&body) {
                    Ok(item) => data.push(item),
                    Err(e) => warn!(
                        cache_type = %handle.cache_type(),
                        error = %e,
                        "Skipping unreadable cache body"
                    ),
                }
                continue;
            }
            if let (Some(id), Some(rel_id), Some(rel_type)) = (
                text_column(row, "id"),
                text_column(row, "rel_id"),
                text_column(row, "rel_type"),
            ) {
                pointers.push(RelPointer { id, rel_id, rel_type });
            }
        }
        Ok((data, pointers))
    }

    /// Entries of a type whose `application` column matches.
    pub async fn get_all_by_application(
        &self,
        cache_type: &str,
        application: &str,
        filter: &RelationshipFilter,
    ) -> Vec<CacheData> {
        let handle = match self.tables.resolve(cache_type) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(cache_type = %cache_type, error = %e, "Rejected read");
                return Vec::new();
            }
        };
        let config = self.config();
        let sql = format!("SELECT DISTINCT id FROM {} WHERE application = ?", handle.resource());

        let rows = retry("select_application_ids", &config.reads.to_retry_config(), || async {
            sqlx::query(&sql)
                .bind(application)
                .fetch_all(self.backend.pool())
                .await
                .map_err(CacheError::from)
        })
        .await;

        match rows {
            Ok(rows) => {
                let ids: Vec<String> = rows.iter().filter_map(|row| text_column(row, "id")).collect();
                if ids.is_empty() {
                    return Vec::new();
                }
                self.read_items(cache_type, Some(&ids), filter).await
            }
            Err(e) => {
                self.log_read_failure("get_all_by_application", cache_type, &e);
                self.metrics.get(&self.prefix, cache_type, &GetStats::errored());
                Vec::new()
            }
        }
    }

    /// [`Self::get_all_by_application`] over several types, running up to
    /// `max_query_concurrency` types at a time. Types without an entry in
    /// `filters` return all relationships.
    pub async fn get_all_by_application_types(
        &self,
        cache_types: &[String],
        application: &str,
        filters: &HashMap<String, RelationshipFilter>,
    ) -> HashMap<String, Vec<CacheData>> {
        let default_filter = RelationshipFilter::All;
        let concurrency = self.config().concurrency();
        let mut results = HashMap::with_capacity(cache_types.len());

        for group in cache_types.chunks(concurrency) {
            let reads = group.iter().map(|cache_type| {
                let filter = filters.get(cache_type).unwrap_or(&default_filter);
                async move {
                    let items = self.get_all_by_application(cache_type, application, filter).await;
                    (cache_type.clone(), items)
                }
            });
            results.extend(join_all(reads).await);
        }
        results
    }

    pub(crate) fn log_read_failure(&self, operation: &str, cache_type: &str, err: &CacheError) {
        if err.is_table_missing() {
            debug!(operation, cache_type = %cache_type, "Table missing, returning empty result");
        } else {
            error!(operation, cache_type = %cache_type, error = %err, "Cache read failed");
        }
    }
}

fn flatten(parts: Vec<Fetched>) -> Fetched {
    let mut data = Vec::new();
    let mut pointers = Vec::new();
    for (batch_data, batch_pointers) in parts {
        data.extend(batch_data);
        pointers.extend(batch_pointers);
    }
    (data, pointers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TableRegistry;
    use serde_json::json;

    fn pointer(id: &str, rel_id: &str, rel_type: &str) -> RelPointer {
        RelPointer {
            id: id.to_string(),
            rel_id: rel_id.to_string(),
            rel_type: rel_type.to_string(),
        }
    }

    #[test]
    fn test_select_sql_bodies_only() {
        let registry = TableRegistry::new(None);
        let handle = registry.resolve("instances").unwrap();

        let sql = select_sql(Dialect::Sqlite, &handle, Some(2), &RelationshipFilter::none());
        assert_eq!(sql, "SELECT body FROM cats_v1_instances WHERE id IN (?, ?)");

        let sql = select_sql(Dialect::Sqlite, &handle, None, &RelationshipFilter::none());
        assert_eq!(sql, "SELECT body FROM cats_v1_instances");
    }

    #[test]
    fn test_select_sql_with_relationships() {
        let registry = TableRegistry::new(None);
        let handle = registry.resolve("instances").unwrap();

        let sql = select_sql(Dialect::Sqlite, &handle, Some(1), &RelationshipFilter::only(["securityGroups", "loadBalancers"]));
        assert!(sql.contains("UNION ALL"));
        assert!(sql.contains("FROM cats_v1_instances_rel WHERE id IN (?) AND (rel_type GLOB ? OR rel_type GLOB ?)"));
        assert_eq!(sql.matches('?').count(), 4);

        let sql = select_sql(Dialect::Sqlite, &handle, None, &RelationshipFilter::all());
        assert!(sql.ends_with("FROM cats_v1_instances_rel"));

        let sql = select_sql(Dialect::MySql, &handle, Some(1), &RelationshipFilter::only(["securityGroups"]));
        assert!(sql.contains("AND (rel_type LIKE ? ESCAPE '!')"));
    }

    #[test]
    fn test_merge_coalesces_duplicates() {
        let data = vec![
            CacheData::new("a").with_attribute("name", json!("first")).with_relationship("r", ["1"]),
            CacheData::new("b"),
            CacheData::new("a").with_attribute("name", json!("second")).with_relationship("r", ["2"]),
        ];

        let merged = merge_data_and_relationships(data, Vec::new(), &RelationshipFilter::all());

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].id, "a");
        assert_eq!(merged[0].attributes["name"], json!("first"));
        assert_eq!(merged[0].relationships["r"].len(), 2);
        assert_eq!(merged[1].id, "b");
    }

    #[test]
    fn test_merge_attaches_pointers_to_known_ids_only() {
        let data = vec![CacheData::new("i-1")];
        let pointers = vec![
            pointer("i-1", "sg-1", "securityGroups"),
            pointer("i-1", "sg-2", "securityGroups"),
            pointer("i-missing", "sg-3", "securityGroups"),
        ];

        let merged = merge_data_and_relationships(data, pointers, &RelationshipFilter::all());

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].relationships["securityGroups"].len(), 2);
    }

    #[test]
    fn test_merge_empty_filter_strips_relationships() {
        let data = vec![CacheData::new("i-1").with_relationship("securityGroups", ["sg-1"])];
        let pointers = vec![pointer("i-1", "lb-1", "loadBalancers")];

        let merged = merge_data_and_relationships(data, pointers, &RelationshipFilter::none());

        assert!(merged[0].relationships.is_empty());
    }

    #[test]
    fn test_merge_prefix_filter_applies_to_bodies_and_pointers() {
        let data = vec![CacheData::new("i-1")
            .with_relationship("foo", ["f-1"])
            .with_relationship("bar:agent", ["b-1"])];
        let pointers = vec![pointer("i-1", "f-2", "foo"), pointer("i-1", "b-2", "bar")];

        let merged = merge_data_and_relationships(data, pointers, &RelationshipFilter::only(["foo"]));

        assert_eq!(merged[0].relationships.len(), 1);
        assert_eq!(merged[0].relationships["foo"].len(), 2);
        assert!(!merged[0].relationships.contains_key("bar"));
    }

    #[test]
    fn test_merge_normalizes_prefixed_keys() {
        let data = vec![CacheData::new("i-1").with_relationship("securityGroups:aws/Agent", ["sg-1"])];

        let merged = merge_data_and_relationships(data, Vec::new(), &RelationshipFilter::all());

        assert!(merged[0].relationships.contains_key("securityGroups"));
        assert!(!merged[0].relationships.contains_key("securityGroups:aws/Agent"));
    }

    #[test]
    fn test_flatten_concatenates_batches() {
        let parts = vec![
            (vec![CacheData::new("a")], vec![pointer("a", "x", "t")]),
            (vec![CacheData::new("b")], Vec::new()),
        ];
        let (data, pointers) = flatten(parts);
        assert_eq!(data.len(), 2);
        assert_eq!(pointers.len(), 1);
    }
}
