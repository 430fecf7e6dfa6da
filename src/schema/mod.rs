// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-type table naming and the created-tables registry.
//!
//! Every cache type owns two tables: a resource table holding entity bodies
//! and a relationship table holding graph edges. Names are derived once per
//! type, validated, and cached in a [`TableRegistry`] owned by the cache
//! instance. The registry also remembers which types have had their tables
//! bootstrapped in this process.
//!
//! # Example
//!
//! ```rust
//! use cats_sql::schema::TableRegistry;
//!
//! let registry = TableRegistry::new(None);
//! let tables = registry.resolve("aws:instances").unwrap();
//!
//! assert_eq!(tables.resource(), "cats_v1_aws_instances");
//! assert_eq!(tables.relationship(), "cats_v1_aws_instances_rel");
//!
//! // Namespaced registries insert the namespace after the schema version
//! let registry = TableRegistry::new(Some("prod"));
//! assert_eq!(registry.resolve("securityGroups").unwrap().resource(), "cats_v1_prod_securityGroups");
//!
//! // Anything that cannot form a safe identifier is rejected
//! assert!(registry.resolve("bad type;").is_err());
//! ```
//!
//! # Design
//!
//! - **Sanitization**: `:`, `/` and `-` become `_`; any other character
//!   outside `[A-Za-z0-9_]` rejects the type.
//! - **Instance scoped**: two caches in one process track creation separately.
//! - **Thread-safe**: Uses `DashMap` for concurrent access.

use crate::storage::traits::CacheError;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Schema version embedded in every table name.
pub const SCHEMA_VERSION: u32 = 1;

/// Reserved cache type for on-demand entries.
pub const ON_DEMAND_TYPE: &str = "onDemand";

/// Agent forced onto every on-demand row.
pub const ON_DEMAND_AGENT: &str = "onDemand";

/// Longest table name accepted (MySQL identifier limit).
pub const MAX_TABLE_NAME_LENGTH: usize = 64;

/// Template tables that per-type tables are cloned from.
pub const RESOURCE_TEMPLATE: &str = "cats_v1_resource_template";
pub const RELATIONSHIP_TEMPLATE: &str = "cats_v1_rel_template";

/// Whether a type's resource table would be another type's relationship
/// table or a template. SQLite folds identifier case, so the check does too.
fn shadows_other_table(sanitized: &str, table: &str) -> bool {
    let table = table.to_ascii_lowercase();
    sanitized.to_ascii_lowercase().ends_with("_rel")
        || table == RESOURCE_TEMPLATE
        || table == RELATIONSHIP_TEMPLATE
}

/// Replace the separators allowed in type names with `_`.
pub fn sanitize_type(cache_type: &str) -> String {
    cache_type.replace([':', '/', '-'], "_")
}

/// Table pair for one cache type.
#[derive(Debug)]
pub struct TableHandle {
    cache_type: String,
    resource: String,
    relationship: String,
    created: AtomicBool,
}

impl TableHandle {
    pub fn cache_type(&self) -> &str {
        &self.cache_type
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn relationship(&self) -> &str {
        &self.relationship
    }

    /// Whether this process has bootstrapped the tables.
    pub fn is_created(&self) -> bool {
        self.created.load(Ordering::Acquire)
    }

    pub(crate) fn mark_created(&self) {
        self.created.store(true, Ordering::Release);
    }
}

/// Registry of validated cache types and their tables.
#[derive(Debug, Default)]
pub struct TableRegistry {
    namespace: Option<String>,
    handles: DashMap<String, Arc<TableHandle>>,
}

impl TableRegistry {
    #[must_use]
    pub fn new(namespace: Option<&str>) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()).map(sanitize_type),
            handles: DashMap::new(),
        }
    }

    /// Look up or derive the tables for a type.
    pub fn resolve(&self, cache_type: &str) -> Result<Arc<TableHandle>, CacheError> {
        if let Some(handle) = self.handles.get(cache_type) {
            return Ok(handle.clone());
        }

        let resource = self.resource_table_name(cache_type)?;
        let relationship = format!("{}_rel", resource);
        if relationship.len() > MAX_TABLE_NAME_LENGTH {
            return Err(CacheError::InvalidType(cache_type.to_string()));
        }

        let handle = self
            .handles
            .entry(cache_type.to_string())
            .or_insert_with(|| {
                Arc::new(TableHandle {
                    cache_type: cache_type.to_string(),
                    resource,
                    relationship,
                    created: AtomicBool::new(false),
                })
            })
            .clone();
        Ok(handle)
    }

    fn resource_table_name(&self, cache_type: &str) -> Result<String, CacheError> {
        let sanitized = sanitize_type(cache_type);
        let valid = !sanitized.is_empty()
            && sanitized.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(CacheError::InvalidType(cache_type.to_string()));
        }
        let table = match &self.namespace {
            Some(ns) => format!("cats_v{}_{}_{}", SCHEMA_VERSION, ns, sanitized),
            None => format!("cats_v{}_{}", SCHEMA_VERSION, sanitized),
        };
        if shadows_other_table(&sanitized, &table) {
            return Err(CacheError::InvalidType(cache_type.to_string()));
        }
        Ok(table)
    }

    /// Types whose tables this process has bootstrapped.
    pub fn created_types(&self) -> Vec<String> {
        self.handles
            .iter()
            .filter(|entry| entry.value().is_created())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Forget every bootstrapped type. The next write re-runs the DDL.
    pub fn clear_created(&self) {
        self.handles.clear();
    }
}
