// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache entry data structure.
//!
//! A [`CacheData`] is the unit written to and read from a cache type: an id,
//! a bag of JSON attributes and a map of relationship keys to related ids.
//! Maps and sets are ordered so that two logically equal entries always
//! serialize to the same body, and therefore to the same body hash.
//!
//! Relationship keys take the form `relType` or `relType:agent`. The part
//! before the first `:` names the related cache type; the part after it
//! names the agent that observed the relationship.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Attribute holding the owning application of an entry.
pub const APPLICATION_ATTRIBUTE: &str = "application";

/// A cached entity.
///
/// # Example
///
/// ```
/// use cats_sql::CacheData;
/// use serde_json::json;
///
/// let instance = CacheData::new("i-1")
///     .with_attribute("state", json!("running"))
///     .with_relationship("securityGroups", ["sg-1", "sg-2"]);
///
/// assert_eq!(instance.id, "i-1");
/// assert_eq!(instance.relationships["securityGroups"].len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheData {
    pub id: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub relationships: BTreeMap<String, BTreeSet<String>>,
}

impl CacheData {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_relationship<I, S>(mut self, key: impl Into<String>, related: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.relationships
            .entry(key.into())
            .or_default()
            .extend(related.into_iter().map(Into::into));
        self
    }

    /// The `application` attribute, when it is a string.
    pub fn application(&self) -> Option<&str> {
        self.attributes.get(APPLICATION_ATTRIBUTE).and_then(Value::as_str)
    }

    /// Drop null attributes and fold `type:agent` relationship keys into
    /// bare type names. This is the form that gets serialized and hashed.
    pub(crate) fn prepare_for_storage(&mut self) {
        self.attributes.retain(|_, v| !v.is_null());
        if self.relationships.keys().any(|k| k.contains(':')) {
            let relationships = std::mem::take(&mut self.relationships);
            self.relationships = normalize_relationships(relationships, &RelationshipFilter::All);
        }
    }

    /// Fold another copy of the same entity into this one. Existing
    /// attributes win; relationship sets are unioned.
    pub(crate) fn absorb(&mut self, other: CacheData) {
        for (key, value) in other.attributes {
            self.attributes.entry(key).or_insert(value);
        }
        for (key, ids) in other.relationships {
            self.relationships.entry(key).or_default().extend(ids);
        }
    }
}

/// Cache type named by a relationship key (text before the first `:`).
pub fn relationship_type(key: &str) -> &str {
    key.split_once(':').map_or(key, |(t, _)| t)
}

/// Agent named by a relationship key (text after the first `:`).
pub fn relationship_agent(key: &str) -> &str {
    key.split_once(':').map_or(key, |(_, a)| a)
}

/// Collapse relationship keys to bare type names, merging sets that land on
/// the same type and dropping types the filter does not allow.
pub(crate) fn normalize_relationships(
    relationships: BTreeMap<String, BTreeSet<String>>,
    filter: &RelationshipFilter,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut normalized: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (key, ids) in relationships {
        let rel_type = relationship_type(&key);
        if filter.allows(rel_type) {
            normalized.entry(rel_type.to_string()).or_default().extend(ids);
        }
    }
    normalized
}

/// Which relationships a read returns.
///
/// # Example
///
/// ```
/// use cats_sql::RelationshipFilter;
///
/// let filter = RelationshipFilter::only(["securityGroups"]);
/// assert!(filter.allows("securityGroups"));
/// assert!(!filter.allows("loadBalancers"));
///
/// assert!(RelationshipFilter::all().allows("anything"));
/// assert!(!RelationshipFilter::none().allows("anything"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RelationshipFilter {
    /// Every relationship type.
    #[default]
    All,
    /// Only relationship types starting with one of these prefixes.
    /// An empty list returns no relationships.
    Prefixes(Vec<String>),
}

impl RelationshipFilter {
    pub fn all() -> Self {
        Self::All
    }

    pub fn none() -> Self {
        Self::Prefixes(Vec::new())
    }

    pub fn only<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Prefixes(prefixes.into_iter().map(Into::into).collect())
    }

    /// True when no relationship may be returned.
    pub fn is_none(&self) -> bool {
        matches!(self, Self::Prefixes(p) if p.is_empty())
    }

    pub fn allows(&self, rel_type: &str) -> bool {
        match self {
            Self::All => true,
            Self::Prefixes(prefixes) => prefixes.iter().any(|p| rel_type.starts_with(p.as_str())),
        }
    }
}
