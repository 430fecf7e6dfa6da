//! Property-based tests (fuzzing) for the cache's pure building blocks.
//!
//! Uses proptest to generate random type names, globs, agents and entities
//! and checks the invariants table naming, hashing and glob translation
//! rely on.
//!
//! Run with: `cargo test --test proptest_fuzz`

use proptest::prelude::*;
use serde_json::{json, Value};

use cats_sql::hashing::{body_hash, shorten_agent};
use cats_sql::schema::{sanitize_type, MAX_TABLE_NAME_LENGTH};
use cats_sql::storage::dialect::{escape_like, glob_to_regex, is_wildcard_glob};
use cats_sql::{CacheData, RelationshipFilter, TableRegistry};

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// Type names as cache agents produce them.
fn cache_type_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z][a-zA-Z0-9]{0,12}([:/-][a-zA-Z0-9]{1,8}){0,3}"
}

fn attribute_strategy() -> impl Strategy<Value = Vec<(String, Value)>> {
    prop::collection::vec(
        (
            "[a-z]{1,8}",
            prop_oneof![
                any::<i64>().prop_map(|n| json!(n)),
                "[a-z0-9 ]{0,16}".prop_map(Value::String),
                any::<bool>().prop_map(Value::Bool),
            ],
        ),
        0..8,
    )
}

fn relationship_strategy() -> impl Strategy<Value = Vec<(String, Vec<String>)>> {
    prop::collection::vec(
        ("[a-z]{1,8}", prop::collection::vec("[a-z0-9-]{1,8}", 0..5)),
        0..5,
    )
}

fn build(id: &str, attributes: &[(String, Value)], relationships: &[(String, Vec<String>)]) -> CacheData {
    let mut item = CacheData::new(id);
    for (key, value) in attributes {
        item = item.with_attribute(key.clone(), value.clone());
    }
    for (key, related) in relationships {
        item = item.with_relationship(key.clone(), related.iter().cloned());
    }
    item
}

// =============================================================================
// Table naming
// =============================================================================

proptest! {
    #[test]
    fn fuzz_sanitized_types_have_no_separators(cache_type in cache_type_strategy()) {
        let sanitized = sanitize_type(&cache_type);
        prop_assert!(!sanitized.contains([':', '/', '-']));
        prop_assert_eq!(sanitized.len(), cache_type.len());
    }

    #[test]
    fn fuzz_registry_names_are_safe_identifiers(cache_type in ".{0,80}") {
        let registry = TableRegistry::new(Some("ns"));
        // Never panics; accepted names contain only identifier characters
        if let Ok(handle) = registry.resolve(&cache_type) {
            prop_assert!(handle.resource().chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
            prop_assert!(handle.relationship().len() <= MAX_TABLE_NAME_LENGTH);
            prop_assert_eq!(handle.relationship(), format!("{}_rel", handle.resource()));
        }
    }

    #[test]
    fn fuzz_registry_is_stable(cache_type in cache_type_strategy()) {
        let registry = TableRegistry::new(None);
        let first = registry.resolve(&cache_type).map(|h| h.resource().to_string());
        let second = registry.resolve(&cache_type).map(|h| h.resource().to_string());
        prop_assert_eq!(first.ok(), second.ok());
    }
}

// =============================================================================
// Hashing
// =============================================================================

proptest! {
    #[test]
    fn fuzz_body_hash_is_hex_sha256(body in ".*[a-z0-9].*") {
        let hash = body_hash(&body).unwrap();
        prop_assert_eq!(hash.len(), 64);
        prop_assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        prop_assert_eq!(Some(hash), body_hash(&body));
    }

    #[test]
    fn fuzz_serialized_hash_ignores_insertion_order(
        attributes in attribute_strategy(),
        relationships in relationship_strategy(),
    ) {
        let forward = build("i-1", &attributes, &relationships);

        let mut reversed_attrs = attributes.clone();
        reversed_attrs.reverse();
        let mut reversed_rels = relationships.clone();
        reversed_rels.reverse();
        let backward = build("i-1", &reversed_attrs, &reversed_rels);

        // Later duplicates overwrite earlier ones, so only compare when keys are unique
        let mut keys: Vec<&String> = attributes.iter().map(|(k, _)| k).collect();
        keys.sort();
        keys.dedup();
        prop_assume!(keys.len() == attributes.len());

        let a = serde_json::to_string(&forward).unwrap();
        let b = serde_json::to_string(&backward).unwrap();
        prop_assert_eq!(body_hash(&a), body_hash(&b));
    }

    #[test]
    fn fuzz_shortened_agents_fit(agent in ".{0,300}", max_len in 20usize..200) {
        let short = shorten_agent(&agent, max_len);
        prop_assert!(short.chars().count() <= max_len);
        if agent.chars().count() <= max_len {
            prop_assert_eq!(short, agent);
        }
    }

    #[test]
    fn fuzz_distinct_long_agents_stay_distinct(a in "[a-z]{200,210}", b in "[a-z]{200,210}") {
        prop_assume!(a != b);
        prop_assert_ne!(shorten_agent(&a, 127), shorten_agent(&b, 127));
    }
}

// =============================================================================
// Glob translation
// =============================================================================

proptest! {
    #[test]
    fn fuzz_glob_regex_is_anchored(glob in "[a-z0-9*?.+-]{0,24}") {
        let regex = glob_to_regex(&glob);
        prop_assert!(regex.starts_with('^'));
        prop_assert!(regex.ends_with('$'));
        prop_assert!(!regex.contains(".*.*"));
    }

    #[test]
    fn fuzz_literal_globs_are_not_wildcards(glob in "[a-z0-9_%.-]{0,24}") {
        prop_assert!(!is_wildcard_glob(&glob));
    }

    #[test]
    fn fuzz_escaped_like_has_no_bare_wildcards(value in "[a-z_%!]{0,24}") {
        let escaped = escape_like(&value);
        let mut chars = escaped.chars();
        while let Some(c) = chars.next() {
            if c == '!' {
                // Every escape is followed by the escaped character
                prop_assert!(matches!(chars.next(), Some('%' | '_' | '!')));
            } else {
                prop_assert!(c != '%' && c != '_');
            }
        }
    }

    #[test]
    fn fuzz_prefix_filter_allows_extensions(prefix in "[a-z]{1,8}", suffix in "[a-zA-Z]{0,8}") {
        let filter = RelationshipFilter::only([prefix.clone()]);
        let extended = format!("{}{}", prefix, suffix);
        prop_assert!(filter.allows(&extended));
        prop_assert!(!RelationshipFilter::none().allows(&extended));
    }
}
