// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Content hashing for body deduplication.
//!
//! Every stored body carries the lowercase hex SHA-256 of its serialized
//! form. A write is skipped when the agent already owns a row with the same
//! hash.
//!
//! ```
//! use cats_sql::hashing::body_hash;
//!
//! let hash = body_hash(r#"{"id":"i-1"}"#).unwrap();
//! assert_eq!(hash.len(), 64);
//! assert_eq!(body_hash("   "), None);
//! ```

use sha2::{Digest, Sha256};

/// Hex characters kept from the hash when shortening an agent name.
const AGENT_HASH_CHARS: usize = 16;

/// Shortest limit that still fits a prefix separator and the full digest.
pub const MIN_AGENT_LENGTH: usize = AGENT_HASH_CHARS + 1;

/// SHA-256 hex digest of a body. Blank bodies have no hash.
pub fn body_hash(body: &str) -> Option<String> {
    if body.trim().is_empty() {
        return None;
    }
    Some(hex::encode(Sha256::digest(body.as_bytes())))
}

/// Fit an agent name into `max_len` characters.
///
/// Long names keep a prefix followed by `:` and a digest of the full name,
/// so two distinct long agents never collide after shortening.
pub fn shorten_agent(agent: &str, max_len: usize) -> String {
    if agent.chars().count() <= max_len {
        return agent.to_string();
    }
    let digest = hex::encode(Sha256::digest(agent.as_bytes()));
    if max_len < MIN_AGENT_LENGTH {
        return digest[..max_len].to_string();
    }
    let suffix = &digest[..AGENT_HASH_CHARS];
    let keep = max_len.saturating_sub(AGENT_HASH_CHARS + 1);
    let prefix: String = agent.chars().take(keep).collect();
    format!("{}:{}", prefix, suffix)
}
