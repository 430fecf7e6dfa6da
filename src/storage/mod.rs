// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL plumbing: errors, the cache contract, dialects and connections.

pub mod dialect;
pub mod sql;
pub mod traits;
