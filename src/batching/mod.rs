// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batching for SQL reads and writes.

pub mod query_batcher;

pub use query_batcher::{BatchOutcome, QueryBatcher};
