// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public result types for cache writes.

use crate::metrics::{EvictStats, MergeStats};
use crate::storage::traits::CacheError;

/// Per-batch accounting for a write or delete call.
///
/// A failed batch does not stop later batches. Rows counted here are the
/// rows each statement covered, not rows the database reported changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Statements executed (successful or not)
    pub batches: usize,
    /// Rows in successful statements
    pub succeeded: usize,
    /// Rows in failed statements
    pub failed: usize,
    /// One error per failed statement
    pub errors: Vec<CacheError>,
}

impl BatchReport {
    /// Check if every batch succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.errors.is_empty()
    }

    pub(crate) fn record_success(&mut self, rows: usize) {
        self.batches += 1;
        self.succeeded += rows;
    }

    pub(crate) fn record_failure(&mut self, rows: usize, error: CacheError) {
        self.batches += 1;
        self.failed += rows;
        self.errors.push(error);
    }

    pub(crate) fn absorb(&mut self, other: BatchReport) {
        self.batches += other.batches;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.errors.extend(other.errors);
    }
}

/// Result of a merge call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Counters reported to the metrics sink
    pub stats: MergeStats,
    /// Write and cleanup statements
    pub report: BatchReport,
    /// Items skipped because their id appeared earlier in the batch
    pub duplicates: usize,
    /// Items dropped because their id is too long
    pub oversized: usize,
}

/// Result of an evict call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictOutcome {
    pub stats: EvictStats,
    pub report: BatchReport,
}

/// One fetched relationship row, attached to `id` under `rel_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RelPointer {
    pub id: String,
    pub rel_id: String,
    pub rel_type: String,
}

/// A resource row ready to write.
#[derive(Debug, Clone)]
pub(crate) struct ResourceRow {
    pub id: String,
    pub agent: String,
    pub application: Option<String>,
    pub body_hash: String,
    pub body: String,
    pub last_updated: i64,
}

/// A relationship row ready to write.
#[derive(Debug, Clone)]
pub(crate) struct RelationshipRow {
    pub uuid: String,
    pub id: String,
    pub rel_id: String,
    pub rel_agent: String,
    pub rel_type: String,
    pub last_updated: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_report_is_success() {
        let mut report = BatchReport::default();
        report.record_success(10);
        report.record_success(5);
        assert!(report.is_success());
        assert_eq!(report.batches, 2);
        assert_eq!(report.succeeded, 15);

        report.record_failure(3, CacheError::Transient("lock".into()));
        assert!(!report.is_success());
        assert_eq!(report.failed, 3);
        assert_eq!(report.errors.len(), 1);
    }

    #[test]
    fn test_batch_report_absorb() {
        let mut a = BatchReport::default();
        a.record_success(2);
        let mut b = BatchReport::default();
        b.record_failure(1, CacheError::Sql("x".into()));

        a.absorb(b);
        assert_eq!(a.batches, 2);
        assert_eq!(a.succeeded, 2);
        assert_eq!(a.failed, 1);
    }
}
