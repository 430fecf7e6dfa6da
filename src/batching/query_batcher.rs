// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batched query execution with bounded fan-out.
//!
//! Large id lists are split into fixed-size batches. Small requests run the
//! batches one after another; requests larger than twice the batch size fan
//! out over at most `max_concurrency` in-flight queries. Every batch runs to
//! completion and the [`BatchOutcome`] keeps both the successful results and
//! the errors, in batch order.
//!
//! # Example
//!
//! ```
//! use cats_sql::batching::QueryBatcher;
//!
//! let batcher = QueryBatcher::new(500, 4);
//! assert!(!batcher.should_fan_out(1000));
//! assert!(batcher.should_fan_out(1001));
//!
//! // A single permitted query never fans out
//! assert!(!QueryBatcher::new(500, 1).should_fan_out(10_000));
//! ```

use crate::storage::traits::CacheError;
use futures::stream::{self, StreamExt};
use std::future::Future;
use tracing::debug;

/// Batch size and fan-out width for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryBatcher {
    batch_size: usize,
    max_concurrency: usize,
}

impl QueryBatcher {
    #[must_use]
    pub fn new(batch_size: usize, max_concurrency: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Whether `total` items warrant concurrent batches.
    pub fn should_fan_out(&self, total: usize) -> bool {
        self.max_concurrency > 1 && total > self.batch_size * 2
    }

    /// Run `query` once per batch of `items`.
    pub async fn run<'a, I, T, F, Fut>(&self, items: &'a [I], query: F) -> BatchOutcome<T>
    where
        F: Fn(&'a [I]) -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        let fanned_out = self.should_fan_out(items.len());
        let width = if fanned_out { self.max_concurrency } else { 1 };

        // Build every batch future before polling any of them.
        let pending: Vec<Fut> = items.chunks(self.batch_size).map(|chunk| query(chunk)).collect();
        let completed: Vec<Result<T, CacheError>> = stream::iter(pending).buffered(width).collect().await;

        let mut outcome = BatchOutcome {
            results: Vec::with_capacity(completed.len()),
            errors: Vec::new(),
            batches: completed.len(),
            fanned_out,
        };
        for result in completed {
            match result {
                Ok(value) => outcome.results.push(value),
                Err(e) => outcome.errors.push(e),
            }
        }

        debug!(
            items = items.len(),
            batches = outcome.batches,
            failed = outcome.errors.len(),
            fanned_out,
            "Batched query complete"
        );
        outcome
    }
}

/// Results of every batch of one call.
#[derive(Debug)]
pub struct BatchOutcome<T> {
    /// Successful batch results, in batch order.
    pub results: Vec<T>,
    /// Errors of failed batches, in batch order.
    pub errors: Vec<CacheError>,
    /// Batches executed.
    pub batches: usize,
    /// Whether batches ran concurrently.
    pub fanned_out: bool,
}

impl<T> BatchOutcome<T> {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// The first failure, if any batch failed.
    pub fn first_error(&self) -> Option<&CacheError> {
        self.errors.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("id-{}", i)).collect()
    }

    #[test]
    fn test_fan_out_threshold() {
        let batcher = QueryBatcher::new(10, 4);
        assert!(!batcher.should_fan_out(0));
        assert!(!batcher.should_fan_out(20));
        assert!(batcher.should_fan_out(21));
    }

    #[test]
    fn test_zero_settings_clamp() {
        let batcher = QueryBatcher::new(0, 0);
        assert_eq!(batcher.batch_size(), 1);
        assert!(!batcher.should_fan_out(100));
    }

    #[tokio::test]
    async fn test_sequential_batches_preserve_order() {
        let items = ids(25);
        let outcome = QueryBatcher::new(10, 1)
            .run(&items, |chunk| async move { Ok(chunk.len()) })
            .await;

        assert!(outcome.is_success());
        assert!(!outcome.fanned_out);
        assert_eq!(outcome.batches, 3);
        assert_eq!(outcome.results, vec![10, 10, 5]);
    }

    #[tokio::test]
    async fn test_empty_input_runs_nothing() {
        let items: Vec<String> = Vec::new();
        let outcome = QueryBatcher::new(10, 4)
            .run(&items, |chunk| async move { Ok(chunk.len()) })
            .await;

        assert_eq!(outcome.batches, 0);
        assert!(outcome.results.is_empty());
    }

    #[tokio::test]
    async fn test_fan_out_respects_concurrency_bound() {
        let items = ids(100);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let outcome = QueryBatcher::new(10, 3)
            .run(&items, |chunk| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(chunk[0].clone())
                }
            })
            .await;

        assert!(outcome.fanned_out);
        assert_eq!(outcome.batches, 10);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) > 1);
        // Results stay in batch order even when batches overlap
        assert_eq!(outcome.results[0], "id-0");
        assert_eq!(outcome.results[9], "id-90");
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_run_with_borrowing_query_is_send() {
        let items = ids(30);
        let prefix = String::from("id-");
        let prefix = prefix.as_str();

        let batcher = QueryBatcher::new(10, 3);
        let run = batcher.run(&items, |chunk| async move {
            Ok(chunk.iter().filter(|id| id.starts_with(prefix)).count())
        });
        assert_send(&run);

        let outcome = run.await;
        assert!(outcome.fanned_out);
        assert_eq!(outcome.results, vec![10, 10, 10]);
    }

    #[tokio::test]
    async fn test_failures_keep_completed_batches() {
        let items = ids(30);
        let outcome = QueryBatcher::new(10, 1)
            .run(&items, |chunk| async move {
                if chunk[0] == "id-10" {
                    Err(CacheError::Transient("boom".into()))
                } else {
                    Ok(chunk.len())
                }
            })
            .await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.results, vec![10, 10]);
        assert_eq!(outcome.first_error(), Some(&CacheError::Transient("boom".into())));
    }
}
