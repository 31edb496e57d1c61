//! Prometheus instrumentation for queue operations.
//!
//! Stores hold an `Arc<QueueMetrics>` handed to them at construction. Nothing
//! is registered globally; the embedding process decides which registry the
//! collectors end up in.

use crate::error::MetadataResult;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::future::Future;
use std::time::Instant;

/// Outcome label for a successful call.
pub const OUTCOME_OK: &str = "ok";
/// Outcome label for a claim that found nothing eligible.
pub const OUTCOME_EMPTY: &str = "empty";
/// Outcome label for a failed call.
pub const OUTCOME_ERROR: &str = "error";

/// Counters and latency histograms for queue operations.
#[derive(Clone)]
pub struct QueueMetrics {
    operations: IntCounterVec,
    duration: HistogramVec,
}

impl QueueMetrics {
    pub fn new() -> Self {
        let operations = IntCounterVec::new(
            Opts::new(
                "mender_queue_operations_total",
                "Total queue operations by queue, operation and outcome",
            ),
            &["queue", "op", "outcome"],
        )
        .expect("metric creation failed");

        let duration = HistogramVec::new(
            HistogramOpts::new(
                "mender_queue_operation_duration_seconds",
                "Time taken by queue operations",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
            ]),
            &["queue", "op"],
        )
        .expect("metric creation failed");

        Self {
            operations,
            duration,
        }
    }

    /// Register both collectors with `registry`.
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.operations.clone()))?;
        registry.register(Box::new(self.duration.clone()))?;
        Ok(())
    }

    /// Run `fut`, recording its latency and outcome under `queue`/`op`.
    pub async fn track<T, F>(&self, queue: &'static str, op: &'static str, fut: F) -> MetadataResult<T>
    where
        F: Future<Output = MetadataResult<T>>,
    {
        let start = Instant::now();
        let result = fut.await;
        self.duration
            .with_label_values(&[queue, op])
            .observe(start.elapsed().as_secs_f64());

        let outcome = match &result {
            Ok(_) => OUTCOME_OK,
            Err(e) if e.is_empty_queue() => OUTCOME_EMPTY,
            Err(e) => {
                tracing::warn!(queue, op, error = %e, "queue operation failed");
                OUTCOME_ERROR
            }
        };
        self.operations
            .with_label_values(&[queue, op, outcome])
            .inc();
        result
    }

    /// Number of recorded operations for the given labels.
    pub fn operation_count(&self, queue: &str, op: &str, outcome: &str) -> u64 {
        self.operations
            .with_label_values(&[queue, op, outcome])
            .get()
    }
}

impl Default for QueueMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QueueMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueMetrics").finish_non_exhaustive()
    }
}
