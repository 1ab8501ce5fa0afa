use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-stage counters, shared between a stage's workers and the
/// [`PipelineHandle`](crate::pipeline::PipelineHandle). Cloning yields
/// another live view of the same counters.
#[derive(Debug, Clone)]
pub struct StageMetrics {
    label: Arc<str>,
    processed: Arc<AtomicU64>,
}

impl StageMetrics {
    pub(crate) fn new(label: impl Into<Arc<str>>) -> Self {
        Self {
            label: label.into(),
            processed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Label of the stage these counters belong to (e.g. `filter#1`).
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Total values this stage has fully processed so far.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            label: self.label.to_string(),
            processed: self.processed(),
        }
    }
}

/// A snapshot of one stage's metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub label: String,
    pub processed: u64,
}

impl MetricsSnapshot {
    /// Format as a human-readable one-liner.
    pub fn format(&self) -> String {
        format!("{}: processed {}", self.label, self.processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_read() {
        let metrics = StageMetrics::new("filter#1");
        for _ in 0..100 {
            metrics.record_processed();
        }
        assert_eq!(metrics.processed(), 100);
        assert_eq!(metrics.label(), "filter#1");
    }

    #[test]
    fn test_clone_shares_counters() {
        let metrics = StageMetrics::new("consumer#2");
        let view = metrics.clone();
        metrics.record_processed();
        assert_eq!(view.processed(), 1);
    }

    #[test]
    fn test_snapshot_format() {
        let metrics = StageMetrics::new("source#0");
        metrics.record_processed();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.format(), "source#0: processed 1");
    }
}
