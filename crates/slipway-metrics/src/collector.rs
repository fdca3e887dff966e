//! Operation metrics — counts and durations per (operation, outcome).
//!
//! Counters are atomics; the map of buckets sits behind an async RwLock
//! and only takes the write lock the first time a bucket is seen.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::debug;

/// Outcome label used for successful calls; failures use their error kind.
pub const SUCCESS: &str = "success";

#[derive(Default)]
struct OutcomeStats {
    count: AtomicU64,
    duration_ms_total: AtomicU64,
    duration_ms_max: AtomicU64,
}

/// Point-in-time values of one (operation, outcome) bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSnapshot {
    pub operation: String,
    pub outcome: String,
    pub count: u64,
    pub duration_ms_total: u64,
    pub duration_ms_max: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    /// Sorted by operation, then outcome.
    pub operations: Vec<OperationSnapshot>,
    /// Responses served while the durable store was unreachable.
    pub degraded_total: u64,
}

#[derive(Default)]
pub struct OperationMetrics {
    buckets: RwLock<HashMap<(String, String), Arc<OutcomeStats>>>,
    degraded: AtomicU64,
}

impl OperationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished call.
    pub async fn record(&self, operation: &str, outcome: &str, elapsed: Duration, degraded: bool) {
        let stats = self.bucket(operation, outcome).await;
        let ms = elapsed.as_millis() as u64;
        stats.count.fetch_add(1, Ordering::Relaxed);
        stats.duration_ms_total.fetch_add(ms, Ordering::Relaxed);
        stats.duration_ms_max.fetch_max(ms, Ordering::Relaxed);
        if degraded {
            self.degraded.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn bucket(&self, operation: &str, outcome: &str) -> Arc<OutcomeStats> {
        let key = (operation.to_string(), outcome.to_string());
        if let Some(stats) = self.buckets.read().await.get(&key) {
            return stats.clone();
        }
        let mut buckets = self.buckets.write().await;
        buckets
            .entry(key)
            .or_insert_with(|| {
                debug!(operation, outcome, "new metrics bucket");
                Arc::new(OutcomeStats::default())
            })
            .clone()
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let buckets = self.buckets.read().await;
        let mut operations: Vec<OperationSnapshot> = buckets
            .iter()
            .map(|((operation, outcome), stats)| OperationSnapshot {
                operation: operation.clone(),
                outcome: outcome.clone(),
                count: stats.count.load(Ordering::Relaxed),
                duration_ms_total: stats.duration_ms_total.load(Ordering::Relaxed),
                duration_ms_max: stats.duration_ms_max.load(Ordering::Relaxed),
            })
            .collect();
        operations.sort_by(|a, b| {
            a.operation
                .cmp(&b.operation)
                .then_with(|| a.outcome.cmp(&b.outcome))
        });
        MetricsSnapshot {
            operations,
            degraded_total: self.degraded.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_per_operation_and_outcome() {
        let metrics = OperationMetrics::new();
        metrics.record("deploy", SUCCESS, Duration::from_millis(1200), false).await;
        metrics.record("deploy", SUCCESS, Duration::from_millis(800), true).await;
        metrics
            .record("deploy", "health_check_timeout", Duration::from_secs(60), false)
            .await;
        metrics.record("promote", SUCCESS, Duration::from_millis(90), false).await;

        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot.degraded_total, 1);
        assert_eq!(snapshot.operations.len(), 3);

        let deploy_ok = &snapshot.operations[1];
        assert_eq!((deploy_ok.operation.as_str(), deploy_ok.outcome.as_str()), ("deploy", "success"));
        assert_eq!(deploy_ok.count, 2);
        assert_eq!(deploy_ok.duration_ms_total, 2000);
        assert_eq!(deploy_ok.duration_ms_max, 1200);

        assert_eq!(snapshot.operations[0].outcome, "health_check_timeout");
        assert_eq!(snapshot.operations[2].operation, "promote");
    }

    #[tokio::test]
    async fn empty_snapshot() {
        let snapshot = OperationMetrics::new().snapshot().await;
        assert_eq!(snapshot, MetricsSnapshot::default());
    }
}
