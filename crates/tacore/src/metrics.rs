//! In-memory metrics aggregation: request counters, a bounded
//! response-time window for percentile estimates, and per-worker activity,
//! all under a single lock. A background task periodically flushes
//! snapshots to the [`Store`](crate::store::Store); counters themselves are
//! never reset by the flush.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::store::Store;

const DEFAULT_RESPONSE_WINDOW: usize = 1000;

/// Fixed-capacity ring buffer; pushing past capacity evicts the oldest
/// element first.
#[derive(Debug, Clone)]
struct RingBuffer<T> {
    items: std::collections::VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: std::collections::VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }
}

#[derive(Debug, Default)]
struct Inner {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    per_method: HashMap<String, u64>,
    per_error_type: HashMap<String, u64>,
    response_times_ms: Option<RingBuffer<u64>>,
    per_worker_processed: HashMap<String, u64>,
    worker_last_seen: HashMap<String, chrono::DateTime<chrono::Utc>>,
}

impl Inner {
    fn new(window: usize) -> Self {
        Self {
            response_times_ms: Some(RingBuffer::new(window)),
            ..Default::default()
        }
    }
}

/// Snapshot returned by [`MetricsCollector::snapshot`]; mirrors the shape
/// the `/api/metrics` endpoint serves.
#[derive(Debug, Clone, Serialize, Default)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub per_method: HashMap<String, u64>,
    pub per_error_type: HashMap<String, u64>,
    pub active_workers: usize,
}

/// Cheaply cloneable handle to the shared in-memory metrics state.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<Inner>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_RESPONSE_WINDOW)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::new(window))),
        }
    }

    /// Record a completed request. O(1).
    pub async fn record_request(
        &self,
        method: &str,
        success: bool,
        response_time_ms: u64,
        error_type: Option<&str>,
    ) {
        let mut inner = self.inner.lock().await;
        inner.total_requests += 1;
        if success {
            inner.successful_requests += 1;
        } else {
            inner.failed_requests += 1;
            if let Some(kind) = error_type {
                *inner.per_error_type.entry(kind.to_string()).or_insert(0) += 1;
            }
        }
        *inner.per_method.entry(method.to_string()).or_insert(0) += 1;
        if let Some(window) = inner.response_times_ms.as_mut() {
            window.push(response_time_ms);
        }
    }

    /// Record worker activity for last-seen/processed-request tracking.
    pub async fn record_worker_activity(&self, worker_id: &str, processed_requests: u64) {
        let mut inner = self.inner.lock().await;
        inner
            .per_worker_processed
            .insert(worker_id.to_string(), processed_requests);
        inner
            .worker_last_seen
            .insert(worker_id.to_string(), chrono::Utc::now());
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().await;
        let mut times: Vec<u64> = inner
            .response_times_ms
            .as_ref()
            .map(|w| w.items.iter().copied().collect())
            .unwrap_or_default();
        times.sort_unstable();

        MetricsSnapshot {
            total_requests: inner.total_requests,
            successful_requests: inner.successful_requests,
            failed_requests: inner.failed_requests,
            p50_ms: percentile(&times, 0.50),
            p95_ms: percentile(&times, 0.95),
            p99_ms: percentile(&times, 0.99),
            per_method: inner.per_method.clone(),
            per_error_type: inner.per_error_type.clone(),
            active_workers: inner.per_worker_processed.len(),
        }
    }

    /// Explicit reset, exposed for tests only — production counters are
    /// never reset by the periodic flush.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        let window = inner
            .response_times_ms
            .as_ref()
            .map(|w| w.capacity)
            .unwrap_or(DEFAULT_RESPONSE_WINDOW);
        *inner = Inner::new(window);
    }

    pub async fn total(&self) -> u64 {
        self.inner.lock().await.total_requests
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (pct * (sorted.len() as f64 - 1.0)).round() as usize;
    sorted[rank.min(sorted.len() - 1)] as f64
}

/// Spawn the periodic Store-flush task. Flushes aggregate snapshots at
/// `interval`; stops when `shutdown` fires.
pub fn spawn_flush_task(
    collector: MetricsCollector,
    store: Store,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snap = collector.snapshot().await;
                    if let Err(e) = store.record_metric("total_requests", snap.total_requests as f64, None).await {
                        tracing::warn!(error = %e, "failed to flush total_requests metric");
                    }
                    if let Err(e) = store.record_metric("successful_requests", snap.successful_requests as f64, None).await {
                        tracing::warn!(error = %e, "failed to flush successful_requests metric");
                    }
                    if let Err(e) = store.record_metric("failed_requests", snap.failed_requests as f64, None).await {
                        tracing::warn!(error = %e, "failed to flush failed_requests metric");
                    }
                    if let Err(e) = store.record_metric("p95_response_time_ms", snap.p95_ms, None).await {
                        tracing::warn!(error = %e, "failed to flush p95 metric");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_success_and_failure_counts() {
        let c = MetricsCollector::new();
        c.record_request("health.check", true, 5, None).await;
        c.record_request("scan.market", false, 10, Some("no_workers"))
            .await;

        let snap = c.snapshot().await;
        assert_eq!(snap.total_requests, 2);
        assert_eq!(snap.successful_requests, 1);
        assert_eq!(snap.failed_requests, 1);
        assert_eq!(snap.per_error_type["no_workers"], 1);
    }

    #[tokio::test]
    async fn per_method_counters_accumulate() {
        let c = MetricsCollector::new();
        c.record_request("scan.market", true, 1, None).await;
        c.record_request("scan.market", true, 1, None).await;
        let snap = c.snapshot().await;
        assert_eq!(snap.per_method["scan.market"], 2);
    }

    #[tokio::test]
    async fn percentiles_over_known_distribution() {
        let c = MetricsCollector::with_window(1000);
        for ms in 1..=100u64 {
            c.record_request("analyze.stock", true, ms, None).await;
        }
        let snap = c.snapshot().await;
        assert!((snap.p50_ms - 50.0).abs() <= 1.0);
        assert!((snap.p95_ms - 95.0).abs() <= 1.0);
        assert!((snap.p99_ms - 99.0).abs() <= 1.0);
    }

    #[tokio::test]
    async fn response_window_evicts_oldest() {
        let c = MetricsCollector::with_window(3);
        c.record_request("m", true, 1, None).await;
        c.record_request("m", true, 2, None).await;
        c.record_request("m", true, 3, None).await;
        c.record_request("m", true, 100, None).await;
        let snap = c.snapshot().await;
        assert_eq!(snap.p99_ms, 100.0);
    }

    #[tokio::test]
    async fn reset_clears_counters() {
        let c = MetricsCollector::new();
        c.record_request("m", true, 1, None).await;
        c.reset().await;
        assert_eq!(c.total().await, 0);
    }

    #[tokio::test]
    async fn worker_activity_tracked_per_worker() {
        let c = MetricsCollector::new();
        c.record_worker_activity("w1", 10).await;
        c.record_worker_activity("w2", 3).await;
        let snap = c.snapshot().await;
        assert_eq!(snap.active_workers, 2);
    }
}
