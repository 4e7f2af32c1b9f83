//! Rolling request metrics and latency percentiles

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::broadcast::BroadcastHub;

/// Sample buffer size that triggers trimming
pub const MAX_LATENCY_SAMPLES: usize = 1000;
/// Samples kept after trimming
pub const RETAINED_LATENCY_SAMPLES: usize = 500;

/// Point-in-time metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub sample_count: usize,
    pub broadcast_connections: usize,
    pub broadcast_messages: u64,
    pub computed_at: DateTime<Utc>,
}

impl Default for MetricsSnapshot {
    fn default() -> Self {
        Self {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            average_latency_ms: 0.0,
            p95_latency_ms: 0.0,
            p99_latency_ms: 0.0,
            sample_count: 0,
            broadcast_connections: 0,
            broadcast_messages: 0,
            computed_at: Utc::now(),
        }
    }
}

/// Collects proxy outcomes and publishes periodic snapshots
pub struct MetricsAggregator {
    hub: Arc<BroadcastHub>,
    total: AtomicU64,
    success: AtomicU64,
    errors: AtomicU64,
    samples: Mutex<Vec<f64>>,
    snapshot: RwLock<MetricsSnapshot>,
    task: tokio::sync::RwLock<Option<JoinHandle<()>>>,
}

impl MetricsAggregator {
    pub fn new(hub: Arc<BroadcastHub>) -> Self {
        Self {
            hub,
            total: AtomicU64::new(0),
            success: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            samples: Mutex::new(Vec::with_capacity(MAX_LATENCY_SAMPLES)),
            snapshot: RwLock::new(MetricsSnapshot::default()),
            task: tokio::sync::RwLock::new(None),
        }
    }

    /// Record one proxied request
    pub fn record_request(&self, latency: Duration, success: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }

        let mut samples = self.samples.lock();
        samples.push(latency.as_micros() as f64 / 1000.0);
        if samples.len() > MAX_LATENCY_SAMPLES {
            let excess = samples.len() - RETAINED_LATENCY_SAMPLES;
            samples.drain(..excess);
        }
    }

    /// Recompute the snapshot from the retained samples
    pub fn recompute(&self) -> MetricsSnapshot {
        let mut sorted = self.samples.lock().clone();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let average = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<f64>() / sorted.len() as f64
        };

        let hub = self.hub.stats();
        let snapshot = MetricsSnapshot {
            total_requests: self.total.load(Ordering::Relaxed),
            successful_requests: self.success.load(Ordering::Relaxed),
            failed_requests: self.errors.load(Ordering::Relaxed),
            average_latency_ms: average,
            p95_latency_ms: percentile(&sorted, 0.95),
            p99_latency_ms: percentile(&sorted, 0.99),
            sample_count: sorted.len(),
            broadcast_connections: hub.connections,
            broadcast_messages: hub.messages_delivered,
            computed_at: Utc::now(),
        };

        *self.snapshot.write() = snapshot.clone();
        debug!(
            total = snapshot.total_requests,
            p95_ms = snapshot.p95_latency_ms,
            "Recomputed metrics"
        );
        snapshot
    }

    /// Last computed snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot.read().clone()
    }

    pub async fn start(self: &Arc<Self>, interval: Duration) {
        let aggregator = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                aggregator.recompute();
            }
        });

        if let Some(previous) = self.task.write().await.replace(handle) {
            previous.abort();
        }
        info!(interval_secs = interval.as_secs(), "Started metrics aggregation task");
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.task.write().await.take() {
            handle.abort();
        }
    }
}

/// Nearest-rank percentile over an ascending slice
fn percentile(sorted: &[f64], quantile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((sorted.len() as f64) * quantile).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
