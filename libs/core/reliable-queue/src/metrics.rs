//! Prometheus metrics for reliable queues
//!
//! Provides observability into reservations, acknowledgements and recovery.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops. If another
/// recorder is already installed the exporter is left uninstalled.
pub fn init_metrics() {
    if PROMETHEUS_HANDLE.get().is_some() {
        return;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_ok() {
                info!("Prometheus metrics initialized");
            }
        }
        Err(e) => warn!(error = %e, "Failed to install Prometheus recorder"),
    }
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Per-queue metrics helper
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    queue: String,
}

impl QueueMetrics {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }

    /// Record messages pushed by producers
    pub fn messages_pushed(&self, count: usize) {
        counter!("reliable_queue_pushed_total", "queue" => self.queue.clone())
            .increment(count as u64);
    }

    /// Record a successful reservation
    pub fn message_reserved(&self) {
        counter!("reliable_queue_reserved_total", "queue" => self.queue.clone()).increment(1);
    }

    /// Record an acknowledgement; `removed` is false for no-op acks
    pub fn message_acked(&self, removed: bool) {
        counter!(
            "reliable_queue_acked_total",
            "queue" => self.queue.clone(),
            "removed" => removed.to_string()
        )
        .increment(1);
    }

    /// Record a handler failure in the listener
    pub fn handler_failed(&self) {
        counter!("reliable_queue_handler_failures_total", "queue" => self.queue.clone())
            .increment(1);
    }

    /// Record a payload refused by handler validation
    pub fn message_rejected(&self) {
        counter!("reliable_queue_rejected_total", "queue" => self.queue.clone()).increment(1);
    }

    /// Record the outcome of one sweeper pass
    pub fn sweep_completed(&self, restored: usize, purged: usize, duration: Duration) {
        counter!("reliable_queue_restored_total", "queue" => self.queue.clone())
            .increment(restored as u64);
        counter!("reliable_queue_purged_total", "queue" => self.queue.clone())
            .increment(purged as u64);
        histogram!("reliable_queue_sweep_duration_seconds", "queue" => self.queue.clone())
            .record(duration.as_secs_f64());
    }

    /// Record a sweeper pass that failed on the store
    pub fn sweep_failed(&self) {
        counter!("reliable_queue_sweep_failures_total", "queue" => self.queue.clone())
            .increment(1);
    }

    /// Update depth gauges
    pub fn depths(&self, queue_len: usize, staged_len: usize) {
        gauge!("reliable_queue_depth", "queue" => self.queue.clone()).set(queue_len as f64);
        gauge!("reliable_queue_staged", "queue" => self.queue.clone()).set(staged_len as f64);
    }
}
