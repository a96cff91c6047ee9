//! Queue producer for enqueuing messages
//!
//! Any service (API, CLI, worker) can push raw byte payloads or JSON values.
//!
//! # Example
//!
//! ```rust,ignore
//! let producer = queue.producer();
//! producer.push("resize:42").await?;
//! producer.push_json(&ResizeJob { id: 42 }).await?;
//! ```

use crate::config::QueueConfig;
use crate::error::QueueResult;
use crate::metrics::QueueMetrics;
use crate::store::{ListEnd, ListStore};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Pushes payloads onto the producer end of a queue
#[derive(Clone)]
pub struct QueueProducer {
    store: Arc<dyn ListStore>,
    queue: String,
    end: ListEnd,
    metrics: QueueMetrics,
}

impl QueueProducer {
    pub fn new(store: Arc<dyn ListStore>, config: &QueueConfig) -> Self {
        Self {
            store,
            queue: config.name.clone(),
            end: config.producer_end,
            metrics: QueueMetrics::new(config.name.clone()),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// Enqueue one payload. Returns the queue length after the push.
    pub async fn push(&self, payload: impl Into<Vec<u8>>) -> QueueResult<usize> {
        let payload: Vec<u8> = payload.into();
        self.push_batch(&[payload]).await
    }

    /// Enqueue several payloads with a single command, in order.
    pub async fn push_batch<P: AsRef<[u8]>>(&self, payloads: &[P]) -> QueueResult<usize> {
        let values: Vec<Vec<u8>> = payloads.iter().map(|p| p.as_ref().to_vec()).collect();
        let len = self.store.push(&self.queue, self.end, &values).await?;
        self.metrics.messages_pushed(payloads.len());

        debug!(
            queue = %self.queue,
            count = payloads.len(),
            queue_len = len,
            "Enqueued messages"
        );

        Ok(len)
    }

    /// Serialize `value` as JSON and enqueue it.
    pub async fn push_json<T: Serialize>(&self, value: &T) -> QueueResult<usize> {
        let payload = serde_json::to_vec(value)?;
        self.push(payload).await
    }
}
