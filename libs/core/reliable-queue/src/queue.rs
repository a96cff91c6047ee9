//! Reservation and acknowledgement
//!
//! `ReliableQueue` is the consumer-facing handle of one queue. It is cheap
//! to clone and safe to share between tasks; all coordination happens in the
//! store.

use crate::config::QueueConfig;
use crate::envelope;
use crate::error::{QueueError, QueueResult};
use crate::listener::Listener;
use crate::metrics::QueueMetrics;
use crate::producer::QueueProducer;
use crate::store::{ListStore, RedisStore, StageRequest};
use crate::sweeper::Sweeper;
use redis::aio::ConnectionManager;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Current wall-clock time in unix seconds
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// A message reserved by a consumer.
///
/// Keep it until processing finishes: acknowledging needs the exact
/// envelope that was staged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Raw payload popped from the queue
    pub payload: Vec<u8>,
    /// Unix seconds after which the sweeper may restore the message
    pub expiry: i64,
    envelope: Vec<u8>,
}

impl Reservation {
    pub fn new(payload: impl Into<Vec<u8>>, expiry: i64) -> Self {
        let payload = payload.into();
        let envelope = envelope::encode(expiry, &payload);
        Self {
            payload,
            expiry,
            envelope,
        }
    }

    /// The staged `expiry|payload` bytes
    pub fn envelope(&self) -> &[u8] {
        &self.envelope
    }

    /// The payload as UTF-8 text
    pub fn text(&self) -> QueueResult<&str> {
        std::str::from_utf8(&self.payload)
            .map_err(|_| QueueError::Malformed(String::from_utf8_lossy(&self.payload).into_owned()))
    }

    /// Deserialize a JSON payload
    pub fn json<T: DeserializeOwned>(&self) -> QueueResult<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Queue depths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_len: usize,
    pub staged_len: usize,
}

/// Handle to one reliable queue
#[derive(Clone)]
pub struct ReliableQueue {
    store: Arc<dyn ListStore>,
    config: Arc<QueueConfig>,
    ack_key: String,
    metrics: QueueMetrics,
}

impl ReliableQueue {
    /// Create a queue over any store. Fails on invalid configuration.
    pub fn new(store: Arc<dyn ListStore>, config: QueueConfig) -> QueueResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            ack_key: config.ack_key(),
            metrics: QueueMetrics::new(config.name.clone()),
            config: Arc::new(config),
        })
    }

    /// Create a queue backed by Redis
    pub fn redis(redis: ConnectionManager, config: QueueConfig) -> QueueResult<Self> {
        Self::new(Arc::new(RedisStore::new(redis)), config)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn ListStore> {
        self.store.clone()
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn ack_key(&self) -> &str {
        &self.ack_key
    }

    pub(crate) fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }

    /// Producer pushing onto this queue
    pub fn producer(&self) -> QueueProducer {
        QueueProducer::new(self.store.clone(), &self.config)
    }

    /// Sweeper restoring this queue's expired reservations
    pub fn sweeper(&self) -> Sweeper {
        Sweeper::new(self.clone())
    }

    /// Listener consuming this queue
    pub fn listener(&self) -> Listener {
        Listener::new(self.clone())
    }

    /// Atomically pop one message and stage it until acknowledged.
    ///
    /// Returns `Ok(None)` when the queue is empty.
    #[instrument(skip(self), fields(queue = %self.config.name))]
    pub async fn reserve(&self) -> QueueResult<Option<Reservation>> {
        let expiry = unix_now().saturating_add(self.config.message_timeout_secs());
        let request = StageRequest {
            queue_key: self.config.name.clone(),
            ack_key: self.ack_key.clone(),
            pop_end: self.config.reserve_end(),
            expiry,
            ttl_secs: self.config.list_ttl_secs,
        };

        match self.store.pop_and_stage(&request).await {
            Ok(payload) => {
                self.metrics.message_reserved();
                debug!(expiry, "Reserved message");
                Ok(Some(Reservation::new(payload, expiry)))
            }
            Err(QueueError::Empty) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Remove the staged entry of a finished reservation.
    ///
    /// Returns whether an entry was removed; acknowledging twice, or after
    /// the sweeper already restored the message, is a no-op.
    pub async fn ack(&self, reservation: &Reservation) -> QueueResult<bool> {
        self.ack_envelope(reservation.envelope()).await
    }

    /// Remove one occurrence of `envelope` from the staging list.
    ///
    /// Matching is by value: two reservations that staged byte-identical
    /// envelopes are indistinguishable here.
    pub async fn ack_envelope(&self, envelope: &[u8]) -> QueueResult<bool> {
        let removed = self.store.remove(&self.ack_key, 1, envelope).await? > 0;
        self.metrics.message_acked(removed);
        debug!(queue = %self.config.name, removed, "Acknowledged message");
        Ok(removed)
    }

    /// Current queue and staging list lengths
    pub async fn stats(&self) -> QueueResult<QueueStats> {
        let stats = QueueStats {
            queue_len: self.store.len(&self.config.name).await?,
            staged_len: self.store.len(&self.ack_key).await?,
        };
        self.metrics.depths(stats.queue_len, stats.staged_len);
        Ok(stats)
    }
}
