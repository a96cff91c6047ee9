//! Consumer loop
//!
//! `Listener` repeatedly reserves a message, hands the payload to a
//! `MessageHandler` and acknowledges it on success. A failed handler leaves
//! the envelope staged, so the sweeper puts the message back on the queue
//! once its timeout passes. Payloads a handler refuses in `validate` are
//! acknowledged without being handled, since redelivering them cannot help.
//!
//! Handlers that return a `mutex_key` get per-key ordering: payloads sharing
//! a key are handled one at a time, in the order they were reserved, while
//! different keys still run concurrently.

use crate::error::{QueueError, QueueResult};
use crate::queue::{ReliableQueue, Reservation};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const MAX_BACKOFF_SECS: u64 = 30;

/// Processes reserved payloads.
///
/// Only `handle` is required. The other hooks default to accepting every
/// payload, ignoring errors and empty polls, and running without ordering
/// constraints.
///
/// # Example
///
/// ```rust,ignore
/// struct Thumbnailer;
///
/// #[async_trait]
/// impl MessageHandler for Thumbnailer {
///     async fn handle(&self, payload: &[u8]) -> Result<(), QueueError> {
///         let job: ResizeJob = serde_json::from_slice(payload)?;
///         resize(job).await.map_err(|e| QueueError::handler(e.to_string()))
///     }
///
///     async fn validate(&self, payload: &[u8]) -> bool {
///         serde_json::from_slice::<ResizeJob>(payload).is_ok()
///     }
///
///     fn mutex_key(&self, payload: &[u8]) -> Option<String> {
///         json_key(payload, "image.owner")
///     }
///
///     fn name(&self) -> &'static str {
///         "Thumbnailer"
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one payload. `Ok` acknowledges it, `Err` leaves it for redelivery.
    async fn handle(&self, payload: &[u8]) -> Result<(), QueueError>;

    /// Checked before `handle`. A rejected payload is reported to `on_error`
    /// and acknowledged without being handled.
    async fn validate(&self, _payload: &[u8]) -> bool {
        true
    }

    /// Called after a rejection or a failed `handle`
    async fn on_error(&self, _payload: &[u8], _error: &QueueError) {}

    /// Called each time the listener finds the queue empty
    async fn on_empty(&self) {}

    /// Ordering key; payloads with the same key never run concurrently
    fn mutex_key(&self, _payload: &[u8]) -> Option<String> {
        None
    }

    /// Handler name for logging
    fn name(&self) -> &'static str {
        "handler"
    }
}

/// Read a dotted path such as `user.id` from a JSON payload.
///
/// Meant for `MessageHandler::mutex_key`. Strings are returned as is,
/// numbers and booleans in their JSON form; anything else yields `None`.
pub fn json_key(payload: &[u8], path: &str) -> Option<String> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    let field = path.split('.').try_fold(&value, |v, part| v.get(part))?;

    match field {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// What happened to a delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handler succeeded and the staged entry was removed
    Acked,
    /// Handler failed; the entry stays staged until the sweeper restores it
    Retained,
    /// Validation refused the payload; the entry was removed unhandled
    Rejected,
}

/// Seconds to wait after `consecutive_errors` failed reservations
fn backoff_secs(consecutive_errors: u32) -> u64 {
    2u64.pow(consecutive_errors.saturating_sub(1).min(5)).min(MAX_BACKOFF_SECS)
}

/// Reserve/handle/ack loop for one queue
#[derive(Clone)]
pub struct Listener {
    queue: ReliableQueue,
}

impl Listener {
    pub fn new(queue: ReliableQueue) -> Self {
        Self { queue }
    }

    /// Reserve and handle a single message. `Ok(None)` when the queue is empty.
    pub async fn process_one<H: MessageHandler + ?Sized>(
        &self,
        handler: &H,
    ) -> QueueResult<Option<Delivery>> {
        match self.queue.reserve().await? {
            Some(reservation) => deliver(&self.queue, handler, reservation).await.map(Some),
            None => Ok(None),
        }
    }

    /// Consume until shutdown.
    ///
    /// Up to `max_concurrent_jobs` handlers run at once; a job waiting for an
    /// earlier job with the same mutex key holds its slot. Handlers still
    /// running when shutdown arrives are awaited before returning.
    pub async fn run<H: MessageHandler + 'static>(
        &self,
        handler: Arc<H>,
        mut shutdown: watch::Receiver<bool>,
    ) -> QueueResult<()> {
        let config = self.queue.config();
        info!(
            queue = %config.name,
            handler = %handler.name(),
            max_concurrent_jobs = config.max_concurrent_jobs,
            "Starting listener"
        );

        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        let mut tasks: JoinSet<()> = JoinSet::new();
        // Completion signal of the latest job per mutex key
        let mut lanes: HashMap<String, oneshot::Receiver<()>> = HashMap::new();
        let mut consecutive_errors: u32 = 0;

        loop {
            if *shutdown.borrow() {
                info!("Received shutdown signal, stopping listener");
                break;
            }

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Handler task panicked");
                }
            }
            lanes.retain(|_, done| matches!(done.try_recv(), Err(TryRecvError::Empty)));

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            match self.queue.reserve().await {
                Ok(Some(reservation)) => {
                    if consecutive_errors > 0 {
                        info!("Store recovered after {} errors", consecutive_errors);
                        consecutive_errors = 0;
                    }

                    let (previous, done) = match handler.mutex_key(&reservation.payload) {
                        Some(key) => {
                            let (tx, rx) = oneshot::channel();
                            (lanes.insert(key, rx), Some(tx))
                        }
                        None => (None, None),
                    };

                    let queue = self.queue.clone();
                    let handler = handler.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        if let Some(previous) = previous {
                            // Err only means the earlier job's task went away
                            let _ = previous.await;
                        }
                        if let Err(e) = deliver(&queue, handler.as_ref(), reservation).await {
                            error!(queue = %queue.name(), error = %e, "Failed to acknowledge message");
                        }
                        if let Some(done) = done {
                            let _ = done.send(());
                        }
                    });
                }
                Ok(None) => {
                    drop(permit);
                    debug!(queue = %config.name, "Queue empty");
                    handler.on_empty().await;
                    if wait_or_shutdown(&mut shutdown, config.empty_queue_poll).await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    let backoff_secs = backoff_secs(consecutive_errors);
                    warn!(
                        error = %e,
                        consecutive_errors,
                        backoff_secs,
                        "Reserve failed, backing off"
                    );
                    if wait_or_shutdown(&mut shutdown, Duration::from_secs(backoff_secs)).await {
                        break;
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Handler task panicked");
            }
        }

        info!(queue = %config.name, "Listener stopped");
        Ok(())
    }
}

async fn deliver<H: MessageHandler + ?Sized>(
    queue: &ReliableQueue,
    handler: &H,
    reservation: Reservation,
) -> QueueResult<Delivery> {
    if !handler.validate(&reservation.payload).await {
        let rejection = QueueError::Rejected(handler.name().to_string());
        handler.on_error(&reservation.payload, &rejection).await;
        queue.ack(&reservation).await?;
        queue.metrics().message_rejected();
        warn!(
            queue = %queue.name(),
            handler = %handler.name(),
            "Payload failed validation, acknowledged without handling"
        );
        return Ok(Delivery::Rejected);
    }

    match handler.handle(&reservation.payload).await {
        Ok(()) => {
            queue.ack(&reservation).await?;
            Ok(Delivery::Acked)
        }
        Err(e) => {
            queue.metrics().handler_failed();
            handler.on_error(&reservation.payload, &e).await;
            warn!(
                queue = %queue.name(),
                handler = %handler.name(),
                error = %e,
                expiry = reservation.expiry,
                "Handler failed, message left staged for redelivery"
            );
            Ok(Delivery::Retained)
        }
    }
}

/// Sleep for `duration`; true when shutdown was signalled meanwhile
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        _ = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::error::ErrorKind;
    use crate::store::MemoryStore;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn text(payload: &[u8]) -> String {
        String::from_utf8_lossy(payload).into_owned()
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        errors: Mutex<Vec<(String, ErrorKind)>>,
        empty_polls: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, payload: &[u8]) -> Result<(), QueueError> {
            self.seen.lock().unwrap().push(text(payload));
            if payload.starts_with(b"fail") {
                return Err(QueueError::handler("refused"));
            }
            Ok(())
        }

        async fn validate(&self, payload: &[u8]) -> bool {
            !payload.starts_with(b"bad")
        }

        async fn on_error(&self, payload: &[u8], error: &QueueError) {
            self.errors.lock().unwrap().push((text(payload), error.kind()));
        }

        async fn on_empty(&self) {
            self.empty_polls.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Serialises on the `user` field and records overlap per key
    #[derive(Default)]
    struct PerUser {
        started: Mutex<Vec<(String, u64)>>,
        active: Mutex<HashSet<String>>,
        max_active: AtomicUsize,
        overlapped: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for PerUser {
        async fn handle(&self, payload: &[u8]) -> Result<(), QueueError> {
            let job: Value = serde_json::from_slice(payload)?;
            let user = job["user"].as_str().unwrap_or_default().to_string();
            let seq = job["seq"].as_u64().unwrap_or_default();

            {
                let mut active = self.active.lock().unwrap();
                if !active.insert(user.clone()) {
                    self.overlapped.fetch_add(1, Ordering::SeqCst);
                }
                self.max_active.fetch_max(active.len(), Ordering::SeqCst);
                self.started.lock().unwrap().push((user.clone(), seq));
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
            self.active.lock().unwrap().remove(&user);
            Ok(())
        }

        fn mutex_key(&self, payload: &[u8]) -> Option<String> {
            json_key(payload, "user")
        }
    }

    fn queue(store: &MemoryStore, config: QueueConfig) -> ReliableQueue {
        ReliableQueue::new(Arc::new(store.clone()), config).unwrap()
    }

    #[test]
    fn test_backoff_doubles_from_one_second() {
        assert_eq!(backoff_secs(1), 1);
        assert_eq!(backoff_secs(2), 2);
        assert_eq!(backoff_secs(3), 4);
        assert_eq!(backoff_secs(5), 16);
        assert_eq!(backoff_secs(6), 30);
        assert_eq!(backoff_secs(u32::MAX), 30);
    }

    #[test]
    fn test_json_key() {
        let payload = br#"{"user":{"id":42,"name":"ada"},"flag":true,"tags":[1]}"#;
        assert_eq!(json_key(payload, "user.id"), Some("42".to_string()));
        assert_eq!(json_key(payload, "user.name"), Some("ada".to_string()));
        assert_eq!(json_key(payload, "flag"), Some("true".to_string()));
        assert_eq!(json_key(payload, "tags"), None);
        assert_eq!(json_key(payload, "user.missing"), None);
        assert_eq!(json_key(b"not json", "user"), None);
    }

    #[tokio::test]
    async fn test_process_one_acks_on_success() {
        let store = MemoryStore::new();
        let queue = queue(&store, QueueConfig::new("jobs"));
        queue.producer().push("ok-1").await.unwrap();

        let delivery = queue.listener().process_one(&Recorder::default()).await.unwrap();

        assert_eq!(delivery, Some(Delivery::Acked));
        assert!(store.list("jobs").is_empty());
        assert!(store.list("jobs:ack").is_empty());
    }

    #[tokio::test]
    async fn test_process_one_retains_on_failure() {
        let store = MemoryStore::new();
        let queue = queue(&store, QueueConfig::new("jobs"));
        queue.producer().push("fail-1").await.unwrap();

        let handler = Recorder::default();
        let delivery = queue.listener().process_one(&handler).await.unwrap();

        assert_eq!(delivery, Some(Delivery::Retained));
        let staged = store.list("jobs:ack");
        assert_eq!(staged.len(), 1);
        assert!(staged[0].ends_with("|fail-1"));
        assert_eq!(
            *handler.errors.lock().unwrap(),
            vec![("fail-1".to_string(), ErrorKind::Transient)]
        );
    }

    #[tokio::test]
    async fn test_rejected_payload_is_acked_unhandled() {
        let store = MemoryStore::new();
        let queue = queue(&store, QueueConfig::new("jobs"));
        queue.producer().push("bad-1").await.unwrap();

        let handler = Recorder::default();
        let delivery = queue.listener().process_one(&handler).await.unwrap();

        assert_eq!(delivery, Some(Delivery::Rejected));
        assert!(handler.seen.lock().unwrap().is_empty());
        assert_eq!(
            *handler.errors.lock().unwrap(),
            vec![("bad-1".to_string(), ErrorKind::Permanent)]
        );
        assert!(store.list("jobs").is_empty());
        assert!(store.list("jobs:ack").is_empty());
    }

    #[tokio::test]
    async fn test_process_one_empty() {
        let store = MemoryStore::new();
        let queue = queue(&store, QueueConfig::new("jobs"));
        let delivery = queue.listener().process_one(&Recorder::default()).await.unwrap();
        assert_eq!(delivery, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_drains_queue_until_shutdown() {
        let store = MemoryStore::new();
        let queue = queue(
            &store,
            QueueConfig::new("jobs")
                .with_max_concurrent_jobs(4)
                .with_empty_queue_poll(Duration::from_secs(1)),
        );
        let payloads: Vec<String> = (0..10).map(|i| format!("ok-{}", i)).collect();
        queue.producer().push_batch(&payloads).await.unwrap();

        let handler = Arc::new(Recorder::default());
        let (tx, rx) = watch::channel(false);
        let listener = queue.listener();
        let task_handler = handler.clone();
        let handle = tokio::spawn(async move { listener.run(task_handler, rx).await });

        tokio::time::sleep(Duration::from_secs(3)).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let mut seen = handler.seen.lock().unwrap().clone();
        seen.sort();
        let mut expected = payloads.clone();
        expected.sort();
        assert_eq!(seen, expected);
        assert!(store.list("jobs").is_empty());
        assert!(store.list("jobs:ack").is_empty());
        assert!(handler.empty_polls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_mutex_key_runs_in_order() {
        let store = MemoryStore::new();
        let queue = queue(
            &store,
            QueueConfig::new("jobs")
                .with_max_concurrent_jobs(4)
                .with_empty_queue_poll(Duration::from_secs(1)),
        );
        let payloads: Vec<String> = (0..6)
            .map(|i| {
                let user = if i % 2 == 0 { "a" } else { "b" };
                format!(r#"{{"user":"{}","seq":{}}}"#, user, i)
            })
            .collect();
        queue.producer().push_batch(&payloads).await.unwrap();

        let handler = Arc::new(PerUser::default());
        let (tx, rx) = watch::channel(false);
        let listener = queue.listener();
        let task_handler = handler.clone();
        let handle = tokio::spawn(async move { listener.run(task_handler, rx).await });

        tokio::time::sleep(Duration::from_secs(3)).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(handler.overlapped.load(Ordering::SeqCst), 0);
        assert_eq!(handler.max_active.load(Ordering::SeqCst), 2);

        let started = handler.started.lock().unwrap().clone();
        let order = |user: &str| -> Vec<u64> {
            started.iter().filter(|(u, _)| u == user).map(|(_, seq)| *seq).collect()
        };
        assert_eq!(order("a"), vec![0, 2, 4]);
        assert_eq!(order("b"), vec![1, 3, 5]);
        assert!(store.list("jobs:ack").is_empty());
    }
}
