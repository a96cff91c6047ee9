//! Expiry sweeper
//!
//! Recovers messages whose consumer crashed or stalled. One pass walks the
//! staging list from offset 0 in fixed windows:
//!
//! ```text
//! staging list ──LRANGE [cursor, cursor+batch-1]──> window
//!   malformed entry  ──LREM──────────────────────> purged
//!   expired entry    ──LREM, then PUSH payload───> restored
//!   live entry       ──────────────────────────────> kept
//! ```
//!
//! Entries are not guaranteed to be time-ordered, so a pass never stops at
//! the first live entry. A restore pushes the payload only when its own LREM
//! removed the entry, in one atomic step, so an acknowledgement or a second
//! sweeper racing the pass never yields a duplicate. The shutdown signal is
//! checked before every window read; store calls already in flight run to
//! completion.

use crate::envelope::Envelope;
use crate::error::QueueResult;
use crate::queue::{ReliableQueue, unix_now};
use crate::store::RestoreRequest;
use serde::Serialize;
use std::str::FromStr;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// When a pass issues its removals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SweepMode {
    /// Scan the whole list first, then restore and purge. Removals made by
    /// the pass cannot shift the cursor past unread entries.
    #[default]
    Snapshot,
    /// Restore and purge while scanning. The cursor advances by entries
    /// read, so entries behind a removal can be skipped until the next pass.
    Streaming,
}

impl FromStr for SweepMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "snapshot" => Ok(SweepMode::Snapshot),
            "streaming" => Ok(SweepMode::Streaming),
            other => Err(format!("unknown sweep mode '{}'", other)),
        }
    }
}

/// Outcome of one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Entries read from the staging list
    pub scanned: usize,
    /// Expired entries pushed back onto the queue
    pub restored: usize,
    /// Undecodable entries dropped
    pub purged: usize,
    /// Entries left in place
    pub retained: usize,
    /// Judged entries that were already gone when the pass acted on them
    pub skipped: usize,
    /// The pass stopped early on shutdown
    pub cancelled: bool,
}

enum Action {
    Purge(Vec<u8>),
    Restore { entry: Vec<u8>, payload: Vec<u8> },
}

/// Inclusive LRANGE offsets of the window starting at `cursor`
fn window_bounds(cursor: usize, batch: usize) -> (isize, isize) {
    let last = cursor.saturating_add(batch.saturating_sub(1));
    (
        isize::try_from(cursor).unwrap_or(isize::MAX),
        isize::try_from(last).unwrap_or(isize::MAX),
    )
}

/// Restores expired staged messages of one queue
#[derive(Clone)]
pub struct Sweeper {
    queue: ReliableQueue,
    clock: fn() -> i64,
}

impl Sweeper {
    pub fn new(queue: ReliableQueue) -> Self {
        Self {
            queue,
            clock: unix_now,
        }
    }

    /// Replace the unix-seconds clock used to judge expiry
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    /// Run one full pass that cannot be cancelled
    pub async fn sweep(&self) -> QueueResult<SweepReport> {
        let (_tx, rx) = watch::channel(false);
        self.sweep_once(&rx).await
    }

    /// Run one pass over the staging list, starting at offset 0.
    ///
    /// Store failures abort the pass and are returned; they are never
    /// mistaken for an empty window.
    pub async fn sweep_once(&self, shutdown: &watch::Receiver<bool>) -> QueueResult<SweepReport> {
        let config = self.queue.config();
        let store = self.queue.store();
        let ack_key = self.queue.ack_key();
        let batch = config.sweep_batch_size.max(1);

        let mut report = SweepReport::default();
        let mut pending = Vec::new();
        let mut cursor = 0usize;

        loop {
            if *shutdown.borrow() {
                debug!(queue = %config.name, cursor, "Sweep cancelled");
                report.cancelled = true;
                break;
            }

            let (start, stop) = window_bounds(cursor, batch);
            let window = store.range(ack_key, start, stop).await?;
            if window.is_empty() {
                break;
            }
            cursor = cursor.saturating_add(window.len());

            for entry in window {
                report.scanned += 1;
                let action = match Envelope::decode(&entry) {
                    Err(_) => Action::Purge(entry),
                    Ok(envelope) if envelope.is_expired((self.clock)()) => Action::Restore {
                        entry,
                        payload: envelope.payload,
                    },
                    Ok(_) => {
                        report.retained += 1;
                        continue;
                    }
                };

                match config.sweep_mode {
                    SweepMode::Streaming => self.apply(action, &mut report).await?,
                    SweepMode::Snapshot => pending.push(action),
                }
            }
        }

        // Snapshot removals run even after a cancellation: the entries were
        // already judged and the work is bounded.
        for action in pending {
            self.apply(action, &mut report).await?;
        }

        Ok(report)
    }

    async fn apply(&self, action: Action, report: &mut SweepReport) -> QueueResult<()> {
        let config = self.queue.config();
        let store = self.queue.store();
        let ack_key = self.queue.ack_key();

        match action {
            Action::Purge(entry) => {
                warn!(
                    queue = %config.name,
                    entry = %String::from_utf8_lossy(&entry),
                    "Purging malformed staged entry"
                );
                if store.remove(ack_key, 1, &entry).await? > 0 {
                    report.purged += 1;
                } else {
                    report.skipped += 1;
                }
            }
            Action::Restore { entry, payload } => {
                let request = RestoreRequest {
                    queue_key: config.name.clone(),
                    ack_key: ack_key.to_string(),
                    entry,
                    payload,
                    push_end: config.restore_end,
                };
                if store.restore(&request).await? {
                    report.restored += 1;
                } else {
                    debug!(queue = %config.name, "Expired entry already acknowledged or restored");
                    report.skipped += 1;
                }
            }
        }
        Ok(())
    }

    /// Sweep every `sweep_interval` until shutdown.
    ///
    /// A failed pass is logged and the next one starts after the interval.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> QueueResult<()> {
        let config = self.queue.config();
        info!(
            queue = %config.name,
            ack_key = %self.queue.ack_key(),
            interval_secs = config.sweep_interval.as_secs(),
            batch_size = config.sweep_batch_size,
            mode = ?config.sweep_mode,
            "Starting sweeper"
        );

        loop {
            if *shutdown.borrow() {
                info!("Received shutdown signal, stopping sweeper");
                break;
            }

            let started = Instant::now();
            match self.sweep_once(&shutdown).await {
                Ok(report) => {
                    self.queue
                        .metrics()
                        .sweep_completed(report.restored, report.purged, started.elapsed());
                    if report.restored > 0 || report.purged > 0 {
                        info!(
                            queue = %config.name,
                            scanned = report.scanned,
                            restored = report.restored,
                            purged = report.purged,
                            skipped = report.skipped,
                            "Recovered staged messages"
                        );
                    } else {
                        debug!(queue = %config.name, scanned = report.scanned, "Sweep found nothing to recover");
                    }
                }
                Err(e) => {
                    self.queue.metrics().sweep_failed();
                    error!(queue = %config.name, error = %e, kind = ?e.kind(), "Sweep failed");
                }
            }

            if let Err(e) = self.queue.stats().await {
                debug!(error = %e, "Failed to refresh queue depth gauges");
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Received shutdown signal, stopping sweeper");
                        break;
                    }
                }
                _ = tokio::time::sleep(config.sweep_interval) => {}
            }
        }

        info!(queue = %config.name, "Sweeper stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::error::{ErrorKind, QueueError};
    use crate::store::{
        ListEnd, ListStore, MemoryStore, MockListStore, RestoreRequest, StageRequest,
    };
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const NOW: i64 = 1_000_000;

    fn fixed_now() -> i64 {
        NOW
    }

    async fn staged(store: &MemoryStore, entries: &[String]) {
        let raw: Vec<Vec<u8>> = entries.iter().map(|e| e.clone().into_bytes()).collect();
        store.push("jobs:ack", ListEnd::Right, &raw).await.unwrap();
    }

    fn sweeper_on(store: Arc<dyn ListStore>, config: QueueConfig) -> Sweeper {
        ReliableQueue::new(store, config)
            .unwrap()
            .sweeper()
            .with_clock(fixed_now)
    }

    fn sweeper(store: &MemoryStore, config: QueueConfig) -> Sweeper {
        sweeper_on(Arc::new(store.clone()), config)
    }

    enum AfterFirstRange {
        Cancel(watch::Sender<bool>),
        Ack(Vec<u8>),
    }

    /// Yields before every command so concurrent passes interleave, and can
    /// act once right after the first window is read.
    struct InterleavedStore {
        inner: MemoryStore,
        after_first_range: Mutex<Option<AfterFirstRange>>,
    }

    impl InterleavedStore {
        fn new(inner: &MemoryStore, hook: Option<AfterFirstRange>) -> Arc<Self> {
            Arc::new(Self {
                inner: inner.clone(),
                after_first_range: Mutex::new(hook),
            })
        }
    }

    #[async_trait]
    impl ListStore for InterleavedStore {
        async fn push(&self, key: &str, end: ListEnd, values: &[Vec<u8>]) -> QueueResult<usize> {
            tokio::task::yield_now().await;
            self.inner.push(key, end, values).await
        }

        async fn range(&self, key: &str, start: isize, stop: isize) -> QueueResult<Vec<Vec<u8>>> {
            tokio::task::yield_now().await;
            let window = self.inner.range(key, start, stop).await?;

            let hook = self.after_first_range.lock().unwrap().take();
            match hook {
                Some(AfterFirstRange::Cancel(tx)) => {
                    let _ = tx.send(true);
                }
                Some(AfterFirstRange::Ack(entry)) => {
                    self.inner.remove(key, 1, &entry).await?;
                }
                None => {}
            }
            Ok(window)
        }

        async fn remove(&self, key: &str, count: isize, value: &[u8]) -> QueueResult<usize> {
            tokio::task::yield_now().await;
            self.inner.remove(key, count, value).await
        }

        async fn len(&self, key: &str) -> QueueResult<usize> {
            self.inner.len(key).await
        }

        async fn pop_and_stage(&self, request: &StageRequest) -> QueueResult<Vec<u8>> {
            tokio::task::yield_now().await;
            self.inner.pop_and_stage(request).await
        }

        async fn restore(&self, request: &RestoreRequest) -> QueueResult<bool> {
            tokio::task::yield_now().await;
            self.inner.restore(request).await
        }

        async fn ping(&self) -> QueueResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_sweep_mode_parse() {
        assert_eq!("snapshot".parse::<SweepMode>().unwrap(), SweepMode::Snapshot);
        assert_eq!("Streaming".parse::<SweepMode>().unwrap(), SweepMode::Streaming);
        assert!("eager".parse::<SweepMode>().is_err());
    }

    #[test]
    fn test_window_bounds_saturate() {
        assert_eq!(window_bounds(0, 51), (0, 50));
        assert_eq!(window_bounds(51, 51), (51, 101));
        assert_eq!(window_bounds(0, usize::MAX), (0, isize::MAX));
        assert_eq!(window_bounds(usize::MAX - 1, 51), (isize::MAX, isize::MAX));
    }

    #[tokio::test]
    async fn test_restores_expired_keeps_live() {
        let store = MemoryStore::new();
        staged(
            &store,
            &[
                format!("{}|old", NOW - 10),
                format!("{}|fresh", NOW + 10),
                format!("{}|edge", NOW),
            ],
        )
        .await;

        let report = sweeper(&store, QueueConfig::new("jobs")).sweep().await.unwrap();

        assert_eq!(report.scanned, 3);
        assert_eq!(report.restored, 1);
        assert_eq!(report.retained, 2);
        assert_eq!(store.list("jobs"), vec!["old"]);
        assert_eq!(
            store.list("jobs:ack"),
            vec![format!("{}|fresh", NOW + 10), format!("{}|edge", NOW)]
        );
    }

    #[tokio::test]
    async fn test_purges_malformed_without_restoring() {
        let store = MemoryStore::new();
        staged(
            &store,
            &["garbage".to_string(), "soon|task".to_string(), format!("{}|ok", NOW + 5)],
        )
        .await;

        let report = sweeper(&store, QueueConfig::new("jobs")).sweep().await.unwrap();

        assert_eq!(report.purged, 2);
        assert_eq!(report.restored, 0);
        assert!(store.list("jobs").is_empty());
        assert_eq!(store.list("jobs:ack"), vec![format!("{}|ok", NOW + 5)]);
    }

    #[tokio::test]
    async fn test_purges_invalid_utf8_next_to_expired() {
        let store = MemoryStore::new();
        store
            .push(
                "jobs:ack",
                ListEnd::Right,
                &[b"\xff\xfe|x".to_vec(), b"1|task-A".to_vec()],
            )
            .await
            .unwrap();

        let report = sweeper(&store, QueueConfig::new("jobs")).sweep().await.unwrap();

        assert_eq!(report.scanned, 2);
        assert_eq!(report.purged, 1);
        assert_eq!(report.restored, 1);
        assert_eq!(store.list("jobs"), vec!["task-A"]);
        assert!(store.raw_list("jobs:ack").is_empty());
    }

    #[tokio::test]
    async fn test_restores_binary_payload_verbatim() {
        let store = MemoryStore::new();
        store
            .push("jobs:ack", ListEnd::Right, &[b"1|\xff\x00".to_vec()])
            .await
            .unwrap();

        let report = sweeper(&store, QueueConfig::new("jobs")).sweep().await.unwrap();

        assert_eq!(report.restored, 1);
        assert_eq!(store.raw_list("jobs"), vec![b"\xff\x00".to_vec()]);
    }

    #[tokio::test]
    async fn test_restore_end() {
        let store = MemoryStore::new();
        store
            .push("jobs", ListEnd::Right, &[b"queued".to_vec()])
            .await
            .unwrap();
        staged(&store, &[format!("{}|late", NOW - 1)]).await;

        sweeper(&store, QueueConfig::new("jobs").with_left_push(true))
            .sweep()
            .await
            .unwrap();

        assert_eq!(store.list("jobs"), vec!["late", "queued"]);
    }

    #[tokio::test]
    async fn test_snapshot_restores_every_expired_entry_in_one_pass() {
        let store = MemoryStore::new();
        let entries: Vec<String> = (0..120).map(|i| format!("{}|m{}", NOW - 1, i)).collect();
        staged(&store, &entries).await;

        let report = sweeper(&store, QueueConfig::new("jobs")).sweep().await.unwrap();

        assert_eq!(report.scanned, 120);
        assert_eq!(report.restored, 120);
        assert!(store.list("jobs:ack").is_empty());
        assert_eq!(store.list("jobs").len(), 120);
        assert_eq!(store.list("jobs")[0], "m0");
    }

    #[tokio::test]
    async fn test_streaming_mode_skips_behind_removals() {
        let store = MemoryStore::new();
        let entries: Vec<String> = (0..120).map(|i| format!("{}|m{}", NOW - 1, i)).collect();
        staged(&store, &entries).await;

        let config = QueueConfig::new("jobs").with_sweep_mode(SweepMode::Streaming);
        let sweeper = sweeper(&store, config);

        // First window removes 51 entries, shifting the rest under the cursor
        let first = sweeper.sweep().await.unwrap();
        assert!(first.restored < 120);
        assert!(first.restored >= 51);

        // Later passes pick up what was skipped
        let mut total = first.restored;
        while !store.list("jobs:ack").is_empty() {
            total += sweeper.sweep().await.unwrap().restored;
        }
        assert_eq!(total, 120);
        assert_eq!(store.list("jobs").len(), 120);
    }

    #[tokio::test]
    async fn test_small_batches_scan_everything() {
        let store = MemoryStore::new();
        let entries: Vec<String> = (0..10).map(|i| format!("{}|m{}", NOW + 100, i)).collect();
        staged(&store, &entries).await;

        let report = sweeper(&store, QueueConfig::new("jobs").with_sweep_batch_size(3))
            .sweep()
            .await
            .unwrap();

        assert_eq!(report.scanned, 10);
        assert_eq!(report.retained, 10);
    }

    #[tokio::test]
    async fn test_unbounded_batch_size() {
        let store = MemoryStore::new();
        let entries: Vec<String> = (0..5).map(|i| format!("{}|m{}", NOW - 1, i)).collect();
        staged(&store, &entries).await;

        let report = sweeper(&store, QueueConfig::new("jobs").with_sweep_batch_size(usize::MAX))
            .sweep()
            .await
            .unwrap();

        assert_eq!(report.scanned, 5);
        assert_eq!(report.restored, 5);
    }

    #[tokio::test]
    async fn test_empty_staging_list() {
        let store = MemoryStore::new();
        let report = sweeper(&store, QueueConfig::new("jobs")).sweep().await.unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn test_cancelled_before_first_window() {
        let store = MemoryStore::new();
        staged(&store, &[format!("{}|old", NOW - 10)]).await;

        let (_tx, rx) = watch::channel(true);
        let report = sweeper(&store, QueueConfig::new("jobs"))
            .sweep_once(&rx)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.scanned, 0);
        assert_eq!(store.list("jobs:ack").len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_after_first_window_applies_judged_entries() {
        let store = MemoryStore::new();
        let entries: Vec<String> = (0..60).map(|i| format!("{}|m{}", NOW - 1, i)).collect();
        staged(&store, &entries).await;

        let (tx, rx) = watch::channel(false);
        let interleaved = InterleavedStore::new(&store, Some(AfterFirstRange::Cancel(tx)));
        let report = sweeper_on(interleaved, QueueConfig::new("jobs"))
            .sweep_once(&rx)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.scanned, 51);
        assert_eq!(report.restored, 51);

        let unread: Vec<String> = (51..60).map(|i| format!("{}|m{}", NOW - 1, i)).collect();
        assert_eq!(store.list("jobs:ack"), unread);
        assert_eq!(store.list("jobs").len(), 51);
        assert_eq!(store.list("jobs")[0], "m0");
    }

    #[tokio::test]
    async fn test_concurrent_sweeps_restore_once() {
        let store = MemoryStore::new();
        staged(&store, &["1|task-A".to_string()]).await;

        let interleaved = InterleavedStore::new(&store, None);
        let sweeper = sweeper_on(interleaved, QueueConfig::new("jobs"));

        let (first, second) = tokio::join!(sweeper.sweep(), sweeper.sweep());
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(first.restored + second.restored, 1);
        assert_eq!(first.skipped + second.skipped, first.scanned + second.scanned - 1);
        assert_eq!(store.list("jobs"), vec!["task-A"]);
        assert!(store.list("jobs:ack").is_empty());
    }

    #[tokio::test]
    async fn test_ack_between_scan_and_restore_is_not_redelivered() {
        let store = MemoryStore::new();
        staged(&store, &["1|task-A".to_string()]).await;

        let hook = AfterFirstRange::Ack(b"1|task-A".to_vec());
        let interleaved = InterleavedStore::new(&store, Some(hook));
        let report = sweeper_on(interleaved, QueueConfig::new("jobs"))
            .sweep()
            .await
            .unwrap();

        assert_eq!(report.scanned, 1);
        assert_eq!(report.restored, 0);
        assert_eq!(report.skipped, 1);
        assert!(store.list("jobs").is_empty());
        assert!(store.list("jobs:ack").is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_is_not_an_empty_window() {
        let mut store = MockListStore::new();
        store.expect_range().returning(|_, _, _| {
            let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "down");
            Err(QueueError::Redis(redis::RedisError::from(io)))
        });

        let queue = ReliableQueue::new(Arc::new(store), QueueConfig::new("jobs")).unwrap();
        let err = queue.sweeper().sweep().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_window_offsets() {
        let mut store = MockListStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_range()
            .withf(|key, start, stop| key == "jobs:ack" && *start == 0 && *stop == 50)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(vec![format!("{}|live", NOW + 60).into_bytes()]));
        store
            .expect_range()
            .withf(|_, start, stop| *start == 1 && *stop == 51)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(vec![]));

        let queue = ReliableQueue::new(Arc::new(store), QueueConfig::new("jobs")).unwrap();
        let report = queue.sweeper().with_clock(fixed_now).sweep().await.unwrap();
        assert_eq!(report.retained, 1);
    }

    #[tokio::test]
    async fn test_restore_lost_to_ack_counts_as_skipped() {
        let mut store = MockListStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_range()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(vec![b"1|gone".to_vec()]));
        store
            .expect_range()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(vec![]));
        store
            .expect_restore()
            .withf(|r| r.entry == b"1|gone" && r.payload == b"gone" && r.queue_key == "jobs")
            .times(1)
            .returning(|_| Ok(false));

        let queue = ReliableQueue::new(Arc::new(store), QueueConfig::new("jobs")).unwrap();
        let report = queue.sweeper().with_clock(fixed_now).sweep().await.unwrap();
        assert_eq!(report.restored, 0);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let store = MemoryStore::new();
        staged(&store, &[format!("{}|old", NOW - 10)]).await;

        let config = QueueConfig::new("jobs").with_sweep_interval(Duration::from_secs(5));
        let sweeper = sweeper(&store, config);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { sweeper.run(rx).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();

        handle.await.unwrap().unwrap();
        assert_eq!(store.list("jobs"), vec!["old"]);
    }
}
