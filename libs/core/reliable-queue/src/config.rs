//! Queue configuration
//!
//! This module provides `QueueConfig`, the immutable description of one
//! named queue shared by producers, consumers and the sweeper.

use crate::error::QueueError;
use crate::registry::QueueDef;
use crate::store::ListEnd;
use crate::sweeper::SweepMode;
use std::time::Duration;
use tracing::warn;

/// Default staging list suffix
pub const DEFAULT_ACK_SUFFIX: &str = ":ack";

/// Default window size of one sweeper range read (offsets `[n, n+50]`)
pub const DEFAULT_SWEEP_BATCH_SIZE: usize = 51;

/// Configuration for a reliable queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Main list key
    pub name: String,

    /// Suffix appended to `name` to form the staging list key
    pub ack_suffix: String,

    /// End producers push onto; reservations pop from the other end
    pub producer_end: ListEnd,

    /// End the sweeper pushes restored messages onto
    pub restore_end: ListEnd,

    /// How long a reserved message may stay unacknowledged
    pub message_timeout: Duration,

    /// TTL refreshed on the staging list by every reservation
    pub list_ttl_secs: u64,

    /// Pause between sweeper passes when running continuously
    pub sweep_interval: Duration,

    /// Number of staged entries read per range request
    pub sweep_batch_size: usize,

    /// When the sweeper issues its removals
    pub sweep_mode: SweepMode,

    /// Listener wait when the queue is empty
    pub empty_queue_poll: Duration,

    /// Maximum handlers the listener runs at once
    pub max_concurrent_jobs: usize,
}

impl QueueConfig {
    /// Create a new QueueConfig with default timings
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ack_suffix: DEFAULT_ACK_SUFFIX.to_string(),
            producer_end: ListEnd::Right,
            restore_end: ListEnd::Right,
            message_timeout: Duration::from_secs(20 * 60),
            list_ttl_secs: 3600,
            sweep_interval: Duration::from_secs(60),
            sweep_batch_size: DEFAULT_SWEEP_BATCH_SIZE,
            sweep_mode: SweepMode::default(),
            empty_queue_poll: Duration::from_secs(60),
            max_concurrent_jobs: 1,
        }
    }

    /// Create a QueueConfig from a `QueueDef`
    pub fn from_queue_def<Q: QueueDef>() -> Self {
        Self::new(Q::QUEUE_NAME)
            .with_ack_suffix(Q::ACK_SUFFIX)
            .with_left_push(Q::LEFT_PUSH)
            .with_message_timeout(Duration::from_secs(Q::MESSAGE_TIMEOUT_SECS))
            .with_list_ttl_secs(Q::LIST_TTL_SECS)
    }

    /// Staging list key (`name` + `ack_suffix`)
    pub fn ack_key(&self) -> String {
        format!("{}{}", self.name, self.ack_suffix)
    }

    /// End reservations pop from
    pub fn reserve_end(&self) -> ListEnd {
        self.producer_end.opposite()
    }

    /// Message timeout in whole seconds, rounded up and at least one
    pub fn message_timeout_secs(&self) -> i64 {
        let secs = self
            .message_timeout
            .as_secs()
            .saturating_add(u64::from(self.message_timeout.subsec_nanos() > 0));
        i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
    }

    /// Set the staging list suffix
    pub fn with_ack_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.ack_suffix = suffix.into();
        self
    }

    /// Restore with LPUSH (`true`) or RPUSH (`false`)
    pub fn with_left_push(mut self, left: bool) -> Self {
        self.restore_end = if left { ListEnd::Left } else { ListEnd::Right };
        self
    }

    /// Set the end producers push onto
    pub fn with_producer_end(mut self, end: ListEnd) -> Self {
        self.producer_end = end;
        self
    }

    /// Set the message timeout
    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    /// Set the staging list TTL
    pub fn with_list_ttl_secs(mut self, secs: u64) -> Self {
        self.list_ttl_secs = secs;
        self
    }

    /// Set the pause between sweeper passes
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the sweeper window size
    pub fn with_sweep_batch_size(mut self, size: usize) -> Self {
        self.sweep_batch_size = size.max(1);
        self
    }

    /// Set the sweep mode
    pub fn with_sweep_mode(mut self, mode: SweepMode) -> Self {
        self.sweep_mode = mode;
        self
    }

    /// Set the listener wait for empty queues
    pub fn with_empty_queue_poll(mut self, poll: Duration) -> Self {
        self.empty_queue_poll = poll;
        self
    }

    /// Set the maximum concurrent handlers
    pub fn with_max_concurrent_jobs(mut self, count: usize) -> Self {
        self.max_concurrent_jobs = count.max(1);
        self
    }

    /// Reject unusable settings.
    ///
    /// A staging TTL that does not exceed the sweep interval is allowed but
    /// logged: the store may drop the whole staging list before a pass runs.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.name.is_empty() {
            return Err(QueueError::Config("queue name must not be empty".into()));
        }
        if self.ack_suffix.is_empty() {
            return Err(QueueError::Config(
                "ack suffix must not be empty, staging would share the queue key".into(),
            ));
        }
        if self.list_ttl_secs == 0 {
            return Err(QueueError::Config("list TTL must be positive".into()));
        }
        if self.list_ttl_secs <= self.sweep_interval.as_secs() {
            warn!(
                queue = %self.name,
                list_ttl_secs = self.list_ttl_secs,
                sweep_interval_secs = self.sweep_interval.as_secs(),
                "Staging list TTL does not exceed the sweep interval; staged messages may be dropped"
            );
        }
        Ok(())
    }
}

#[cfg(feature = "config")]
mod env {
    use super::QueueConfig;
    use crate::sweeper::SweepMode;
    use core_config::{ConfigError, FromEnv, env_bool, env_parse, env_required};
    use std::time::Duration;

    /// Load QueueConfig from environment variables
    ///
    /// Environment variables:
    /// - `RQ_QUEUE_NAME` (required) - main list key
    /// - `RQ_ACK_SUFFIX` (default `:ack`)
    /// - `RQ_LEFT_PUSH` (default `false`) - restore with LPUSH
    /// - `RQ_PRODUCER_LEFT_PUSH` (default `false`) - producers LPUSH, reserve RPOP
    /// - `RQ_MESSAGE_TIMEOUT_SECS` (default 1200)
    /// - `RQ_LIST_TTL_SECS` (default 3600)
    /// - `RQ_SWEEP_INTERVAL_SECS` (default 60)
    /// - `RQ_SWEEP_BATCH_SIZE` (default 51)
    /// - `RQ_SWEEP_MODE` (`snapshot` or `streaming`, default `snapshot`)
    /// - `RQ_EMPTY_QUEUE_POLL_SECS` (default 60)
    /// - `RQ_MAX_CONCURRENT_JOBS` (default 1)
    impl FromEnv for QueueConfig {
        fn from_env() -> Result<Self, ConfigError> {
            let name = env_required("RQ_QUEUE_NAME")?;
            let ack_suffix = core_config::env_or_default("RQ_ACK_SUFFIX", super::DEFAULT_ACK_SUFFIX);

            let producer_end = if env_bool("RQ_PRODUCER_LEFT_PUSH", false)? {
                crate::store::ListEnd::Left
            } else {
                crate::store::ListEnd::Right
            };

            let mode: String = env_parse("RQ_SWEEP_MODE", "snapshot".to_string())?;
            let sweep_mode = mode.parse::<SweepMode>().map_err(|e| ConfigError::ParseError {
                key: "RQ_SWEEP_MODE".to_string(),
                details: e,
            })?;

            Ok(QueueConfig::new(name)
                .with_ack_suffix(ack_suffix)
                .with_left_push(env_bool("RQ_LEFT_PUSH", false)?)
                .with_producer_end(producer_end)
                .with_message_timeout(Duration::from_secs(env_parse(
                    "RQ_MESSAGE_TIMEOUT_SECS",
                    20 * 60,
                )?))
                .with_list_ttl_secs(env_parse("RQ_LIST_TTL_SECS", 3600)?)
                .with_sweep_interval(Duration::from_secs(env_parse("RQ_SWEEP_INTERVAL_SECS", 60)?))
                .with_sweep_batch_size(env_parse(
                    "RQ_SWEEP_BATCH_SIZE",
                    super::DEFAULT_SWEEP_BATCH_SIZE,
                )?)
                .with_sweep_mode(sweep_mode)
                .with_empty_queue_poll(Duration::from_secs(env_parse(
                    "RQ_EMPTY_QUEUE_POLL_SECS",
                    60,
                )?))
                .with_max_concurrent_jobs(env_parse("RQ_MAX_CONCURRENT_JOBS", 1)?))
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new("queue")
    }
}
