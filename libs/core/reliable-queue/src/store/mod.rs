//! List store abstraction
//!
//! Every queue operation goes through `ListStore`, which exposes only the
//! list commands the protocol needs. `RedisStore` talks to a real server;
//! `MemoryStore` is an in-process stand-in with the same atomicity.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use self::redis::{RESERVE_SCRIPT, RESTORE_SCRIPT, RedisStore, connect};

use crate::error::QueueResult;
use async_trait::async_trait;

/// One end of a list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListEnd {
    /// Head (LPUSH / LPOP)
    Left,
    /// Tail (RPUSH / RPOP)
    Right,
}

impl ListEnd {
    pub fn opposite(&self) -> Self {
        match self {
            ListEnd::Left => ListEnd::Right,
            ListEnd::Right => ListEnd::Left,
        }
    }

    pub fn push_command(&self) -> &'static str {
        match self {
            ListEnd::Left => "LPUSH",
            ListEnd::Right => "RPUSH",
        }
    }

    pub fn pop_command(&self) -> &'static str {
        match self {
            ListEnd::Left => "LPOP",
            ListEnd::Right => "RPOP",
        }
    }
}

/// Arguments of the atomic pop-and-stage step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRequest {
    /// Main list to pop from
    pub queue_key: String,
    /// Staging list to append the envelope to
    pub ack_key: String,
    /// End of the main list to pop
    pub pop_end: ListEnd,
    /// Unix seconds embedded in the staged envelope
    pub expiry: i64,
    /// TTL applied to the staging list afterwards
    pub ttl_secs: u64,
}

/// Arguments of the conditional restore step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRequest {
    /// Main list the payload goes back to
    pub queue_key: String,
    /// Staging list holding the entry
    pub ack_key: String,
    /// Exact staged entry, envelope included
    pub entry: Vec<u8>,
    /// Bare payload pushed back onto the main list
    pub payload: Vec<u8>,
    /// End of the main list to push onto
    pub push_end: ListEnd,
}

/// Capability over a shared list-oriented store.
///
/// Implementations must execute each method as one atomic step on the
/// store; `pop_and_stage` must never expose a popped but unstaged element
/// and `restore` must never push a payload whose entry it did not remove.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ListStore: Send + Sync {
    /// Push values onto `end` of `key` in one command. Returns the new length.
    async fn push(&self, key: &str, end: ListEnd, values: &[Vec<u8>]) -> QueueResult<usize>;

    /// Read `[start, stop]` (inclusive, negative offsets count from the tail).
    async fn range(&self, key: &str, start: isize, stop: isize) -> QueueResult<Vec<Vec<u8>>>;

    /// Remove up to `count` occurrences of `value` (LREM semantics).
    async fn remove(&self, key: &str, count: isize, value: &[u8]) -> QueueResult<usize>;

    /// Length of `key`, zero when missing.
    async fn len(&self, key: &str) -> QueueResult<usize>;

    /// Pop one element and stage `expiry|element`, refreshing the staging TTL.
    ///
    /// Returns `Err(QueueError::Empty)` when the main list has no element.
    async fn pop_and_stage(&self, request: &StageRequest) -> QueueResult<Vec<u8>>;

    /// Remove one copy of the staged entry and, only if one was removed,
    /// push the payload back onto the main list.
    ///
    /// Returns `false` when the entry was already gone (acknowledged or
    /// restored by someone else), in which case nothing is pushed.
    async fn restore(&self, request: &RestoreRequest) -> QueueResult<bool>;

    /// Round-trip check used by readiness probes.
    async fn ping(&self) -> QueueResult<()>;
}
