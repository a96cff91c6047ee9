use super::{ListEnd, ListStore, RestoreRequest, StageRequest};
use crate::envelope;
use crate::error::{QueueError, QueueResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct Lists {
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    ttls: HashMap<String, u64>,
}

impl Lists {
    /// Drop keys whose list became empty, mirroring Redis key deletion
    fn prune(&mut self, key: &str) {
        if self.lists.get(key).is_some_and(|l| l.is_empty()) {
            self.lists.remove(key);
            self.ttls.remove(key);
        }
    }

    /// LREM on one list
    fn remove(&mut self, key: &str, count: isize, value: &[u8]) -> usize {
        let Some(list) = self.lists.get_mut(key) else {
            return 0;
        };

        let limit = if count == 0 { usize::MAX } else { count.unsigned_abs() };
        let mut removed = 0;

        if count >= 0 {
            let mut i = 0;
            while i < list.len() && removed < limit {
                if list[i] == value {
                    list.remove(i);
                    removed += 1;
                } else {
                    i += 1;
                }
            }
        } else {
            let mut i = list.len();
            while i > 0 && removed < limit {
                i -= 1;
                if list[i] == value {
                    list.remove(i);
                    removed += 1;
                }
            }
        }

        self.prune(key);
        removed
    }

    fn push(&mut self, key: &str, end: ListEnd, value: Vec<u8>) {
        let list = self.lists.entry(key.to_string()).or_default();
        match end {
            ListEnd::Left => list.push_front(value),
            ListEnd::Right => list.push_back(value),
        }
    }
}

/// In-process `ListStore`.
///
/// A single mutex serialises every command, which gives the same
/// all-or-nothing behaviour Redis provides for commands and scripts. TTLs
/// are recorded but never fire.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Lists>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Lists> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of a list, head first, with invalid UTF-8 replaced
    pub fn list(&self, key: &str) -> Vec<String> {
        self.raw_list(key)
            .iter()
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }

    /// Snapshot of a list, head first, as stored
    pub fn raw_list(&self, key: &str) -> Vec<Vec<u8>> {
        self.lock()
            .lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// TTL last applied to `key`
    pub fn ttl(&self, key: &str) -> Option<u64> {
        self.lock().ttls.get(key).copied()
    }
}

/// Resolve Redis-style inclusive offsets against a list of `len` items
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };

    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl ListStore for MemoryStore {
    async fn push(&self, key: &str, end: ListEnd, values: &[Vec<u8>]) -> QueueResult<usize> {
        let mut state = self.lock();
        for value in values {
            state.push(key, end, value.clone());
        }
        Ok(state.lists.get(key).map_or(0, VecDeque::len))
    }

    async fn range(&self, key: &str, start: isize, stop: isize) -> QueueResult<Vec<Vec<u8>>> {
        let state = self.lock();
        let Some(list) = state.lists.get(key) else {
            return Ok(vec![]);
        };

        Ok(match resolve_range(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => vec![],
        })
    }

    async fn remove(&self, key: &str, count: isize, value: &[u8]) -> QueueResult<usize> {
        Ok(self.lock().remove(key, count, value))
    }

    async fn len(&self, key: &str) -> QueueResult<usize> {
        Ok(self.lock().lists.get(key).map_or(0, VecDeque::len))
    }

    async fn pop_and_stage(&self, request: &StageRequest) -> QueueResult<Vec<u8>> {
        let mut state = self.lock();

        let element = state
            .lists
            .get_mut(&request.queue_key)
            .and_then(|list| match request.pop_end {
                ListEnd::Left => list.pop_front(),
                ListEnd::Right => list.pop_back(),
            })
            .ok_or(QueueError::Empty)?;
        state.prune(&request.queue_key);

        state
            .lists
            .entry(request.ack_key.clone())
            .or_default()
            .push_back(envelope::encode(request.expiry, &element));
        state.ttls.insert(request.ack_key.clone(), request.ttl_secs);

        Ok(element)
    }

    async fn restore(&self, request: &RestoreRequest) -> QueueResult<bool> {
        let mut state = self.lock();
        if state.remove(&request.ack_key, 1, &request.entry) == 0 {
            return Ok(false);
        }
        state.push(&request.queue_key, request.push_end, request.payload.clone());
        Ok(true)
    }

    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }
}
