use super::{ListEnd, ListStore, RestoreRequest, StageRequest};
use crate::error::{QueueError, QueueResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::sync::Arc;
use tracing::{debug, info};

/// Pop one element, stage it with its expiry and refresh the staging TTL.
///
/// KEYS[1] main list, KEYS[2] staging list
/// ARGV[1] expiry (unix seconds), ARGV[2] staging TTL, ARGV[3] LPOP or RPOP
pub const RESERVE_SCRIPT: &str = r"
local element = redis.call(ARGV[3], KEYS[1])
if element then
    redis.call('RPUSH', KEYS[2], ARGV[1] .. '|' .. element)
    redis.call('EXPIRE', KEYS[2], tonumber(ARGV[2]))
    return element
end
return false
";

/// Remove one staged entry and push its payload back only if it was removed.
///
/// KEYS[1] main list, KEYS[2] staging list
/// ARGV[1] staged entry, ARGV[2] payload, ARGV[3] LPUSH or RPUSH
pub const RESTORE_SCRIPT: &str = r"
if redis.call('LREM', KEYS[2], 1, ARGV[1]) == 1 then
    redis.call(ARGV[3], KEYS[1], ARGV[2])
    return 1
end
return 0
";

/// Connect to Redis and verify the connection with PING
pub async fn connect(url: &str) -> redis::RedisResult<ConnectionManager> {
    info!("Attempting to connect to Redis");

    let client = Client::open(url)?;
    let manager = ConnectionManager::new(client).await?;

    let mut conn = manager.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;

    info!("Successfully connected to Redis");
    Ok(manager)
}

/// `ListStore` backed by a Redis connection manager
#[derive(Clone)]
pub struct RedisStore {
    redis: Arc<ConnectionManager>,
    reserve: Arc<Script>,
    restore: Arc<Script>,
}

impl RedisStore {
    /// Create a new RedisStore
    pub fn new(redis: ConnectionManager) -> Self {
        Self::from_arc(Arc::new(redis))
    }

    /// Create from an Arc<ConnectionManager> (for sharing connections)
    pub fn from_arc(redis: Arc<ConnectionManager>) -> Self {
        Self {
            redis,
            reserve: Arc::new(Script::new(RESERVE_SCRIPT)),
            restore: Arc::new(Script::new(RESTORE_SCRIPT)),
        }
    }
}

#[async_trait]
impl ListStore for RedisStore {
    async fn push(&self, key: &str, end: ListEnd, values: &[Vec<u8>]) -> QueueResult<usize> {
        if values.is_empty() {
            return self.len(key).await;
        }

        let mut conn = (*self.redis).clone();
        let len: usize = match end {
            ListEnd::Left => conn.lpush(key, values).await?,
            ListEnd::Right => conn.rpush(key, values).await?,
        };
        Ok(len)
    }

    async fn range(&self, key: &str, start: isize, stop: isize) -> QueueResult<Vec<Vec<u8>>> {
        let mut conn = (*self.redis).clone();
        let items: Vec<Vec<u8>> = conn.lrange(key, start, stop).await?;
        Ok(items)
    }

    async fn remove(&self, key: &str, count: isize, value: &[u8]) -> QueueResult<usize> {
        let mut conn = (*self.redis).clone();
        let removed: usize = conn.lrem(key, count, value).await?;
        Ok(removed)
    }

    async fn len(&self, key: &str) -> QueueResult<usize> {
        let mut conn = (*self.redis).clone();
        let len: usize = conn.llen(key).await?;
        Ok(len)
    }

    async fn pop_and_stage(&self, request: &StageRequest) -> QueueResult<Vec<u8>> {
        let mut conn = (*self.redis).clone();

        let element: Option<Vec<u8>> = self
            .reserve
            .key(&request.queue_key)
            .key(&request.ack_key)
            .arg(request.expiry)
            .arg(request.ttl_secs)
            .arg(request.pop_end.pop_command())
            .invoke_async(&mut conn)
            .await?;

        match element {
            Some(element) => {
                debug!(
                    queue = %request.queue_key,
                    expiry = request.expiry,
                    "Staged reserved message"
                );
                Ok(element)
            }
            None => Err(QueueError::Empty),
        }
    }

    async fn restore(&self, request: &RestoreRequest) -> QueueResult<bool> {
        let mut conn = (*self.redis).clone();

        let removed: i64 = self
            .restore
            .key(&request.queue_key)
            .key(&request.ack_key)
            .arg(request.entry.as_slice())
            .arg(request.payload.as_slice())
            .arg(request.push_end.push_command())
            .invoke_async(&mut conn)
            .await?;

        Ok(removed == 1)
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = (*self.redis).clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
