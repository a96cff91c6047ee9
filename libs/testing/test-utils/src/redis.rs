//! Redis container for queue tests

use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Client};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

const REDIS_TAG: &str = "8-alpine";
const REDIS_PORT: u16 = 6379;

/// A throwaway Redis server, removed when dropped.
///
/// ```no_run
/// use test_utils::TestRedis;
///
/// # async fn example() {
/// let redis = TestRedis::new().await;
/// let manager = redis.connection_manager().await;
/// assert!(redis.list("jobs").await.is_empty());
/// # }
/// ```
pub struct TestRedis {
    _container: ContainerAsync<Redis>,
    client: Client,
    url: String,
}

impl TestRedis {
    pub async fn new() -> Self {
        let container = Redis::default()
            .with_tag(REDIS_TAG)
            .start()
            .await
            .expect("redis container should start");

        let port = container
            .get_host_port_ipv4(REDIS_PORT)
            .await
            .expect("redis port should be mapped");

        let url = format!("redis://127.0.0.1:{}", port);
        let client = Client::open(url.as_str()).expect("redis url should be valid");
        tracing::info!(%url, tag = REDIS_TAG, "Test Redis started");

        Self {
            _container: container,
            client,
            url,
        }
    }

    /// Connection URL, e.g. for `reliable_queue::connect`
    pub fn connection_string(&self) -> &str {
        &self.url
    }

    /// Plain multiplexed connection for direct assertions
    pub async fn connection(&self) -> MultiplexedConnection {
        self.client
            .get_multiplexed_async_connection()
            .await
            .expect("redis connection should open")
    }

    /// Reconnecting connection, as services use in production
    pub async fn connection_manager(&self) -> ConnectionManager {
        ConnectionManager::new(self.client.clone())
            .await
            .expect("connection manager should open")
    }

    /// Full contents of a list, head first
    pub async fn list(&self, key: &str) -> Vec<String> {
        self.connection()
            .await
            .lrange(key, 0, -1)
            .await
            .expect("LRANGE should succeed")
    }
}
