//! Shared test utilities for queue testing
//!
//! - `TestRedis`: Redis container with automatic cleanup (feature: "redis")
//! - `TestDataBuilder`: deterministic queue names and payloads
//! - `assertions`: helpers for checking staged envelopes
//!
//! # Redis Testing
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["redis"] }
//! ```
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRedis};
//!
//! #[tokio::test]
//! async fn my_queue_test() {
//!     let redis = TestRedis::new().await;
//!     let conn = redis.connection_manager().await;
//!     let queue_name = TestDataBuilder::from_test_name("my_queue_test").queue_name("jobs");
//! }
//! ```

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Deterministic test data, seeded from the test name.
///
/// Tests sharing one Redis instance stay isolated by using distinct
/// queue names.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let a = TestDataBuilder::from_test_name("test_sweep");
    /// let b = TestDataBuilder::from_test_name("test_sweep");
    /// assert_eq!(a.queue_name("jobs"), b.queue_name("jobs"));
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Queue key unique to this builder, e.g. `test:jobs:12345`
    pub fn queue_name(&self, prefix: &str) -> String {
        format!("test:{}:{}", prefix, self.seed)
    }

    /// `count` distinct payloads, `<label>-0` .. `<label>-{count-1}`
    pub fn payloads(&self, label: &str, count: usize) -> Vec<String> {
        (0..count).map(|i| format!("{}-{}", label, i)).collect()
    }
}

/// Test assertion helpers
pub mod assertions {
    /// Assert `raw` is a well-formed `<expiry>|<payload>` envelope for
    /// `payload` and return its expiry.
    pub fn assert_envelope(raw: &str, payload: &str) -> i64 {
        let (expiry, rest) = raw
            .split_once('|')
            .unwrap_or_else(|| panic!("envelope '{}' has no delimiter", raw));
        assert_eq!(rest, payload, "envelope '{}' carries the wrong payload", raw);
        expiry
            .parse()
            .unwrap_or_else(|_| panic!("envelope '{}' has a non-numeric expiry", raw))
    }

    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }
}
