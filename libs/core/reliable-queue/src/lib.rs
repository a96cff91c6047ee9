//! Reliable Queue
//!
//! At-least-once message queue on top of plain Redis lists.
//!
//! ## Features
//!
//! - **Atomic reservation**: a Lua script pops a message and stages it as
//!   `<expiry>|<payload>` in the acknowledgement list in one step
//! - **Acknowledgement by value**: finished messages are removed with `LREM`
//! - **Expiry sweeper**: staged messages whose deadline passed are removed
//!   and pushed back onto the queue in one atomic step, malformed entries
//!   are purged
//! - **Listener**: bounded-concurrency consume loop with validation and
//!   error hooks, per-key ordering and graceful shutdown
//! - **Binary safe**: payloads are opaque bytes end to end
//! - **Prometheus metrics** and **health endpoints**
//!
//! ## Example
//!
//! ```ignore
//! use reliable_queue::{QueueConfig, QueueDef, ReliableQueue};
//!
//! struct Thumbnails;
//! impl QueueDef for Thumbnails {
//!     const QUEUE_NAME: &'static str = "media:thumbnails";
//! }
//!
//! let redis = reliable_queue::connect("redis://localhost:6379").await?;
//! let queue = ReliableQueue::redis(redis, QueueConfig::from_queue_def::<Thumbnails>())?;
//!
//! queue.producer().push("resize:42").await?;
//!
//! if let Some(reservation) = queue.reserve().await? {
//!     // process reservation.payload ...
//!     queue.ack(&reservation).await?;
//! }
//!
//! // In a dedicated process
//! queue.sweeper().run(shutdown_rx).await?;
//! ```

mod config;
mod envelope;
mod error;
mod health;
mod listener;
pub mod metrics;
mod producer;
mod queue;
mod registry;
mod store;
mod sweeper;

// Re-export main types
pub use config::{DEFAULT_ACK_SUFFIX, DEFAULT_SWEEP_BATCH_SIZE, QueueConfig};
pub use envelope::{DELIMITER, Envelope, decode, encode};
pub use error::{ErrorKind, QueueError, QueueResult};
pub use health::{HealthState, health_router};
pub use listener::{Delivery, Listener, MessageHandler, json_key};
pub use metrics::{QueueMetrics, init_metrics};
pub use producer::QueueProducer;
pub use queue::{QueueStats, ReliableQueue, Reservation, unix_now};
pub use registry::QueueDef;
pub use store::{
    ListEnd, ListStore, MemoryStore, RESERVE_SCRIPT, RESTORE_SCRIPT, RedisStore, RestoreRequest,
    StageRequest, connect,
};
pub use sweeper::{SweepMode, SweepReport, Sweeper};
