//! Queue definitions
//!
//! Services declare their queues once as zero-sized types and derive a
//! `QueueConfig` from them, so producers, consumers and the sweeper agree on
//! keys and timings.

/// Static definition of a reliable queue.
///
/// # Example
///
/// ```rust
/// use reliable_queue::{QueueConfig, QueueDef};
///
/// struct ThumbnailQueue;
///
/// impl QueueDef for ThumbnailQueue {
///     const QUEUE_NAME: &'static str = "media:thumbnails";
///     const MESSAGE_TIMEOUT_SECS: u64 = 300;
/// }
///
/// let config = QueueConfig::from_queue_def::<ThumbnailQueue>();
/// assert_eq!(config.ack_key(), "media:thumbnails:ack");
/// ```
pub trait QueueDef {
    /// Main list key
    const QUEUE_NAME: &'static str;

    /// Suffix appended to the queue name for the staging list
    const ACK_SUFFIX: &'static str = ":ack";

    /// Seconds a reserved message may stay unacknowledged
    const MESSAGE_TIMEOUT_SECS: u64 = 20 * 60;

    /// Safety-net TTL of the staging list
    const LIST_TTL_SECS: u64 = 3600;

    /// Restore expired messages with LPUSH instead of RPUSH
    const LEFT_PUSH: bool = false;
}
