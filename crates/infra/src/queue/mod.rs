//! Stage queues.
//!
//! Each pipeline stage is backed by one named in-memory [`Queue`]; the
//! [`QueueManager`] hands out shared instances by name. Queue state lives in
//! process memory only.

mod fifo;
mod manager;
mod types;
mod work;

pub use fifo::Queue;
pub use manager::{JsonQueue, QueueManager, RETRY_QUEUE};
pub use types::{EnqueueOptions, FailOutcome, QueueError, QueueJob, QueueStats};
pub use work::{ItemWork, RetryWork};
