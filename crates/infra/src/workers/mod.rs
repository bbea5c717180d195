//! In-process workers draining the pipeline queues.
//!
//! A [`StageWorker`] runs one [`StageHandler`] against its stage queue and
//! reports item outcomes on the bus; a [`RetryWorker`] feeds due retries back
//! into the recovery engine. [`spawn`] drives either on a tokio task.

mod retry;
mod runner;
mod stage;

pub use retry::RetryWorker;
pub use runner::{WorkOutcome, Worker, WorkerHandle, WorkerStats, spawn};
pub use stage::{RETRIES_EXHAUSTED, StageError, StageHandler, StageWorker};
