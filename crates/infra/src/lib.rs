//! Infrastructure layer: queues, repositories, orchestration, recovery, workers.
//!
//! Everything here runs in one process. Components talk through the
//! [`EventBus`](narrator_events::EventBus) and the named queues of the
//! [`QueueManager`](queue::QueueManager); [`pipeline::Pipeline`] wires the
//! in-memory versions together.

pub mod config;
pub mod job_locks;
pub mod orchestrator;
pub mod pipeline;
pub mod queue;
pub mod recovery;
pub mod repository;
pub mod workers;


pub use config::PipelineConfig;
pub use orchestrator::{JobOrchestrator, JobStatusView, OrchestratorError};
pub use pipeline::Pipeline;
pub use recovery::{ErrorRecoveryEngine, RecoveryError};
