//! Error classification, logging and retry scheduling.

mod engine;
mod policy;
mod retry;
mod types;

pub use engine::{ErrorRecoveryEngine, RecoveryError};
pub use policy::RetryPolicy;
pub use retry::{RequeueStageRetry, RetryHandler};
pub use types::{ErrorKind, ErrorLog, ErrorStats, ErrorStatus};
