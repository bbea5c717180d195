use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use super::{WorkOutcome, Worker};
use crate::queue::{JsonQueue, QueueManager, RetryWork};
use crate::recovery::ErrorRecoveryEngine;

/// Feeds due retries from the retry queue into the recovery engine.
///
/// Envelopes are always acked: the engine records the outcome on the error
/// log, so a failed retry is never retried by the queue itself.
pub struct RetryWorker {
    queue: Arc<JsonQueue>,
    engine: Arc<ErrorRecoveryEngine>,
}

impl RetryWorker {
    pub fn new(queues: &QueueManager, engine: Arc<ErrorRecoveryEngine>) -> Self {
        Self {
            queue: queues.retry_queue(),
            engine,
        }
    }

    pub async fn run_once(&self) -> WorkOutcome {
        for stalled in self.queue.take_reclaimed().await {
            error!(
                envelope_id = %stalled.id,
                attempts = stalled.attempts,
                "retry envelope stalled past its attempts; its error log stays unresolved"
            );
        }

        let Some(envelope) = self.queue.dequeue().await else {
            return WorkOutcome::Idle;
        };

        let outcome = match serde_json::from_value::<RetryWork>(envelope.payload) {
            Ok(work) => match self.engine.retry_error(&work.error_id).await {
                Ok(()) => WorkOutcome::Succeeded,
                Err(err) => {
                    warn!(error_id = %work.error_id, error = %err, "retry did not recover");
                    WorkOutcome::Failed
                }
            },
            Err(err) => {
                error!(envelope_id = %envelope.id, error = %err, "dropping undecodable retry payload");
                WorkOutcome::Failed
            }
        };

        if let Err(err) = self.queue.ack(envelope.id).await {
            warn!(error = %err, "could not ack retry envelope");
        }
        outcome
    }
}

impl core::fmt::Debug for RetryWorker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RetryWorker").finish_non_exhaustive()
    }
}

#[async_trait]
impl Worker for RetryWorker {
    fn name(&self) -> String {
        "retry".to_owned()
    }

    async fn run_once(&self) -> WorkOutcome {
        RetryWorker::run_once(self).await
    }
}
