use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, error, warn};

use narrator_core::EnvelopeId;
use narrator_events::{ErrorContext, EventBus, PipelineEvent};
use narrator_production::Stage;

use super::{WorkOutcome, Worker};
use crate::queue::{EnqueueOptions, FailOutcome, ItemWork, JsonQueue, QueueJob, QueueManager};
use crate::recovery::ErrorKind;

/// Error type reported once an item used up its recovery rounds.
pub const RETRIES_EXHAUSTED: &str = "retries_exhausted";

/// Failure of one stage on one item.
///
/// `error_type` uses the recovery classification tags (`timeout`,
/// `rate_limit`, ...); unknown tags are treated as non-retryable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error_type}: {message}")]
pub struct StageError {
    pub error_type: String,
    pub message: String,
}

impl StageError {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    pub fn of_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind.as_str(), message)
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::classify(&self.error_type)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Work performed by one pipeline stage (text generation, synthesis, ...).
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> Stage;

    async fn process(&self, work: &ItemWork) -> Result<(), StageError>;
}

/// Drains one stage queue through a [`StageHandler`].
///
/// - Success moves the item to the next stage, or reports it completed
///   after the last one
/// - Retryable failures go back to the queue; once the envelope is out of
///   attempts the failure is handed to the recovery engine via error-occurred
/// - Non-retryable failures are reported right away
pub struct StageWorker {
    handler: Arc<dyn StageHandler>,
    queue: Arc<JsonQueue>,
    queues: Arc<QueueManager>,
    bus: Arc<dyn EventBus<PipelineEvent>>,
    max_recoveries: u32,
}

impl StageWorker {
    /// `max_recoveries` bounds how many recovery rounds one item may go
    /// through before it is given up on.
    pub fn new(
        handler: Arc<dyn StageHandler>,
        queues: Arc<QueueManager>,
        bus: Arc<dyn EventBus<PipelineEvent>>,
        max_recoveries: u32,
    ) -> Self {
        let queue = queues.stage_queue(handler.stage());
        Self {
            handler,
            queue,
            queues,
            bus,
            max_recoveries,
        }
    }

    pub fn stage(&self) -> Stage {
        self.handler.stage()
    }

    /// Process at most one envelope from the stage queue.
    ///
    /// Envelopes the queue retired after stalling in flight are escalated
    /// first, in place of new work.
    pub async fn run_once(&self) -> WorkOutcome {
        let reclaimed = self.queue.take_reclaimed().await;
        if !reclaimed.is_empty() {
            for envelope in reclaimed {
                self.escalate_reclaimed(envelope).await;
            }
            return WorkOutcome::Failed;
        }

        let Some(envelope) = self.queue.dequeue().await else {
            return WorkOutcome::Idle;
        };
        let stage = self.stage();

        let work: ItemWork = match serde_json::from_value(envelope.payload) {
            Ok(work) => work,
            Err(err) => {
                error!(
                    stage = %stage,
                    envelope_id = %envelope.id,
                    error = %err,
                    "dropping undecodable stage payload"
                );
                self.ack(envelope.id).await;
                return WorkOutcome::Failed;
            }
        };

        match self.handler.process(&work).await {
            Ok(()) => {
                self.ack(envelope.id).await;
                self.advance(stage, &work).await;
                WorkOutcome::Succeeded
            }
            Err(err) if err.is_retryable() => {
                match self.queue.fail(envelope.id, err.to_string()).await {
                    Ok(FailOutcome::Requeued { attempts }) => {
                        debug!(
                            stage = %stage,
                            item_id = %work.item_id,
                            attempts,
                            error = %err,
                            "stage attempt failed, requeued"
                        );
                    }
                    Ok(FailOutcome::Exhausted { attempts }) => {
                        self.escalate(stage, &work, &err, attempts).await;
                    }
                    Err(queue_err) => {
                        warn!(stage = %stage, error = %queue_err, "could not record stage failure");
                    }
                }
                WorkOutcome::Failed
            }
            Err(err) => {
                self.ack(envelope.id).await;
                self.report(stage, &work, &err.error_type, &err.message, envelope.attempts + 1)
                    .await;
                WorkOutcome::Failed
            }
        }
    }

    async fn advance(&self, stage: Stage, work: &ItemWork) {
        let Some(next) = stage.next() else {
            debug!(job_id = %work.job_id, item_id = %work.item_id, "item finished all stages");
            self.bus
                .publish(PipelineEvent::item_completed(
                    work.job_id.clone(),
                    work.item_id.clone(),
                ))
                .await;
            return;
        };

        let enqueued = self
            .queues
            .enqueue_json(
                next.as_str(),
                ItemWork::TYPE,
                work,
                EnqueueOptions::for_job(work.job_id.clone()),
            )
            .await;
        if let Err(err) = enqueued {
            error!(stage = %next, item_id = %work.item_id, error = %err, "could not hand item to next stage");
            self.report(next, work, "serialization_error", &err.to_string(), 0)
                .await;
        }
    }

    async fn escalate_reclaimed(&self, envelope: QueueJob<JsonValue>) {
        let stage = self.stage();
        let work: ItemWork = match serde_json::from_value(envelope.payload) {
            Ok(work) => work,
            Err(err) => {
                error!(
                    stage = %stage,
                    envelope_id = %envelope.id,
                    error = %err,
                    "dropping undecodable stalled payload"
                );
                return;
            }
        };

        let message = envelope
            .last_error
            .unwrap_or_else(|| "visibility timeout expired".to_owned());
        let err = StageError::of_kind(ErrorKind::Timeout, message);
        self.escalate(stage, &work, &err, envelope.attempts).await;
    }

    async fn escalate(&self, stage: Stage, work: &ItemWork, err: &StageError, attempts: u32) {
        if work.recoveries >= self.max_recoveries {
            let message = format!(
                "{err} (gave up after {} recovery rounds)",
                work.recoveries
            );
            self.report(stage, work, RETRIES_EXHAUSTED, &message, attempts)
                .await;
        } else {
            self.report(stage, work, &err.error_type, &err.message, attempts)
                .await;
        }
    }

    async fn report(&self, stage: Stage, work: &ItemWork, error_type: &str, message: &str, attempts: u32) {
        warn!(
            stage = %stage,
            job_id = %work.job_id,
            item_id = %work.item_id,
            error_type,
            attempts,
            "stage failed"
        );

        let context = ErrorContext::for_item(work.job_id.clone(), work.item_id.clone(), stage.as_str())
            .with_details(json!({
                "attempts": attempts,
                "recoveries": work.recoveries,
            }));
        self.bus
            .publish(PipelineEvent::error_occurred(error_type, message, context))
            .await;
    }

    async fn ack(&self, id: EnvelopeId) {
        if let Err(err) = self.queue.ack(id).await {
            warn!(stage = %self.stage(), error = %err, "could not ack envelope");
        }
    }
}

impl core::fmt::Debug for StageWorker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StageWorker")
            .field("stage", &self.stage())
            .field("max_recoveries", &self.max_recoveries)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Worker for StageWorker {
    fn name(&self) -> String {
        format!("stage:{}", self.stage())
    }

    async fn run_once(&self) -> WorkOutcome {
        StageWorker::run_once(self).await
    }
}
