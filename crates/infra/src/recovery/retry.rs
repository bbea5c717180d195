//! "Retry the original operation" capability.

use std::sync::Arc;

use async_trait::async_trait;
use anyhow::{Context, anyhow};

use narrator_production::Stage;

use super::ErrorLog;
use crate::queue::{EnqueueOptions, ItemWork, QueueManager};

/// Re-runs whatever operation produced an error log.
#[async_trait]
pub trait RetryHandler: Send + Sync {
    async fn retry(&self, log: &ErrorLog) -> anyhow::Result<()>;
}

/// Puts the failed item back on the stage queue it failed in.
///
/// The re-enqueued work carries one more recovery round than the failure
/// reported in `details.recoveries`, so stage workers can bound the loop.
#[derive(Debug, Clone)]
pub struct RequeueStageRetry {
    queues: Arc<QueueManager>,
}

impl RequeueStageRetry {
    pub fn new(queues: Arc<QueueManager>) -> Self {
        Self { queues }
    }
}

#[async_trait]
impl RetryHandler for RequeueStageRetry {
    async fn retry(&self, log: &ErrorLog) -> anyhow::Result<()> {
        let context = &log.context;
        let (Some(job_id), Some(item_id), Some(stage)) =
            (&context.job_id, &context.item_id, &context.stage)
        else {
            return Err(anyhow!(
                "error log {} does not name a job, item and stage",
                log.id
            ));
        };
        let stage: Stage = stage
            .parse()
            .with_context(|| format!("error log {}", log.id))?;

        let previous = context
            .details
            .get("recoveries")
            .and_then(|value| value.as_u64())
            .and_then(|value| u32::try_from(value).ok())
            .unwrap_or(0);
        let work = ItemWork {
            recoveries: previous.saturating_add(1),
            ..ItemWork::new(job_id.clone(), item_id.clone())
        };

        self.queues
            .enqueue_json(
                stage.as_str(),
                ItemWork::TYPE,
                &work,
                EnqueueOptions::for_job(job_id.clone()),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use narrator_core::{ErrorId, ItemId, JobId};
    use narrator_events::ErrorContext;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn requeues_item_on_its_stage_with_one_more_recovery() {
        let queues = Arc::new(QueueManager::default());
        let retry = RequeueStageRetry::new(queues.clone());
        let context = ErrorContext::for_item(JobId::from("j"), ItemId::from("i"), "chunking")
            .with_details(json!({"recoveries": 1}));
        let log = ErrorLog::new(ErrorId::from("e"), "timeout", "slow", context, Utc::now());

        retry.retry(&log).await.unwrap();

        let envelope = queues.stage_queue(Stage::Chunking).dequeue().await.unwrap();
        let work: ItemWork = serde_json::from_value(envelope.payload).unwrap();
        assert_eq!(work.item_id, ItemId::from("i"));
        assert_eq!(work.recoveries, 2);
        assert_eq!(envelope.job_id, Some(JobId::from("j")));
    }

    #[tokio::test]
    async fn rejects_logs_without_item_context() {
        let retry = RequeueStageRetry::new(Arc::new(QueueManager::default()));
        let log = ErrorLog::new(
            ErrorId::from("e"),
            "timeout",
            "provider health check",
            ErrorContext::default(),
            Utc::now(),
        );

        assert!(retry.retry(&log).await.is_err());
    }
}
