//! Single-node composition root.

use std::sync::Arc;

use tracing::info;

use narrator_events::{InMemoryEventBus, PipelineEvent, Subscription};

use crate::config::PipelineConfig;
use crate::orchestrator::JobOrchestrator;
use crate::queue::QueueManager;
use crate::recovery::{ErrorRecoveryEngine, RecoveryError, RequeueStageRetry, RetryHandler};
use crate::repository::{
    InMemoryContentItemRepository, InMemoryErrorLogRepository, InMemoryJobRepository,
};
use crate::workers::{self, RetryWorker, StageHandler, StageWorker, WorkerHandle};

/// Every pipeline component wired onto one in-memory bus.
///
/// The orchestrator and the recovery engine are subscribed on construction;
/// workers are started separately with [`spawn_workers`](Self::spawn_workers).
pub struct Pipeline {
    pub config: PipelineConfig,
    pub bus: Arc<InMemoryEventBus<PipelineEvent>>,
    pub queues: Arc<QueueManager>,
    pub jobs: Arc<InMemoryJobRepository>,
    pub items: Arc<InMemoryContentItemRepository>,
    pub error_logs: Arc<InMemoryErrorLogRepository>,
    pub orchestrator: Arc<JobOrchestrator>,
    pub recovery: Arc<ErrorRecoveryEngine>,
    subscriptions: Vec<Subscription>,
}

impl Pipeline {
    /// Wire a pipeline that retries failed items by requeueing them.
    pub fn in_memory(config: PipelineConfig) -> Self {
        let queues = Arc::new(QueueManager::new(config.queue.clone()));
        let retry_handler = Arc::new(RequeueStageRetry::new(Arc::clone(&queues)));
        Self::with_retry_handler(config, queues, retry_handler)
    }

    pub fn with_retry_handler(
        config: PipelineConfig,
        queues: Arc<QueueManager>,
        retry_handler: Arc<dyn RetryHandler>,
    ) -> Self {
        let bus = InMemoryEventBus::<PipelineEvent>::arc();
        let jobs = InMemoryJobRepository::arc();
        let items = InMemoryContentItemRepository::arc();
        let error_logs = InMemoryErrorLogRepository::arc();

        let orchestrator = Arc::new(JobOrchestrator::new(
            jobs.clone(),
            items.clone(),
            Arc::clone(&queues),
            bus.clone(),
            config.orchestrator.clone(),
        ));
        let recovery = Arc::new(ErrorRecoveryEngine::new(
            error_logs.clone(),
            Arc::clone(&queues),
            bus.clone(),
            retry_handler,
            &config.recovery,
        ));

        let mut subscriptions = orchestrator.register();
        subscriptions.push(recovery.register());
        info!(
            queues = queues.queue_names().len(),
            subscriptions = subscriptions.len(),
            "pipeline wired"
        );

        Self {
            config,
            bus,
            queues,
            jobs,
            items,
            error_logs,
            orchestrator,
            recovery,
            subscriptions,
        }
    }

    /// A worker for `handler`'s stage, bounded by the configured retry budget.
    pub fn stage_worker(&self, handler: Arc<dyn StageHandler>) -> StageWorker {
        StageWorker::new(
            handler,
            Arc::clone(&self.queues),
            self.bus.clone(),
            self.config.recovery.max_retries,
        )
    }

    pub fn retry_worker(&self) -> RetryWorker {
        RetryWorker::new(&self.queues, Arc::clone(&self.recovery))
    }

    /// Start one worker per stage handler plus the retry worker.
    pub fn spawn_workers(&self, handlers: Vec<Arc<dyn StageHandler>>) -> Vec<WorkerHandle> {
        let mut handles: Vec<WorkerHandle> = handlers
            .into_iter()
            .map(|handler| workers::spawn(Arc::new(self.stage_worker(handler)), &self.config.worker))
            .collect();
        handles.push(workers::spawn(
            Arc::new(self.retry_worker()),
            &self.config.worker,
        ));
        handles
    }

    /// Purge resolved error logs older than the configured retention.
    pub async fn cleanup_resolved_errors(&self) -> Result<usize, RecoveryError> {
        self.recovery
            .cleanup_resolved_errors(self.config.recovery.retention_days)
            .await
    }

    /// Detach the orchestrator and the recovery engine from the bus.
    pub fn unsubscribe_all(&mut self) {
        for subscription in &mut self.subscriptions {
            subscription.unsubscribe();
        }
    }
}

impl core::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}
