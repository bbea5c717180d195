//! Job orchestration.
//!
//! The orchestrator owns the job lifecycle once a job exists: it starts jobs,
//! fans their items out to the first stage, and folds item outcomes back into
//! the job counters until the job completes or crosses the failure threshold.
//!
//! It never calls workers or the recovery engine; everything flows through the
//! event bus.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use narrator_core::{AggregateRoot, DomainError, Entity, JobId};
use narrator_events::{
    EventBus, EventHandler, EventKind, ItemSignal, JobCompleted, PipelineEvent, Subscription,
};
use narrator_production::{Job, JobStatus, Stage};

use crate::config::OrchestratorConfig;
use crate::job_locks::JobLocks;
use crate::queue::{EnqueueOptions, ItemWork, QueueError, QueueManager};
use crate::repository::{ContentItemRepository, JobRepository, RepositoryError};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Read-only progress snapshot of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub status: JobStatus,
    /// `completed_items / max(total_items, 1)`.
    pub progress: f64,
    pub total_items: u32,
    pub completed_items: u32,
    pub failed_items: u32,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            status: job.status(),
            progress: job.progress(),
            total_items: job.total_items(),
            completed_items: job.completed_items(),
            failed_items: job.failed_items(),
        }
    }
}

pub struct JobOrchestrator {
    jobs: Arc<dyn JobRepository>,
    items: Arc<dyn ContentItemRepository>,
    queues: Arc<QueueManager>,
    bus: Arc<dyn EventBus<PipelineEvent>>,
    locks: JobLocks,
    config: OrchestratorConfig,
}

impl JobOrchestrator {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        items: Arc<dyn ContentItemRepository>,
        queues: Arc<QueueManager>,
        bus: Arc<dyn EventBus<PipelineEvent>>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            jobs,
            items,
            queues,
            bus,
            locks: JobLocks::new(),
            config,
        }
    }

    /// Subscribe to job-started, item-completed and item-failed.
    ///
    /// Handlers hold a weak reference; dropping the last `Arc` of the
    /// orchestrator turns them into no-ops.
    pub fn register(self: &Arc<Self>) -> Vec<Subscription> {
        [
            EventKind::JobStarted,
            EventKind::ItemCompleted,
            EventKind::ItemFailed,
        ]
        .into_iter()
        .map(|kind| {
            self.bus.subscribe(
                kind,
                Arc::new(OrchestratorHandler {
                    orchestrator: Arc::downgrade(self),
                }),
            )
        })
        .collect()
    }

    /// PENDING → PROCESSING, then announce it with job-started.
    pub async fn start_job_processing(&self, job_id: &JobId) -> Result<(), OrchestratorError> {
        {
            let _guard = self.locks.lock(job_id).await;
            let mut job = self.load(job_id).await?;
            job.start(Utc::now())?;
            self.jobs.save(&job).await?;
            info!(job_id = %job_id, total_items = job.total_items(), "job started");
        }

        self.bus.publish(PipelineEvent::job_started(job_id.clone())).await;
        Ok(())
    }

    pub async fn get_job_status(&self, job_id: &JobId) -> Result<JobStatusView, OrchestratorError> {
        let job = self.load(job_id).await?;
        Ok(JobStatusView::from(&job))
    }

    pub async fn pause_job(&self, job_id: &JobId) -> Result<(), OrchestratorError> {
        self.transition(job_id, |job| job.pause()).await?;
        info!(job_id = %job_id, "job paused");
        self.bus.publish(PipelineEvent::job_paused(job_id.clone())).await;
        Ok(())
    }

    /// PAUSED → PROCESSING, then settle the item outcomes counted while the
    /// job was paused: it may fail on the threshold or complete right away.
    pub async fn resume_job(&self, job_id: &JobId) -> Result<(), OrchestratorError> {
        let outcome = {
            let _guard = self.locks.lock(job_id).await;
            let mut job = self.load(job_id).await?;
            job.resume()?;
            let outcome = self.settle(&mut job)?;
            self.jobs.save(&job).await?;
            outcome
        };

        info!(job_id = %job_id, "job resumed");
        self.bus.publish(PipelineEvent::job_resumed(job_id.clone())).await;
        self.announce(job_id, outcome).await;
        Ok(())
    }

    pub async fn cancel_job(&self, job_id: &JobId) -> Result<(), OrchestratorError> {
        self.transition(job_id, |job| job.cancel()).await?;
        info!(job_id = %job_id, "job cancelled");
        self.bus.publish(PipelineEvent::job_cancelled(job_id.clone())).await;
        Ok(())
    }

    /// Fan the job's items out to the first stage.
    ///
    /// Never fails: any problem force-fails the job instead.
    pub async fn handle_job_started(&self, job_id: &JobId) {
        let job = match self.jobs.find_by_id(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                error!(job_id = %job_id, "started job not found");
                return;
            }
            Err(err) => {
                self.force_fail(job_id, &format!("failed to load started job: {err}"))
                    .await;
                return;
            }
        };

        if job.total_items() == 0 {
            self.complete_empty_job(job_id).await;
            return;
        }

        if let Err(err) = self.dispatch_items(&job).await {
            self.force_fail(job_id, &err.to_string()).await;
        }
    }

    pub async fn handle_item_completed(&self, signal: &ItemSignal) -> Result<(), OrchestratorError> {
        let outcome = {
            let _guard = self.locks.lock(&signal.job_id).await;
            let mut job = self.load(&signal.job_id).await?;
            if !job.status().accepts_item_updates() {
                debug!(
                    job_id = %signal.job_id,
                    item_id = %signal.item_id,
                    status = %job.status(),
                    "ignoring item completion for inactive job"
                );
                return Ok(());
            }

            job.record_item_completed()?;
            let outcome = self.settle(&mut job)?;
            self.jobs.save(&job).await?;
            debug!(
                job_id = %signal.job_id,
                item_id = %signal.item_id,
                completed = job.completed_items(),
                total = job.total_items(),
                "item completed"
            );
            outcome
        };

        self.announce(&signal.job_id, outcome).await;
        Ok(())
    }

    pub async fn handle_item_failed(&self, signal: &ItemSignal) -> Result<(), OrchestratorError> {
        let outcome = {
            let _guard = self.locks.lock(&signal.job_id).await;
            let mut job = self.load(&signal.job_id).await?;
            if !job.status().accepts_item_updates() {
                debug!(
                    job_id = %signal.job_id,
                    item_id = %signal.item_id,
                    status = %job.status(),
                    "ignoring item failure for inactive job"
                );
                return Ok(());
            }

            job.record_item_failed()?;
            let outcome = self.settle(&mut job)?;
            self.jobs.save(&job).await?;
            warn!(
                job_id = %signal.job_id,
                item_id = %signal.item_id,
                failed = job.failed_items(),
                total = job.total_items(),
                "item failed"
            );
            outcome
        };

        self.announce(&signal.job_id, outcome).await;
        Ok(())
    }

    /// Decide whether the counters just moved the job into a terminal state.
    ///
    /// Only a PROCESSING job settles; a paused one waits for `resume_job`.
    fn settle(&self, job: &mut Job) -> Result<Option<PipelineEvent>, OrchestratorError> {
        if job.status() != JobStatus::Processing {
            return Ok(None);
        }

        let percent = self.config.failure_threshold_percent;
        if job.failed_items() > 0 && job.failure_threshold_reached(percent) {
            job.fail(Utc::now())?;
            let message = format!(
                "failure threshold exceeded: {}/{} items failed",
                job.failed_items(),
                job.total_items()
            );
            return Ok(Some(PipelineEvent::job_failed(job.id().clone(), message)));
        }

        if job.all_items_processed() {
            job.complete(Utc::now())?;
            return Ok(Some(completion_event(job)));
        }

        Ok(None)
    }

    async fn announce(&self, job_id: &JobId, outcome: Option<PipelineEvent>) {
        let Some(event) = outcome else {
            return;
        };
        match &event {
            PipelineEvent::JobFailed(failed) => {
                warn!(job_id = %job_id, reason = %failed.error, "job failed")
            }
            _ => info!(job_id = %job_id, "job completed"),
        }
        self.bus.publish(event).await;
    }

    async fn dispatch_items(&self, job: &Job) -> Result<(), OrchestratorError> {
        let job_id = job.id();
        let items = self.items.find_by_job_id(job_id).await?;
        let stage = Stage::first();

        for item in &items {
            let work = ItemWork::new(job_id.clone(), item.id().clone());
            self.queues
                .enqueue_json(
                    stage.as_str(),
                    ItemWork::TYPE,
                    &work,
                    EnqueueOptions::for_job(job_id.clone()),
                )
                .await?;
        }

        info!(job_id = %job_id, items = items.len(), stage = %stage, "job items dispatched");
        Ok(())
    }

    async fn complete_empty_job(&self, job_id: &JobId) {
        match self.settle_locked(job_id).await {
            Ok(outcome) => self.announce(job_id, outcome).await,
            Err(err) => self.force_fail(job_id, &err.to_string()).await,
        }
    }

    async fn settle_locked(&self, job_id: &JobId) -> Result<Option<PipelineEvent>, OrchestratorError> {
        let _guard = self.locks.lock(job_id).await;
        let mut job = self.load(job_id).await?;
        let outcome = self.settle(&mut job)?;
        self.jobs.save(&job).await?;
        Ok(outcome)
    }

    async fn force_fail(&self, job_id: &JobId, reason: &str) {
        error!(job_id = %job_id, reason, "job dispatch failed");

        match self.transition(job_id, |job| job.fail(Utc::now())).await {
            Ok(()) => {
                self.bus
                    .publish(PipelineEvent::job_failed(job_id.clone(), reason))
                    .await
            }
            Err(err) => error!(job_id = %job_id, error = %err, "could not mark job failed"),
        }
    }

    async fn transition(
        &self,
        job_id: &JobId,
        apply: impl FnOnce(&mut Job) -> Result<(), DomainError>,
    ) -> Result<(), OrchestratorError> {
        let _guard = self.locks.lock(job_id).await;
        let mut job = self.load(job_id).await?;
        apply(&mut job)?;
        self.jobs.save(&job).await?;
        Ok(())
    }

    async fn load(&self, job_id: &JobId) -> Result<Job, OrchestratorError> {
        self.jobs
            .find_by_id(job_id)
            .await?
            .ok_or_else(|| DomainError::not_found("Job", job_id).into())
    }
}

impl core::fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn completion_event(job: &Job) -> PipelineEvent {
    PipelineEvent::JobCompleted(JobCompleted {
        job_id: job.id().clone(),
        completed_items: job.completed_items(),
        total_items: job.total_items(),
        failed_items: (job.failed_items() > 0).then_some(job.failed_items()),
        timestamp: job.completed_at().unwrap_or_else(Utc::now),
    })
}

struct OrchestratorHandler {
    orchestrator: Weak<JobOrchestrator>,
}

#[async_trait]
impl EventHandler<PipelineEvent> for OrchestratorHandler {
    async fn handle(&self, event: &PipelineEvent) -> anyhow::Result<()> {
        let Some(orchestrator) = self.orchestrator.upgrade() else {
            return Ok(());
        };

        match event {
            PipelineEvent::JobStarted(signal) => {
                orchestrator.handle_job_started(&signal.job_id).await;
            }
            PipelineEvent::ItemCompleted(signal) => {
                orchestrator.handle_item_completed(signal).await?;
            }
            PipelineEvent::ItemFailed(signal) => {
                orchestrator.handle_item_failed(signal).await?;
            }
            _ => {}
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "job_orchestrator"
    }
}
