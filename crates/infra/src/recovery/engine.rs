use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use narrator_core::{DomainError, ErrorId};
use narrator_events::{
    ErrorFailed, ErrorOccurred, ErrorRecovered, EventBus, EventHandler, EventKind, PipelineEvent,
    RetryScheduled, Subscription,
};

use super::{ErrorKind, ErrorLog, ErrorStats, ErrorStatus, RetryHandler, RetryPolicy};
use crate::config::RecoveryConfig;
use crate::queue::{EnqueueOptions, QueueError, QueueManager, RETRY_QUEUE, RetryWork};
use crate::repository::{ErrorLogRepository, RepositoryError};

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("retry failed: {0}")]
    Retry(String),
}

/// Turns `error.occurred` events into error logs and drives their retries.
///
/// Retryable errors are parked on the retry queue with exponential backoff;
/// the [`RetryWorker`](crate::workers::RetryWorker) feeds them back into
/// [`retry_error`](Self::retry_error). Everything else is failed right away,
/// and failing a log that names an item reports that item as failed.
pub struct ErrorRecoveryEngine {
    logs: Arc<dyn ErrorLogRepository>,
    queues: Arc<QueueManager>,
    bus: Arc<dyn EventBus<PipelineEvent>>,
    retry_handler: Arc<dyn RetryHandler>,
    policy: RetryPolicy,
    rate_limit_cooldown: std::time::Duration,
}

impl ErrorRecoveryEngine {
    pub fn new(
        logs: Arc<dyn ErrorLogRepository>,
        queues: Arc<QueueManager>,
        bus: Arc<dyn EventBus<PipelineEvent>>,
        retry_handler: Arc<dyn RetryHandler>,
        config: &RecoveryConfig,
    ) -> Self {
        Self {
            logs,
            queues,
            bus,
            retry_handler,
            policy: RetryPolicy::from_config(config),
            rate_limit_cooldown: config.rate_limit_cooldown(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Subscribe to `error.occurred` on the bus.
    pub fn register(self: &Arc<Self>) -> Subscription {
        self.bus.subscribe(
            EventKind::ErrorOccurred,
            Arc::new(ErrorOccurredHandler {
                engine: Arc::downgrade(self),
            }),
        )
    }

    /// Persist a new error log and decide its fate. Returns the log id.
    pub async fn handle_error_occurred(
        &self,
        event: &ErrorOccurred,
    ) -> Result<ErrorId, RecoveryError> {
        let mut log = ErrorLog::new(
            ErrorId::generate(),
            event.error_type.as_str(),
            event.message.as_str(),
            event.context.clone(),
            event.timestamp,
        );
        self.logs.save(&log).await?;

        let kind = log.kind();
        info!(
            error_id = %log.id,
            error_type = %log.error_type,
            kind = %kind,
            job_id = ?log.context.job_id,
            item_id = ?log.context.item_id,
            "error logged"
        );

        if kind.is_retryable() {
            self.schedule_retry(&mut log).await?;
        } else {
            let reason = format!("non-retryable error type: {}", log.error_type);
            self.fail_log(&mut log, reason).await?;
        }
        Ok(log.id)
    }

    /// Schedule the next retry of `log` on the retry queue.
    ///
    /// Logs that already used up their retries are failed instead.
    pub async fn schedule_retry(&self, log: &mut ErrorLog) -> Result<(), RecoveryError> {
        if !self.policy.should_retry(log.retry_count) {
            let reason = format!("max retries ({}) exceeded", self.policy.max_retries);
            return self.fail_log(log, reason).await;
        }

        let delay = self.policy.calculate_retry_delay(log.retry_count);
        let now = Utc::now();
        let next_retry_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
        log.schedule_retry(next_retry_at)?;
        self.logs.save(log).await?;

        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        info!(
            error_id = %log.id,
            retry_count = log.retry_count,
            delay_ms,
            "retry scheduled"
        );

        self.bus
            .publish(PipelineEvent::RetryScheduled(RetryScheduled {
                error_id: log.id.clone(),
                retry_count: log.retry_count,
                delay_ms,
                next_retry_at,
                timestamp: now,
            }))
            .await;

        let options = EnqueueOptions {
            job_id: log.context.job_id.clone(),
            delay: Some(delay),
            max_attempts: None,
        };
        self.queues
            .enqueue_json(
                RETRY_QUEUE,
                RetryWork::TYPE,
                &RetryWork {
                    error_id: log.id.clone(),
                },
                options,
            )
            .await?;
        Ok(())
    }

    /// Retry the operation behind `error_id`.
    ///
    /// Rate-limited errors wait out the cooldown first. A log whose type is not
    /// retryable is failed without invoking the handler. When the handler
    /// fails the log is failed and the error is returned.
    pub async fn retry_error(&self, error_id: &ErrorId) -> Result<(), RecoveryError> {
        let mut log = self
            .logs
            .find_by_id(error_id)
            .await?
            .ok_or_else(|| DomainError::not_found("ErrorLog", error_id))?;

        log.begin_retry()?;
        self.logs.save(&log).await?;

        match log.kind() {
            ErrorKind::Other => {
                let reason = format!("non-retryable error type: {}", log.error_type);
                return self.fail_log(&mut log, reason).await;
            }
            ErrorKind::RateLimit => {
                debug!(
                    error_id = %log.id,
                    cooldown_ms = u64::try_from(self.rate_limit_cooldown.as_millis()).unwrap_or(u64::MAX),
                    "waiting out rate limit"
                );
                tokio::time::sleep(self.rate_limit_cooldown).await;
            }
            ErrorKind::Network
            | ErrorKind::Timeout
            | ErrorKind::ServiceUnavailable
            | ErrorKind::Transient => {}
        }

        match self.retry_handler.retry(&log).await {
            Ok(()) => {
                let now = Utc::now();
                log.mark_recovered(now)?;
                self.logs.save(&log).await?;
                info!(error_id = %log.id, retry_count = log.retry_count, "error recovered");

                self.bus
                    .publish(PipelineEvent::ErrorRecovered(ErrorRecovered {
                        error_id: log.id.clone(),
                        retry_count: log.retry_count,
                        timestamp: now,
                    }))
                    .await;
                Ok(())
            }
            Err(err) => {
                let message = format!("{err:#}");
                self.fail_log(&mut log, message.clone()).await?;
                Err(RecoveryError::Retry(message))
            }
        }
    }

    /// Counters over every stored error log (full scan).
    pub async fn get_error_stats(&self) -> Result<ErrorStats, RecoveryError> {
        let logs = self.logs.find_all().await?;

        let mut stats = ErrorStats {
            total: logs.len(),
            ..ErrorStats::default()
        };
        for log in &logs {
            if log.kind().is_retryable() {
                stats.retryable += 1;
            }
            match log.status {
                ErrorStatus::Recovered => stats.recovered += 1,
                ErrorStatus::Failed => stats.failed += 1,
                ErrorStatus::RetryScheduled | ErrorStatus::Retrying => stats.pending_retry += 1,
                ErrorStatus::Logged => {}
            }
        }
        Ok(stats)
    }

    /// Delete resolved logs older than `max_age_days`; returns how many went.
    pub async fn cleanup_resolved_errors(&self, max_age_days: u32) -> Result<usize, RecoveryError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(max_age_days));
        let resolved = self.logs.find_resolved_errors(cutoff).await?;

        let mut deleted = 0;
        for log in resolved {
            if self.logs.delete(&log.id).await? {
                deleted += 1;
            }
        }

        if deleted > 0 {
            info!(deleted, max_age_days, "purged resolved error logs");
        }
        Ok(deleted)
    }

    async fn fail_log(&self, log: &mut ErrorLog, final_error: String) -> Result<(), RecoveryError> {
        let now = Utc::now();
        log.mark_failed(final_error.as_str(), now)?;
        self.logs.save(log).await?;
        warn!(
            error_id = %log.id,
            error_type = %log.error_type,
            final_error = %final_error,
            "error log failed"
        );

        self.bus
            .publish(PipelineEvent::ErrorFailed(ErrorFailed {
                error_id: log.id.clone(),
                error_type: log.error_type.clone(),
                final_error,
                timestamp: now,
            }))
            .await;

        if let (Some(job_id), Some(item_id)) = (&log.context.job_id, &log.context.item_id) {
            self.bus
                .publish(PipelineEvent::item_failed(job_id.clone(), item_id.clone()))
                .await;
        }
        Ok(())
    }
}

impl core::fmt::Debug for ErrorRecoveryEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ErrorRecoveryEngine")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

struct ErrorOccurredHandler {
    engine: Weak<ErrorRecoveryEngine>,
}

#[async_trait]
impl EventHandler<PipelineEvent> for ErrorOccurredHandler {
    async fn handle(&self, event: &PipelineEvent) -> anyhow::Result<()> {
        let PipelineEvent::ErrorOccurred(event) = event else {
            return Ok(());
        };
        let Some(engine) = self.engine.upgrade() else {
            return Ok(());
        };
        engine.handle_error_occurred(event).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "error_recovery.error_occurred"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use narrator_core::{ItemId, JobId};
    use narrator_events::{ErrorContext, Event, InMemoryEventBus, handler_fn};

    use super::*;
    use crate::repository::InMemoryErrorLogRepository;

    struct StubRetry {
        calls: AtomicUsize,
        fail_with: Option<&'static str>,
    }

    #[async_trait]
    impl RetryHandler for StubRetry {
        async fn retry(&self, _log: &ErrorLog) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(message) => Err(anyhow::anyhow!(message)),
                None => Ok(()),
            }
        }
    }

    struct Fixture {
        engine: Arc<ErrorRecoveryEngine>,
        logs: Arc<InMemoryErrorLogRepository>,
        queues: Arc<QueueManager>,
        retry: Arc<StubRetry>,
        seen: Arc<Mutex<Vec<PipelineEvent>>>,
    }

    fn fixture(fail_with: Option<&'static str>) -> Fixture {
        let bus = InMemoryEventBus::<PipelineEvent>::arc();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe_all(Arc::new(handler_fn("sink", move |event: PipelineEvent| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(event);
                Ok(())
            }
        })));

        let logs = InMemoryErrorLogRepository::arc();
        let queues = Arc::new(QueueManager::default());
        let retry = Arc::new(StubRetry {
            calls: AtomicUsize::new(0),
            fail_with,
        });
        let engine = Arc::new(ErrorRecoveryEngine::new(
            logs.clone(),
            queues.clone(),
            bus,
            retry.clone(),
            &RecoveryConfig::default(),
        ));

        Fixture {
            engine,
            logs,
            queues,
            retry,
            seen,
        }
    }

    fn occurred(error_type: &str) -> ErrorOccurred {
        ErrorOccurred {
            error_type: error_type.to_owned(),
            message: "stage blew up".to_owned(),
            context: ErrorContext::for_item(JobId::from("job-1"), ItemId::from("item-1"), "chunking"),
            timestamp: Utc::now(),
        }
    }

    fn kinds(seen: &Mutex<Vec<PipelineEvent>>) -> Vec<EventKind> {
        seen.lock().unwrap().iter().map(|event| event.kind()).collect()
    }

    async fn stored(fx: &Fixture, id: &ErrorId) -> ErrorLog {
        fx.logs.find_by_id(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn non_retryable_error_is_failed_and_reports_its_item() {
        let fx = fixture(None);

        let id = fx.engine.handle_error_occurred(&occurred("validation_error")).await.unwrap();

        let log = stored(&fx, &id).await;
        assert_eq!(log.status, ErrorStatus::Failed);
        assert_eq!(log.history, vec![ErrorStatus::Logged, ErrorStatus::Failed]);
        assert_eq!(
            log.final_error.as_deref(),
            Some("non-retryable error type: validation_error")
        );
        assert!(log.resolved_at.is_some());
        assert_eq!(kinds(&fx.seen), vec![EventKind::ErrorFailed, EventKind::ItemFailed]);
        assert_eq!(fx.queues.retry_queue().stats().await.delayed, 0);
    }

    #[tokio::test]
    async fn retryable_error_is_parked_on_the_retry_queue() {
        let fx = fixture(None);

        let id = fx.engine.handle_error_occurred(&occurred("timeout")).await.unwrap();

        let log = stored(&fx, &id).await;
        assert_eq!(log.status, ErrorStatus::RetryScheduled);
        assert_eq!(log.retry_count, 1);
        assert!(log.next_retry_at.is_some());
        assert_eq!(fx.queues.retry_queue().stats().await.delayed, 1);

        let events = fx.seen.lock().unwrap().clone();
        let [PipelineEvent::RetryScheduled(scheduled)] = events.as_slice() else {
            panic!("unexpected events: {events:?}");
        };
        assert_eq!(scheduled.retry_count, 1);
        assert!((1_000..=1_200).contains(&scheduled.delay_ms));
    }

    #[tokio::test]
    async fn successful_retry_recovers_the_log() {
        let fx = fixture(None);
        let id = fx.engine.handle_error_occurred(&occurred("network-error")).await.unwrap();

        fx.engine.retry_error(&id).await.unwrap();

        let log = stored(&fx, &id).await;
        assert_eq!(log.status, ErrorStatus::Recovered);
        assert_eq!(log.retry_count, 1);
        assert_eq!(fx.retry.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            kinds(&fx.seen),
            vec![EventKind::RetryScheduled, EventKind::ErrorRecovered]
        );
    }

    #[tokio::test]
    async fn failed_retry_fails_the_log_and_surfaces_the_error() {
        let fx = fixture(Some("provider still down"));
        let id = fx.engine.handle_error_occurred(&occurred("service_unavailable")).await.unwrap();

        let err = fx.engine.retry_error(&id).await.unwrap_err();

        assert!(matches!(err, RecoveryError::Retry(ref m) if m.contains("provider still down")));
        let log = stored(&fx, &id).await;
        assert_eq!(log.status, ErrorStatus::Failed);
        assert_eq!(log.final_error.as_deref(), Some("provider still down"));
        assert_eq!(
            kinds(&fx.seen),
            vec![EventKind::RetryScheduled, EventKind::ErrorFailed, EventKind::ItemFailed]
        );
    }

    #[tokio::test]
    async fn retrying_unknown_log_is_not_found() {
        let fx = fixture(None);
        let err = fx.engine.retry_error(&ErrorId::from("missing")).await.unwrap_err();
        assert!(matches!(err, RecoveryError::Domain(ref e) if e.is_not_found()));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_retry_waits_for_the_cooldown() {
        let fx = fixture(None);
        let id = fx.engine.handle_error_occurred(&occurred("rate_limit")).await.unwrap();

        let started = tokio::time::Instant::now();
        fx.engine.retry_error(&id).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(stored(&fx, &id).await.status, ErrorStatus::Recovered);
    }

    #[tokio::test]
    async fn retries_beyond_the_limit_fail_the_log() {
        let fx = fixture(None);
        let id = fx.engine.handle_error_occurred(&occurred("timeout")).await.unwrap();

        let mut log = stored(&fx, &id).await;
        for _ in 1..5 {
            log.begin_retry().unwrap();
            fx.engine.schedule_retry(&mut log).await.unwrap();
        }
        assert_eq!(log.retry_count, 5);
        assert_eq!(log.status, ErrorStatus::RetryScheduled);

        fx.engine.schedule_retry(&mut log).await.unwrap();

        assert_eq!(log.status, ErrorStatus::Failed);
        assert_eq!(log.final_error.as_deref(), Some("max retries (5) exceeded"));
        assert_eq!(stored(&fx, &id).await.status, ErrorStatus::Failed);
    }

    #[tokio::test]
    async fn stats_and_cleanup_cover_every_log() {
        let fx = fixture(None);
        let recovered = fx.engine.handle_error_occurred(&occurred("timeout")).await.unwrap();
        fx.engine.retry_error(&recovered).await.unwrap();
        fx.engine.handle_error_occurred(&occurred("timeout")).await.unwrap();
        fx.engine.handle_error_occurred(&occurred("bad_input")).await.unwrap();

        let stats = fx.engine.get_error_stats().await.unwrap();
        assert_eq!(
            stats,
            ErrorStats {
                total: 3,
                retryable: 2,
                recovered: 1,
                failed: 1,
                pending_retry: 1,
            }
        );

        // Nothing is old enough yet.
        assert_eq!(fx.engine.cleanup_resolved_errors(30).await.unwrap(), 0);

        let mut aged = stored(&fx, &recovered).await;
        aged.resolved_at = Some(Utc::now() - chrono::Duration::days(31));
        fx.logs.save(&aged).await.unwrap();

        assert_eq!(fx.engine.cleanup_resolved_errors(30).await.unwrap(), 1);
        assert_eq!(fx.engine.get_error_stats().await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn registered_engine_reacts_to_bus_events() {
        let bus = InMemoryEventBus::<PipelineEvent>::arc();
        let logs = InMemoryErrorLogRepository::arc();
        let queues = Arc::new(QueueManager::default());
        let engine = Arc::new(ErrorRecoveryEngine::new(
            logs.clone(),
            queues,
            bus.clone(),
            Arc::new(StubRetry {
                calls: AtomicUsize::new(0),
                fail_with: None,
            }),
            &RecoveryConfig::default(),
        ));
        let _subscription = engine.register();

        bus.publish(PipelineEvent::error_occurred(
            "timeout",
            "tts timed out",
            ErrorContext::default(),
        ))
        .await;

        let all = logs.find_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, ErrorStatus::RetryScheduled);
    }
}
