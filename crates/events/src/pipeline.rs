//! Pipeline event catalogue.
//!
//! Every event that crosses the bus is a variant of [`PipelineEvent`]; the set
//! is closed so routing is a table lookup on [`EventKind`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use narrator_core::{ErrorId, ItemId, JobId};

use crate::Event;

/// Routing key for [`PipelineEvent`] subscriptions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    JobStarted,
    JobCompleted,
    JobFailed,
    JobPaused,
    JobResumed,
    JobCancelled,
    ItemCompleted,
    ItemFailed,
    ErrorOccurred,
    RetryScheduled,
    ErrorRecovered,
    ErrorFailed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::JobStarted => "job.started",
            EventKind::JobCompleted => "job.completed",
            EventKind::JobFailed => "job.failed",
            EventKind::JobPaused => "job.paused",
            EventKind::JobResumed => "job.resumed",
            EventKind::JobCancelled => "job.cancelled",
            EventKind::ItemCompleted => "item.completed",
            EventKind::ItemFailed => "item.failed",
            EventKind::ErrorOccurred => "error.occurred",
            EventKind::RetryScheduled => "error.retry_scheduled",
            EventKind::ErrorRecovered => "error.recovered",
            EventKind::ErrorFailed => "error.failed",
        }
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job-level signal without extra data (started, paused, resumed, cancelled).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSignal {
    pub job_id: JobId,
    pub timestamp: DateTime<Utc>,
}

/// Event: all items of a job were processed without crossing the failure threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCompleted {
    pub job_id: JobId,
    pub completed_items: u32,
    pub total_items: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_items: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

/// Event: a job ended in FAILED; `error` is the human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailed {
    pub job_id: JobId,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Item-level completion or failure reported by a stage worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSignal {
    pub job_id: JobId,
    pub item_id: ItemId,
    pub timestamp: DateTime<Utc>,
}

/// Where a failure happened. All fields are optional; failures outside a
/// stage (e.g. a provider health check) carry only `details`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<ItemId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default)]
    pub details: JsonValue,
}

impl ErrorContext {
    pub fn for_item(job_id: JobId, item_id: ItemId, stage: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id),
            item_id: Some(item_id),
            stage: Some(stage.into()),
            details: JsonValue::Null,
        }
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = details;
        self
    }
}

/// Event: a failure was observed somewhere in the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorOccurred {
    pub error_type: String,
    pub message: String,
    #[serde(default)]
    pub context: ErrorContext,
    pub timestamp: DateTime<Utc>,
}

/// Event: the recovery engine scheduled a retry for an error log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryScheduled {
    pub error_id: ErrorId,
    pub retry_count: u32,
    pub delay_ms: u64,
    pub next_retry_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

/// Event: a retried operation succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecovered {
    pub error_id: ErrorId,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

/// Event: an error log reached the terminal `failed` status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFailed {
    pub error_id: ErrorId,
    pub error_type: String,
    pub final_error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    JobStarted(JobSignal),
    JobCompleted(JobCompleted),
    JobFailed(JobFailed),
    JobPaused(JobSignal),
    JobResumed(JobSignal),
    JobCancelled(JobSignal),
    ItemCompleted(ItemSignal),
    ItemFailed(ItemSignal),
    ErrorOccurred(ErrorOccurred),
    RetryScheduled(RetryScheduled),
    ErrorRecovered(ErrorRecovered),
    ErrorFailed(ErrorFailed),
}

impl PipelineEvent {
    pub fn job_started(job_id: JobId) -> Self {
        Self::JobStarted(JobSignal {
            job_id,
            timestamp: Utc::now(),
        })
    }

    pub fn job_paused(job_id: JobId) -> Self {
        Self::JobPaused(JobSignal {
            job_id,
            timestamp: Utc::now(),
        })
    }

    pub fn job_resumed(job_id: JobId) -> Self {
        Self::JobResumed(JobSignal {
            job_id,
            timestamp: Utc::now(),
        })
    }

    pub fn job_cancelled(job_id: JobId) -> Self {
        Self::JobCancelled(JobSignal {
            job_id,
            timestamp: Utc::now(),
        })
    }

    pub fn job_failed(job_id: JobId, error: impl Into<String>) -> Self {
        Self::JobFailed(JobFailed {
            job_id,
            error: error.into(),
            timestamp: Utc::now(),
        })
    }

    pub fn item_completed(job_id: JobId, item_id: ItemId) -> Self {
        Self::ItemCompleted(ItemSignal {
            job_id,
            item_id,
            timestamp: Utc::now(),
        })
    }

    pub fn item_failed(job_id: JobId, item_id: ItemId) -> Self {
        Self::ItemFailed(ItemSignal {
            job_id,
            item_id,
            timestamp: Utc::now(),
        })
    }

    pub fn error_occurred(
        error_type: impl Into<String>,
        message: impl Into<String>,
        context: ErrorContext,
    ) -> Self {
        Self::ErrorOccurred(ErrorOccurred {
            error_type: error_type.into(),
            message: message.into(),
            context,
            timestamp: Utc::now(),
        })
    }

    /// Job this event concerns, if any.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            PipelineEvent::JobStarted(e)
            | PipelineEvent::JobPaused(e)
            | PipelineEvent::JobResumed(e)
            | PipelineEvent::JobCancelled(e) => Some(&e.job_id),
            PipelineEvent::JobCompleted(e) => Some(&e.job_id),
            PipelineEvent::JobFailed(e) => Some(&e.job_id),
            PipelineEvent::ItemCompleted(e) | PipelineEvent::ItemFailed(e) => Some(&e.job_id),
            PipelineEvent::ErrorOccurred(e) => e.context.job_id.as_ref(),
            PipelineEvent::RetryScheduled(_)
            | PipelineEvent::ErrorRecovered(_)
            | PipelineEvent::ErrorFailed(_) => None,
        }
    }
}

impl Event for PipelineEvent {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        match self {
            PipelineEvent::JobStarted(_) => EventKind::JobStarted,
            PipelineEvent::JobCompleted(_) => EventKind::JobCompleted,
            PipelineEvent::JobFailed(_) => EventKind::JobFailed,
            PipelineEvent::JobPaused(_) => EventKind::JobPaused,
            PipelineEvent::JobResumed(_) => EventKind::JobResumed,
            PipelineEvent::JobCancelled(_) => EventKind::JobCancelled,
            PipelineEvent::ItemCompleted(_) => EventKind::ItemCompleted,
            PipelineEvent::ItemFailed(_) => EventKind::ItemFailed,
            PipelineEvent::ErrorOccurred(_) => EventKind::ErrorOccurred,
            PipelineEvent::RetryScheduled(_) => EventKind::RetryScheduled,
            PipelineEvent::ErrorRecovered(_) => EventKind::ErrorRecovered,
            PipelineEvent::ErrorFailed(_) => EventKind::ErrorFailed,
        }
    }

    fn event_type(&self) -> &'static str {
        self.kind().as_str()
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PipelineEvent::JobStarted(e)
            | PipelineEvent::JobPaused(e)
            | PipelineEvent::JobResumed(e)
            | PipelineEvent::JobCancelled(e) => e.timestamp,
            PipelineEvent::JobCompleted(e) => e.timestamp,
            PipelineEvent::JobFailed(e) => e.timestamp,
            PipelineEvent::ItemCompleted(e) | PipelineEvent::ItemFailed(e) => e.timestamp,
            PipelineEvent::ErrorOccurred(e) => e.timestamp,
            PipelineEvent::RetryScheduled(e) => e.timestamp,
            PipelineEvent::ErrorRecovered(e) => e.timestamp,
            PipelineEvent::ErrorFailed(e) => e.timestamp,
        }
    }
}
