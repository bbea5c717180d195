//! Queue envelope types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use narrator_core::{EnvelopeId, JobId};

/// A payload waiting in (or taken from) a named queue, with retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJob<T> {
    pub id: EnvelopeId,
    /// Free-form type tag, used by consumers to pick a decoder.
    pub job_type: String,
    pub payload: T,
    /// Job the envelope belongs to, if any.
    pub job_id: Option<JobId>,
    /// Failed attempts so far.
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    /// Wall-clock admission time for delayed envelopes.
    pub available_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Options for [`Queue::enqueue`](super::Queue::enqueue).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub job_id: Option<JobId>,
    pub delay: Option<Duration>,
    /// Falls back to the queue's configured default.
    pub max_attempts: Option<u32>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_job(job_id: JobId) -> Self {
        Self {
            job_id: Some(job_id),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// What `fail` did with the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-admitted at the tail of the ready ordering.
    Requeued { attempts: u32 },
    /// Attempts exhausted; the envelope was retired.
    Exhausted { attempts: u32 },
}

impl FailOutcome {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, FailOutcome::Exhausted { .. })
    }
}

/// Point-in-time counters of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub ready: usize,
    pub delayed: usize,
    pub in_flight: usize,
    pub acked: u64,
    pub exhausted: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("envelope {id} is not in flight on queue {queue}")]
    UnknownEnvelope { queue: String, id: EnvelopeId },
}
