//! Error log model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use narrator_core::{DomainError, DomainResult, ErrorId};
use narrator_events::ErrorContext;

/// Recovery class of an error type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    RateLimit,
    Timeout,
    ServiceUnavailable,
    Transient,
    /// Anything not on the retryable allow-list.
    Other,
}

impl ErrorKind {
    /// Map an error type tag onto a kind.
    ///
    /// Case-insensitive; `-` and spaces are treated as `_`.
    pub fn classify(error_type: &str) -> Self {
        let normalized: String = error_type
            .trim()
            .chars()
            .map(|c| match c {
                '-' | ' ' => '_',
                c => c.to_ascii_lowercase(),
            })
            .collect();

        match normalized.as_str() {
            "network_error" => ErrorKind::Network,
            "rate_limit" => ErrorKind::RateLimit,
            "timeout" => ErrorKind::Timeout,
            "service_unavailable" => ErrorKind::ServiceUnavailable,
            "transient_error" => ErrorKind::Transient,
            _ => ErrorKind::Other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorKind::Other)
    }

    /// Canonical error type tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network_error",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::Transient => "transient_error",
            ErrorKind::Other => "other",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error log lifecycle.
///
/// ```text
/// LOGGED ──► RETRY_SCHEDULED ──► RETRYING ──► RECOVERED
///   │              │   ▲            │
///   │              │   └────────────┤ further retry
///   ▼              ▼                ▼
/// FAILED         FAILED           FAILED
/// ```
///
/// A logged error may also be retried directly (LOGGED → RETRYING).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStatus {
    Logged,
    RetryScheduled,
    Retrying,
    Recovered,
    Failed,
}

impl ErrorStatus {
    pub fn is_resolved(&self) -> bool {
        matches!(self, ErrorStatus::Recovered | ErrorStatus::Failed)
    }

    pub fn can_transition_to(&self, next: ErrorStatus) -> bool {
        use ErrorStatus::*;
        matches!(
            (self, next),
            (Logged, RetryScheduled | Retrying | Failed)
                | (RetryScheduled, Retrying | Failed)
                | (Retrying, Recovered | Failed | RetryScheduled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorStatus::Logged => "logged",
            ErrorStatus::RetryScheduled => "retry_scheduled",
            ErrorStatus::Retrying => "retrying",
            ErrorStatus::Recovered => "recovered",
            ErrorStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit and recovery record for one observed failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLog {
    pub id: ErrorId,
    pub error_type: String,
    pub message: String,
    pub context: ErrorContext,
    pub occurred_at: DateTime<Utc>,
    pub status: ErrorStatus,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub final_error: Option<String>,
    /// Every status held so far, oldest first.
    pub history: Vec<ErrorStatus>,
}

impl ErrorLog {
    pub fn new(
        id: ErrorId,
        error_type: impl Into<String>,
        message: impl Into<String>,
        context: ErrorContext,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            error_type: error_type.into(),
            message: message.into(),
            context,
            occurred_at,
            status: ErrorStatus::Logged,
            retry_count: 0,
            next_retry_at: None,
            resolved_at: None,
            final_error: None,
            history: vec![ErrorStatus::Logged],
        }
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::classify(&self.error_type)
    }

    pub fn is_resolved(&self) -> bool {
        self.status.is_resolved()
    }

    /// Count one more retry and park it until `next_retry_at`.
    pub fn schedule_retry(&mut self, next_retry_at: DateTime<Utc>) -> DomainResult<()> {
        self.transition(ErrorStatus::RetryScheduled)?;
        self.retry_count += 1;
        self.next_retry_at = Some(next_retry_at);
        Ok(())
    }

    pub fn begin_retry(&mut self) -> DomainResult<()> {
        self.transition(ErrorStatus::Retrying)
    }

    pub fn mark_recovered(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        self.transition(ErrorStatus::Recovered)?;
        self.next_retry_at = None;
        self.resolved_at = Some(at);
        Ok(())
    }

    pub fn mark_failed(&mut self, final_error: impl Into<String>, at: DateTime<Utc>) -> DomainResult<()> {
        self.transition(ErrorStatus::Failed)?;
        self.next_retry_at = None;
        self.final_error = Some(final_error.into());
        self.resolved_at = Some(at);
        Ok(())
    }

    fn transition(&mut self, next: ErrorStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invalid_state(format!(
                "error log {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.history.push(next);
        Ok(())
    }
}

/// Aggregate counters over all error logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ErrorStats {
    pub total: usize,
    pub retryable: usize,
    pub recovered: usize,
    pub failed: usize,
    /// Logs with status retry_scheduled or retrying.
    pub pending_retry: usize,
}
