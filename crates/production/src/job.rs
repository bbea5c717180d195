use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use narrator_core::{AggregateRoot, DomainError, DomainResult, JobId};

/// Job status lifecycle.
///
/// ```text
/// DRAFT ──► PENDING ──► PROCESSING ──► COMPLETED
///                          │  ▲    └──► FAILED
///                          ▼  │
///                         PAUSED ─────► FAILED
///
/// any non-terminal ──► CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Draft,
    Pending,
    Processing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether item counters may still move (work can be in flight).
    pub fn accepts_item_updates(&self) -> bool {
        matches!(self, JobStatus::Processing | JobStatus::Paused)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Draft, Pending) => true,
            (Pending, Processing) => true,
            (Processing, Paused | Completed | Failed) => true,
            (Paused, Processing | Failed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Draft => "draft",
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate root: a batch of content items processed as one unit.
///
/// The job is the sole owner of its counters. Every mutator either succeeds
/// and bumps `version`, or returns an error and leaves the job untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    id: JobId,
    name: String,
    status: JobStatus,
    total_items: u32,
    completed_items: u32,
    failed_items: u32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    voice_config: Option<JsonValue>,
    prompt_config: Option<JsonValue>,
    version: u64,
}

impl Job {
    /// Create a job that is ready to be started.
    pub fn new(
        id: JobId,
        name: impl Into<String>,
        total_items: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            status: JobStatus::Pending,
            total_items,
            completed_items: 0,
            failed_items: 0,
            created_at,
            started_at: None,
            completed_at: None,
            voice_config: None,
            prompt_config: None,
            version: 0,
        }
    }

    /// Create a job that still needs to be submitted before it can start.
    pub fn draft(
        id: JobId,
        name: impl Into<String>,
        total_items: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: JobStatus::Draft,
            ..Self::new(id, name, total_items, created_at)
        }
    }

    pub fn with_voice_config(mut self, config: JsonValue) -> Self {
        self.voice_config = Some(config);
        self
    }

    pub fn with_prompt_config(mut self, config: JsonValue) -> Self {
        self.prompt_config = Some(config);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn total_items(&self) -> u32 {
        self.total_items
    }

    pub fn completed_items(&self) -> u32 {
        self.completed_items
    }

    pub fn failed_items(&self) -> u32 {
        self.failed_items
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn voice_config(&self) -> Option<&JsonValue> {
        self.voice_config.as_ref()
    }

    pub fn prompt_config(&self) -> Option<&JsonValue> {
        self.prompt_config.as_ref()
    }

    /// Fraction of items processed (successfully or not), in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        f64::from(self.completed_items) / f64::from(self.total_items.max(1))
    }

    pub fn all_items_processed(&self) -> bool {
        self.completed_items == self.total_items
    }

    /// Number of failed items at which the job is failed: `ceil(total * percent / 100)`.
    pub fn failure_threshold(&self, percent: u32) -> u32 {
        let scaled = u64::from(self.total_items) * u64::from(percent);
        u32::try_from(scaled.div_ceil(100)).unwrap_or(u32::MAX)
    }

    pub fn failure_threshold_reached(&self, percent: u32) -> bool {
        self.failed_items >= self.failure_threshold(percent)
    }

    /// DRAFT → PENDING.
    pub fn submit(&mut self) -> DomainResult<()> {
        self.transition(JobStatus::Pending)
    }

    /// PENDING → PROCESSING. `started_at` is supplied by the calling use case.
    pub fn start(&mut self, started_at: DateTime<Utc>) -> DomainResult<()> {
        if self.status != JobStatus::Pending {
            return Err(DomainError::invalid_state(format!(
                "job {} cannot be started from status {}",
                self.id, self.status
            )));
        }
        self.transition(JobStatus::Processing)?;
        self.started_at = Some(started_at);
        Ok(())
    }

    pub fn pause(&mut self) -> DomainResult<()> {
        self.transition(JobStatus::Paused)
    }

    pub fn resume(&mut self) -> DomainResult<()> {
        if self.status != JobStatus::Paused {
            return Err(DomainError::invalid_state(format!(
                "job {} cannot be resumed from status {}",
                self.id, self.status
            )));
        }
        self.transition(JobStatus::Processing)
    }

    pub fn cancel(&mut self) -> DomainResult<()> {
        self.transition(JobStatus::Cancelled)
    }

    /// PROCESSING → COMPLETED; stamps `completed_at`.
    pub fn complete(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Completed)?;
        self.completed_at = Some(at);
        Ok(())
    }

    /// PROCESSING | PAUSED → FAILED; stamps `completed_at`.
    pub fn fail(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Failed)?;
        self.completed_at = Some(at);
        Ok(())
    }

    /// Count one item as processed successfully.
    pub fn record_item_completed(&mut self) -> DomainResult<()> {
        self.ensure_accepts_items()?;
        self.completed_items += 1;
        self.version += 1;
        Ok(())
    }

    /// Count one item as processed and failed.
    ///
    /// A failed item still counts toward the processed total.
    pub fn record_item_failed(&mut self) -> DomainResult<()> {
        self.ensure_accepts_items()?;
        self.completed_items += 1;
        self.failed_items += 1;
        self.version += 1;
        Ok(())
    }

    fn ensure_accepts_items(&self) -> DomainResult<()> {
        if !self.status.accepts_item_updates() {
            return Err(DomainError::invalid_state(format!(
                "job {} does not accept item updates in status {}",
                self.id, self.status
            )));
        }
        if self.completed_items >= self.total_items {
            return Err(DomainError::invariant(format!(
                "job {} already processed all {} items",
                self.id, self.total_items
            )));
        }
        Ok(())
    }

    fn transition(&mut self, next: JobStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invalid_state(format!(
                "job {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.version += 1;
        Ok(())
    }
}

impl AggregateRoot for Job {
    type Id = JobId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_job(total: u32) -> Job {
        Job::new(JobId::from("job-1"), "chapter batch", total, Utc::now())
    }

    fn processing_job(total: u32) -> Job {
        let mut job = pending_job(total);
        job.start(Utc::now()).unwrap();
        job
    }

    #[test]
    fn start_from_pending_stamps_started_at() {
        let mut job = pending_job(3);
        let at = Utc::now();

        job.start(at).unwrap();

        assert_eq!(job.status(), JobStatus::Processing);
        assert_eq!(job.started_at(), Some(at));
        assert_eq!(job.completed_at(), None);
    }

    #[test]
    fn start_from_non_pending_is_rejected_without_mutation() {
        for status in [
            JobStatus::Draft,
            JobStatus::Processing,
            JobStatus::Paused,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            let mut job = pending_job(2);
            job.status = status;
            let before = job.clone();

            let err = job.start(Utc::now()).unwrap_err();

            assert!(err.is_invalid_state(), "{status}: {err}");
            assert_eq!(job, before);
        }
    }

    #[test]
    fn draft_must_be_submitted_before_start() {
        let mut job = Job::draft(JobId::from("d"), "draft", 1, Utc::now());
        assert!(job.start(Utc::now()).is_err());

        job.submit().unwrap();
        job.start(Utc::now()).unwrap();
        assert_eq!(job.status(), JobStatus::Processing);
    }

    #[test]
    fn pause_and_resume_round_trip() {
        let mut job = processing_job(4);
        job.pause().unwrap();
        assert_eq!(job.status(), JobStatus::Paused);
        assert!(job.pause().is_err());

        job.resume().unwrap();
        assert_eq!(job.status(), JobStatus::Processing);
        assert!(job.resume().is_err());
    }

    #[test]
    fn terminal_states_reject_every_transition() {
        let mut completed = processing_job(1);
        completed.record_item_completed().unwrap();
        completed.complete(Utc::now()).unwrap();

        let mut failed = processing_job(1);
        failed.fail(Utc::now()).unwrap();

        let mut cancelled = pending_job(1);
        cancelled.cancel().unwrap();

        for mut job in [completed, failed, cancelled] {
            let before = job.clone();
            assert!(job.submit().is_err());
            assert!(job.start(Utc::now()).is_err());
            assert!(job.pause().is_err());
            assert!(job.resume().is_err());
            assert!(job.cancel().is_err());
            assert!(job.complete(Utc::now()).is_err());
            assert!(job.fail(Utc::now()).is_err());
            assert!(job.record_item_completed().is_err());
            assert_eq!(job, before);
        }
    }

    #[test]
    fn complete_and_fail_stamp_completed_at() {
        let at = Utc::now();

        let mut job = processing_job(1);
        job.complete(at).unwrap();
        assert_eq!(job.completed_at(), Some(at));

        let mut job = processing_job(1);
        job.pause().unwrap();
        job.fail(at).unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.completed_at(), Some(at));
    }

    #[test]
    fn pending_job_cannot_fail() {
        let mut job = pending_job(1);
        let before = job.clone();

        let err = job.fail(Utc::now()).unwrap_err();

        assert!(err.is_invalid_state());
        assert_eq!(job, before);
    }

    #[test]
    fn failed_items_count_toward_processed_total() {
        let mut job = processing_job(3);
        job.record_item_completed().unwrap();
        job.record_item_failed().unwrap();

        assert_eq!(job.completed_items(), 2);
        assert_eq!(job.failed_items(), 1);
        assert!((job.progress() - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn counters_cannot_exceed_total() {
        let mut job = processing_job(1);
        job.record_item_completed().unwrap();

        let err = job.record_item_failed().unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
        assert_eq!(job.completed_items(), 1);
        assert_eq!(job.failed_items(), 0);
    }

    #[test]
    fn failure_threshold_uses_ceiling() {
        assert_eq!(pending_job(10).failure_threshold(30), 3);
        assert_eq!(pending_job(11).failure_threshold(30), 4);
        assert_eq!(pending_job(1).failure_threshold(30), 1);
        assert_eq!(pending_job(20).failure_threshold(30), 6);
        assert_eq!(pending_job(0).failure_threshold(30), 0);
    }

    #[test]
    fn progress_guards_empty_jobs() {
        assert_eq!(pending_job(0).progress(), 0.0);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Completed,
            Failed,
            Pause,
            Resume,
            Complete,
            Fail,
            Cancel,
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                4 => Just(Op::Completed),
                3 => Just(Op::Failed),
                1 => Just(Op::Pause),
                1 => Just(Op::Resume),
                1 => Just(Op::Complete),
                1 => Just(Op::Fail),
                1 => Just(Op::Cancel),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 500,
                ..ProptestConfig::default()
            })]

            /// Property: counters stay ordered whatever sequence of operations is applied.
            #[test]
            fn counters_stay_ordered(total in 0u32..40, ops in proptest::collection::vec(op(), 0..80)) {
                let mut job = processing_job(total);

                for op in ops {
                    let before = job.clone();
                    let result = match op {
                        Op::Completed => job.record_item_completed(),
                        Op::Failed => job.record_item_failed(),
                        Op::Pause => job.pause(),
                        Op::Resume => job.resume(),
                        Op::Complete => job.complete(Utc::now()),
                        Op::Fail => job.fail(Utc::now()),
                        Op::Cancel => job.cancel(),
                    };

                    if result.is_err() {
                        prop_assert_eq!(&job, &before);
                    } else {
                        prop_assert_eq!(job.version(), before.version() + 1);
                    }

                    prop_assert!(job.failed_items() <= job.completed_items());
                    prop_assert!(job.completed_items() <= job.total_items());
                    prop_assert_eq!(job.total_items(), total);
                }
            }
        }
    }
}
