//! In-memory named queue.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use narrator_core::EnvelopeId;

use super::types::{EnqueueOptions, FailOutcome, QueueError, QueueJob, QueueStats};
use crate::config::QueueConfig;

const VISIBILITY_EXPIRED: &str = "visibility timeout expired";

struct QueueState<T> {
    envelopes: HashMap<EnvelopeId, QueueJob<T>>,
    ready: VecDeque<EnvelopeId>,
    /// Parked envelopes keyed by (due time, insertion sequence).
    delayed: BTreeMap<(Instant, u64), EnvelopeId>,
    /// In-flight envelopes and when they were handed out.
    in_flight: HashMap<EnvelopeId, Instant>,
    /// Envelopes that ran out of attempts through reclaiming, awaiting
    /// [`Queue::take_reclaimed`].
    reclaimed: Vec<QueueJob<T>>,
    seq: u64,
    acked: u64,
    exhausted: u64,
}

impl<T> QueueState<T> {
    fn new() -> Self {
        Self {
            envelopes: HashMap::new(),
            ready: VecDeque::new(),
            delayed: BTreeMap::new(),
            in_flight: HashMap::new(),
            reclaimed: Vec::new(),
            seq: 0,
            acked: 0,
            exhausted: 0,
        }
    }

    fn promote_due(&mut self, now: Instant) {
        while let Some(entry) = self.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let id = entry.remove();
            self.ready.push_back(id);
        }
    }

    fn reclaim_expired(&mut self, queue: &str, now: Instant, timeout: Duration) {
        let mut expired: Vec<(Instant, EnvelopeId)> = self
            .in_flight
            .iter()
            .filter(|(_, dequeued_at)| now.saturating_duration_since(**dequeued_at) >= timeout)
            .map(|(id, dequeued_at)| (*dequeued_at, *id))
            .collect();
        expired.sort_by_key(|(dequeued_at, _)| *dequeued_at);

        for (_, id) in expired {
            self.in_flight.remove(&id);
            warn!(queue, envelope_id = %id, "reclaiming stalled envelope");
            if let Some((_, Some(retired))) = self.record_failure(queue, id, VISIBILITY_EXPIRED.to_owned()) {
                self.reclaimed.push(retired);
            }
        }
    }

    /// Envelope must already be out of `in_flight`. An exhausted envelope is
    /// handed back alongside the outcome.
    fn record_failure(
        &mut self,
        queue: &str,
        id: EnvelopeId,
        error: String,
    ) -> Option<(FailOutcome, Option<QueueJob<T>>)> {
        let envelope = self.envelopes.get_mut(&id)?;
        envelope.attempts += 1;
        envelope.last_error = Some(error);
        let attempts = envelope.attempts;

        if attempts < envelope.max_attempts {
            self.ready.push_back(id);
            debug!(queue, envelope_id = %id, attempts, "envelope requeued");
            return Some((FailOutcome::Requeued { attempts }, None));
        }

        let retired = self.envelopes.remove(&id)?;
        self.exhausted += 1;
        warn!(
            queue,
            envelope_id = %id,
            attempts,
            job_type = %retired.job_type,
            last_error = retired.last_error.as_deref().unwrap_or_default(),
            "envelope exhausted its attempts"
        );
        Some((FailOutcome::Exhausted { attempts }, Some(retired)))
    }
}

/// Named FIFO work queue with delayed admission and bounded retries.
///
/// - Ready envelopes are handed out oldest first; failures rejoin at the tail
/// - Delayed envelopes are admitted once their delay elapsed, when the queue is
///   next observed (`dequeue`, `size`, `stats`)
/// - An envelope is ready, delayed, in flight or retired; never two at once
pub struct Queue<T> {
    name: String,
    config: QueueConfig,
    state: Mutex<QueueState<T>>,
}

impl<T: Clone + Send> Queue<T> {
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(QueueState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add an envelope and return its id.
    pub async fn enqueue(
        &self,
        job_type: impl Into<String>,
        payload: T,
        options: EnqueueOptions,
    ) -> EnvelopeId {
        let id = EnvelopeId::new();
        let delay = options.delay.filter(|delay| !delay.is_zero());
        let created_at = Utc::now();
        let envelope = QueueJob {
            id,
            job_type: job_type.into(),
            payload,
            job_id: options.job_id,
            attempts: 0,
            max_attempts: options
                .max_attempts
                .unwrap_or(self.config.default_max_attempts),
            created_at,
            available_at: delay
                .map(|delay| created_at + chrono::Duration::from_std(delay).unwrap_or_default()),
            last_error: None,
        };

        let mut state = self.state.lock().await;
        state.envelopes.insert(id, envelope);
        match delay {
            Some(delay) => {
                state.seq += 1;
                let key = (Instant::now() + delay, state.seq);
                state.delayed.insert(key, id);
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                debug!(queue = %self.name, envelope_id = %id, delay_ms, "envelope parked");
            }
            None => {
                state.ready.push_back(id);
                debug!(queue = %self.name, envelope_id = %id, "envelope enqueued");
            }
        }
        id
    }

    /// Take the oldest ready envelope and mark it in flight.
    pub async fn dequeue(&self) -> Option<QueueJob<T>> {
        let mut state = self.state.lock().await;
        self.observe(&mut state);

        while let Some(id) = state.ready.pop_front() {
            if let Some(envelope) = state.envelopes.get(&id).cloned() {
                state.in_flight.insert(id, Instant::now());
                return Some(envelope);
            }
        }
        None
    }

    /// Retire an in-flight envelope after successful processing.
    pub async fn ack(&self, id: EnvelopeId) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.in_flight.remove(&id).is_none() {
            return Err(self.unknown(id));
        }
        state.envelopes.remove(&id);
        state.acked += 1;
        Ok(())
    }

    /// Record a failed attempt of an in-flight envelope.
    pub async fn fail(&self, id: EnvelopeId, error: impl Into<String>) -> Result<FailOutcome, QueueError> {
        let mut state = self.state.lock().await;
        if state.in_flight.remove(&id).is_none() {
            return Err(self.unknown(id));
        }
        state
            .record_failure(&self.name, id, error.into())
            .map(|(outcome, _)| outcome)
            .ok_or_else(|| self.unknown(id))
    }

    /// Drain envelopes that used up their attempts because they stalled in
    /// flight past the visibility timeout.
    ///
    /// Nothing else reports these, so the consumer must escalate them.
    pub async fn take_reclaimed(&self) -> Vec<QueueJob<T>> {
        let mut state = self.state.lock().await;
        self.observe(&mut state);
        std::mem::take(&mut state.reclaimed)
    }

    /// Number of ready envelopes (delayed and in-flight ones are not counted).
    pub async fn size(&self) -> usize {
        let mut state = self.state.lock().await;
        self.observe(&mut state);
        state.ready.len()
    }

    pub async fn stats(&self) -> QueueStats {
        let mut state = self.state.lock().await;
        self.observe(&mut state);
        QueueStats {
            ready: state.ready.len(),
            delayed: state.delayed.len(),
            in_flight: state.in_flight.len(),
            acked: state.acked,
            exhausted: state.exhausted,
        }
    }

    fn observe(&self, state: &mut QueueState<T>) {
        let now = Instant::now();
        if let Some(timeout) = self.config.visibility_timeout() {
            state.reclaim_expired(&self.name, now, timeout);
        }
        state.promote_due(now);
    }

    fn unknown(&self, id: EnvelopeId) -> QueueError {
        QueueError::UnknownEnvelope {
            queue: self.name.clone(),
            id,
        }
    }
}

impl<T> core::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Queue<u32> {
        Queue::new("test", QueueConfig::default())
    }

    #[tokio::test]
    async fn dequeues_in_fifo_order() {
        let q = queue();
        for n in 1..=3 {
            q.enqueue("n", n, EnqueueOptions::new()).await;
        }

        let mut seen = Vec::new();
        while let Some(envelope) = q.dequeue().await {
            seen.push(envelope.payload);
            q.ack(envelope.id).await.unwrap();
        }

        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(q.stats().await.acked, 3);
    }

    #[tokio::test]
    async fn failed_envelope_rejoins_tail_until_exhausted() {
        let q = queue();
        let first = q.enqueue("n", 1, EnqueueOptions::new()).await;
        q.enqueue("n", 2, EnqueueOptions::new()).await;

        let envelope = q.dequeue().await.unwrap();
        assert_eq!(envelope.id, first);
        assert_eq!(
            q.fail(first, "boom").await.unwrap(),
            FailOutcome::Requeued { attempts: 1 }
        );

        // Retry lands behind the envelope that was already waiting.
        assert_eq!(q.dequeue().await.unwrap().payload, 2);
        let retried = q.dequeue().await.unwrap();
        assert_eq!(retried.id, first);
        assert_eq!(retried.attempts, 1);
        assert_eq!(retried.last_error.as_deref(), Some("boom"));

        assert_eq!(
            q.fail(first, "boom").await.unwrap(),
            FailOutcome::Requeued { attempts: 2 }
        );
        q.dequeue().await.unwrap();
        assert_eq!(
            q.fail(first, "boom").await.unwrap(),
            FailOutcome::Exhausted { attempts: 3 }
        );

        let stats = q.stats().await;
        assert_eq!(stats.exhausted, 1);
        assert_eq!(stats.ready, 0);
        assert_eq!(stats.in_flight, 1);
    }

    #[tokio::test]
    async fn size_counts_ready_envelopes_only() {
        let q = queue();
        q.enqueue("n", 1, EnqueueOptions::new()).await;
        q.enqueue("n", 2, EnqueueOptions::new()).await;
        q.enqueue("n", 3, EnqueueOptions::new().with_delay(Duration::from_secs(10)))
            .await;
        q.dequeue().await.unwrap();

        assert_eq!(q.size().await, 1);
        let stats = q.stats().await;
        assert_eq!((stats.ready, stats.delayed, stats.in_flight), (1, 1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_envelope_is_admitted_once_after_its_delay() {
        let q = queue();
        let id = q
            .enqueue("n", 7, EnqueueOptions::new().with_delay(Duration::from_millis(500)))
            .await;

        assert!(q.dequeue().await.is_none());
        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(q.dequeue().await.is_none());

        tokio::time::advance(Duration::from_millis(1)).await;
        let envelope = q.dequeue().await.unwrap();
        assert_eq!(envelope.id, id);
        assert!(envelope.available_at.is_some());
        assert!(q.dequeue().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_envelope_is_reclaimed_after_visibility_timeout() {
        let q = Queue::new(
            "stall",
            QueueConfig {
                default_max_attempts: 2,
                visibility_timeout_ms: Some(1_000),
            },
        );
        let id = q.enqueue("n", 1u32, EnqueueOptions::new()).await;
        q.dequeue().await.unwrap();

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(q.dequeue().await.is_none());

        tokio::time::advance(Duration::from_millis(1)).await;
        let reclaimed = q.dequeue().await.unwrap();
        assert_eq!(reclaimed.id, id);
        assert_eq!(reclaimed.attempts, 1);
        assert_eq!(reclaimed.last_error.as_deref(), Some(VISIBILITY_EXPIRED));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(q.stats().await.exhausted, 1);
        assert!(q.ack(id).await.is_err());

        let retired = q.take_reclaimed().await;
        assert_eq!(retired.len(), 1);
        assert_eq!((retired[0].id, retired[0].attempts), (id, 2));
        assert!(q.take_reclaimed().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_reported_by_consumers_are_not_handed_back() {
        let q = Queue::new(
            "explicit",
            QueueConfig {
                default_max_attempts: 1,
                visibility_timeout_ms: Some(1_000),
            },
        );
        let id = q.enqueue("n", 1u32, EnqueueOptions::new()).await;
        q.dequeue().await.unwrap();
        assert!(q.fail(id, "boom").await.unwrap().is_exhausted());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(q.take_reclaimed().await.is_empty());
    }

    #[tokio::test]
    async fn ack_and_fail_require_in_flight_envelope() {
        let q = queue();
        let id = q.enqueue("n", 1, EnqueueOptions::new()).await;

        assert!(matches!(
            q.ack(id).await,
            Err(QueueError::UnknownEnvelope { .. })
        ));
        assert!(q.fail(id, "nope").await.is_err());

        q.dequeue().await.unwrap();
        q.ack(id).await.unwrap();
        assert!(q.ack(id).await.is_err());
    }

    #[tokio::test]
    async fn enqueue_options_override_max_attempts() {
        let q = queue();
        let id = q
            .enqueue("n", 1, EnqueueOptions::new().with_max_attempts(1))
            .await;
        q.dequeue().await.unwrap();

        assert!(q.fail(id, "once").await.unwrap().is_exhausted());
    }
}
