//! Per-job async mutexes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

use narrator_core::JobId;

type Slot = Arc<tokio::sync::Mutex<()>>;

/// Serializes read-modify-write cycles on the same job.
///
/// Locks for different jobs are independent. An entry is dropped as soon as no
/// task holds or waits for it, so the map only grows with concurrently active
/// jobs.
#[derive(Debug, Default, Clone)]
pub struct JobLocks {
    slots: Arc<Mutex<HashMap<JobId, Slot>>>,
}

impl JobLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `job_id`.
    pub async fn lock(&self, job_id: &JobId) -> JobLockGuard {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(job_id.clone()).or_default())
        };

        let guard = Arc::clone(&slot).lock_owned().await;
        JobLockGuard {
            job_id: job_id.clone(),
            slot,
            slots: Arc::clone(&self.slots),
            guard: Some(guard),
        }
    }

    /// Number of jobs with a live lock entry.
    pub fn active(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Exclusive access to one job; released on drop.
#[derive(Debug)]
pub struct JobLockGuard {
    job_id: JobId,
    slot: Slot,
    slots: Arc<Mutex<HashMap<JobId, Slot>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for JobLockGuard {
    fn drop(&mut self) {
        // Release first so waiters can proceed.
        drop(self.guard.take());

        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // Map entry + this guard's handle: nobody else holds or waits.
        if Arc::strong_count(&self.slot) == 2 {
            slots.remove(&self.job_id);
        }
    }
}
