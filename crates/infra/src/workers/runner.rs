use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;

/// Result of one polling step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// Nothing was waiting.
    Idle,
    Succeeded,
    Failed,
}

/// A unit that can be polled for work.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    fn name(&self) -> String;

    /// Process at most one envelope.
    async fn run_once(&self) -> WorkOutcome;
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: WorkOutcome) {
        match outcome {
            WorkOutcome::Idle => {}
            WorkOutcome::Succeeded => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            WorkOutcome::Failed => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> WorkerStats {
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        WorkerStats {
            processed: succeeded + failed,
            succeeded,
            failed,
        }
    }
}

/// Handle to control and join a background worker.
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) also stops
/// the worker, without waiting for it.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                warn!(worker = %self.name, error = %err, "worker task ended abnormally");
            }
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }
}

/// Run `worker` on a tokio task until its handle shuts it down.
///
/// The worker is polled back to back while it finds work and sleeps for the
/// configured poll interval whenever it comes back idle.
pub fn spawn<W: Worker>(worker: Arc<W>, config: &WorkerConfig) -> WorkerHandle {
    let name = worker.name();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let counters = Arc::new(Counters::default());

    let join = tokio::spawn(worker_loop(
        worker,
        config.poll_interval(),
        shutdown_rx,
        Arc::clone(&counters),
    ));
    info!(worker = %name, "worker started");

    WorkerHandle {
        name,
        shutdown: shutdown_tx,
        join: Some(join),
        counters,
    }
}

async fn worker_loop<W: Worker>(
    worker: Arc<W>,
    poll_interval: std::time::Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    counters: Arc<Counters>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let outcome = worker.run_once().await;
        counters.record(outcome);

        if outcome == WorkOutcome::Idle {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    // Sender gone: the handle was dropped.
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        } else {
            tokio::task::yield_now().await;
        }
    }

    debug!(worker = %worker.name(), stats = ?counters.snapshot(), "worker stopped");
}
