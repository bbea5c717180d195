//! Registry of named queues.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use serde_json::Value as JsonValue;

use narrator_core::EnvelopeId;
use narrator_production::Stage;

use super::fifo::Queue;
use super::types::{EnqueueOptions, QueueStats};
use crate::config::QueueConfig;

/// Name of the queue holding scheduled error retries.
pub const RETRY_QUEUE: &str = "retry";

/// Queue carrying JSON payloads; every pipeline queue is one of these.
pub type JsonQueue = Queue<JsonValue>;

/// Owns one shared queue per name.
///
/// Every stage queue and the retry queue exist from construction; other names
/// are created on first use.
pub struct QueueManager {
    config: QueueConfig,
    queues: RwLock<HashMap<String, Arc<JsonQueue>>>,
}

impl QueueManager {
    pub fn new(config: QueueConfig) -> Self {
        let queues = Stage::ALL
            .iter()
            .map(Stage::as_str)
            .chain([RETRY_QUEUE])
            .map(|name| (name.to_owned(), Arc::new(Queue::new(name, config.clone()))))
            .collect();

        Self {
            config,
            queues: RwLock::new(queues),
        }
    }

    /// Shared queue for `name`, created on first use.
    pub fn get_queue(&self, name: &str) -> Arc<JsonQueue> {
        if let Some(queue) = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Arc::clone(queue);
        }

        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            queues
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(Queue::new(name, self.config.clone()))),
        )
    }

    pub fn stage_queue(&self, stage: Stage) -> Arc<JsonQueue> {
        self.get_queue(stage.as_str())
    }

    pub fn retry_queue(&self) -> Arc<JsonQueue> {
        self.get_queue(RETRY_QUEUE)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Known queue names, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Serialize `payload` and enqueue it on the queue called `name`.
    pub async fn enqueue_json<P: Serialize>(
        &self,
        name: &str,
        job_type: &str,
        payload: &P,
        options: EnqueueOptions,
    ) -> Result<EnvelopeId, serde_json::Error> {
        let payload = serde_json::to_value(payload)?;
        Ok(self.get_queue(name).enqueue(job_type, payload, options).await)
    }

    pub async fn stats(&self) -> BTreeMap<String, QueueStats> {
        let queues: Vec<Arc<JsonQueue>> = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut stats = BTreeMap::new();
        for queue in queues {
            stats.insert(queue.name().to_owned(), queue.stats().await);
        }
        stats
    }
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl core::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueueManager")
            .field("queues", &self.queue_names())
            .finish()
    }
}
