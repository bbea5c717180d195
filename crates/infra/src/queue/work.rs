//! Payloads carried by pipeline queues.

use serde::{Deserialize, Serialize};

use narrator_core::{ErrorId, ItemId, JobId};

/// One item travelling through the stage queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemWork {
    pub item_id: ItemId,
    pub job_id: JobId,
    /// Recovery rounds this item already went through.
    #[serde(default)]
    pub recoveries: u32,
}

impl ItemWork {
    pub const TYPE: &'static str = "process_item";

    pub fn new(job_id: JobId, item_id: ItemId) -> Self {
        Self {
            item_id,
            job_id,
            recoveries: 0,
        }
    }
}

/// Request to retry the operation behind an error log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryWork {
    pub error_id: ErrorId,
}

impl RetryWork {
    pub const TYPE: &'static str = "retry_error";
}
