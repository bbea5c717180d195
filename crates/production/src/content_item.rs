use serde::{Deserialize, Serialize};

use narrator_core::{Entity, ItemId, JobId};

/// Processing status of a single content item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// One unit of work belonging to a job (e.g. a chapter to narrate).
///
/// The orchestrator only needs identity and ordering; item content lives with
/// the stage providers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    id: ItemId,
    job_id: JobId,
    position: u32,
    status: ItemStatus,
}

impl ContentItem {
    pub fn new(id: ItemId, job_id: JobId, position: u32) -> Self {
        Self {
            id,
            job_id,
            position,
            status: ItemStatus::Pending,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn status(&self) -> ItemStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ItemStatus) {
        self.status = status;
    }
}

impl Entity for ContentItem {
    type Id = ItemId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
