//! Persistence seams.
//!
//! The pipeline only depends on these traits; the in-memory implementations
//! back tests and single-node deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use narrator_core::{ErrorId, JobId};
use narrator_production::{ContentItem, Job};

use crate::recovery::ErrorLog;

mod in_memory;

pub use in_memory::{InMemoryContentItemRepository, InMemoryErrorLogRepository, InMemoryJobRepository};

#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>, RepositoryError>;

    /// Insert or replace.
    async fn save(&self, job: &Job) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ContentItemRepository: Send + Sync {
    /// Items of `job_id`, ordered by position.
    async fn find_by_job_id(&self, job_id: &JobId) -> Result<Vec<ContentItem>, RepositoryError>;

    async fn save(&self, item: &ContentItem) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ErrorLogRepository: Send + Sync {
    async fn find_by_id(&self, id: &ErrorId) -> Result<Option<ErrorLog>, RepositoryError>;

    async fn save(&self, log: &ErrorLog) -> Result<(), RepositoryError>;

    async fn find_all(&self) -> Result<Vec<ErrorLog>, RepositoryError>;

    /// Recovered or failed logs resolved before `cutoff`.
    async fn find_resolved_errors(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ErrorLog>, RepositoryError>;

    /// Returns whether a log was removed.
    async fn delete(&self, id: &ErrorId) -> Result<bool, RepositoryError>;
}
