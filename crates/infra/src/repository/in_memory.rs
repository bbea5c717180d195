use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use narrator_core::{AggregateRoot, Entity, ErrorId, ItemId, JobId};
use narrator_production::{ContentItem, Job};

use super::{ContentItemRepository, ErrorLogRepository, JobRepository, RepositoryError};
use crate::recovery::ErrorLog;

/// In-memory job repository for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>, RepositoryError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(jobs.get(id).cloned())
    }

    async fn save(&self, job: &Job) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        jobs.insert(job.id().clone(), job.clone());
        Ok(())
    }
}

/// In-memory content item repository for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryContentItemRepository {
    items: RwLock<HashMap<ItemId, ContentItem>>,
}

impl InMemoryContentItemRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl ContentItemRepository for InMemoryContentItemRepository {
    async fn find_by_job_id(&self, job_id: &JobId) -> Result<Vec<ContentItem>, RepositoryError> {
        let items = self.items.read().unwrap_or_else(PoisonError::into_inner);
        let mut found: Vec<ContentItem> = items
            .values()
            .filter(|item| item.job_id() == job_id)
            .cloned()
            .collect();
        found.sort_by_key(|item| item.position());
        Ok(found)
    }

    async fn save(&self, item: &ContentItem) -> Result<(), RepositoryError> {
        let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
        items.insert(item.id().clone(), item.clone());
        Ok(())
    }
}

/// In-memory error log repository for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryErrorLogRepository {
    logs: RwLock<HashMap<ErrorId, ErrorLog>>,
}

impl InMemoryErrorLogRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl ErrorLogRepository for InMemoryErrorLogRepository {
    async fn find_by_id(&self, id: &ErrorId) -> Result<Option<ErrorLog>, RepositoryError> {
        let logs = self.logs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(logs.get(id).cloned())
    }

    async fn save(&self, log: &ErrorLog) -> Result<(), RepositoryError> {
        let mut logs = self.logs.write().unwrap_or_else(PoisonError::into_inner);
        logs.insert(log.id.clone(), log.clone());
        Ok(())
    }

    async fn find_all(&self) -> Result<Vec<ErrorLog>, RepositoryError> {
        let logs = self.logs.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<ErrorLog> = logs.values().cloned().collect();
        all.sort_by_key(|log| log.occurred_at);
        Ok(all)
    }

    async fn find_resolved_errors(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ErrorLog>, RepositoryError> {
        let logs = self.logs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(logs
            .values()
            .filter(|log| log.is_resolved())
            .filter(|log| log.resolved_at.unwrap_or(log.occurred_at) < cutoff)
            .cloned()
            .collect())
    }

    async fn delete(&self, id: &ErrorId) -> Result<bool, RepositoryError> {
        let mut logs = self.logs.write().unwrap_or_else(PoisonError::into_inner);
        Ok(logs.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use narrator_events::ErrorContext;

    use super::*;

    #[tokio::test]
    async fn items_come_back_in_position_order() {
        let repo = InMemoryContentItemRepository::new();
        let job = JobId::from("job");
        for (id, position) in [("c", 2), ("a", 0), ("b", 1)] {
            repo.save(&ContentItem::new(ItemId::from(id), job.clone(), position))
                .await
                .unwrap();
        }
        repo.save(&ContentItem::new(ItemId::from("other"), JobId::from("x"), 0))
            .await
            .unwrap();

        let items = repo.find_by_job_id(&job).await.unwrap();
        let ids: Vec<&str> = items.iter().map(|item| item.id().as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn only_resolved_logs_before_cutoff_are_returned() {
        let repo = InMemoryErrorLogRepository::new();
        let old = Utc::now() - chrono::Duration::days(40);

        let mut stale = ErrorLog::new(ErrorId::from("stale"), "timeout", "t", ErrorContext::default(), old);
        stale.mark_failed("gave up", old).unwrap();
        let open = ErrorLog::new(ErrorId::from("open"), "timeout", "t", ErrorContext::default(), old);
        let mut fresh = ErrorLog::new(ErrorId::from("fresh"), "timeout", "t", ErrorContext::default(), Utc::now());
        fresh.mark_failed("gave up", Utc::now()).unwrap();

        for log in [&stale, &open, &fresh] {
            repo.save(log).await.unwrap();
        }

        let cutoff = Utc::now() - chrono::Duration::days(30);
        let resolved = repo.find_resolved_errors(cutoff).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, ErrorId::from("stale"));

        assert!(repo.delete(&ErrorId::from("stale")).await.unwrap());
        assert!(!repo.delete(&ErrorId::from("stale")).await.unwrap());
        assert_eq!(repo.find_all().await.unwrap().len(), 2);
    }
}
