//! In-memory job storage.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use fleet_core::{
    Job, JobId, JobStore,
    traits::{JobFilter, StorageError},
};

struct Entry {
    // insertion order, for stable newest-first listing
    seq: u64,
    job: Job,
}

#[derive(Default)]
struct Jobs {
    entries: HashMap<JobId, Entry>,
    next_seq: u64,
}

/// In-memory job store.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<Jobs>,
}

impl MemoryJobStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &Job) -> Result<(), StorageError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        if jobs.entries.contains_key(&job.id) {
            return Err(StorageError::AlreadyExists(job.id));
        }
        let seq = jobs.next_seq;
        jobs.next_seq += 1;
        jobs.entries.insert(
            job.id,
            Entry {
                seq,
                job: job.clone(),
            },
        );
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StorageError> {
        Ok(self
            .jobs
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .entries
            .get(&id)
            .map(|e| e.job.clone()))
    }

    async fn update(&self, job: &Job) -> Result<(), StorageError> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let entry = jobs
            .entries
            .get_mut(&job.id)
            .ok_or(StorageError::NotFound(job.id))?;
        entry.job = job.clone();
        Ok(())
    }

    async fn list(&self, filter: JobFilter) -> Result<Vec<Job>, StorageError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let mut result: Vec<&Entry> = jobs
            .entries
            .values()
            .filter(|e| filter.status.is_none_or(|status| e.job.status == status))
            .filter(|e| {
                filter
                    .agent_id
                    .as_ref()
                    .is_none_or(|agent_id| e.job.agent_id == *agent_id)
            })
            .collect();

        result.sort_by(|a, b| b.seq.cmp(&a.seq));
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }

        Ok(result.into_iter().map(|e| e.job.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use fleet_core::{AgentId, JobStatus};
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_create_get_update() {
        let store = MemoryJobStore::new();
        let mut job = Job::new(AgentId::new("a1"), "backup", json!({"location": "s3"}));
        store.create(&job).await.unwrap();

        job.transition(JobStatus::Running);
        store.update(&job).await.unwrap();

        let loaded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Running);
        assert_eq!(loaded.params["location"], "s3");
    }

    #[tokio::test]
    async fn test_duplicate_create_fails() {
        let store = MemoryJobStore::new();
        let job = Job::new(AgentId::new("a1"), "backup", json!(null));
        store.create(&job).await.unwrap();
        assert!(matches!(
            store.create(&job).await,
            Err(StorageError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_update_missing_fails() {
        let store = MemoryJobStore::new();
        let job = Job::new(AgentId::new("a1"), "backup", json!(null));
        assert!(matches!(
            store.update(&job).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_filters_newest_first() {
        let store = MemoryJobStore::new();
        let first = Job::new(AgentId::new("a1"), "backup", json!(null));
        let second = Job::new(AgentId::new("a2"), "backup", json!(null));
        let mut third = Job::new(AgentId::new("a1"), "restore", json!(null));
        third.transition(JobStatus::Failed);
        for job in [&first, &second, &third] {
            store.create(job).await.unwrap();
        }

        let all = store.list(JobFilter::default()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![third.id, second.id, first.id]);

        let a1 = store
            .list(JobFilter {
                agent_id: Some(AgentId::new("a1")),
                ..JobFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(a1.len(), 2);

        let failed = store
            .list(JobFilter {
                status: Some(JobStatus::Failed),
                limit: Some(1),
                ..JobFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, third.id);
    }
}
