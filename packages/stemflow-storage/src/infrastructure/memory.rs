//! In-memory adapter for JobStore
//!
//! DashMap shards give per-entry locking, so compare-and-swap is atomic with
//! respect to other writers of the same job without a global lock.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::domain::{stamp_write, JobId, JobRecord, JobStats, JobStore, StatusFilter};
use crate::{Result, StorageError};

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<JobId, JobRecord>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, record: JobRecord) -> Result<()> {
        match self.jobs.entry(record.job_id) {
            Entry::Occupied(_) => Err(StorageError::duplicate_job(record.job_id)),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn read(&self, job_id: &JobId) -> Result<JobRecord> {
        match self.jobs.get(job_id) {
            Some(record) if record.is_retained_at(Utc::now()) => Ok(record.clone()),
            _ => Err(StorageError::job_not_found(job_id)),
        }
    }

    async fn compare_and_swap(
        &self,
        job_id: &JobId,
        expected_version: u64,
        next: JobRecord,
    ) -> Result<JobRecord> {
        let mut current = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StorageError::job_not_found(job_id))?;

        if !current.is_retained_at(Utc::now()) {
            return Err(StorageError::job_not_found(job_id));
        }
        if current.version != expected_version {
            return Err(StorageError::version_conflict(
                job_id,
                expected_version,
                current.version,
            ));
        }

        let stored = stamp_write(next, job_id, expected_version);
        *current = stored.clone();
        Ok(stored)
    }

    async fn list(&self, filter: StatusFilter) -> Result<Vec<JobId>> {
        Ok(self
            .jobs
            .iter()
            .filter(|entry| filter.matches(entry.status))
            .map(|entry| *entry.key())
            .collect())
    }

    async fn scan(&self, filter: StatusFilter) -> Result<Vec<JobRecord>> {
        Ok(self
            .jobs
            .iter()
            .filter(|entry| filter.matches(entry.status))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn delete(&self, job_id: &JobId) -> Result<bool> {
        Ok(self.jobs.remove(job_id).is_some())
    }

    async fn stats(&self) -> Result<JobStats> {
        let mut stats = JobStats::default();
        for entry in self.jobs.iter() {
            stats.record(entry.status);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobStatus, StageId};
    use chrono::Duration;
    use std::sync::Arc;

    fn ttl() -> Duration {
        Duration::hours(1)
    }

    #[tokio::test]
    async fn test_create_and_read() {
        let store = InMemoryJobStore::new();
        let id = store
            .create("/in/song.mp3", serde_json::Value::Null, ttl())
            .await
            .unwrap();

        let record = store.read(&id).await.unwrap();
        assert_eq!(record.job_id, id);
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.version, 0);
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = InMemoryJobStore::new();
        let record = JobRecord::new("/in/a.wav", serde_json::Value::Null, ttl()).unwrap();
        store.insert(record.clone()).await.unwrap();

        let err = store.insert(record).await.unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::DuplicateJob);
    }

    #[tokio::test]
    async fn test_cas_increments_version() {
        let store = InMemoryJobStore::new();
        let id = store.create("/in/a.wav", serde_json::Value::Null, ttl()).await.unwrap();

        let mut record = store.read(&id).await.unwrap();
        record.status = JobStatus::Running;
        record.current_stage = Some(StageId::Separation);
        let stored = store.compare_and_swap(&id, 0, record).await.unwrap();

        assert_eq!(stored.version, 1);
        assert_eq!(store.read(&id).await.unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_stale_writer_rejected() {
        let store = InMemoryJobStore::new();
        let id = store.create("/in/a.wav", serde_json::Value::Null, ttl()).await.unwrap();

        let first = store.read(&id).await.unwrap();
        let second = first.clone();

        store.compare_and_swap(&id, first.version, first).await.unwrap();
        let err = store
            .compare_and_swap(&id, second.version, second)
            .await
            .unwrap_err();
        assert!(err.is_version_conflict());
    }

    #[tokio::test]
    async fn test_concurrent_cas_exactly_one_winner() {
        let store = Arc::new(InMemoryJobStore::new());
        let id = store.create("/in/a.wav", serde_json::Value::Null, ttl()).await.unwrap();
        let snapshot = store.read(&id).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let record = snapshot.clone();
            handles.push(tokio::spawn(async move {
                store.compare_and_swap(&id, 0, record).await.is_ok()
            }));
        }

        let winners = futures_count(handles).await;
        assert_eq!(winners, 1);
        assert_eq!(store.read(&id).await.unwrap().version, 1);
    }

    async fn futures_count(handles: Vec<tokio::task::JoinHandle<bool>>) -> usize {
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        wins
    }

    #[tokio::test]
    async fn test_read_hides_records_past_retention() {
        let store = InMemoryJobStore::new();
        let mut record = JobRecord::new("/in/a.wav", serde_json::Value::Null, ttl()).unwrap();
        record.status = JobStatus::Completed;
        record.retain_until = Some(Utc::now() - Duration::seconds(5));
        let id = record.job_id;
        store.insert(record).await.unwrap();

        assert!(store.read(&id).await.unwrap_err().is_not_found());
        // Still visible to scans so it can be purged
        assert_eq!(store.scan(StatusFilter::Terminal).await.unwrap().len(), 1);
        assert!(store.delete(&id).await.unwrap());
        assert!(!store.delete(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_and_stats() {
        let store = InMemoryJobStore::new();
        let a = store.create("/in/a.wav", serde_json::Value::Null, ttl()).await.unwrap();
        store.create("/in/b.wav", serde_json::Value::Null, ttl()).await.unwrap();

        let mut record = store.read(&a).await.unwrap();
        record.status = JobStatus::Failed;
        store.compare_and_swap(&a, 0, record).await.unwrap();

        assert_eq!(store.list(StatusFilter::NonTerminal).await.unwrap().len(), 1);
        assert_eq!(store.list(StatusFilter::Is(JobStatus::Failed)).await.unwrap(), vec![a]);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.count(JobStatus::Queued), 1);
        assert_eq!(stats.count(JobStatus::Failed), 1);
    }
}
