use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{JobStore, StoreError};
use crate::models::job::{Job, JobStatus, Transition};

/// In-process job store used when no database is configured.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, jobs: &[Job]) -> Result<(), StoreError> {
        let mut table = self.jobs.write().await;
        for job in jobs {
            table.insert(job.id, job.clone());
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<Job>, StoreError> {
        let table = self.jobs.read().await;
        Ok(ids.iter().filter_map(|id| table.get(id).cloned()).collect())
    }

    async fn list_recent(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>, StoreError> {
        let table = self.jobs.read().await;
        let mut jobs: Vec<Job> = table
            .values()
            .filter(|job| !job.is_expired(now))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(jobs)
    }

    async fn transition(&self, id: Uuid, transition: Transition) -> Result<Job, StoreError> {
        let mut table = self.jobs.write().await;
        let current = table.get(&id).cloned().ok_or(StoreError::NotFound(id))?;
        let updated = current.apply(transition)?;
        table.insert(id, updated.clone());
        Ok(updated)
    }

    async fn set_queue_message_id(&self, id: Uuid, message_id: &str) -> Result<(), StoreError> {
        let mut table = self.jobs.write().await;
        let job = table.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        job.queue_message_id = Some(message_id.to_string());
        Ok(())
    }

    async fn stale_processing(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let table = self.jobs.read().await;
        Ok(table
            .values()
            .filter(|job| job.status == JobStatus::Processing && job.created_at < cutoff)
            .cloned()
            .collect())
    }

    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let table = self.jobs.read().await;
        Ok(table
            .values()
            .filter(|job| job.is_expired(now))
            .cloned()
            .collect())
    }

    async fn delete(&self, ids: &[Uuid]) -> Result<u64, StoreError> {
        let mut table = self.jobs.write().await;
        Ok(ids.iter().filter(|id| table.remove(id).is_some()).count() as u64)
    }

    async fn status_counts(
        &self,
        live_at: Option<DateTime<Utc>>,
    ) -> Result<HashMap<JobStatus, i64>, StoreError> {
        let table = self.jobs.read().await;
        let mut counts = HashMap::new();
        for job in table.values() {
            if live_at.is_some_and(|now| job.is_expired(now)) {
                continue;
            }
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
