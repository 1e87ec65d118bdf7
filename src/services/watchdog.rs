//! Periodic recovery of abandoned jobs and hard deletion of expired ones.
//!
//! Runs on a fixed interval using `tokio::time::interval` until cancelled.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::db::{JobStore, StoreError};
use crate::models::job::{self, Transition};
use crate::services::storage::BlobStore;

#[derive(Clone)]
pub struct Watchdog {
    jobs: Arc<dyn JobStore>,
    blobs: Arc<dyn BlobStore>,
    stale_after: chrono::Duration,
    interval: Duration,
}

impl Watchdog {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        blobs: Arc<dyn BlobStore>,
        stale_after: chrono::Duration,
        interval: Duration,
    ) -> Self {
        Self {
            jobs,
            blobs,
            stale_after,
            interval,
        }
    }

    /// Fail `processing` jobs created more than `stale_after` ago. Returns how many were reclaimed.
    pub async fn reclaim_stale(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let stale = self.jobs.stale_processing(now - self.stale_after).await?;
        let mut reclaimed = 0;
        for job in stale {
            match self
                .jobs
                .transition(job.id, Transition::Reclaim { at: now })
                .await
            {
                Ok(_) => {
                    reclaimed += 1;
                    tracing::warn!(job_id = %job.id, created_at = %job.created_at, "Reclaimed stale job");
                }
                // Finished or cancelled between the scan and the update.
                Err(StoreError::Transition(_) | StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if reclaimed > 0 {
            metrics::counter!("jobs_reclaimed_total").increment(reclaimed as u64);
        }
        Ok(reclaimed)
    }

    /// Delete every job past its expiry along with its blobs. Returns rows deleted.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let expired = self.jobs.expired(now).await?;
        if expired.is_empty() {
            return Ok(0);
        }

        for job in &expired {
            let mut keys = job.input_keys();
            if job.input_count().is_some() {
                keys.push(job.input_key.clone());
            }
            keys.push(job::result_key(job.id));
            for key in keys {
                if let Err(e) = self.blobs.delete(&key).await {
                    tracing::warn!(job_id = %job.id, key = %key, error = %e, "Failed to delete expired blob");
                }
            }
        }

        let ids: Vec<_> = expired.iter().map(|j| j.id).collect();
        let deleted = self.jobs.delete(&ids).await?;
        tracing::info!(deleted, "Expired jobs purged");
        Ok(deleted)
    }

    /// Run both sweeps every interval until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            stale_after_mins = self.stale_after.num_minutes(),
            "Watchdog started"
        );

        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Watchdog stopping");
                    break;
                }
                _ = interval.tick() => {
                    let now = Utc::now();
                    if let Err(e) = self.reclaim_stale(now).await {
                        tracing::error!(error = %e, "Watchdog: stale reclaim failed");
                    }
                    match self.sweep_expired(now).await {
                        Ok(0) => tracing::debug!("Watchdog: nothing expired"),
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Watchdog: expiry sweep failed"),
                    }
                }
            }
        }
    }
}
