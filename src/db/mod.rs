use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

use crate::models::job::{Job, JobStatus, Transition, TransitionError};

pub mod memory;
pub mod queries;

pub use memory::MemoryJobStore;
pub use queries::PgJobStore;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Durable job table.
///
/// All status changes go through [`JobStore::transition`], which re-reads the row,
/// applies the transition and writes the result as one unit.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, jobs: &[Job]) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Fetch the given ids. Missing ids are skipped; order follows the input.
    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<Job>, StoreError>;

    /// Non-expired jobs, newest first.
    async fn list_recent(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>, StoreError>;

    async fn transition(&self, id: Uuid, transition: Transition) -> Result<Job, StoreError>;

    async fn set_queue_message_id(&self, id: Uuid, message_id: &str) -> Result<(), StoreError>;

    /// `processing` jobs created before `cutoff`.
    async fn stale_processing(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    /// Jobs of any status whose `expires_at` is before `now`.
    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    /// Hard-delete rows, returning how many were removed.
    async fn delete(&self, ids: &[Uuid]) -> Result<u64, StoreError>;

    /// Count jobs per status. With `live_at`, only jobs not yet expired at that instant count.
    async fn status_counts(
        &self,
        live_at: Option<DateTime<Utc>>,
    ) -> Result<HashMap<JobStatus, i64>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Corrupt job row: {0}")]
    Corrupt(String),
}
