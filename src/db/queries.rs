use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use super::{JobStore, StoreError};
use crate::models::job::{Job, JobStatus, Transition};
use crate::models::params::MethodParams;

const JOB_COLUMNS: &str = "id, status, method, original_filename, input_key, scale, params, \
     denoise_first, face_enhance, result_key, created_at, expires_at, started_at, finished_at, \
     status_detail, error_message, progress, queue_message_id";

/// Postgres-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_one(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, status, method, original_filename, input_key, scale, params,
                              denoise_first, face_enhance, result_key, created_at, expires_at,
                              started_at, finished_at, status_detail, error_message, progress,
                              queue_message_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(job.id)
        .bind(job.status.as_ref())
        .bind(&job.method)
        .bind(&job.original_filename)
        .bind(&job.input_key)
        .bind(job.scale)
        .bind(Json(&job.params))
        .bind(job.denoise_first)
        .bind(job.face_enhance)
        .bind(&job.result_key)
        .bind(job.created_at)
        .bind(job.expires_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(&job.status_detail)
        .bind(&job.error_message)
        .bind(job.progress)
        .bind(&job.queue_message_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let status: String = row.try_get("status")?;
    let status: JobStatus = status
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("unknown status {status}")))?;
    let Json(params): Json<MethodParams> = row.try_get("params")?;

    Ok(Job {
        id: row.try_get("id")?,
        status,
        method: row.try_get("method")?,
        original_filename: row.try_get("original_filename")?,
        input_key: row.try_get("input_key")?,
        scale: row.try_get("scale")?,
        params,
        denoise_first: row.try_get("denoise_first")?,
        face_enhance: row.try_get("face_enhance")?,
        result_key: row.try_get("result_key")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        status_detail: row.try_get("status_detail")?,
        error_message: row.try_get("error_message")?,
        progress: row.try_get("progress")?,
        queue_message_id: row.try_get("queue_message_id")?,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, jobs: &[Job]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for job in jobs {
            Self::insert_one(&mut tx, job).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = ANY($1)"
        ))
        .bind(ids.to_vec())
        .fetch_all(&self.pool)
        .await?;

        let mut by_id = rows
            .iter()
            .map(|row| job_from_row(row).map(|job| (job.id, job)))
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn list_recent(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE expires_at >= $1 ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn transition(&self, id: Uuid, transition: Transition) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound(id))?;

        let job = job_from_row(&row)?.apply(transition)?;

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                result_key = $3,
                started_at = $4,
                finished_at = $5,
                status_detail = $6,
                error_message = $7,
                progress = $8
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.status.as_ref())
        .bind(&job.result_key)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(&job.status_detail)
        .bind(&job.error_message)
        .bind(job.progress)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(job)
    }

    async fn set_queue_message_id(&self, id: Uuid, message_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE jobs SET queue_message_id = $2 WHERE id = $1")
            .bind(id)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn stale_processing(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'processing' AND created_at < $1"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE expires_at < $1"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn delete(&self, ids: &[Uuid]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM jobs WHERE id = ANY($1)")
            .bind(ids.to_vec())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn status_counts(
        &self,
        live_at: Option<DateTime<Utc>>,
    ) -> Result<HashMap<JobStatus, i64>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM jobs
            WHERE $1::timestamptz IS NULL OR expires_at >= $1
            GROUP BY status
            "#,
        )
        .bind(live_at)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            let status: JobStatus = status
                .parse()
                .map_err(|_| StoreError::Corrupt(format!("unknown status {status}")))?;
            counts.insert(status, row.try_get::<i64, _>("count")?);
        }
        Ok(counts)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
