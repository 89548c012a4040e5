//! Durable internal job queue.
//!
//! Jobs are self-contained `(function, kwargs)` rows with scheduling
//! metadata. Claims go through SKIP LOCKED; the partial unique index on
//! `(serial_group) WHERE status = 'running'` backstops the serial-group
//! rule against concurrent claimers.

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;

use qcgrid_core::error::QcGridError;
use qcgrid_core::ports::{InternalJobQueue, Result};
use qcgrid_core::record::{InternalJob, InternalJobSpec};
use qcgrid_core::types::InternalJobStatus;

use crate::sqlx_types::InternalJobRow;

const JOB_COLUMNS: &str = "id, name, status, added_date, scheduled_date, started_date, \
     last_updated, ended_date, runner_hostname, runner_uuid, progress, function, kwargs, \
     after_function, after_function_kwargs, result, user_name, unique_name, serial_group";

/// Postgres-backed internal job queue.
pub struct PgInternalJobQueue {
    pool: PgPool,
}

impl PgInternalJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InternalJobQueue for PgInternalJobQueue {
    async fn add(&self, spec: InternalJobSpec) -> Result<i64> {
        if let Some(unique_name) = &spec.unique_name {
            let existing: Option<i64> = sqlx::query_scalar(
                "SELECT id FROM internal_jobs WHERE unique_name = $1 \
                 AND status IN ('waiting', 'running')",
            )
            .bind(unique_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
            if let Some(id) = existing {
                return Ok(id);
            }
        }

        let inserted: std::result::Result<i64, sqlx::Error> = sqlx::query_scalar(
            r#"
            INSERT INTO internal_jobs
                (name, status, scheduled_date, function, kwargs, user_name,
                 unique_name, after_function, after_function_kwargs, serial_group)
            VALUES ($1, 'waiting', $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(&spec.name)
        .bind(spec.scheduled_date)
        .bind(&spec.function)
        .bind(&spec.kwargs)
        .bind(&spec.user_name)
        .bind(&spec.unique_name)
        .bind(&spec.after_function)
        .bind(&spec.after_function_kwargs)
        .bind(&spec.serial_group)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(id) => Ok(id),
            // a concurrent add with the same unique_name won the race
            Err(e)
                if e.as_database_error()
                    .map(|d| d.is_unique_violation())
                    .unwrap_or(false) =>
            {
                let id: i64 = sqlx::query_scalar(
                    "SELECT id FROM internal_jobs WHERE unique_name = $1 \
                     AND status IN ('waiting', 'running')",
                )
                .bind(&spec.unique_name)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| anyhow!(e))?;
                Ok(id)
            }
            Err(e) => Err(anyhow!(e).into()),
        }
    }

    async fn claim_next(
        &self,
        runner_hostname: &str,
        runner_uuid: &str,
    ) -> Result<Option<InternalJob>> {
        let claimed: std::result::Result<Option<InternalJobRow>, sqlx::Error> = sqlx::query_as(
            &format!(
                r#"
                UPDATE internal_jobs
                SET status = 'running', started_date = now(), last_updated = now(),
                    runner_hostname = $1, runner_uuid = $2
                WHERE id = (
                    SELECT j.id FROM internal_jobs j
                    WHERE j.status = 'waiting'
                      AND j.scheduled_date <= now()
                      AND (j.serial_group IS NULL OR NOT EXISTS
                           (SELECT 1 FROM internal_jobs g
                            WHERE g.serial_group = j.serial_group AND g.status = 'running'))
                    ORDER BY j.scheduled_date ASC
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING {JOB_COLUMNS}
                "#
            ),
        )
        .bind(runner_hostname)
        .bind(runner_uuid)
        .fetch_optional(&self.pool)
        .await;

        match claimed {
            Ok(None) => Ok(None),
            Ok(Some(row)) => Ok(Some(row.into_job()?)),
            // two claimers racing on the same serial group: the partial
            // unique index rejects the loser, who just tries again later
            Err(e)
                if e.as_database_error()
                    .map(|d| d.is_unique_violation())
                    .unwrap_or(false) =>
            {
                Ok(None)
            }
            Err(e) => Err(anyhow!(e).into()),
        }
    }

    async fn update_progress(&self, job_id: i64, progress: i32) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE internal_jobs SET progress = $2, last_updated = now() \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(job_id)
        .bind(progress.clamp(0, 100))
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        if updated.rows_affected() == 0 {
            return Err(QcGridError::NotFound(format!("running internal job {job_id}")));
        }
        Ok(())
    }

    async fn finish(
        &self,
        job_id: i64,
        status: InternalJobStatus,
        result: Option<Value>,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(QcGridError::InvalidInput(format!(
                "cannot finish a job with non-terminal status {status}"
            )));
        }
        sqlx::query(
            "UPDATE internal_jobs \
             SET status = $2, result = $3, ended_date = now(), last_updated = now() \
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(status.as_str())
        .bind(&result)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn reap_stale(&self, stale_after: chrono::Duration) -> Result<Vec<i64>> {
        let cutoff = chrono::Utc::now() - stale_after;
        let recycled: Vec<i64> = sqlx::query_scalar(
            r#"
            UPDATE internal_jobs
            SET status = 'waiting', runner_hostname = NULL, runner_uuid = NULL,
                started_date = NULL, progress = 0
            WHERE status = 'running' AND last_updated < $1
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;

        if !recycled.is_empty() {
            tracing::warn!(n = recycled.len(), "recycled stale internal jobs");
        }
        Ok(recycled)
    }
}
