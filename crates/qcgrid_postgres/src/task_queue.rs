//! Claim/return protocol against the task queue.
//!
//! Claim holds one transaction for the whole call: the manager row lock,
//! the per-tag SKIP LOCKED selection, and the record flips all commit
//! together. Return finishes each task in its own short transaction so one
//! bad payload never poisons the batch.

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::json;
use sqlx::{PgConnection, PgPool};
use std::collections::BTreeMap;

use qcgrid_core::error::QcGridError;
use qcgrid_core::ports::{Result, TaskQueue};
use qcgrid_core::record::RecordTask;
use qcgrid_core::results::{extract_properties, ResultPayload};
use qcgrid_core::types::{
    CompressionType, OutputType, RecordStatus, RecordType, TaskRejectReason, TaskReturnMetadata,
};

use crate::helpers;
use crate::sqlx_types::{parse_record_status, parse_record_type};

/// Postgres-backed task queue.
pub struct PgTaskQueue {
    pool: PgPool,
}

impl PgTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ClaimedRow {
    id: i64,
    record_id: i64,
    function: String,
    function_kwargs: serde_json::Value,
    required_programs: Vec<String>,
}

/// Select up to `limit` eligible waiting tasks for one manager tag.
/// `tag = None` is the wildcard pass.
async fn select_eligible(
    conn: &mut PgConnection,
    programs: &[String],
    tag: Option<&str>,
    limit: i64,
) -> Result<Vec<ClaimedRow>> {
    let base = r#"
        SELECT t.id, t.record_id, t.function, t.function_kwargs, t.required_programs
        FROM task_queue t
        JOIN base_record r ON r.id = t.record_id
        WHERE r.status = 'waiting'
          AND t.required_programs <@ $1
    "#;

    let rows = if let Some(tag) = tag {
        sqlx::query_as::<_, ClaimedRow>(&format!(
            "{base} AND t.tag = $3 \
             ORDER BY t.priority DESC, t.sort_date ASC, t.id ASC \
             LIMIT $2 FOR UPDATE OF t SKIP LOCKED"
        ))
        .bind(programs)
        .bind(limit)
        .bind(tag)
        .fetch_all(&mut *conn)
        .await
    } else {
        sqlx::query_as::<_, ClaimedRow>(&format!(
            "{base} ORDER BY t.priority DESC, t.sort_date ASC, t.id ASC \
             LIMIT $2 FOR UPDATE OF t SKIP LOCKED"
        ))
        .bind(programs)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await
    };
    rows.map_err(|e| anyhow!(e).into())
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn claim(
        &self,
        manager_name: &str,
        programs: &BTreeMap<String, String>,
        tags: &[String],
        limit: usize,
    ) -> Result<Vec<RecordTask>> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;

        let manager: Option<(i64, String)> =
            sqlx::query_as("SELECT id, status FROM compute_manager WHERE name = $1 FOR UPDATE")
                .bind(manager_name)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| anyhow!(e))?;
        let (manager_id, status) = manager
            .ok_or_else(|| QcGridError::NotFound(format!("manager {manager_name}")))?;
        if status != "active" {
            return Err(QcGridError::Conflict(format!(
                "manager {manager_name} is inactive; reactivate before claiming"
            )));
        }

        sqlx::query("UPDATE compute_manager SET modified_on = now() WHERE id = $1")
            .bind(manager_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| anyhow!(e))?;

        let program_names: Vec<String> = programs.keys().map(|k| k.to_lowercase()).collect();
        let mut claimed: Vec<RecordTask> = Vec::new();

        // the manager's own tag order wins across tags
        for tag in tags {
            if claimed.len() >= limit {
                break;
            }
            let remaining = (limit - claimed.len()) as i64;
            let tag = tag.trim().to_lowercase();
            let filter = if tag == "*" { None } else { Some(tag.as_str()) };
            let rows = select_eligible(&mut tx, &program_names, filter, remaining).await?;

            for row in rows {
                sqlx::query(
                    "UPDATE base_record \
                     SET status = 'running', manager_name = $2, modified_on = now() \
                     WHERE id = $1",
                )
                .bind(row.record_id)
                .bind(manager_name)
                .execute(&mut *tx)
                .await
                .map_err(|e| anyhow!(e))?;
                helpers::insert_history(
                    &mut tx,
                    row.record_id,
                    RecordStatus::Running,
                    Some(manager_name),
                    None,
                )
                .await?;

                claimed.push(RecordTask {
                    id: row.id,
                    record_id: row.record_id,
                    function: row.function,
                    function_kwargs: row.function_kwargs,
                    required_programs: row.required_programs,
                });
            }
        }

        if !claimed.is_empty() {
            sqlx::query("UPDATE compute_manager SET claimed = claimed + $2 WHERE id = $1")
                .bind(manager_id)
                .bind(claimed.len() as i64)
                .execute(&mut *tx)
                .await
                .map_err(|e| anyhow!(e))?;
        }

        tx.commit().await.map_err(|e| anyhow!(e))?;
        tracing::debug!(manager = manager_name, n = claimed.len(), "claimed tasks");
        Ok(claimed)
    }

    async fn return_results(
        &self,
        manager_name: &str,
        results: Vec<(i64, ResultPayload)>,
    ) -> Result<TaskReturnMetadata> {
        // the calling manager must exist; counters land on it even for
        // rejected items
        let manager_id: Option<i64> =
            sqlx::query_scalar("SELECT id FROM compute_manager WHERE name = $1")
                .bind(manager_name)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| anyhow!(e))?;
        let manager_id =
            manager_id.ok_or_else(|| QcGridError::NotFound(format!("manager {manager_name}")))?;

        let mut meta = TaskReturnMetadata::default();

        for (idx, (task_id, payload)) in results.into_iter().enumerate() {
            match self.return_one(manager_id, manager_name, task_id, payload).await {
                Ok(None) => meta.accepted_ids.push(task_id),
                Ok(Some(reason)) => {
                    self.bump_counter(manager_id, "rejected").await?;
                    meta.rejected_info.push((idx, reason));
                }
                Err(e) => {
                    tracing::warn!(task_id, error = %e, "task return failed");
                    self.bump_counter(manager_id, "rejected").await?;
                    meta.rejected_info.push((idx, TaskRejectReason::InvalidPayload));
                }
            }
        }

        Ok(meta)
    }
}

impl PgTaskQueue {
    async fn bump_counter(&self, manager_id: i64, counter: &str) -> Result<()> {
        // counter names are fixed at the call sites, never user input
        sqlx::query(&format!(
            "UPDATE compute_manager SET {counter} = {counter} + 1 WHERE id = $1"
        ))
        .bind(manager_id)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;
        Ok(())
    }

    /// Finish one task in its own transaction. Ok(None) = accepted,
    /// Ok(Some(reason)) = rejected.
    async fn return_one(
        &self,
        manager_id: i64,
        manager_name: &str,
        task_id: i64,
        payload: ResultPayload,
    ) -> Result<Option<TaskRejectReason>> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;

        let row: Option<(i64, String, Option<String>, String)> = sqlx::query_as(
            r#"
            SELECT r.id, r.status, r.manager_name, r.record_type
            FROM task_queue t
            JOIN base_record r ON r.id = t.record_id
            WHERE t.id = $1
            FOR UPDATE
            "#,
        )
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| anyhow!(e))?;

        // covers tasks deleted after claim (cancel, hard delete)
        let Some((record_id, status, assigned_manager, record_type)) = row else {
            return Ok(Some(TaskRejectReason::TaskNotFound));
        };
        // an old claim returning after reassignment
        if assigned_manager.as_deref() != Some(manager_name) {
            return Ok(Some(TaskRejectReason::WrongManager));
        }
        if parse_record_status(&status)? != RecordStatus::Running {
            return Ok(Some(TaskRejectReason::NotRunning));
        }
        let record_type = parse_record_type(&record_type)?;

        if payload.success() {
            let mut properties = extract_properties(record_type, &payload);

            // an optimization's relaxed structure becomes a stored molecule
            // so that services can chain from it
            if record_type == RecordType::Optimization {
                if let Some(final_molecule) = payload.final_molecule() {
                    let final_id = helpers::upsert_molecule(&mut tx, final_molecule).await?;
                    if let Some(map) = properties.as_object_mut() {
                        map.insert("final_molecule_id".into(), json!(final_id));
                    }
                }
            }

            sqlx::query(
                "UPDATE base_record \
                 SET status = 'complete', properties = $2, modified_on = now() \
                 WHERE id = $1",
            )
            .bind(record_id)
            .bind(&properties)
            .execute(&mut *tx)
            .await
            .map_err(|e| anyhow!(e))?;

            let history_id = helpers::insert_history(
                &mut tx,
                record_id,
                RecordStatus::Complete,
                Some(manager_name),
                payload.provenance(),
            )
            .await?;
            if let Some(stdout) = payload.stdout() {
                helpers::insert_output(
                    &mut tx,
                    history_id,
                    OutputType::Stdout,
                    stdout.as_bytes(),
                    CompressionType::Zstd,
                )
                .await?;
            }
            if let Some(stderr) = payload.stderr() {
                helpers::insert_output(
                    &mut tx,
                    history_id,
                    OutputType::Stderr,
                    stderr.as_bytes(),
                    CompressionType::Zstd,
                )
                .await?;
            }

            sqlx::query("DELETE FROM task_queue WHERE id = $1")
                .bind(task_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| anyhow!(e))?;

            // completing a child wakes its parent service
            sqlx::query("DELETE FROM service_dependency WHERE record_id = $1")
                .bind(record_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| anyhow!(e))?;

            sqlx::query("UPDATE compute_manager SET successes = successes + 1 WHERE id = $1")
                .bind(manager_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| anyhow!(e))?;
        } else {
            sqlx::query(
                "UPDATE base_record SET status = 'error', modified_on = now() WHERE id = $1",
            )
            .bind(record_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| anyhow!(e))?;

            let history_id = helpers::insert_history(
                &mut tx,
                record_id,
                RecordStatus::Error,
                Some(manager_name),
                payload.provenance(),
            )
            .await?;

            let error = payload
                .error()
                .map(|e| json!({"error_type": e.error_type, "error_message": e.error_message}))
                .unwrap_or_else(
                    || json!({"error_type": "unknown", "error_message": "no error reported"}),
                );
            helpers::insert_output(
                &mut tx,
                history_id,
                OutputType::Error,
                error.to_string().as_bytes(),
                CompressionType::Zstd,
            )
            .await?;
            if let Some(stdout) = payload.stdout() {
                helpers::insert_output(
                    &mut tx,
                    history_id,
                    OutputType::Stdout,
                    stdout.as_bytes(),
                    CompressionType::Zstd,
                )
                .await?;
            }

            sqlx::query("DELETE FROM task_queue WHERE id = $1")
                .bind(task_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| anyhow!(e))?;

            sqlx::query("UPDATE compute_manager SET failures = failures + 1 WHERE id = $1")
                .bind(manager_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| anyhow!(e))?;
        }

        tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok(None)
    }
}
