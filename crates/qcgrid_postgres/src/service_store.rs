//! Service iteration driver.
//!
//! Each pass first propagates child failures to their parents, then
//! iterates every service whose dependency set is empty. A service is
//! iterated under its own row lock (SKIP LOCKED), so passes from multiple
//! server processes never double-iterate one service. The iterator state
//! machines themselves live in qcgrid_core and stay database-free: this
//! driver owns the envelope `{state, pending}` stored in
//! `service_queue.service_state`, where `pending` maps child keys to the
//! record ids spawned for them.

use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{PgConnection, PgPool};

use qcgrid_core::error::QcGridError;
use qcgrid_core::ports::{Result, ServiceEngine};
use qcgrid_core::services::{self, DependencyResult, IterateOutcome, ServiceContext};
use qcgrid_core::types::{CompressionType, OutputType, RecordStatus};

use crate::helpers;
use crate::sqlx_types::{parse_priority, parse_record_status};

/// Bound on synchronous re-iterations when every spawned child already
/// exists complete.
const SERVICE_ITERATION_FUEL: usize = 10;

/// How many services one pass will touch.
const SERVICE_BATCH: i64 = 100;

/// Postgres-backed service engine.
pub struct PgServiceEngine {
    pool: PgPool,
}

impl PgServiceEngine {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Driver-owned wrapper around the iterator state.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateEnvelope {
    #[serde(default)]
    state: Value,
    #[serde(default)]
    pending: Vec<PendingChild>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PendingChild {
    key: String,
    record_id: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct ServiceWorkRow {
    id: i64,
    record_id: i64,
    tag: String,
    priority: i32,
    find_existing: bool,
    iteration: i32,
    service_state: Value,
}

#[async_trait]
impl ServiceEngine for PgServiceEngine {
    async fn iterate_services(&self) -> Result<usize> {
        self.propagate_child_errors().await?;

        let candidates: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT s.id FROM service_queue s
            JOIN base_record r ON r.id = s.record_id
            WHERE r.status IN ('waiting', 'running')
              AND NOT EXISTS
                  (SELECT 1 FROM service_dependency d WHERE d.service_id = s.id)
            ORDER BY s.priority DESC, s.created_on
            LIMIT $1
            "#,
        )
        .bind(SERVICE_BATCH)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;

        let mut iterated = 0;
        for service_id in candidates {
            if self.iterate_one(service_id).await? {
                iterated += 1;
            }
        }
        if iterated > 0 {
            tracing::debug!(n = iterated, "iterated services");
        }
        Ok(iterated)
    }
}

impl PgServiceEngine {
    /// A failed child fails its parent (no current type tolerates child
    /// errors). The dependency rows stay so a later reset can re-queue the
    /// failed children.
    async fn propagate_child_errors(&self) -> Result<()> {
        let parents: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT DISTINCT s.id, s.record_id
            FROM service_queue s
            JOIN base_record r ON r.id = s.record_id
            JOIN service_dependency d ON d.service_id = s.id
            JOIN base_record c ON c.id = d.record_id
            WHERE r.status IN ('waiting', 'running')
              AND c.status IN ('error', 'cancelled', 'invalid', 'deleted')
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;

        for (service_id, record_id) in parents {
            let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;

            // re-check under lock; another process may have handled it
            let locked: Option<i64> = sqlx::query_scalar(
                "SELECT id FROM service_queue WHERE id = $1 FOR UPDATE SKIP LOCKED",
            )
            .bind(service_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| anyhow!(e))?;
            if locked.is_none() {
                continue;
            }

            let record_type: Option<String> = sqlx::query_scalar(
                "SELECT record_type FROM base_record WHERE id = $1 \
                 AND status IN ('waiting', 'running') FOR UPDATE",
            )
            .bind(record_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| anyhow!(e))?;
            let Some(record_type) = record_type else {
                continue;
            };
            if let Some(rt) = qcgrid_core::types::RecordType::from_str(&record_type) {
                if services::tolerates_child_errors(rt) {
                    continue;
                }
            }

            let n_failed: i64 = sqlx::query_scalar(
                r#"
                SELECT count(*) FROM service_dependency d
                JOIN base_record c ON c.id = d.record_id
                WHERE d.service_id = $1
                  AND c.status IN ('error', 'cancelled', 'invalid', 'deleted')
                "#,
            )
            .bind(service_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| anyhow!(e))?;

            mark_service_error(
                &mut tx,
                record_id,
                &format!("{n_failed} dependency record(s) failed"),
            )
            .await?;

            tx.commit().await.map_err(|e| anyhow!(e))?;
            tracing::info!(record_id, n_failed, "service failed due to child errors");
        }
        Ok(())
    }

    /// Iterate one eligible service. Returns whether an iteration happened.
    async fn iterate_one(&self, service_id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;

        let service: Option<ServiceWorkRow> = sqlx::query_as(
            "SELECT id, record_id, tag, priority, find_existing, iteration, service_state \
             FROM service_queue WHERE id = $1 FOR UPDATE SKIP LOCKED",
        )
        .bind(service_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| anyhow!(e))?;
        let Some(mut service) = service else {
            return Ok(false);
        };

        // raced with a completing child inserting new work
        let deps_left: i64 =
            sqlx::query_scalar("SELECT count(*) FROM service_dependency WHERE service_id = $1")
                .bind(service_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| anyhow!(e))?;
        if deps_left > 0 {
            return Ok(false);
        }

        let record: Option<(String, String, i64, Vec<i64>, Value)> = sqlx::query_as(
            "SELECT status, record_type, specification_id, molecule_ids, input_data \
             FROM base_record WHERE id = $1 FOR UPDATE",
        )
        .bind(service.record_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| anyhow!(e))?;
        let Some((status, _, specification_id, molecule_ids, input_data)) = record else {
            return Ok(false);
        };
        let mut status = parse_record_status(&status)?;
        if !matches!(status, RecordStatus::Waiting | RecordStatus::Running) {
            return Ok(false);
        }

        let specification = helpers::get_specification(&mut tx, specification_id).await?;
        let molecules = helpers::get_molecules(&mut tx, &molecule_ids).await?;
        let priority = parse_priority(service.priority)?;

        for _ in 0..SERVICE_ITERATION_FUEL {
            if status == RecordStatus::Waiting {
                sqlx::query(
                    "UPDATE base_record SET status = 'running', modified_on = now() WHERE id = $1",
                )
                .bind(service.record_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| anyhow!(e))?;
                helpers::insert_history(
                    &mut tx,
                    service.record_id,
                    RecordStatus::Running,
                    None,
                    None,
                )
                .await?;
                status = RecordStatus::Running;
            }

            let envelope: StateEnvelope = if service.service_state.is_null() {
                StateEnvelope::default()
            } else {
                serde_json::from_value(service.service_state.clone())?
            };

            let deps = self.load_dependencies(&mut tx, &envelope.pending).await?;

            let ctx = ServiceContext {
                record_id: service.record_id,
                specification: &specification,
                molecules: &molecules,
                molecule_ids: &molecule_ids,
                input_data: &input_data,
                iteration: service.iteration,
                state: &envelope.state,
                deps: &deps,
                tag: &service.tag,
                priority,
            };

            match services::iterate(&ctx) {
                Err(e) => {
                    tracing::warn!(record_id = service.record_id, error = %e, "service iteration failed");
                    mark_service_error(&mut tx, service.record_id, &e.to_string()).await?;
                    break;
                }
                Ok(IterateOutcome::Finished { properties }) => {
                    sqlx::query(
                        "UPDATE base_record \
                         SET status = 'complete', properties = $2, modified_on = now() \
                         WHERE id = $1",
                    )
                    .bind(service.record_id)
                    .bind(&properties)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| anyhow!(e))?;
                    helpers::insert_history(
                        &mut tx,
                        service.record_id,
                        RecordStatus::Complete,
                        None,
                        None,
                    )
                    .await?;
                    sqlx::query("DELETE FROM service_queue WHERE id = $1")
                        .bind(service.id)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| anyhow!(e))?;
                    break;
                }
                Ok(IterateOutcome::NeedMoreWork { children, state }) => {
                    let mut pending = Vec::with_capacity(children.len());
                    let mut all_complete = true;

                    for child in &children {
                        let (child_id, _existing) =
                            helpers::add_one_record(&mut tx, &child.input, service.find_existing)
                                .await?;
                        pending.push(PendingChild {
                            key: child.key.clone(),
                            record_id: child_id,
                        });

                        let child_status: String =
                            sqlx::query_scalar("SELECT status FROM base_record WHERE id = $1")
                                .bind(child_id)
                                .fetch_one(&mut *tx)
                                .await
                                .map_err(|e| anyhow!(e))?;
                        if parse_record_status(&child_status)? != RecordStatus::Complete {
                            all_complete = false;
                            sqlx::query(
                                r#"
                                INSERT INTO service_dependency (service_id, record_id, extras)
                                VALUES ($1, $2, $3)
                                ON CONFLICT (service_id, record_id, extras) DO NOTHING
                                "#,
                            )
                            .bind(service.id)
                            .bind(child_id)
                            .bind(json!({ "key": child.key }))
                            .execute(&mut *tx)
                            .await
                            .map_err(|e| anyhow!(e))?;
                        }
                    }

                    let new_state =
                        serde_json::to_value(StateEnvelope { state, pending })?;
                    service.iteration += 1;
                    sqlx::query(
                        "UPDATE service_queue SET service_state = $2, iteration = $3 WHERE id = $1",
                    )
                    .bind(service.id)
                    .bind(&new_state)
                    .bind(service.iteration)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| anyhow!(e))?;
                    service.service_state = new_state;

                    if !all_complete {
                        break;
                    }
                    // every child pre-existed complete: burn fuel and
                    // iterate again right away
                }
            }
        }

        tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok(true)
    }

    async fn load_dependencies(
        &self,
        conn: &mut PgConnection,
        pending: &[PendingChild],
    ) -> Result<Vec<DependencyResult>> {
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = pending.iter().map(|p| p.record_id).collect();
        let rows: Vec<(i64, String, Option<Value>)> =
            sqlx::query_as("SELECT id, status, properties FROM base_record WHERE id = ANY($1)")
                .bind(&ids)
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| anyhow!(e))?;

        let by_id: std::collections::HashMap<i64, (String, Option<Value>)> = rows
            .into_iter()
            .map(|(id, status, properties)| (id, (status, properties)))
            .collect();

        pending
            .iter()
            .map(|p| {
                let (status, properties) = by_id.get(&p.record_id).ok_or_else(|| {
                    QcGridError::NotFound(format!("dependency record {}", p.record_id))
                })?;
                Ok(DependencyResult {
                    key: p.key.clone(),
                    record_id: p.record_id,
                    status: parse_record_status(status)?,
                    properties: properties.clone().unwrap_or(Value::Null),
                })
            })
            .collect()
    }
}

/// Fail a service record, keeping its scaffolding for a later reset.
async fn mark_service_error(
    conn: &mut PgConnection,
    record_id: i64,
    message: &str,
) -> Result<()> {
    sqlx::query("UPDATE base_record SET status = 'error', modified_on = now() WHERE id = $1")
        .bind(record_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| anyhow!(e))?;
    let history_id =
        helpers::insert_history(&mut *conn, record_id, RecordStatus::Error, None, None).await?;
    let error = json!({
        "error_type": "service_iteration_error",
        "error_message": message,
    });
    helpers::insert_output(
        &mut *conn,
        history_id,
        OutputType::Error,
        error.to_string().as_bytes(),
        CompressionType::Zstd,
    )
    .await?;
    Ok(())
}
