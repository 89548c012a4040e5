//! Postgres record store: bulk insert with dedup, projection-aware fetch,
//! and every status transition the lifecycle allows.

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgConnection, PgPool, QueryBuilder};
use std::collections::HashMap;

use qcgrid_core::error::QcGridError;
use qcgrid_core::ports::{RecordStore, Result};
use qcgrid_core::record::{
    Record, RecordAddInput, RecordIncludes, RecordModification, RecordQuery,
};
use qcgrid_core::types::{
    CompressionType, DeleteMetadata, InsertMetadata, OutputType, RecordStatus, RecordType,
    UpdateMetadata,
};

use crate::helpers;
use crate::sqlx_types::{
    parse_record_status, parse_record_type, HistoryRow, OutputRow, RecordRow, ServiceRow, TaskRow,
};

const RECORD_COLUMNS: &str = "id, record_type, status, owner_user, owner_group, manager_name, \
     created_on, modified_on, specification_id, molecule_ids, input_data, extras, properties";

/// Postgres-backed record store.
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Row lock + status probe used by the transition operations.
async fn lock_record(
    conn: &mut PgConnection,
    record_id: i64,
) -> Result<Option<(RecordStatus, RecordType, String, i32)>> {
    let row: Option<(String, String, String, i32)> = sqlx::query_as(
        "SELECT status, record_type, tag, priority FROM base_record WHERE id = $1 FOR UPDATE",
    )
    .bind(record_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| anyhow!(e))?;

    match row {
        None => Ok(None),
        Some((status, record_type, tag, priority)) => Ok(Some((
            parse_record_status(&status)?,
            parse_record_type(&record_type)?,
            tag,
            priority,
        ))),
    }
}

/// Remove the task/service scaffolding of a record (used by the terminal
/// transitions). History is always retained.
async fn clear_queue_rows(conn: &mut PgConnection, record_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM task_queue WHERE record_id = $1")
        .bind(record_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| anyhow!(e))?;
    sqlx::query("DELETE FROM service_queue WHERE record_id = $1")
        .bind(record_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| anyhow!(e))?;
    Ok(())
}

async fn set_status(conn: &mut PgConnection, record_id: i64, status: RecordStatus) -> Result<()> {
    sqlx::query("UPDATE base_record SET status = $2, modified_on = now() WHERE id = $1")
        .bind(record_id)
        .bind(status.as_str())
        .execute(&mut *conn)
        .await
        .map_err(|e| anyhow!(e))?;
    Ok(())
}

/// error → waiting for one atomic record: rebuild the task at a demoted
/// queue position.
async fn reset_atomic(
    conn: &mut PgConnection,
    record_id: i64,
    tag: &str,
    priority: i32,
) -> Result<()> {
    let (specification_id, molecule_ids): (i64, Vec<i64>) =
        sqlx::query_as("SELECT specification_id, molecule_ids FROM base_record WHERE id = $1")
            .bind(record_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| anyhow!(e))?;
    let specification = helpers::get_specification(&mut *conn, specification_id).await?;

    sqlx::query(
        "UPDATE base_record SET status = 'waiting', manager_name = NULL, modified_on = now() WHERE id = $1",
    )
    .bind(record_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| anyhow!(e))?;

    helpers::insert_task_row(
        &mut *conn,
        record_id,
        &specification,
        &molecule_ids,
        tag,
        priority,
        true,
    )
    .await?;
    Ok(())
}

/// error → waiting for one service record: re-queue errored children, then
/// put the parent back in the rotation.
async fn reset_service(conn: &mut PgConnection, record_id: i64) -> Result<()> {
    let errored_children: Vec<(i64, String, i32)> = sqlx::query_as(
        r#"
        SELECT c.id, c.tag, c.priority
        FROM service_dependency d
        JOIN service_queue s ON s.id = d.service_id
        JOIN base_record c ON c.id = d.record_id
        WHERE s.record_id = $1 AND c.status = 'error'
        "#,
    )
    .bind(record_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| anyhow!(e))?;

    for (child_id, tag, priority) in errored_children {
        reset_atomic(&mut *conn, child_id, &tag, priority).await?;
    }

    sqlx::query(
        "UPDATE base_record SET status = 'waiting', manager_name = NULL, modified_on = now() WHERE id = $1",
    )
    .bind(record_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| anyhow!(e))?;
    Ok(())
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn add(
        &self,
        inputs: Vec<RecordAddInput>,
        find_existing: bool,
    ) -> Result<(InsertMetadata, Vec<Option<i64>>)> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;
        let mut meta = InsertMetadata::default();
        let mut ids = Vec::with_capacity(inputs.len());

        for (idx, input) in inputs.iter().enumerate() {
            match helpers::add_one_record(&mut tx, input, find_existing).await {
                Ok((id, existing)) => {
                    ids.push(Some(id));
                    if existing {
                        meta.existing_idx.push(idx);
                    } else {
                        meta.inserted_idx.push(idx);
                    }
                }
                // domain-level rejections leave the transaction usable;
                // database errors abort the whole batch
                Err(e @ QcGridError::Internal(_)) => return Err(e),
                Err(e) => {
                    ids.push(None);
                    meta.errors.push((idx, e.to_string()));
                }
            }
        }

        tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok((meta, ids))
    }

    async fn get(
        &self,
        ids: &[i64],
        includes: RecordIncludes,
        missing_ok: bool,
    ) -> Result<Vec<Option<Record>>> {
        let rows: Vec<RecordRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM base_record WHERE id = ANY($1)"
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;

        let mut records: HashMap<i64, Record> = HashMap::with_capacity(rows.len());
        for row in rows {
            let record = row.into_record()?;
            records.insert(record.id, record);
        }

        if includes.compute_history {
            let history: Vec<HistoryRow> = sqlx::query_as(
                "SELECT id, record_id, status, manager_name, modified_on, provenance \
                 FROM record_compute_history WHERE record_id = ANY($1) ORDER BY id",
            )
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;

            let mut outputs_by_history: HashMap<i64, Vec<OutputRow>> = HashMap::new();
            if includes.outputs {
                let history_ids: Vec<i64> = history.iter().map(|h| h.id).collect();
                let outputs: Vec<OutputRow> = sqlx::query_as(
                    "SELECT id, history_id, output_type, compression_type, compression_level, data \
                     FROM output_store WHERE history_id = ANY($1) ORDER BY id",
                )
                .bind(&history_ids)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| anyhow!(e))?;
                for output in outputs {
                    outputs_by_history.entry(output.history_id).or_default().push(output);
                }
            }

            for row in history {
                let record_id = row.record_id;
                let mut entry = row.into_entry()?;
                if includes.outputs {
                    let blobs = outputs_by_history
                        .remove(&entry.id)
                        .unwrap_or_default()
                        .into_iter()
                        .map(|o| o.into_blob())
                        .collect::<Result<Vec<_>>>()?;
                    entry.outputs = Some(blobs);
                }
                if let Some(record) = records.get_mut(&record_id) {
                    record.compute_history.get_or_insert_with(Vec::new).push(entry);
                }
            }
        }

        if includes.task {
            let tasks: Vec<TaskRow> = sqlx::query_as(
                "SELECT id, record_id, required_programs, tag, priority, created_on, sort_date, \
                 function, function_kwargs FROM task_queue WHERE record_id = ANY($1)",
            )
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
            for task in tasks {
                let record_id = task.record_id;
                if let Some(record) = records.get_mut(&record_id) {
                    record.task = Some(task.into_task()?);
                }
            }
        }

        if includes.service {
            let services: Vec<ServiceRow> = sqlx::query_as(
                "SELECT id, record_id, tag, priority, find_existing, iteration, service_state, \
                 created_on FROM service_queue WHERE record_id = ANY($1)",
            )
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
            for service in services {
                let record_id = service.record_id;
                if let Some(record) = records.get_mut(&record_id) {
                    record.service = Some(service.into_service()?);
                }
            }
        }

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match records.remove(id) {
                Some(record) => out.push(Some(record)),
                None if missing_ok => out.push(None),
                None => return Err(QcGridError::NotFound(format!("record {id}"))),
            }
        }
        Ok(out)
    }

    async fn query(&self, query: RecordQuery) -> Result<Vec<Record>> {
        let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(format!(
            "SELECT {RECORD_COLUMNS} FROM base_record WHERE TRUE"
        ));

        if let Some(record_id) = &query.record_id {
            builder.push(" AND id = ANY(").push_bind(record_id.clone()).push(")");
        }
        if let Some(record_type) = &query.record_type {
            let names: Vec<String> =
                record_type.iter().map(|t| t.as_str().to_string()).collect();
            builder.push(" AND record_type = ANY(").push_bind(names).push(")");
        }
        if let Some(status) = &query.status {
            let names: Vec<String> = status.iter().map(|s| s.as_str().to_string()).collect();
            builder.push(" AND status = ANY(").push_bind(names).push(")");
        }
        if let Some(manager_name) = &query.manager_name {
            builder
                .push(" AND manager_name = ANY(")
                .push_bind(manager_name.clone())
                .push(")");
        }
        if let Some(owner_user) = &query.owner_user {
            builder.push(" AND owner_user = ANY(").push_bind(owner_user.clone()).push(")");
        }
        if let Some(created_before) = query.created_before {
            builder.push(" AND created_on < ").push_bind(created_before);
        }
        if let Some(created_after) = query.created_after {
            builder.push(" AND created_on > ").push_bind(created_after);
        }
        if let Some(cursor) = query.cursor {
            builder.push(" AND id < ").push_bind(cursor);
        }
        builder.push(" ORDER BY id DESC LIMIT ").push_bind(query.limit.unwrap_or(100).clamp(1, 1000));

        let rows: Vec<RecordRow> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
        rows.into_iter().map(|r| r.into_record()).collect()
    }

    async fn modify(
        &self,
        ids: &[i64],
        modification: RecordModification,
    ) -> Result<UpdateMetadata> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;
        let mut meta = UpdateMetadata::default();

        let new_tag = match (&modification.tag, modification.delete_tag) {
            (_, true) => Some("*".to_string()),
            (Some(tag), false) => {
                let tag = tag.trim().to_lowercase();
                if tag.is_empty() {
                    return Err(QcGridError::InvalidInput("tag must not be empty".into()));
                }
                Some(tag)
            }
            (None, false) => None,
        };

        for (idx, id) in ids.iter().enumerate() {
            let Some((status, _, _, _)) = lock_record(&mut tx, *id).await? else {
                meta.errors.push((idx, format!("record {id} not found")));
                continue;
            };
            if status != RecordStatus::Waiting {
                meta.errors.push((
                    idx,
                    format!("record {id} is {status}; tag/priority changes require waiting"),
                ));
                continue;
            }

            if let Some(tag) = &new_tag {
                sqlx::query("UPDATE base_record SET tag = $2, modified_on = now() WHERE id = $1")
                    .bind(id)
                    .bind(tag)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| anyhow!(e))?;
                sqlx::query("UPDATE task_queue SET tag = $2 WHERE record_id = $1")
                    .bind(id)
                    .bind(tag)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| anyhow!(e))?;
                sqlx::query("UPDATE service_queue SET tag = $2 WHERE record_id = $1")
                    .bind(id)
                    .bind(tag)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| anyhow!(e))?;
            }
            if let Some(priority) = modification.priority {
                sqlx::query(
                    "UPDATE base_record SET priority = $2, modified_on = now() WHERE id = $1",
                )
                .bind(id)
                .bind(priority.as_i32())
                .execute(&mut *tx)
                .await
                .map_err(|e| anyhow!(e))?;
                sqlx::query("UPDATE task_queue SET priority = $2 WHERE record_id = $1")
                    .bind(id)
                    .bind(priority.as_i32())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| anyhow!(e))?;
                sqlx::query("UPDATE service_queue SET priority = $2 WHERE record_id = $1")
                    .bind(id)
                    .bind(priority.as_i32())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| anyhow!(e))?;
            }
            meta.updated_idx.push(idx);
        }

        tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok(meta)
    }

    async fn reset(&self, ids: &[i64]) -> Result<UpdateMetadata> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;
        let mut meta = UpdateMetadata::default();

        for (idx, id) in ids.iter().enumerate() {
            let Some((status, record_type, tag, priority)) = lock_record(&mut tx, *id).await?
            else {
                meta.errors.push((idx, format!("record {id} not found")));
                continue;
            };
            if status != RecordStatus::Error {
                meta.errors
                    .push((idx, format!("record {id} is {status}; only error records reset")));
                continue;
            }

            if record_type.is_service() {
                reset_service(&mut tx, *id).await?;
            } else {
                reset_atomic(&mut tx, *id, &tag, priority).await?;
            }
            meta.updated_idx.push(idx);
        }

        tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok(meta)
    }

    async fn cancel(&self, ids: &[i64]) -> Result<UpdateMetadata> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;
        let mut meta = UpdateMetadata::default();

        for (idx, id) in ids.iter().enumerate() {
            let Some((status, _, _, _)) = lock_record(&mut tx, *id).await? else {
                meta.errors.push((idx, format!("record {id} not found")));
                continue;
            };
            if !RecordStatus::can_transition(status, RecordStatus::Cancelled) {
                meta.errors
                    .push((idx, format!("record {id} is {status}; cannot cancel")));
                continue;
            }
            set_status(&mut tx, *id, RecordStatus::Cancelled).await?;
            sqlx::query(
                "UPDATE base_record SET manager_name = NULL WHERE id = $1",
            )
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| anyhow!(e))?;
            clear_queue_rows(&mut tx, *id).await?;
            meta.updated_idx.push(idx);
        }

        tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok(meta)
    }

    async fn invalidate(&self, ids: &[i64]) -> Result<UpdateMetadata> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;
        let mut meta = UpdateMetadata::default();

        for (idx, id) in ids.iter().enumerate() {
            let Some((status, _, _, _)) = lock_record(&mut tx, *id).await? else {
                meta.errors.push((idx, format!("record {id} not found")));
                continue;
            };
            if !RecordStatus::can_transition(status, RecordStatus::Invalid) {
                meta.errors
                    .push((idx, format!("record {id} is {status}; cannot invalidate")));
                continue;
            }
            set_status(&mut tx, *id, RecordStatus::Invalid).await?;
            clear_queue_rows(&mut tx, *id).await?;
            meta.updated_idx.push(idx);
        }

        tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok(meta)
    }

    async fn undelete(&self, ids: &[i64]) -> Result<UpdateMetadata> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;
        let mut meta = UpdateMetadata::default();

        for (idx, id) in ids.iter().enumerate() {
            let Some((status, record_type, tag, priority)) = lock_record(&mut tx, *id).await?
            else {
                meta.errors.push((idx, format!("record {id} not found")));
                continue;
            };
            if status != RecordStatus::Deleted {
                meta.errors
                    .push((idx, format!("record {id} is {status}; only deleted records undelete")));
                continue;
            }

            // the last attempt decides where the record lands
            let last_history: Option<String> = sqlx::query_scalar(
                "SELECT status FROM record_compute_history WHERE record_id = $1 \
                 ORDER BY id DESC LIMIT 1",
            )
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| anyhow!(e))?;

            let restored = match last_history.as_deref() {
                Some("complete") => RecordStatus::Complete,
                Some("error") => RecordStatus::Error,
                _ => RecordStatus::Waiting,
            };
            set_status(&mut tx, *id, restored).await?;

            if restored == RecordStatus::Waiting {
                if record_type.is_service() {
                    sqlx::query(
                        r#"
                        INSERT INTO service_queue (record_id, tag, priority, find_existing)
                        VALUES ($1, $2, $3, true)
                        ON CONFLICT (record_id) DO NOTHING
                        "#,
                    )
                    .bind(id)
                    .bind(&tag)
                    .bind(priority)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| anyhow!(e))?;
                } else {
                    let (specification_id, molecule_ids): (i64, Vec<i64>) = sqlx::query_as(
                        "SELECT specification_id, molecule_ids FROM base_record WHERE id = $1",
                    )
                    .bind(id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| anyhow!(e))?;
                    let specification =
                        helpers::get_specification(&mut tx, specification_id).await?;
                    helpers::insert_task_row(
                        &mut tx,
                        *id,
                        &specification,
                        &molecule_ids,
                        &tag,
                        priority,
                        true,
                    )
                    .await?;
                }
            }
            meta.updated_idx.push(idx);
        }

        tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok(meta)
    }

    async fn delete(
        &self,
        ids: &[i64],
        soft_delete: bool,
        delete_children: bool,
    ) -> Result<DeleteMetadata> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;
        let mut meta = DeleteMetadata::default();

        for (idx, id) in ids.iter().enumerate() {
            let Some((status, record_type, _, _)) = lock_record(&mut tx, *id).await? else {
                meta.missing_idx.push(idx);
                continue;
            };

            // outstanding children first, while the dependency rows still exist
            let child_ids: Vec<i64> = if delete_children && record_type.is_service() {
                sqlx::query_scalar(
                    r#"
                    SELECT d.record_id FROM service_dependency d
                    JOIN service_queue s ON s.id = d.service_id
                    WHERE s.record_id = $1
                    "#,
                )
                .bind(id)
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| anyhow!(e))?
            } else {
                Vec::new()
            };

            if soft_delete {
                if status == RecordStatus::Deleted {
                    meta.errors.push((idx, format!("record {id} is already deleted")));
                    continue;
                }
                set_status(&mut tx, *id, RecordStatus::Deleted).await?;
                clear_queue_rows(&mut tx, *id).await?;
                for child_id in child_ids {
                    if let Some((child_status, _, _, _)) = lock_record(&mut tx, child_id).await? {
                        if child_status != RecordStatus::Deleted {
                            set_status(&mut tx, child_id, RecordStatus::Deleted).await?;
                            clear_queue_rows(&mut tx, child_id).await?;
                        }
                    }
                }
            } else {
                sqlx::query("DELETE FROM base_record WHERE id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| anyhow!(e))?;
                for child_id in child_ids {
                    sqlx::query("DELETE FROM base_record WHERE id = $1")
                        .bind(child_id)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| anyhow!(e))?;
                }
            }
            meta.deleted_idx.push(idx);
        }

        tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok(meta)
    }

    async fn reset_assigned(&self, manager_names: &[String]) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;
        let ids = helpers::reset_assigned(&mut tx, manager_names, "tasks reset by request").await?;
        tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok(ids)
    }

    async fn append_output(
        &self,
        history_id: i64,
        output_type: OutputType,
        data: &[u8],
        compression: CompressionType,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;
        let exists: Option<i64> =
            sqlx::query_scalar("SELECT id FROM record_compute_history WHERE id = $1")
                .bind(history_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| anyhow!(e))?;
        if exists.is_none() {
            return Err(QcGridError::NotFound(format!("history entry {history_id}")));
        }
        helpers::insert_output(&mut tx, history_id, output_type, data, compression).await?;
        tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn get_short_description(&self, id: i64) -> Result<String> {
        let specification_id: Option<i64> =
            sqlx::query_scalar("SELECT specification_id FROM base_record WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| anyhow!(e))?;
        let specification_id =
            specification_id.ok_or_else(|| QcGridError::NotFound(format!("record {id}")))?;

        let doc: Value =
            sqlx::query_scalar("SELECT specification FROM specification WHERE id = $1")
                .bind(specification_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| anyhow!(e))?;
        let specification: qcgrid_core::specification::Specification =
            serde_json::from_value(doc)?;
        Ok(specification.short_description())
    }
}
