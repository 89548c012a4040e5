//! Manager registry: activation, heartbeats, deactivation with task
//! recycling, and queries.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, QueryBuilder};

use qcgrid_core::error::QcGridError;
use qcgrid_core::ports::{ManagerRegistry, Result};
use qcgrid_core::proto::{ManagerActivationBody, ManagerUpdateBody};
use qcgrid_core::record::{ComputeManager, ManagerLogEntry, ManagerQuery};
use qcgrid_core::types::ManagerStatus;

use crate::helpers;
use crate::sqlx_types::{ManagerLogRow, ManagerRow};

const MANAGER_COLUMNS: &str = "id, name, cluster, hostname, username, manager_version, tags, \
     programs, status, claimed, successes, failures, rejected, active_tasks, active_cores, \
     active_memory, total_worker_walltime, total_task_walltime, created_on, modified_on";

/// Postgres-backed manager registry.
pub struct PgManagerRegistry {
    pool: PgPool,
}

impl PgManagerRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ManagerRegistry for PgManagerRegistry {
    async fn activate(&self, activation: ManagerActivationBody) -> Result<i64> {
        let activation = activation.normalized()?;
        let fullname = activation.name_data.fullname();

        // versions are folded to lowercase with the program names so the
        // whole column stays case-stable
        let programs: serde_json::Value = activation
            .programs
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.to_lowercase())))
            .collect::<serde_json::Map<_, _>>()
            .into();

        let inserted: std::result::Result<i64, sqlx::Error> = sqlx::query_scalar(
            r#"
            INSERT INTO compute_manager
                (name, cluster, hostname, username, manager_version, tags, programs, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'active')
            RETURNING id
            "#,
        )
        .bind(&fullname)
        .bind(&activation.name_data.cluster)
        .bind(&activation.name_data.hostname)
        .bind(&activation.username)
        .bind(&activation.manager_version)
        .bind(&activation.tags)
        .bind(&programs)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(id) => {
                tracing::info!(manager = %fullname, "manager activated");
                Ok(id)
            }
            Err(e)
                if e.as_database_error()
                    .map(|d| d.is_unique_violation())
                    .unwrap_or(false) =>
            {
                tracing::warn!(manager = %fullname, "cannot activate duplicate manager");
                Err(QcGridError::Conflict(format!(
                    "a manager named {fullname} already exists"
                )))
            }
            Err(e) => Err(anyhow!(e).into()),
        }
    }

    async fn heartbeat(&self, name: &str, update: ManagerUpdateBody) -> Result<()> {
        if update.status != ManagerStatus::Active {
            // a manager shutting down goes through deactivate instead
            return Err(QcGridError::InvalidInput(
                "heartbeat status must be active".into(),
            ));
        }

        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;

        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT id, status FROM compute_manager WHERE name = $1 FOR UPDATE")
                .bind(name)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| anyhow!(e))?;
        let (manager_id, status) =
            row.ok_or_else(|| QcGridError::NotFound(format!("manager {name}")))?;
        if status != "active" {
            return Err(QcGridError::Conflict(format!(
                "manager {name} is inactive; reactivate instead of updating"
            )));
        }

        sqlx::query(
            r#"
            UPDATE compute_manager
            SET active_tasks = $2, active_cores = $3, active_memory = $4,
                total_worker_walltime = $5, total_task_walltime = $6,
                modified_on = now()
            WHERE id = $1
            "#,
        )
        .bind(manager_id)
        .bind(update.active_tasks)
        .bind(update.active_cores)
        .bind(update.active_memory)
        .bind(update.total_worker_walltime)
        .bind(update.total_task_walltime)
        .execute(&mut *tx)
        .await
        .map_err(|e| anyhow!(e))?;

        // snapshot goes in the same transaction as the update
        sqlx::query(
            r#"
            INSERT INTO compute_manager_log
                (manager_id, timestamp, claimed, successes, failures, rejected,
                 active_tasks, active_cores, active_memory,
                 total_worker_walltime, total_task_walltime)
            SELECT id, modified_on, claimed, successes, failures, rejected,
                   active_tasks, active_cores, active_memory,
                   total_worker_walltime, total_task_walltime
            FROM compute_manager WHERE id = $1
            "#,
        )
        .bind(manager_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| anyhow!(e))?;

        tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn deactivate(
        &self,
        names: &[String],
        modified_before: Option<DateTime<Utc>>,
        reason: &str,
    ) -> Result<Vec<String>> {
        if names.is_empty() && modified_before.is_none() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;

        let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
            "UPDATE compute_manager SET status = 'inactive', modified_on = now() \
             WHERE status = 'active'",
        );
        if !names.is_empty() {
            builder.push(" AND name = ANY(").push_bind(names.to_vec()).push(")");
        }
        if let Some(cutoff) = modified_before {
            builder.push(" AND modified_on < ").push_bind(cutoff);
        }
        builder.push(" RETURNING name");

        let deactivated: Vec<String> = builder
            .build_query_scalar()
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| anyhow!(e))?;

        // recycle the orphaned work of each dead manager
        for dead_name in &deactivated {
            let recycled =
                helpers::reset_assigned(&mut tx, std::slice::from_ref(dead_name), reason).await?;
            tracing::info!(
                manager = %dead_name,
                reason,
                n_recycled = recycled.len(),
                "deactivated manager"
            );
        }

        tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok(deactivated)
    }

    async fn get(&self, names: &[String], missing_ok: bool) -> Result<Vec<Option<ComputeManager>>> {
        let rows: Vec<ManagerRow> = sqlx::query_as(&format!(
            "SELECT {MANAGER_COLUMNS} FROM compute_manager WHERE name = ANY($1)"
        ))
        .bind(names)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;

        let mut by_name = std::collections::HashMap::with_capacity(rows.len());
        for row in rows {
            let manager = row.into_manager()?;
            by_name.insert(manager.name.clone(), manager);
        }

        let mut out = Vec::with_capacity(names.len());
        for name in names {
            match by_name.remove(name) {
                Some(manager) => out.push(Some(manager)),
                None if missing_ok => out.push(None),
                None => return Err(QcGridError::NotFound(format!("manager {name}"))),
            }
        }
        Ok(out)
    }

    async fn query(&self, query: ManagerQuery) -> Result<Vec<ComputeManager>> {
        let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(format!(
            "SELECT {MANAGER_COLUMNS} FROM compute_manager WHERE TRUE"
        ));

        if let Some(manager_id) = &query.manager_id {
            builder.push(" AND id = ANY(").push_bind(manager_id.clone()).push(")");
        }
        if let Some(name) = &query.name {
            builder.push(" AND name = ANY(").push_bind(name.clone()).push(")");
        }
        if let Some(cluster) = &query.cluster {
            builder.push(" AND cluster = ANY(").push_bind(cluster.clone()).push(")");
        }
        if let Some(hostname) = &query.hostname {
            builder.push(" AND hostname = ANY(").push_bind(hostname.clone()).push(")");
        }
        if let Some(status) = &query.status {
            let names: Vec<String> = status.iter().map(|s| s.as_str().to_string()).collect();
            builder.push(" AND status = ANY(").push_bind(names).push(")");
        }
        if let Some(modified_before) = query.modified_before {
            builder.push(" AND modified_on < ").push_bind(modified_before);
        }
        if let Some(modified_after) = query.modified_after {
            builder.push(" AND modified_on > ").push_bind(modified_after);
        }
        if let Some(cursor) = query.cursor {
            builder.push(" AND id < ").push_bind(cursor);
        }
        builder
            .push(" ORDER BY id DESC LIMIT ")
            .push_bind(query.limit.unwrap_or(100).clamp(1, 1000));

        let rows: Vec<ManagerRow> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
        rows.into_iter().map(|r| r.into_manager()).collect()
    }

    async fn get_log(&self, name: &str) -> Result<Vec<ManagerLogEntry>> {
        let manager_id: Option<i64> =
            sqlx::query_scalar("SELECT id FROM compute_manager WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| anyhow!(e))?;
        let manager_id =
            manager_id.ok_or_else(|| QcGridError::NotFound(format!("manager {name}")))?;

        let rows: Vec<ManagerLogRow> = sqlx::query_as(
            "SELECT id, manager_id, timestamp, claimed, successes, failures, rejected, \
             active_tasks, active_cores, active_memory, total_worker_walltime, \
             total_task_walltime \
             FROM compute_manager_log WHERE manager_id = $1 ORDER BY timestamp DESC",
        )
        .bind(manager_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| anyhow!(e))?;

        Ok(rows.into_iter().map(|r| r.into_entry()).collect())
    }
}
