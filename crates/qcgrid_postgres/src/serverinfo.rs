//! Server statistics snapshots and the internal error log.

use anyhow::anyhow;
use serde_json::{json, Value};
use sqlx::PgPool;

use qcgrid_core::ports::Result;

/// Collect a snapshot of record/task/manager counts and append it to
/// `server_stats`. Returns the snapshot payload. Run periodically by the
/// internal job runner.
pub async fn update_server_stats(pool: &PgPool) -> Result<Value> {
    let record_counts: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, count(*) FROM base_record GROUP BY status")
            .fetch_all(pool)
            .await
            .map_err(|e| anyhow!(e))?;

    let task_count: i64 = sqlx::query_scalar("SELECT count(*) FROM task_queue")
        .fetch_one(pool)
        .await
        .map_err(|e| anyhow!(e))?;
    let service_count: i64 = sqlx::query_scalar("SELECT count(*) FROM service_queue")
        .fetch_one(pool)
        .await
        .map_err(|e| anyhow!(e))?;
    let manager_counts: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, count(*) FROM compute_manager GROUP BY status")
            .fetch_all(pool)
            .await
            .map_err(|e| anyhow!(e))?;
    let molecule_count: i64 = sqlx::query_scalar("SELECT count(*) FROM molecule")
        .fetch_one(pool)
        .await
        .map_err(|e| anyhow!(e))?;
    let output_bytes: Option<i64> =
        sqlx::query_scalar("SELECT sum(length(data))::bigint FROM output_store")
            .fetch_one(pool)
            .await
            .map_err(|e| anyhow!(e))?;

    let record_map: serde_json::Map<String, Value> = record_counts
        .into_iter()
        .map(|(status, n)| (status, json!(n)))
        .collect();
    let manager_map: serde_json::Map<String, Value> = manager_counts
        .into_iter()
        .map(|(status, n)| (status, json!(n)))
        .collect();

    let payload = json!({
        "record_counts": record_map,
        "task_queue_size": task_count,
        "service_queue_size": service_count,
        "manager_counts": manager_map,
        "molecule_count": molecule_count,
        "output_store_bytes": output_bytes.unwrap_or(0),
    });

    sqlx::query("INSERT INTO server_stats (payload) VALUES ($1)")
        .bind(&payload)
        .execute(pool)
        .await
        .map_err(|e| anyhow!(e))?;

    Ok(payload)
}

/// Append an entry to the internal error log. Failures here are swallowed -
/// error logging must never mask the original error.
pub async fn log_internal_error(
    pool: &PgPool,
    error_text: &str,
    user_name: Option<&str>,
    request_path: Option<&str>,
) {
    let result = sqlx::query(
        "INSERT INTO internal_error_log (error_text, user_name, request_path) \
         VALUES ($1, $2, $3)",
    )
    .bind(error_text)
    .bind(user_name)
    .bind(request_path)
    .execute(pool)
    .await;
    if let Err(e) = result {
        tracing::error!(error = %e, "failed to write internal error log");
    }
}
