//! Shared transaction-level operations.
//!
//! Everything here takes a `PgConnection` so that the record store, the
//! task return path, and the service iteration driver can compose these
//! steps inside their own transactions.

use anyhow::anyhow;
use serde_json::{json, Value};
use sqlx::PgConnection;

use qcgrid_core::compression;
use qcgrid_core::error::QcGridError;
use qcgrid_core::molecule::{Molecule, MoleculeRef};
use qcgrid_core::ports::Result;
use qcgrid_core::record::RecordAddInput;
use qcgrid_core::specification::Specification;
use qcgrid_core::types::{CompressionType, OutputType, RecordStatus};

/// Insert a molecule, or return the id of the existing row with the same
/// content hash.
pub(crate) async fn upsert_molecule(conn: &mut PgConnection, molecule: &Molecule) -> Result<i64> {
    let hash = molecule.molecule_hash();
    let doc = serde_json::to_value(molecule)?;

    let inserted: Option<i64> = sqlx::query_scalar(
        r#"
        INSERT INTO molecule (molecule_hash, molecule)
        VALUES ($1, $2)
        ON CONFLICT (molecule_hash) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(&hash)
    .bind(&doc)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| anyhow!(e))?;

    if let Some(id) = inserted {
        return Ok(id);
    }
    let existing: i64 = sqlx::query_scalar("SELECT id FROM molecule WHERE molecule_hash = $1")
        .bind(&hash)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| anyhow!(e))?;
    Ok(existing)
}

/// Fetch molecules by id, ordered like `ids`. Missing ids are an error -
/// records always reference molecules that exist.
pub(crate) async fn get_molecules(conn: &mut PgConnection, ids: &[i64]) -> Result<Vec<Molecule>> {
    let rows: Vec<(i64, Value)> =
        sqlx::query_as("SELECT id, molecule FROM molecule WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| anyhow!(e))?;

    let by_id: std::collections::HashMap<i64, Value> = rows.into_iter().collect();
    ids.iter()
        .map(|id| {
            let doc = by_id
                .get(id)
                .ok_or_else(|| QcGridError::NotFound(format!("molecule {id}")))?;
            serde_json::from_value(doc.clone()).map_err(QcGridError::from)
        })
        .collect()
}

/// Insert a specification, or return the existing id for the same
/// `(record_type, specification_hash)`. The stored document is the
/// normalized form.
pub(crate) async fn upsert_specification(
    conn: &mut PgConnection,
    specification: &Specification,
) -> Result<i64> {
    let mut normalized = specification.clone();
    normalized.normalize();
    let hash = normalized.specification_hash();
    let record_type = normalized.record_type().as_str();
    let doc = serde_json::to_value(&normalized)?;

    let inserted: Option<i64> = sqlx::query_scalar(
        r#"
        INSERT INTO specification (record_type, specification_hash, specification)
        VALUES ($1, $2, $3)
        ON CONFLICT (record_type, specification_hash) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(record_type)
    .bind(&hash)
    .bind(&doc)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| anyhow!(e))?;

    if let Some(id) = inserted {
        return Ok(id);
    }
    let existing: i64 = sqlx::query_scalar(
        "SELECT id FROM specification WHERE record_type = $1 AND specification_hash = $2",
    )
    .bind(record_type)
    .bind(&hash)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| anyhow!(e))?;
    Ok(existing)
}

/// Load a stored specification document.
pub(crate) async fn get_specification(
    conn: &mut PgConnection,
    specification_id: i64,
) -> Result<Specification> {
    let doc: Value =
        sqlx::query_scalar("SELECT specification FROM specification WHERE id = $1")
            .bind(specification_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| anyhow!(e))?
            .ok_or_else(|| QcGridError::NotFound(format!("specification {specification_id}")))?;
    serde_json::from_value(doc).map_err(QcGridError::from)
}

/// Append a compute-history entry; returns its id.
pub(crate) async fn insert_history(
    conn: &mut PgConnection,
    record_id: i64,
    status: RecordStatus,
    manager_name: Option<&str>,
    provenance: Option<&Value>,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO record_compute_history (record_id, status, manager_name, provenance)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(record_id)
    .bind(status.as_str())
    .bind(manager_name)
    .bind(provenance)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| anyhow!(e))?;
    Ok(id)
}

/// Compress and store one output blob for a history entry.
pub(crate) async fn insert_output(
    conn: &mut PgConnection,
    history_id: i64,
    output_type: OutputType,
    payload: &[u8],
    compression_type: CompressionType,
) -> Result<()> {
    let (data, applied, level) = compression::compress(payload, compression_type, None)?;
    sqlx::query(
        r#"
        INSERT INTO output_store (history_id, output_type, compression_type, compression_level, data)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (history_id, output_type) DO UPDATE
            SET compression_type = EXCLUDED.compression_type,
                compression_level = EXCLUDED.compression_level,
                data = EXCLUDED.data
        "#,
    )
    .bind(history_id)
    .bind(output_type.as_str())
    .bind(applied.as_str())
    .bind(level)
    .bind(data)
    .execute(&mut *conn)
    .await
    .map_err(|e| anyhow!(e))?;
    Ok(())
}

/// Create the task row for an atomic record. `demote` pushes `sort_date`
/// to now so a retried task does not leapfrog fresh work; a freshly added
/// record keeps `sort_date = created_on`.
pub(crate) async fn insert_task_row(
    conn: &mut PgConnection,
    record_id: i64,
    specification: &Specification,
    molecule_ids: &[i64],
    tag: &str,
    priority: i32,
    demote: bool,
) -> Result<()> {
    let required_programs = specification.required_programs();
    let function_kwargs = json!({
        "record_id": record_id,
        "molecule_ids": molecule_ids,
        "specification": serde_json::to_value(specification)?,
    });

    sqlx::query(
        r#"
        INSERT INTO task_queue
            (record_id, required_programs, tag, priority, sort_date, function, function_kwargs)
        SELECT $1, $2, $3, $4,
               CASE WHEN $5 THEN now() ELSE r.created_on END,
               $6, $7
        FROM base_record r WHERE r.id = $1
        "#,
    )
    .bind(record_id)
    .bind(&required_programs)
    .bind(tag)
    .bind(priority)
    .bind(demote)
    .bind(specification.task_function())
    .bind(&function_kwargs)
    .execute(&mut *conn)
    .await
    .map_err(|e| anyhow!(e))?;
    Ok(())
}

/// Insert one record (with specification/molecule upserts and dedup).
/// Returns `(record_id, existing)`.
pub(crate) async fn add_one_record(
    conn: &mut PgConnection,
    input: &RecordAddInput,
    find_existing: bool,
) -> Result<(i64, bool)> {
    input.specification.validate()?;

    let mut specification = input.specification.clone();
    specification.normalize();
    let record_type = specification.record_type();
    let tag = input.tag.trim().to_lowercase();
    if tag.is_empty() {
        return Err(QcGridError::InvalidInput("tag must not be empty".into()));
    }

    let specification_id = upsert_specification(&mut *conn, &specification).await?;

    let mut molecule_ids = Vec::with_capacity(input.molecules.len());
    for molecule_ref in &input.molecules {
        match molecule_ref {
            MoleculeRef::Id(id) => {
                let exists: Option<i64> =
                    sqlx::query_scalar("SELECT id FROM molecule WHERE id = $1")
                        .bind(id)
                        .fetch_optional(&mut *conn)
                        .await
                        .map_err(|e| anyhow!(e))?;
                molecule_ids
                    .push(exists.ok_or_else(|| QcGridError::NotFound(format!("molecule {id}")))?);
            }
            MoleculeRef::Inline(molecule) => {
                molecule_ids.push(upsert_molecule(&mut *conn, molecule).await?);
            }
        }
    }
    if molecule_ids.is_empty() {
        return Err(QcGridError::InvalidInput(
            "a record requires at least one input molecule".into(),
        ));
    }

    let input_hash = RecordAddInput::input_hash(&molecule_ids, &input.input_data);

    if find_existing {
        // tombstoned rows must not alias a new submission
        let existing: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM base_record
            WHERE record_type = $1 AND specification_id = $2 AND input_hash = $3
              AND status NOT IN ('deleted', 'invalid')
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(record_type.as_str())
        .bind(specification_id)
        .bind(&input_hash)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| anyhow!(e))?;

        if let Some(id) = existing {
            return Ok((id, true));
        }
    }

    let record_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO base_record
            (record_type, status, owner_user, owner_group, specification_id,
             molecule_ids, input_hash, input_data, tag, priority, extras)
        VALUES ($1, 'waiting', $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING id
        "#,
    )
    .bind(record_type.as_str())
    .bind(&input.owner_user)
    .bind(&input.owner_group)
    .bind(specification_id)
    .bind(&molecule_ids)
    .bind(&input_hash)
    .bind(&input.input_data)
    .bind(&tag)
    .bind(input.priority.as_i32())
    .bind(&input.extras)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| anyhow!(e))?;

    if record_type.is_service() {
        sqlx::query(
            r#"
            INSERT INTO service_queue (record_id, tag, priority, find_existing)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(record_id)
        .bind(&tag)
        .bind(input.priority.as_i32())
        .bind(find_existing)
        .execute(&mut *conn)
        .await
        .map_err(|e| anyhow!(e))?;
    } else {
        insert_task_row(
            &mut *conn,
            record_id,
            &specification,
            &molecule_ids,
            &tag,
            input.priority.as_i32(),
            false,
        )
        .await?;
    }

    Ok((record_id, false))
}

/// Recycle every running record owned by the given managers back to
/// waiting: clear the manager link, demote the task, and append an `error`
/// history entry recording the eviction. Returns the affected record ids.
pub(crate) async fn reset_assigned(
    conn: &mut PgConnection,
    manager_names: &[String],
    reason: &str,
) -> Result<Vec<i64>> {
    if manager_names.is_empty() {
        return Ok(Vec::new());
    }

    let assigned: Vec<(i64, String)> = sqlx::query_as(
        r#"
        SELECT id, manager_name FROM base_record
        WHERE manager_name = ANY($1) AND status = 'running'
        FOR UPDATE
        "#,
    )
    .bind(manager_names)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| anyhow!(e))?;

    if assigned.is_empty() {
        return Ok(Vec::new());
    }
    let record_ids: Vec<i64> = assigned.iter().map(|(id, _)| *id).collect();

    sqlx::query(
        r#"
        UPDATE base_record
        SET status = 'waiting', manager_name = NULL, modified_on = now()
        WHERE id = ANY($1)
        "#,
    )
    .bind(&record_ids)
    .execute(&mut *conn)
    .await
    .map_err(|e| anyhow!(e))?;

    sqlx::query("UPDATE task_queue SET sort_date = now() WHERE record_id = ANY($1)")
        .bind(&record_ids)
        .execute(&mut *conn)
        .await
        .map_err(|e| anyhow!(e))?;

    for (record_id, manager_name) in &assigned {
        let history_id =
            insert_history(&mut *conn, *record_id, RecordStatus::Error, Some(manager_name), None)
                .await?;
        let error = json!({
            "error_type": "manager_error",
            "error_message": format!("manager {manager_name} was deactivated: {reason}"),
        });
        insert_output(
            &mut *conn,
            history_id,
            OutputType::Error,
            error.to_string().as_bytes(),
            CompressionType::Zstd,
        )
        .await?;
    }

    Ok(record_ids)
}
