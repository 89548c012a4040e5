//! Record handlers.
//!
//! POST   /api/v1/records/:record_type   - bulk add
//! GET    /api/v1/records/:id            - fetch one (query-string projection)
//! PATCH  /api/v1/records                - modify status/tag/priority
//! DELETE /api/v1/records                - soft/hard delete
//! POST   /api/v1/records/query          - filtered query
//! POST   /api/v1/records/{reset,cancel,invalidate,undelete}
//! GET    /api/v1/records/:id/short_description

use axum::{
    extract::{Path, Query},
    Extension, Json,
};
use serde::Deserialize;

use qcgrid_core::proto::{
    RecordAddBody, RecordAddResponse, RecordDeleteBody, RecordIdsBody, RecordModifyBody,
};
use qcgrid_core::record::{Record, RecordIncludes, RecordModification, RecordQuery};
use qcgrid_core::types::{DeleteMetadata, RecordStatus, RecordType, UpdateMetadata};
use qcgrid_core::QcGridError;

use crate::error::AppError;
use crate::payload::{Encoded, Payload};
use crate::state::AppState;

pub async fn add(
    Extension(state): Extension<AppState>,
    Path(record_type): Path<String>,
    payload: Payload<RecordAddBody>,
) -> Result<Encoded<RecordAddResponse>, AppError> {
    let record_type = RecordType::from_str(&record_type)
        .ok_or_else(|| QcGridError::InvalidInput(format!("unknown record type {record_type}")))?;

    let body = &payload.body;
    if body.records.is_empty() {
        return Err(QcGridError::InvalidInput("no records given".into()).into());
    }
    if body.records.len() as i64 > state.config.api_limits.add_records {
        return Err(QcGridError::InvalidInput(format!(
            "cannot add more than {} records per call",
            state.config.api_limits.add_records
        ))
        .into());
    }
    for input in &body.records {
        if input.specification.record_type() != record_type {
            return Err(QcGridError::InvalidInput(format!(
                "specification of type {} does not match endpoint {}",
                input.specification.record_type(),
                record_type
            ))
            .into());
        }
    }

    let (meta, ids) = state
        .records
        .add(body.records.clone(), body.find_existing)
        .await?;
    Ok(payload.reply(RecordAddResponse { meta, ids }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ProjectionQuery {
    #[serde(default)]
    pub include: Option<String>,
    #[serde(default)]
    pub exclude: Option<String>,
}

fn split_names(raw: &Option<String>) -> Vec<String> {
    raw.as_deref()
        .map(|s| {
            s.split(',')
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

pub async fn get_record(
    Extension(state): Extension<AppState>,
    Path(key): Path<String>,
    Query(projection): Query<ProjectionQuery>,
) -> Result<Json<Record>, AppError> {
    let id: i64 = key
        .parse()
        .map_err(|_| QcGridError::InvalidInput(format!("invalid record id {key}")))?;
    let includes = RecordIncludes::from_lists(
        &split_names(&projection.include),
        &split_names(&projection.exclude),
    );
    let mut found = state.records.get(&[id], includes, false).await?;
    let record = found
        .pop()
        .flatten()
        .ok_or_else(|| QcGridError::NotFound(format!("record {id}")))?;
    Ok(Json(record))
}

pub async fn query(
    Extension(state): Extension<AppState>,
    payload: Payload<RecordQuery>,
) -> Result<Encoded<Vec<Record>>, AppError> {
    let mut query = payload.body.clone();
    let cap = state.config.api_limits.get_records;
    query.limit = Some(query.limit.unwrap_or(cap).min(cap));
    let records = state.records.query(query).await?;
    Ok(payload.reply(records))
}

pub async fn modify(
    Extension(state): Extension<AppState>,
    payload: Payload<RecordModifyBody>,
) -> Result<Encoded<UpdateMetadata>, AppError> {
    let body = &payload.body;
    let meta = match body.status {
        // status changes route through the dedicated transitions
        Some(RecordStatus::Waiting) => state.records.reset(&body.record_ids).await?,
        Some(RecordStatus::Cancelled) => state.records.cancel(&body.record_ids).await?,
        Some(RecordStatus::Invalid) => state.records.invalidate(&body.record_ids).await?,
        Some(other) => {
            return Err(QcGridError::InvalidInput(format!(
                "cannot set status {other} through modify"
            ))
            .into())
        }
        None => {
            let modification = RecordModification {
                tag: body.tag.clone(),
                delete_tag: body.delete_tag,
                priority: body.priority,
            };
            state.records.modify(&body.record_ids, modification).await?
        }
    };
    Ok(payload.reply(meta))
}

pub async fn delete_records(
    Extension(state): Extension<AppState>,
    payload: Payload<RecordDeleteBody>,
) -> Result<Encoded<DeleteMetadata>, AppError> {
    let body = &payload.body;
    let meta = state
        .records
        .delete(&body.record_ids, body.soft_delete, body.delete_children)
        .await?;
    Ok(payload.reply(meta))
}

pub async fn reset(
    Extension(state): Extension<AppState>,
    payload: Payload<RecordIdsBody>,
) -> Result<Encoded<UpdateMetadata>, AppError> {
    let meta = state.records.reset(&payload.body.record_ids).await?;
    Ok(payload.reply(meta))
}

pub async fn cancel(
    Extension(state): Extension<AppState>,
    payload: Payload<RecordIdsBody>,
) -> Result<Encoded<UpdateMetadata>, AppError> {
    let meta = state.records.cancel(&payload.body.record_ids).await?;
    Ok(payload.reply(meta))
}

pub async fn invalidate(
    Extension(state): Extension<AppState>,
    payload: Payload<RecordIdsBody>,
) -> Result<Encoded<UpdateMetadata>, AppError> {
    let meta = state.records.invalidate(&payload.body.record_ids).await?;
    Ok(payload.reply(meta))
}

pub async fn undelete(
    Extension(state): Extension<AppState>,
    payload: Payload<RecordIdsBody>,
) -> Result<Encoded<UpdateMetadata>, AppError> {
    let meta = state.records.undelete(&payload.body.record_ids).await?;
    Ok(payload.reply(meta))
}

pub async fn short_description(
    Extension(state): Extension<AppState>,
    Path(key): Path<String>,
) -> Result<Json<String>, AppError> {
    let id: i64 = key
        .parse()
        .map_err(|_| QcGridError::InvalidInput(format!("invalid record id {key}")))?;
    Ok(Json(state.records.get_short_description(id).await?))
}
