//! Manager lifecycle handlers.
//!
//! POST  /compute/v1/managers            - activate
//! PATCH /compute/v1/managers/:fullname  - heartbeat / status update
//! POST  /api/v1/managers/query          - filtered query
//! GET   /api/v1/managers/:name          - single manager
//! GET   /api/v1/managers/:name/log      - manager log snapshots

use axum::{extract::Path, Extension, Json};

use qcgrid_core::proto::{ManagerActivationBody, ManagerUpdateBody};
use qcgrid_core::record::{ComputeManager, ManagerLogEntry, ManagerQuery};
use qcgrid_core::QcGridError;

use crate::error::AppError;
use crate::payload::{Encoded, Payload};
use crate::state::AppState;

pub async fn activate(
    Extension(state): Extension<AppState>,
    payload: Payload<ManagerActivationBody>,
) -> Result<Encoded<i64>, AppError> {
    let id = state.managers.activate(payload.body.clone()).await?;
    Ok(payload.reply(id))
}

pub async fn update(
    Extension(state): Extension<AppState>,
    Path(fullname): Path<String>,
    payload: Payload<ManagerUpdateBody>,
) -> Result<Encoded<()>, AppError> {
    state.managers.heartbeat(&fullname, payload.body.clone()).await?;
    Ok(payload.reply(()))
}

pub async fn query_managers(
    Extension(state): Extension<AppState>,
    payload: Payload<ManagerQuery>,
) -> Result<Encoded<Vec<ComputeManager>>, AppError> {
    let mut query = payload.body.clone();
    let cap = state.config.api_limits.get_managers;
    query.limit = Some(query.limit.unwrap_or(cap).min(cap));
    let managers = state.managers.query(query).await?;
    Ok(payload.reply(managers))
}

pub async fn get_manager(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ComputeManager>, AppError> {
    let mut found = state.managers.get(&[name.clone()], false).await?;
    let manager = found
        .pop()
        .flatten()
        .ok_or_else(|| QcGridError::NotFound(format!("manager {name}")))?;
    Ok(Json(manager))
}

pub async fn get_manager_log(
    Extension(state): Extension<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<ManagerLogEntry>>, AppError> {
    Ok(Json(state.managers.get_log(&name).await?))
}
