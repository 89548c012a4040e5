//! Task claim/return handlers for compute managers.
//!
//! POST /compute/v1/tasks/claim
//! POST /compute/v1/tasks/return

use axum::Extension;

use qcgrid_core::proto::{TaskClaimBody, TaskReturnBody};
use qcgrid_core::record::RecordTask;
use qcgrid_core::types::TaskReturnMetadata;
use qcgrid_core::QcGridError;

use crate::error::AppError;
use crate::payload::{Encoded, Payload};
use crate::state::AppState;

pub async fn claim(
    Extension(state): Extension<AppState>,
    payload: Payload<TaskClaimBody>,
) -> Result<Encoded<Vec<RecordTask>>, AppError> {
    let body = &payload.body;
    let limit = body
        .limit
        .min(state.config.api_limits.manager_tasks_claim as usize);
    let tasks = state
        .tasks
        .claim(&body.name_data.fullname(), &body.programs, &body.tags, limit)
        .await?;
    Ok(payload.reply(tasks))
}

pub async fn return_tasks(
    Extension(state): Extension<AppState>,
    payload: Payload<TaskReturnBody>,
) -> Result<Encoded<TaskReturnMetadata>, AppError> {
    let body = &payload.body;
    if body.results.len() as i64 > state.config.api_limits.manager_tasks_return {
        return Err(QcGridError::InvalidInput(format!(
            "cannot return more than {} tasks per call",
            state.config.api_limits.manager_tasks_return
        ))
        .into());
    }

    let results: Vec<_> = body
        .results
        .iter()
        .map(|(task_id, result)| (*task_id, result.clone()))
        .collect();
    let meta = state
        .tasks
        .return_results(&body.name_data.fullname(), results)
        .await?;
    Ok(payload.reply(meta))
}
