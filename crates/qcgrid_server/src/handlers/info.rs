//! GET /api/v1/information - server identity, limits, and MOTD.

use axum::{Extension, Json};

use qcgrid_core::proto::InformationResponse;

use crate::config::{CLIENT_VERSION_LOWER_LIMIT, CLIENT_VERSION_UPPER_LIMIT};
use crate::state::AppState;

pub async fn information(Extension(state): Extension<AppState>) -> Json<InformationResponse> {
    Json(InformationResponse {
        name: "qcgrid".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        api_limits: state.config.api_limits.clone(),
        client_version_lower_limit: CLIENT_VERSION_LOWER_LIMIT.into(),
        client_version_upper_limit: CLIENT_VERSION_UPPER_LIMIT.into(),
        motd: state.config.motd.clone(),
    })
}
