//! Error handling for the axum server.
//! Maps `QcGridError` to HTTP status codes and the `{msg}` error envelope.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use qcgrid_core::proto::ErrorBody;
use qcgrid_core::QcGridError;

/// Marker attached to 500 responses so the error-log middleware can record
/// the message without re-reading the body.
#[derive(Debug, Clone)]
pub struct InternalErrorText(pub String);

/// Wrapper to convert `QcGridError` into an axum response.
pub struct AppError(pub QcGridError);

impl From<QcGridError> for AppError {
    fn from(e: QcGridError) -> Self {
        Self(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let msg = self.0.to_string();

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %msg, "internal server error");
        }

        let mut response = (status, Json(ErrorBody { msg: msg.clone() })).into_response();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            response.extensions_mut().insert(InternalErrorText(msg));
        }
        response
    }
}
