use thiserror::Error;

/// Domain errors for the record execution engine.
///
/// `ComputeError` (a failure reported by a manager) is deliberately absent:
/// it is data, stored as a terminal `error` output on the record, and never
/// propagates as an HTTP error.
#[derive(Debug, Error)]
pub enum QcGridError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl QcGridError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::InvalidInput(_) => 400,
            Self::Internal(_) => 500,
        }
    }
}

impl From<serde_json::Error> for QcGridError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(anyhow::anyhow!(e))
    }
}
