//! Core error taxonomy.
//!
//! [`SessionError`] is the boundary error type for the session engine
//! (registry, session, recorder, hub). Route handlers convert it to an
//! HTTP response via [`SessionError::status_code`]; nothing below the
//! route layer should format a string for a caller to parse.

use axum::http::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to spawn session: {0}")]
    SpawnFailed(String),

    #[error("invalid terminal dimensions: {cols}x{rows}")]
    InvalidDimensions { cols: u32, rows: u32 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("session {0} not found")]
    NotFound(String),

    #[error("session {0} is not attachable")]
    NotAttachable(String),

    #[error("session {0} is not writable")]
    NotWritable(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("unknown key name: {0}")]
    UnknownKey(String),

    #[error("session limit reached (max {0})")]
    SessionLimitReached(usize),

    #[error("transcript I/O error: {0}")]
    #[allow(dead_code)]
    RecorderIo(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl SessionError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SessionError::SpawnFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SessionError::InvalidDimensions { .. }
            | SessionError::UnknownKey(_)
            | SessionError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::NotAttachable(_) | SessionError::NotWritable(_) => {
                StatusCode::CONFLICT
            }
            SessionError::PermissionDenied => StatusCode::FORBIDDEN,
            SessionError::SessionLimitReached(_) => StatusCode::SERVICE_UNAVAILABLE,
            SessionError::RecorderIo(_) | SessionError::Serde(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl axum::response::IntoResponse for SessionError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
