use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FileServerError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Path is outside the permitted directory scope")]
    OutsideScope,

    #[error("Filesystem root cannot be used as a directory scope")]
    RootScope,

    #[error("A base directory scope is required")]
    ScopeRequired,

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("File operation not allowed on directory")]
    NotAFile,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FileServerError {
    /// Whether this error is an authorization decision rather than an I/O failure.
    pub fn is_sandbox_violation(&self) -> bool {
        matches!(
            self,
            FileServerError::OutsideScope | FileServerError::RootScope
        )
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for FileServerError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            FileServerError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            FileServerError::OutsideScope => (StatusCode::FORBIDDEN, "OUTSIDE_SCOPE"),
            FileServerError::RootScope => (StatusCode::FORBIDDEN, "ROOT_SCOPE"),
            FileServerError::ScopeRequired => (StatusCode::BAD_REQUEST, "SCOPE_REQUIRED"),
            FileServerError::InvalidPath(_) => (StatusCode::BAD_REQUEST, "INVALID_PATH"),
            FileServerError::NotAFile => (StatusCode::BAD_REQUEST, "NOT_A_FILE"),
            FileServerError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
        };

        let body = ErrorResponse {
            error: self.to_string(),
            code,
        };

        (status, Json(body)).into_response()
    }
}
