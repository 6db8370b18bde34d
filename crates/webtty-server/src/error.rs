use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TermError {
    #[error("terminal {0} not found")]
    NotFound(String),
    #[error("failed to spawn shell: {0}")]
    SpawnFailed(String),
    #[error("failed to resize terminal: {0}")]
    ResizeFailed(String),
    #[error("pty closed")]
    PtyClosed,
    #[error("max connections reached")]
    MaxConnectionsReached,
    #[error(transparent)]
    Store(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl IntoResponse for TermError {
    fn into_response(self) -> Response {
        let status = match self {
            TermError::NotFound(_) => StatusCode::NOT_FOUND,
            TermError::MaxConnectionsReached => StatusCode::TOO_MANY_REQUESTS,
            TermError::SpawnFailed(_)
            | TermError::ResizeFailed(_)
            | TermError::PtyClosed
            | TermError::Store(_)
            | TermError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

pub type TermResult<T> = Result<T, TermError>;
