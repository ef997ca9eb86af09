//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors are automatically converted
//! to a JSON-body HTTP response with an appropriate status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use lattice_core::ServeError;
use serde_json::json;
use thiserror::Error;

/// All errors that can occur in the lattice-server request lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from the serving runtime (batch failures, timeouts,
    /// missing inputs, shutdown).
    #[error(transparent)]
    Serve(#[from] ServeError),

    /// The requested path is not in the routing table.
    #[error("Path {0} not found. Ping / for the routing table")]
    PathNotFound(String),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::PathNotFound(_) => StatusCode::NOT_FOUND,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Serve(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
