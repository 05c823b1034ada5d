use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use chatrelay_shared::{HubError, LogError};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<LogError> for ServerError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::InvalidFileName(name) => {
                ServerError::BadRequest(format!("Invalid log file name: {name}"))
            }
            LogError::NotFound(name) => ServerError::NotFound(name),
            LogError::Io(e) => ServerError::Internal(e.to_string()),
        }
    }
}

impl From<HubError> for ServerError {
    fn from(err: HubError) -> Self {
        ServerError::Unavailable(err.to_string())
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            ServerError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
