use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failures that stop an event from being counted.
///
/// Duplicate submissions and suppressed views are successful outcomes and
/// never show up here.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rate limit exceeded for bucket '{bucket}', retry after {retry_after_secs}s")]
    RateLimited {
        bucket: String,
        retry_after_secs: u64,
    },

    #[error("Hashing failure: {0}")]
    Hashing(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl GateError {
    pub fn validation(msg: impl Into<String>) -> Self {
        GateError::Validation(msg.into())
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            GateError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }
            GateError::RateLimited {
                retry_after_secs, ..
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                format!("Too many requests, retry in {retry_after_secs}s"),
            ),
            GateError::Hashing(msg) => {
                tracing::error!("Hashing failure: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "HASHING_ERROR",
                    "Failed to fingerprint request".to_string(),
                )
            }
            GateError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal server error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        let mut response = (status, body).into_response();
        if let GateError::RateLimited {
            retry_after_secs, ..
        } = self
        {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }
        response
    }
}
