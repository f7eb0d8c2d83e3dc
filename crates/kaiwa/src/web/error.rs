use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kaiwa_core::checkpoint::InvalidThreadId;
use kaiwa_model::ErrorKind;
use serde_json::json;

/// An error returned by the chat API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The thread id in the path is malformed.
    #[error(transparent)]
    InvalidThreadId(#[from] InvalidThreadId),
    /// The request body is missing or is not the expected JSON.
    #[error(transparent)]
    InvalidBody(#[from] JsonRejection),
    /// The message has no content.
    #[error("message content must not be empty")]
    EmptyMessage,
    /// The turn failed.
    #[error(transparent)]
    Chat(#[from] kaiwa_core::Error),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::InvalidThreadId(_) => {
                (StatusCode::BAD_REQUEST, "INVALID_THREAD_ID")
            }
            ApiError::InvalidBody(rejection) => {
                (rejection.status(), "INVALID_BODY")
            }
            ApiError::EmptyMessage => (StatusCode::BAD_REQUEST, "EMPTY_MESSAGE"),
            ApiError::Chat(kaiwa_core::Error::TooManySteps(_)) => {
                (StatusCode::BAD_GATEWAY, "TOO_MANY_STEPS")
            }
            ApiError::Chat(err) => match err.model_error_kind() {
                Some(ErrorKind::RateLimitExceeded) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "RATE_LIMITED")
                }
                _ => (StatusCode::BAD_GATEWAY, "MODEL_ERROR"),
            },
        }
    }

    fn message(&self) -> String {
        match self {
            // The rejection's `Display` leaves out the decoding error.
            ApiError::InvalidBody(rejection) => rejection.body_text(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!("request failed: {self}");
        }
        let body = json!({
            "error": {
                "code": code,
                "message": self.message(),
            }
        });
        (status, Json(body)).into_response()
    }
}
