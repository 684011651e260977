//! HTTP error responses.
//!
//! Every error leaves the server as `{ "error": <message>, "code": <CODE> }`.
//! Generation failures use their fixed code and message; anything internal
//! is logged and replaced with a generic message.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use pagecraft_core::error::{CoreError, GenerationErrorCode};
use pagecraft_pipeline::PipelineError;
use serde_json::json;

/// Seconds a rate-limited caller is asked to wait.
const RATE_LIMIT_RETRY_AFTER_SECS: u64 = 60;

const INTERNAL_MESSAGE: &str = "An internal error occurred";

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Generation(code) => AppError::Core(CoreError::Generation(code)),
            PipelineError::Core(core) => AppError::Core(core),
            PipelineError::Database(db) => AppError::Database(db),
            other @ PipelineError::IllegalTransition { .. } => {
                AppError::Core(CoreError::Internal(other.to_string()))
            }
        }
    }
}

impl From<GenerationErrorCode> for AppError {
    fn from(code: GenerationErrorCode) -> Self {
        AppError::Core(CoreError::Generation(code))
    }
}

/// HTTP status for a generation error code returned before streaming starts.
pub fn generation_status(code: GenerationErrorCode) -> StatusCode {
    match code {
        GenerationErrorCode::EmptyPrompt | GenerationErrorCode::PromptTooLong => {
            StatusCode::BAD_REQUEST
        }
        GenerationErrorCode::CreditsExhausted => StatusCode::PAYMENT_REQUIRED,
        GenerationErrorCode::GenerationInProgress | GenerationErrorCode::StreamInterrupted => {
            StatusCode::CONFLICT
        }
        GenerationErrorCode::UpgradeRequired => StatusCode::FORBIDDEN,
        GenerationErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        GenerationErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
        GenerationErrorCode::StreamError
        | GenerationErrorCode::TokenLimitExceeded
        | GenerationErrorCode::ApiError => StatusCode::BAD_GATEWAY,
    }
}

impl AppError {
    fn status_code_message(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Core(CoreError::Generation(code)) => {
                (generation_status(*code), code.as_str(), code.message().to_string())
            }
            AppError::Core(CoreError::NotFound { entity, id }) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("{entity} with id {id} not found"),
            ),
            AppError::Core(CoreError::Unauthorized(msg)) => {
                (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone())
            }
            AppError::Core(CoreError::Internal(msg)) => {
                tracing::error!(error = %msg, "Internal error");
                internal()
            }
            AppError::Database(sqlx::Error::RowNotFound) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                "Resource not found".to_string(),
            ),
            AppError::Database(err) => {
                tracing::error!(error = %err, "Database error");
                internal()
            }
        }
    }
}

fn internal() -> (StatusCode, &'static str, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        INTERNAL_MESSAGE.to_string(),
    )
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.status_code_message();
        let body = axum::Json(json!({ "error": message, "code": code }));
        let mut response = (status, body).into_response();

        if status == StatusCode::TOO_MANY_REQUESTS {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(RATE_LIMIT_RETRY_AFTER_SECS),
            );
        }
        response
    }
}
