use pagecraft_core::error::GenerationErrorCode;

/// Errors from the upstream model API.
///
/// The `Display` text may include upstream response bodies and is meant for
/// logs only. Callers see [`LlmError::error_code`].
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// No response (or no further output) within the configured timeout.
    #[error("model request timed out")]
    Timeout,

    /// The API answered with a non-2xx status.
    #[error("model API error ({status}): {body}")]
    Api { status: u16, body: String },

    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The response could not be understood, or the stream broke off.
    #[error("malformed model response: {0}")]
    Protocol(String),

    /// Output stopped at the max-token limit.
    #[error("model output hit the token limit")]
    TokenLimit,
}

impl LlmError {
    /// Timeouts and 5xx-class failures are worth one more attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Timeout => true,
            LlmError::Api { status, .. } => *status >= 500,
            LlmError::Request(e) => e.is_timeout() || e.is_connect(),
            LlmError::Protocol(_) | LlmError::TokenLimit => false,
        }
    }

    /// Caller-visible code for this failure.
    pub fn error_code(&self) -> GenerationErrorCode {
        match self {
            LlmError::Timeout => GenerationErrorCode::Timeout,
            LlmError::Request(e) if e.is_timeout() => GenerationErrorCode::Timeout,
            LlmError::Api { .. } | LlmError::Request(_) => GenerationErrorCode::ApiError,
            LlmError::Protocol(_) => GenerationErrorCode::StreamError,
            LlmError::TokenLimit => GenerationErrorCode::TokenLimitExceeded,
        }
    }
}
