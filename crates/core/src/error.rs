use serde::{Deserialize, Serialize};

use crate::types::DbId;

/// Domain errors shared by every crate in the workspace.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Generation error: {0}")]
    Generation(GenerationErrorCode),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Shorthand for a not-found error keyed by a numeric id.
    pub fn not_found(entity: &'static str, id: DbId) -> Self {
        CoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<GenerationErrorCode> for CoreError {
    fn from(code: GenerationErrorCode) -> Self {
        CoreError::Generation(code)
    }
}

// ---------------------------------------------------------------------------
// Caller-visible generation error codes
// ---------------------------------------------------------------------------

/// The fixed taxonomy of caller-visible generation errors.
///
/// Every error that reaches a client (HTTP body or stream event) is reduced
/// to one of these codes plus its fixed [`message`](Self::message). Upstream
/// error text never crosses this boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationErrorCode {
    EmptyPrompt,
    PromptTooLong,
    CreditsExhausted,
    GenerationInProgress,
    UpgradeRequired,
    RateLimited,
    StreamInterrupted,
    StreamError,
    TokenLimitExceeded,
    ApiError,
    Timeout,
}

impl GenerationErrorCode {
    /// Stable string form, used in JSON bodies and the `error_code` column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmptyPrompt => "EMPTY_PROMPT",
            Self::PromptTooLong => "PROMPT_TOO_LONG",
            Self::CreditsExhausted => "CREDITS_EXHAUSTED",
            Self::GenerationInProgress => "GENERATION_IN_PROGRESS",
            Self::UpgradeRequired => "UPGRADE_REQUIRED",
            Self::RateLimited => "RATE_LIMITED",
            Self::StreamInterrupted => "STREAM_INTERRUPTED",
            Self::StreamError => "STREAM_ERROR",
            Self::TokenLimitExceeded => "TOKEN_LIMIT_EXCEEDED",
            Self::ApiError => "API_ERROR",
            Self::Timeout => "TIMEOUT",
        }
    }

    /// Parse the stored string form. Unknown values yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        ALL_CODES.iter().copied().find(|c| c.as_str() == s)
    }

    /// Fixed caller-facing message for this code.
    pub fn message(self) -> &'static str {
        match self {
            Self::EmptyPrompt => "Prompt must not be empty",
            Self::PromptTooLong => "Prompt exceeds the maximum length of 10000 characters",
            Self::CreditsExhausted => "Not enough credits for this generation",
            Self::GenerationInProgress => "A generation is already running for this project",
            Self::UpgradeRequired => "Your plan does not include page generation",
            Self::RateLimited => "Too many generation requests, try again shortly",
            Self::StreamInterrupted => "The stream was interrupted and can be resumed",
            Self::StreamError => "Generation failed while streaming",
            Self::TokenLimitExceeded => "The generated page exceeded the output limit",
            Self::ApiError => "The generation service returned an error",
            Self::Timeout => "The generation service timed out",
        }
    }
}

impl std::fmt::Display for GenerationErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const ALL_CODES: &[GenerationErrorCode] = &[
    GenerationErrorCode::EmptyPrompt,
    GenerationErrorCode::PromptTooLong,
    GenerationErrorCode::CreditsExhausted,
    GenerationErrorCode::GenerationInProgress,
    GenerationErrorCode::UpgradeRequired,
    GenerationErrorCode::RateLimited,
    GenerationErrorCode::StreamInterrupted,
    GenerationErrorCode::StreamError,
    GenerationErrorCode::TokenLimitExceeded,
    GenerationErrorCode::ApiError,
    GenerationErrorCode::Timeout,
];
