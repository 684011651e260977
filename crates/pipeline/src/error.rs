use pagecraft_core::error::{CoreError, GenerationErrorCode};
use pagecraft_core::session::SessionStatus;

/// Errors surfaced by the generation pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A caller-visible generation failure with a fixed code.
    #[error("{0}")]
    Generation(GenerationErrorCode),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A write the session state machine does not allow.
    #[error("session cannot move from {from} to {to}")]
    IllegalTransition { from: SessionStatus, to: SessionStatus },
}

impl From<GenerationErrorCode> for PipelineError {
    fn from(code: GenerationErrorCode) -> Self {
        PipelineError::Generation(code)
    }
}

impl PipelineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        PipelineError::Core(CoreError::NotFound {
            entity,
            id: id.to_string(),
        })
    }

    /// The generation code, if this is a caller-visible generation failure.
    pub fn code(&self) -> Option<GenerationErrorCode> {
        match self {
            PipelineError::Generation(code) => Some(*code),
            PipelineError::Core(CoreError::Generation(code)) => Some(*code),
            _ => None,
        }
    }
}
