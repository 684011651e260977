//! Request prompt validation.
//!
//! Validation runs before sanitization and before any model call. The raw
//! text is trimmed and its length measured in Unicode scalar values.

use serde::Serialize;

use crate::error::GenerationErrorCode;
use crate::sanitize;

/// Maximum accepted prompt length after trimming, in characters.
pub const MAX_PROMPT_CHARS: usize = 10_000;

/// A validated user prompt in sanitized form.
///
/// The raw text is not kept; the sanitized text is what crosses into model
/// prompts and storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Prompt {
    sanitized: String,
    char_len: usize,
    flagged: bool,
}

impl Prompt {
    /// Trim, validate and sanitize a raw prompt.
    ///
    /// - trimmed length 0 -> `EMPTY_PROMPT`
    /// - trimmed length > [`MAX_PROMPT_CHARS`] -> `PROMPT_TOO_LONG`
    pub fn new(raw: &str) -> Result<Self, GenerationErrorCode> {
        let trimmed = validate_prompt(raw)?;
        Ok(Self {
            sanitized: sanitize::sanitize(trimmed),
            char_len: trimmed.chars().count(),
            flagged: !sanitize::is_clean(trimmed),
        })
    }

    pub fn sanitized(&self) -> &str {
        &self.sanitized
    }

    /// Length of the trimmed raw text in characters.
    pub fn char_len(&self) -> usize {
        self.char_len
    }

    /// Whether the raw text contained injection patterns that were fenced.
    pub fn is_flagged(&self) -> bool {
        self.flagged
    }
}

/// Validate prompt length, returning the trimmed slice on success.
pub fn validate_prompt(raw: &str) -> Result<&str, GenerationErrorCode> {
    let trimmed = raw.trim();
    let len = trimmed.chars().count();
    if len == 0 {
        return Err(GenerationErrorCode::EmptyPrompt);
    }
    if len > MAX_PROMPT_CHARS {
        return Err(GenerationErrorCode::PromptTooLong);
    }
    Ok(trimmed)
}
