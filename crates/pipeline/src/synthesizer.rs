//! Brief synthesis.
//!
//! One short, non-streaming model call turns the sanitized prompt into a
//! five-line brief. Any failure, whether the call itself or parsing its
//! output, yields the fixed fallback brief so generation always proceeds.

use std::sync::Arc;

use pagecraft_core::assembly::{AssembledPrompt, ChatMessage};
use pagecraft_core::brief::{Brief, SYNTHESIS_INSTRUCTIONS};
use pagecraft_llm::{ModelClient, ModelRequest};

/// Output budget for the brief call.
const BRIEF_MAX_TOKENS: u32 = 400;

pub struct BriefSynthesizer {
    client: Arc<dyn ModelClient>,
    model: String,
}

impl BriefSynthesizer {
    pub fn new(client: Arc<dyn ModelClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    /// Synthesize a brief from already-sanitized prompt text.
    ///
    /// Returns the brief and whether it is the fallback.
    pub async fn synthesize(&self, sanitized_prompt: &str) -> (Brief, bool) {
        let request = ModelRequest::new(
            self.model.clone(),
            BRIEF_MAX_TOKENS,
            AssembledPrompt {
                system: SYNTHESIS_INSTRUCTIONS.to_string(),
                messages: vec![ChatMessage::user(sanitized_prompt)],
            },
        );

        match self.client.complete(&request).await {
            Ok(completion) => match Brief::parse(&completion.text) {
                Ok(brief) => (brief, false),
                Err(e) => {
                    tracing::warn!(error = %e, "Brief output did not parse, using fallback brief");
                    (Brief::fallback(), true)
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Brief synthesis call failed, using fallback brief");
                (Brief::fallback(), true)
            }
        }
    }
}
