use async_trait::async_trait;
use pagecraft_core::assembly::{AssembledPrompt, ChatMessage};

use crate::error::LlmError;

/// One model call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRequest {
    pub model: String,
    pub max_tokens: u32,
    pub system: String,
    pub messages: Vec<ChatMessage>,
}

impl ModelRequest {
    pub fn new(model: impl Into<String>, max_tokens: u32, prompt: AssembledPrompt) -> Self {
        Self {
            model: model.into(),
            max_tokens,
            system: prompt.system,
            messages: prompt.messages,
        }
    }
}

/// Full text of a finished model call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
}

/// Receives streamed output fragments in generation order.
pub type ChunkSink<'a> = &'a mut (dyn FnMut(&str) + Send);

/// The upstream model, as seen by the pipeline.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Run a request to completion without streaming.
    async fn complete(&self, request: &ModelRequest) -> Result<Completion, LlmError>;

    /// Run a request, handing every output fragment to `on_chunk` as it
    /// arrives. The returned text is the concatenation of all fragments.
    ///
    /// Output cut off at the token limit is `Err(LlmError::TokenLimit)`.
    async fn stream(
        &self,
        request: &ModelRequest,
        on_chunk: ChunkSink<'_>,
    ) -> Result<Completion, LlmError>;
}
