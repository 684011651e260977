//! Messages API client over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use crate::client::{ChunkSink, Completion, ModelClient, ModelRequest};
use crate::error::LlmError;
use crate::messages::{
    parse_payload, BlockDelta, MessagesRequest, MessagesResponse, StreamPayload, STOP_MAX_TOKENS,
};
use crate::sse::SseDecoder;

const API_VERSION: &str = "2023-06-01";

/// Connection settings for the upstream API.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Base URL, e.g. `https://api.anthropic.com`.
    pub api_url: String,
    pub api_key: String,
    /// Model used for page generation passes.
    pub model: String,
    /// Model used for brief synthesis.
    pub brief_model: String,
    pub max_tokens: u32,
    /// Bound on waiting for response headers, and on the gap between two
    /// streamed reads.
    pub timeout: Duration,
    /// Delay before the single retry.
    pub retry_delay: Duration,
}

/// HTTP client for the Messages API.
pub struct HttpModelClient {
    client: reqwest::Client,
    config: LlmConfig,
}

impl HttpModelClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    async fn send(
        &self,
        request: &ModelRequest,
        stream: bool,
    ) -> Result<reqwest::Response, LlmError> {
        let body = MessagesRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            system: &request.system,
            messages: &request.messages,
            stream,
        };

        let send = self
            .client
            .post(format!("{}/v1/messages", self.config.api_url.trim_end_matches('/')))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send();

        let response = tokio::time::timeout(self.config.timeout, send)
            .await
            .map_err(|_| LlmError::Timeout)??;

        Self::ensure_success(response).await
    }

    /// Return the response unchanged on success, or an [`LlmError::Api`]
    /// carrying the status and body text.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, LlmError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            tracing::warn!(status = status.as_u16(), body = %body, "Model API returned an error");
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn complete(&self, request: &ModelRequest) -> Result<Completion, LlmError> {
        let response = self.send(request, false).await?;
        let parsed = tokio::time::timeout(self.config.timeout, response.json::<MessagesResponse>())
            .await
            .map_err(|_| LlmError::Timeout)??;

        if parsed.stop_reason.as_deref() == Some(STOP_MAX_TOKENS) {
            return Err(LlmError::TokenLimit);
        }
        Ok(Completion {
            text: parsed.text(),
        })
    }

    async fn stream(
        &self,
        request: &ModelRequest,
        on_chunk: ChunkSink<'_>,
    ) -> Result<Completion, LlmError> {
        let response = self.send(request, true).await?;
        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::new();
        let mut text = String::new();
        let mut stop_reason: Option<String> = None;

        loop {
            let next = tokio::time::timeout(self.config.timeout, body.next())
                .await
                .map_err(|_| LlmError::Timeout)?;
            let Some(bytes) = next else {
                return Err(LlmError::Protocol("stream ended before message_stop".into()));
            };

            for frame in decoder.push(&bytes?) {
                match parse_payload(&frame.data) {
                    Some(StreamPayload::ContentBlockDelta {
                        delta: BlockDelta::TextDelta { text: fragment },
                    }) => {
                        if !fragment.is_empty() {
                            on_chunk(&fragment);
                            text.push_str(&fragment);
                        }
                    }
                    Some(StreamPayload::MessageDelta { delta }) => {
                        if delta.stop_reason.is_some() {
                            stop_reason = delta.stop_reason;
                        }
                    }
                    Some(StreamPayload::MessageStop) => {
                        if stop_reason.as_deref() == Some(STOP_MAX_TOKENS) {
                            return Err(LlmError::TokenLimit);
                        }
                        return Ok(Completion { text });
                    }
                    Some(StreamPayload::Error { error }) => {
                        tracing::warn!(
                            kind = %error.kind,
                            message = %error.message,
                            "Model stream error event"
                        );
                        return Err(match error.kind.as_str() {
                            "overloaded_error" | "api_error" => LlmError::Api {
                                status: 529,
                                body: error.message,
                            },
                            _ => LlmError::Protocol(error.kind),
                        });
                    }
                    Some(_) => {}
                    None => {
                        tracing::debug!(event = ?frame.event, "Skipping unparseable stream frame");
                    }
                }
            }
        }
    }
}
