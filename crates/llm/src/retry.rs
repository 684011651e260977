//! Single-retry wrapper for model calls.
//!
//! A failed call is retried once after a fixed delay when the error is
//! retryable (timeout or 5xx-class) and, for streaming calls, when no output
//! fragment has been handed to the caller yet. A second failure is returned
//! as-is.

use std::time::Duration;

use async_trait::async_trait;

use crate::client::{ChunkSink, Completion, ModelClient, ModelRequest};
use crate::error::LlmError;

pub struct RetryingClient<C> {
    inner: C,
    delay: Duration,
}

impl<C: ModelClient> RetryingClient<C> {
    pub fn new(inner: C, delay: Duration) -> Self {
        Self { inner, delay }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: ModelClient> ModelClient for RetryingClient<C> {
    async fn complete(&self, request: &ModelRequest) -> Result<Completion, LlmError> {
        match self.inner.complete(request).await {
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    error = %e,
                    delay_ms = self.delay.as_millis() as u64,
                    "Model call failed, retrying once"
                );
                tokio::time::sleep(self.delay).await;
                self.inner.complete(request).await
            }
            other => other,
        }
    }

    async fn stream(
        &self,
        request: &ModelRequest,
        on_chunk: ChunkSink<'_>,
    ) -> Result<Completion, LlmError> {
        let mut emitted = false;
        let first = {
            let mut tracking = |fragment: &str| {
                emitted = true;
                on_chunk(fragment);
            };
            self.inner.stream(request, &mut tracking).await
        };

        match first {
            Err(e) if e.is_retryable() && !emitted => {
                tracing::warn!(
                    error = %e,
                    delay_ms = self.delay.as_millis() as u64,
                    "Model stream failed before output, retrying once"
                );
                tokio::time::sleep(self.delay).await;
                self.inner.stream(request, on_chunk).await
            }
            other => other,
        }
    }
}
