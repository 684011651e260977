//! Upstream language-model client.
//!
//! - [`ModelClient`]: the seam the pipeline depends on.
//! - [`HttpModelClient`]: Messages API client over `reqwest`, streaming
//!   output through server-sent events.
//! - [`RetryingClient`]: single retry after a fixed delay on timeout or
//!   5xx-class failure, only while no output has been emitted.

pub mod client;
pub mod error;
pub mod http;
pub mod messages;
pub mod retry;
pub mod sse;

pub use client::{ChunkSink, Completion, ModelClient, ModelRequest};
pub use error::LlmError;
pub use http::{HttpModelClient, LlmConfig};
pub use retry::RetryingClient;
