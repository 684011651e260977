//! Generation event bus.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`GenerationEvent`]: the envelope published on every session status
//!   transition, credit refund and expiry.
//! - [`EventLogger`]: background subscriber that writes every event to the
//!   tracing output.

pub mod bus;
pub mod logger;

pub use bus::{EventBus, GenerationEvent};
pub use logger::EventLogger;
