//! Generation pipeline.
//!
//! Turns a raw prompt into a committed HTML page: validation and
//! sanitization, brief synthesis, prompt assembly, the credit charge, the
//! sequential refinement passes and the resumable stream that carries their
//! output to the caller.

pub mod error;
pub mod hub;
pub mod memory;
pub mod orchestrator;
pub mod pg;
pub mod rate_limit;
pub mod service;
pub mod store;
pub mod synthesizer;

pub use error::PipelineError;
pub use hub::{Reader, StopReason, StreamHub};
pub use memory::MemoryGenerationStore;
pub use orchestrator::Orchestrator;
pub use pg::PgGenerationStore;
pub use rate_limit::{FixedWindowLimiter, RateLimiter, Unlimited};
pub use service::{CreditSummary, GenerationService, GenerationSettings, SessionStream};
pub use store::GenerationStore;
pub use synthesizer::BriefSynthesizer;
