//! Generation session rows and DTOs.
//!
//! The row keeps enum-valued columns as text; [`GenerationSessionRow::into_domain`]
//! converts to the typed [`GenerationSession`] used by the pipeline.

use serde::Serialize;
use sqlx::FromRow;
use pagecraft_core::assembly::{AssembledPrompt, ChatMessage};
use pagecraft_core::brief::Brief;
use pagecraft_core::error::{CoreError, GenerationErrorCode};
use pagecraft_core::policy::{GenerationMode, Tier};
use pagecraft_core::session::{GenerationSession, NewSession, SessionStatus};
use pagecraft_core::types::{DbId, SessionId, Timestamp};

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A row from the `generation_sessions` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct GenerationSessionRow {
    pub id: SessionId,
    pub project_id: DbId,
    pub account_id: DbId,
    pub tier: String,
    pub mode: String,
    pub credit_cost: i32,
    pub passes_total: i32,
    pub passes_completed: i32,
    pub status: String,
    pub error_code: Option<String>,
    pub brief: serde_json::Value,
    pub brief_fallback: bool,
    pub system_prompt: String,
    pub request_messages: serde_json::Value,
    pub delivery_cursor: i32,
    pub interrupted_at: Option<Timestamp>,
    pub closed_at: Option<Timestamp>,
    pub refunded_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl GenerationSessionRow {
    /// Convert the stored row into the domain record.
    pub fn into_domain(self) -> Result<GenerationSession, CoreError> {
        let status = SessionStatus::parse(&self.status).ok_or_else(|| {
            CoreError::Internal(format!("session {} has unknown status {}", self.id, self.status))
        })?;
        let mode = GenerationMode::parse(&self.mode).ok_or_else(|| {
            CoreError::Internal(format!("session {} has unknown mode {}", self.id, self.mode))
        })?;
        let brief: Brief = serde_json::from_value(self.brief)
            .map_err(|e| CoreError::Internal(format!("session {} brief: {e}", self.id)))?;
        let messages: Vec<ChatMessage> = serde_json::from_value(self.request_messages)
            .map_err(|e| CoreError::Internal(format!("session {} messages: {e}", self.id)))?;

        Ok(GenerationSession {
            id: self.id,
            project_id: self.project_id,
            account_id: self.account_id,
            tier: Tier::from_str_or_free(&self.tier),
            mode,
            credit_cost: self.credit_cost,
            passes_total: to_u32(self.passes_total),
            passes_completed: to_u32(self.passes_completed),
            status,
            error_code: self.error_code.as_deref().and_then(GenerationErrorCode::parse),
            delivery_cursor: to_u32(self.delivery_cursor),
            brief,
            brief_fallback: self.brief_fallback,
            request: AssembledPrompt {
                system: self.system_prompt,
                messages,
            },
            interrupted_at: self.interrupted_at,
            closed_at: self.closed_at,
            refunded_at: self.refunded_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn to_u32(v: i32) -> u32 {
    v.max(0) as u32
}

// ---------------------------------------------------------------------------
// Create DTO
// ---------------------------------------------------------------------------

/// Column values for inserting a new session.
#[derive(Debug, Clone)]
pub struct CreateGenerationSession {
    pub id: SessionId,
    pub project_id: DbId,
    pub account_id: DbId,
    pub tier: String,
    pub mode: String,
    pub credit_cost: i32,
    pub passes_total: i32,
    pub brief: serde_json::Value,
    pub brief_fallback: bool,
    pub system_prompt: String,
    pub request_messages: serde_json::Value,
}

impl CreateGenerationSession {
    /// Build the insert DTO for a new session with a fresh time-ordered id.
    pub fn from_new(input: &NewSession) -> Result<Self, CoreError> {
        let brief = serde_json::to_value(&input.brief)
            .map_err(|e| CoreError::Internal(format!("brief serialization: {e}")))?;
        let request_messages = serde_json::to_value(&input.request.messages)
            .map_err(|e| CoreError::Internal(format!("message serialization: {e}")))?;
        Ok(Self {
            id: uuid::Uuid::now_v7(),
            project_id: input.project_id,
            account_id: input.account_id,
            tier: input.tier.as_str().to_string(),
            mode: input.mode.as_str().to_string(),
            credit_cost: input.credit_cost,
            passes_total: input.passes_total as i32,
            brief,
            brief_fallback: input.brief_fallback,
            system_prompt: input.request.system.clone(),
            request_messages,
        })
    }
}

// ---------------------------------------------------------------------------
// Open outcome
// ---------------------------------------------------------------------------

/// Result of the open-and-charge transaction.
#[derive(Debug)]
pub enum OpenOutcome {
    Opened(GenerationSessionRow),
    /// Another open session holds the project lock.
    ProjectBusy,
    /// The balance did not cover the cost; nothing was written.
    InsufficientCredits,
}

// ---------------------------------------------------------------------------
// Guarded writes
// ---------------------------------------------------------------------------

/// Result of a status write guarded by the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWrite {
    Applied,
    /// The session is closed or does not exist.
    Closed,
    /// The stored status may not move to the requested one.
    Rejected { from: SessionStatus },
}

/// Result of closing a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Closed now. `refunded` is the amount returned to the account when a
    /// refund was requested and had not happened before.
    Closed { refunded: Option<i32> },
    /// Already closed, or missing; nothing changed.
    AlreadyClosed,
    Rejected { from: SessionStatus },
}
