//! Generation session state machine.
//!
//! ```text
//! PENDING      -> STREAMING(1)                      credit charged, pass 1 requested
//! STREAMING(k) -> REFINING(k+1)                     pass k complete, k < N
//! STREAMING(k) -> COMPLETE                          pass k complete, k == N
//! REFINING(k)  -> same rules as STREAMING
//! non-terminal -> INTERRUPTED                       client disconnect / cancel
//! non-terminal -> FAILED                            upstream error / truncation
//! INTERRUPTED  -> STREAMING / REFINING              resume at the first incomplete pass
//! ```
//!
//! A session is closed (immutable) once COMPLETE or FAILED, or once an
//! INTERRUPTED session is cancelled or expires; `closed_at` marks that point.
//! Both stores refuse any write that [`SessionStatus::can_transition_to`]
//! does not permit.

use serde::{Deserialize, Serialize};

use crate::assembly::AssembledPrompt;
use crate::brief::Brief;
use crate::error::GenerationErrorCode;
use crate::policy::{GenerationMode, Tier};
use crate::types::{DbId, SessionId, Timestamp};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    Streaming,
    Refining,
    Complete,
    Interrupted,
    Failed,
}

impl SessionStatus {
    /// String representation for database storage.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "PENDING",
            SessionStatus::Streaming => "STREAMING",
            SessionStatus::Refining => "REFINING",
            SessionStatus::Complete => "COMPLETE",
            SessionStatus::Interrupted => "INTERRUPTED",
            SessionStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(SessionStatus::Pending),
            "STREAMING" => Some(SessionStatus::Streaming),
            "REFINING" => Some(SessionStatus::Refining),
            "COMPLETE" => Some(SessionStatus::Complete),
            "INTERRUPTED" => Some(SessionStatus::Interrupted),
            "FAILED" => Some(SessionStatus::Failed),
            _ => None,
        }
    }

    /// COMPLETE and FAILED never change again.
    pub fn is_final(self) -> bool {
        matches!(self, SessionStatus::Complete | SessionStatus::Failed)
    }

    /// Statuses in which an orchestrator is (or should be) driving passes.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            SessionStatus::Pending | SessionStatus::Streaming | SessionStatus::Refining
        )
    }

    pub const ALL: [SessionStatus; 6] = [
        SessionStatus::Pending,
        SessionStatus::Streaming,
        SessionStatus::Refining,
        SessionStatus::Complete,
        SessionStatus::Interrupted,
        SessionStatus::Failed,
    ];

    /// Whether the state machine permits `self -> to`.
    ///
    /// STREAMING -> STREAMING is a restart of pass 1 after its driver was
    /// lost; INTERRUPTED -> INTERRUPTED is the close of an interrupted
    /// session by cancel or expiry.
    pub fn can_transition_to(self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        match self {
            Pending => matches!(to, Streaming | Interrupted | Failed),
            Streaming => matches!(to, Streaming | Refining | Complete | Interrupted | Failed),
            Refining => matches!(to, Refining | Complete | Interrupted | Failed),
            Interrupted => matches!(to, Streaming | Refining | Interrupted | Failed),
            Complete | Failed => false,
        }
    }

    /// Every status from which `to` may be entered.
    pub fn allowed_sources(to: SessionStatus) -> Vec<SessionStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(to))
            .collect()
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status a session is in while running the given 1-based pass.
pub fn status_for_pass(pass: u32) -> SessionStatus {
    if pass <= 1 {
        SessionStatus::Streaming
    } else {
        SessionStatus::Refining
    }
}

// ---------------------------------------------------------------------------
// Session record
// ---------------------------------------------------------------------------

/// Durable state of one generation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSession {
    pub id: SessionId,
    pub project_id: DbId,
    pub account_id: DbId,
    pub tier: Tier,
    pub mode: GenerationMode,
    pub credit_cost: i32,
    pub passes_total: u32,
    pub passes_completed: u32,
    pub status: SessionStatus,
    pub error_code: Option<GenerationErrorCode>,
    /// Highest snapshot pass handed to a reader.
    pub delivery_cursor: u32,
    pub brief: Brief,
    pub brief_fallback: bool,
    /// Pass-1 input: assembled system prompt plus conversation turns.
    pub request: AssembledPrompt,
    pub interrupted_at: Option<Timestamp>,
    pub closed_at: Option<Timestamp>,
    pub refunded_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl GenerationSession {
    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }

    /// The first pass that has not completed yet.
    pub fn next_pass(&self) -> u32 {
        self.passes_completed + 1
    }
}

/// Input for opening a new session (before the credit charge).
#[derive(Debug, Clone)]
pub struct NewSession {
    pub project_id: DbId,
    pub account_id: DbId,
    pub tier: Tier,
    pub mode: GenerationMode,
    pub credit_cost: i32,
    pub passes_total: u32,
    pub brief: Brief,
    pub brief_fallback: bool,
    pub request: AssembledPrompt,
}

/// An immutable per-pass HTML checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub session_id: SessionId,
    /// 1-based pass number that produced this document.
    pub pass: u32,
    pub html: String,
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

/// How a session ends after a pass fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Nothing was committed: FAILED, refund the charge.
    FailAndRefund { code: GenerationErrorCode },
    /// A later pass hit the output limit: COMPLETE on the last good snapshot.
    CompleteWithLastSnapshot { code: GenerationErrorCode },
    /// A later pass failed otherwise: FAILED, keep the last good snapshot.
    FailKeepingSnapshot { code: GenerationErrorCode },
}

impl FailureOutcome {
    pub fn status(self) -> SessionStatus {
        match self {
            FailureOutcome::CompleteWithLastSnapshot { .. } => SessionStatus::Complete,
            _ => SessionStatus::Failed,
        }
    }

    pub fn code(self) -> GenerationErrorCode {
        match self {
            FailureOutcome::FailAndRefund { code }
            | FailureOutcome::CompleteWithLastSnapshot { code }
            | FailureOutcome::FailKeepingSnapshot { code } => code,
        }
    }

    pub fn refunds(self) -> bool {
        matches!(self, FailureOutcome::FailAndRefund { .. })
    }
}

/// Decide the session outcome when a pass fails with `code`.
pub fn failure_outcome(passes_completed: u32, code: GenerationErrorCode) -> FailureOutcome {
    if passes_completed == 0 {
        FailureOutcome::FailAndRefund { code }
    } else if code == GenerationErrorCode::TokenLimitExceeded {
        FailureOutcome::CompleteWithLastSnapshot { code }
    } else {
        FailureOutcome::FailKeepingSnapshot { code }
    }
}
