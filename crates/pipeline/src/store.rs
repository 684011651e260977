//! Persistence seam for the pipeline.
//!
//! [`GenerationStore`] is everything the service and orchestrator need from
//! durable storage. [`PgGenerationStore`](crate::pg::PgGenerationStore) is the
//! production implementation; [`MemoryGenerationStore`](crate::memory::MemoryGenerationStore)
//! provides the same atomicity guarantees in process.

use async_trait::async_trait;
use pagecraft_core::assembly::{ChatMessage, ChatRole};
use pagecraft_core::error::GenerationErrorCode;
use pagecraft_core::policy::Tier;
use pagecraft_core::session::{GenerationSession, NewSession, SessionStatus, Snapshot};
use pagecraft_core::types::{DbId, SessionId, Timestamp};
use serde::Serialize;

use crate::error::PipelineError;

/// Number of stored turns replayed as history.
pub const HISTORY_LIMIT: usize = pagecraft_core::assembly::MAX_HISTORY_TURNS;

/// What the service needs to know about a project before generating.
#[derive(Debug, Clone)]
pub struct ProjectContext {
    pub project_id: DbId,
    /// Owning account.
    pub account_id: DbId,
    pub tier: Tier,
    pub balance: i32,
    /// Open session currently holding the project lock.
    pub active_session: Option<SessionId>,
    /// Recent stored turns, oldest first, followed by the committed page
    /// as an assistant turn when one exists.
    pub history: Vec<ChatMessage>,
}

/// Build history from stored turns and the committed page.
pub fn build_history(turns: Vec<ChatMessage>, committed_html: Option<String>) -> Vec<ChatMessage> {
    let mut history = turns;
    if let Some(html) = committed_html {
        history.push(ChatMessage::assistant(html));
    }
    history
}

/// One credit ledger entry as shown to the account owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub delta: i32,
    pub reason: String,
    pub session_id: Option<SessionId>,
    pub created_at: Timestamp,
}

#[async_trait]
pub trait GenerationStore: Send + Sync {
    async fn load_project_context(&self, project_id: DbId) -> Result<ProjectContext, PipelineError>;

    /// Create the session and charge its cost atomically.
    ///
    /// Fails with `GENERATION_IN_PROGRESS` when the project already has an
    /// open session and `CREDITS_EXHAUSTED` when the balance does not cover
    /// the cost; neither failure changes any state.
    async fn open_session(&self, input: NewSession) -> Result<GenerationSession, PipelineError>;

    async fn find_session(&self, id: SessionId) -> Result<Option<GenerationSession>, PipelineError>;

    async fn latest_snapshot(&self, id: SessionId) -> Result<Option<Snapshot>, PipelineError>;

    /// Move an open session to a non-closing status. `false` if closed;
    /// [`PipelineError::IllegalTransition`] if the current status may not
    /// move to `status`.
    async fn set_status(&self, id: SessionId, status: SessionStatus) -> Result<bool, PipelineError>;

    /// Persist a pass output and count the pass as completed. `false` if
    /// the session is closed.
    async fn commit_snapshot(
        &self,
        id: SessionId,
        pass: u32,
        html: &str,
    ) -> Result<bool, PipelineError>;

    /// Close a session, committing its latest snapshot to the project.
    /// `false` if it was already closed. Transitions are checked as for
    /// [`set_status`](Self::set_status).
    async fn finish(
        &self,
        id: SessionId,
        status: SessionStatus,
        error_code: Option<GenerationErrorCode>,
    ) -> Result<bool, PipelineError>;

    /// [`finish`](Self::finish) and return the session's charge in one
    /// atomic step. `None` if the session was already closed, otherwise the
    /// amount returned to the account.
    async fn finish_with_refund(
        &self,
        id: SessionId,
        status: SessionStatus,
        error_code: Option<GenerationErrorCode>,
    ) -> Result<Option<i32>, PipelineError>;

    /// Raise the delivery cursor to `pass`; never lowers it.
    async fn advance_cursor(&self, id: SessionId, pass: u32) -> Result<(), PipelineError>;

    /// Append a conversation turn to a project.
    async fn record_turn(
        &self,
        project_id: DbId,
        role: ChatRole,
        content: &str,
    ) -> Result<(), PipelineError>;

    /// Open INTERRUPTED sessions interrupted before `cutoff`.
    async fn stale_interrupted(
        &self,
        cutoff: Timestamp,
    ) -> Result<Vec<GenerationSession>, PipelineError>;

    /// Move open PENDING/STREAMING/REFINING sessions to INTERRUPTED,
    /// returning their ids.
    async fn orphaned_running(&self) -> Result<Vec<SessionId>, PipelineError>;

    async fn balance(&self, account_id: DbId) -> Result<Option<i32>, PipelineError>;

    async fn recent_ledger(
        &self,
        account_id: DbId,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, PipelineError>;
}
