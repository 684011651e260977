//! PostgreSQL-backed [`GenerationStore`].

use async_trait::async_trait;
use pagecraft_core::assembly::ChatRole;
use pagecraft_core::error::{CoreError, GenerationErrorCode};
use pagecraft_core::session::{GenerationSession, NewSession, SessionStatus, Snapshot};
use pagecraft_core::types::{DbId, SessionId, Timestamp};
use pagecraft_db::models::generation_session::{
    CloseOutcome, CreateGenerationSession, OpenOutcome, StatusWrite,
};
use pagecraft_db::repositories::{
    AccountRepo, CreditLedgerRepo, GenerationSessionRepo, ProjectRepo, SnapshotRepo,
};
use pagecraft_db::DbPool;

use crate::error::PipelineError;
use crate::store::{build_history, GenerationStore, LedgerEntry, ProjectContext, HISTORY_LIMIT};

pub struct PgGenerationStore {
    pool: DbPool,
}

impl PgGenerationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// `Some(refunded)` when the session was closed by this call.
fn closed(outcome: CloseOutcome, to: SessionStatus) -> Result<Option<Option<i32>>, PipelineError> {
    match outcome {
        CloseOutcome::Closed { refunded } => Ok(Some(refunded)),
        CloseOutcome::AlreadyClosed => Ok(None),
        CloseOutcome::Rejected { from } => Err(PipelineError::IllegalTransition { from, to }),
    }
}

fn to_i32(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

#[async_trait]
impl GenerationStore for PgGenerationStore {
    async fn load_project_context(
        &self,
        project_id: DbId,
    ) -> Result<ProjectContext, PipelineError> {
        let project = ProjectRepo::find_by_id(&self.pool, project_id)
            .await?
            .ok_or_else(|| PipelineError::from(CoreError::not_found("Project", project_id)))?;
        let account = AccountRepo::find_by_id(&self.pool, project.account_id)
            .await?
            .ok_or_else(|| {
                PipelineError::from(CoreError::not_found("Account", project.account_id))
            })?;
        let active = GenerationSessionRepo::find_open_for_project(&self.pool, project_id).await?;
        let turns = ProjectRepo::list_recent_turns(&self.pool, project_id, HISTORY_LIMIT as i64)
            .await?
            .iter()
            .map(|t| t.to_message())
            .collect();

        Ok(ProjectContext {
            project_id,
            account_id: account.id,
            tier: account.tier(),
            balance: account.credit_balance,
            active_session: active.map(|s| s.id),
            history: build_history(turns, project.committed_html),
        })
    }

    async fn open_session(&self, input: NewSession) -> Result<GenerationSession, PipelineError> {
        let create = CreateGenerationSession::from_new(&input)?;
        match GenerationSessionRepo::open_charged(&self.pool, &create).await? {
            OpenOutcome::Opened(row) => Ok(row.into_domain()?),
            OpenOutcome::ProjectBusy => Err(GenerationErrorCode::GenerationInProgress.into()),
            OpenOutcome::InsufficientCredits => Err(GenerationErrorCode::CreditsExhausted.into()),
        }
    }

    async fn find_session(
        &self,
        id: SessionId,
    ) -> Result<Option<GenerationSession>, PipelineError> {
        match GenerationSessionRepo::find_by_id(&self.pool, id).await? {
            Some(row) => Ok(Some(row.into_domain()?)),
            None => Ok(None),
        }
    }

    async fn latest_snapshot(&self, id: SessionId) -> Result<Option<Snapshot>, PipelineError> {
        let row = SnapshotRepo::latest_for_session(&self.pool, id).await?;
        Ok(row.map(Snapshot::from))
    }

    async fn set_status(
        &self,
        id: SessionId,
        status: SessionStatus,
    ) -> Result<bool, PipelineError> {
        match GenerationSessionRepo::set_status(&self.pool, id, status).await? {
            StatusWrite::Applied => Ok(true),
            StatusWrite::Closed => Ok(false),
            StatusWrite::Rejected { from } => {
                Err(PipelineError::IllegalTransition { from, to: status })
            }
        }
    }

    async fn commit_snapshot(
        &self,
        id: SessionId,
        pass: u32,
        html: &str,
    ) -> Result<bool, PipelineError> {
        Ok(GenerationSessionRepo::commit_snapshot(&self.pool, id, to_i32(pass), html).await?)
    }

    async fn finish(
        &self,
        id: SessionId,
        status: SessionStatus,
        error_code: Option<GenerationErrorCode>,
    ) -> Result<bool, PipelineError> {
        let outcome =
            GenerationSessionRepo::finish(&self.pool, id, status, error_code, false).await?;
        Ok(closed(outcome, status)?.is_some())
    }

    async fn finish_with_refund(
        &self,
        id: SessionId,
        status: SessionStatus,
        error_code: Option<GenerationErrorCode>,
    ) -> Result<Option<i32>, PipelineError> {
        let outcome =
            GenerationSessionRepo::finish(&self.pool, id, status, error_code, true).await?;
        Ok(closed(outcome, status)?.map(|refunded| refunded.unwrap_or(0)))
    }

    async fn advance_cursor(&self, id: SessionId, pass: u32) -> Result<(), PipelineError> {
        GenerationSessionRepo::advance_cursor(&self.pool, id, to_i32(pass)).await?;
        Ok(())
    }

    async fn record_turn(
        &self,
        project_id: DbId,
        role: ChatRole,
        content: &str,
    ) -> Result<(), PipelineError> {
        ProjectRepo::add_turn(&self.pool, project_id, role, content).await?;
        Ok(())
    }

    async fn stale_interrupted(
        &self,
        cutoff: Timestamp,
    ) -> Result<Vec<GenerationSession>, PipelineError> {
        GenerationSessionRepo::list_stale_interrupted(&self.pool, cutoff)
            .await?
            .into_iter()
            .map(|row| row.into_domain().map_err(PipelineError::from))
            .collect()
    }

    async fn orphaned_running(&self) -> Result<Vec<SessionId>, PipelineError> {
        Ok(GenerationSessionRepo::interrupt_orphans(&self.pool).await?)
    }

    async fn balance(&self, account_id: DbId) -> Result<Option<i32>, PipelineError> {
        Ok(AccountRepo::balance(&self.pool, account_id).await?)
    }

    async fn recent_ledger(
        &self,
        account_id: DbId,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, PipelineError> {
        let rows = CreditLedgerRepo::list_recent(&self.pool, account_id, limit as i64).await?;
        Ok(rows
            .into_iter()
            .map(|r| LedgerEntry {
                delta: r.delta,
                reason: r.reason,
                session_id: r.session_id,
                created_at: r.created_at,
            })
            .collect())
    }
}
