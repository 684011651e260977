//! In-process [`GenerationStore`].
//!
//! All state sits behind one mutex, so every trait method is atomic the same
//! way the Postgres transactions are. Used by tests and local development.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use pagecraft_core::assembly::{ChatMessage, ChatRole};
use pagecraft_core::error::{CoreError, GenerationErrorCode};
use pagecraft_core::policy::{LedgerReason, Tier};
use pagecraft_core::session::{GenerationSession, NewSession, SessionStatus, Snapshot};
use pagecraft_core::types::{DbId, SessionId, Timestamp};

use crate::error::PipelineError;
use crate::store::{build_history, GenerationStore, LedgerEntry, ProjectContext, HISTORY_LIMIT};

struct Account {
    tier: Tier,
    balance: i32,
}

struct Project {
    account_id: DbId,
    committed_html: Option<String>,
    turns: Vec<ChatMessage>,
}

#[derive(Default)]
struct State {
    next_id: DbId,
    accounts: HashMap<DbId, Account>,
    projects: HashMap<DbId, Project>,
    sessions: HashMap<SessionId, GenerationSession>,
    snapshots: HashMap<SessionId, BTreeMap<u32, String>>,
    ledger: Vec<(DbId, LedgerEntry)>,
}

impl State {
    fn allocate_id(&mut self) -> DbId {
        self.next_id += 1;
        self.next_id
    }

    fn open_session_mut(&mut self, id: SessionId) -> Option<&mut GenerationSession> {
        self.sessions.get_mut(&id).filter(|s| s.closed_at.is_none())
    }

    /// The open session, if `to` is a permitted move from its status.
    fn transition_mut(
        &mut self,
        id: SessionId,
        to: SessionStatus,
    ) -> Result<Option<&mut GenerationSession>, PipelineError> {
        match self.open_session_mut(id) {
            Some(session) if !session.status.can_transition_to(to) => {
                Err(PipelineError::IllegalTransition {
                    from: session.status,
                    to,
                })
            }
            other => Ok(other),
        }
    }

    /// Close a session and commit its latest snapshot to the project.
    /// `None` if it was already closed.
    fn close(
        &mut self,
        id: SessionId,
        status: SessionStatus,
        error_code: Option<GenerationErrorCode>,
    ) -> Result<Option<DbId>, PipelineError> {
        let Some(session) = self.transition_mut(id, status)? else {
            return Ok(None);
        };
        let now = Utc::now();
        session.status = status;
        session.error_code = error_code;
        session.closed_at = Some(now);
        session.updated_at = now;
        let project_id = session.project_id;

        let latest = self
            .snapshots
            .get(&id)
            .and_then(|passes| passes.values().next_back().cloned());
        if let (Some(html), Some(project)) = (latest, self.projects.get_mut(&project_id)) {
            project.committed_html = Some(html);
        }
        Ok(Some(project_id))
    }

    /// Return a session's charge, at most once.
    fn return_charge(&mut self, id: SessionId) -> Option<i32> {
        let session = self.sessions.get_mut(&id)?;
        if session.refunded_at.is_some() {
            return None;
        }
        session.refunded_at = Some(Utc::now());
        let (account_id, amount) = (session.account_id, session.credit_cost);

        if let Some(account) = self.accounts.get_mut(&account_id) {
            account.balance += amount;
        }
        push_ledger(self, account_id, amount, LedgerReason::GenerationRefund, id);
        Some(amount)
    }
}

#[derive(Default)]
pub struct MemoryGenerationStore {
    state: Mutex<State>,
}

impl MemoryGenerationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, PipelineError> {
        self.state
            .lock()
            .map_err(|_| CoreError::Internal("memory store lock poisoned".into()).into())
    }

    pub fn add_account(&self, tier: Tier, balance: i32) -> DbId {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let id = state.allocate_id();
        state.accounts.insert(id, Account { tier, balance });
        id
    }

    pub fn add_project(&self, account_id: DbId) -> DbId {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let id = state.allocate_id();
        state.projects.insert(
            id,
            Project {
                account_id,
                committed_html: None,
                turns: Vec::new(),
            },
        );
        id
    }

    /// The project's committed page, if any.
    pub fn committed_html(&self, project_id: DbId) -> Option<String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .projects
            .get(&project_id)
            .and_then(|p| p.committed_html.clone())
    }

    /// Ids of every session opened against a project, oldest first.
    pub fn session_ids(&self, project_id: DbId) -> Vec<SessionId> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut sessions: Vec<&GenerationSession> = state
            .sessions
            .values()
            .filter(|s| s.project_id == project_id)
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions.into_iter().map(|s| s.id).collect()
    }

    /// Ledger deltas recorded against a session, in insertion order.
    pub fn session_ledger(&self, session_id: SessionId) -> Vec<i32> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .ledger
            .iter()
            .filter(|(_, e)| e.session_id == Some(session_id))
            .map(|(_, e)| e.delta)
            .collect()
    }

    /// Passes with a committed snapshot, in order.
    pub fn snapshot_passes(&self, session_id: SessionId) -> Vec<u32> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .snapshots
            .get(&session_id)
            .map(|passes| passes.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Backdate an interruption, for expiry tests.
    pub fn set_interrupted_at(&self, id: SessionId, at: Timestamp) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(s) = state.sessions.get_mut(&id) {
            s.interrupted_at = Some(at);
        }
    }
}

fn push_ledger(
    state: &mut State,
    account_id: DbId,
    delta: i32,
    reason: LedgerReason,
    session_id: SessionId,
) {
    state.ledger.push((
        account_id,
        LedgerEntry {
            delta,
            reason: reason.as_str().to_string(),
            session_id: Some(session_id),
            created_at: Utc::now(),
        },
    ));
}

#[async_trait]
impl GenerationStore for MemoryGenerationStore {
    async fn load_project_context(
        &self,
        project_id: DbId,
    ) -> Result<ProjectContext, PipelineError> {
        let state = self.lock()?;
        let project = state
            .projects
            .get(&project_id)
            .ok_or_else(|| PipelineError::from(CoreError::not_found("Project", project_id)))?;
        let account = state
            .accounts
            .get(&project.account_id)
            .ok_or_else(|| {
                PipelineError::from(CoreError::not_found("Account", project.account_id))
            })?;
        let active_session = state
            .sessions
            .values()
            .find(|s| s.project_id == project_id && s.closed_at.is_none())
            .map(|s| s.id);
        let skip = project.turns.len().saturating_sub(HISTORY_LIMIT);
        let turns = project.turns.iter().skip(skip).cloned().collect();

        Ok(ProjectContext {
            project_id,
            account_id: project.account_id,
            tier: account.tier,
            balance: account.balance,
            active_session,
            history: build_history(turns, project.committed_html.clone()),
        })
    }

    async fn open_session(&self, input: NewSession) -> Result<GenerationSession, PipelineError> {
        let mut state = self.lock()?;

        let busy = state
            .sessions
            .values()
            .any(|s| s.project_id == input.project_id && s.closed_at.is_none());
        if busy {
            return Err(GenerationErrorCode::GenerationInProgress.into());
        }

        let account = state
            .accounts
            .get_mut(&input.account_id)
            .ok_or(GenerationErrorCode::CreditsExhausted)?;
        if account.balance < input.credit_cost {
            return Err(GenerationErrorCode::CreditsExhausted.into());
        }
        account.balance -= input.credit_cost;

        let now = Utc::now();
        let session = GenerationSession {
            id: uuid::Uuid::now_v7(),
            project_id: input.project_id,
            account_id: input.account_id,
            tier: input.tier,
            mode: input.mode,
            credit_cost: input.credit_cost,
            passes_total: input.passes_total,
            passes_completed: 0,
            status: SessionStatus::Pending,
            error_code: None,
            delivery_cursor: 0,
            brief: input.brief,
            brief_fallback: input.brief_fallback,
            request: input.request,
            interrupted_at: None,
            closed_at: None,
            refunded_at: None,
            created_at: now,
            updated_at: now,
        };
        push_ledger(
            &mut state,
            input.account_id,
            -input.credit_cost,
            LedgerReason::GenerationCharge,
            session.id,
        );
        state.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn find_session(
        &self,
        id: SessionId,
    ) -> Result<Option<GenerationSession>, PipelineError> {
        Ok(self.lock()?.sessions.get(&id).cloned())
    }

    async fn latest_snapshot(&self, id: SessionId) -> Result<Option<Snapshot>, PipelineError> {
        let state = self.lock()?;
        Ok(state
            .snapshots
            .get(&id)
            .and_then(|passes| passes.iter().next_back())
            .map(|(pass, html)| Snapshot {
                session_id: id,
                pass: *pass,
                html: html.clone(),
            }))
    }

    async fn set_status(
        &self,
        id: SessionId,
        status: SessionStatus,
    ) -> Result<bool, PipelineError> {
        let mut state = self.lock()?;
        let Some(session) = state.transition_mut(id, status)? else {
            return Ok(false);
        };
        session.status = status;
        session.interrupted_at = (status == SessionStatus::Interrupted).then(Utc::now);
        session.updated_at = Utc::now();
        Ok(true)
    }

    async fn commit_snapshot(
        &self,
        id: SessionId,
        pass: u32,
        html: &str,
    ) -> Result<bool, PipelineError> {
        let mut state = self.lock()?;
        let Some(session) = state.open_session_mut(id) else {
            return Ok(false);
        };
        session.passes_completed = session.passes_completed.max(pass);
        session.updated_at = Utc::now();
        state
            .snapshots
            .entry(id)
            .or_default()
            .entry(pass)
            .or_insert_with(|| html.to_string());
        Ok(true)
    }

    async fn finish(
        &self,
        id: SessionId,
        status: SessionStatus,
        error_code: Option<GenerationErrorCode>,
    ) -> Result<bool, PipelineError> {
        Ok(self.lock()?.close(id, status, error_code)?.is_some())
    }

    async fn finish_with_refund(
        &self,
        id: SessionId,
        status: SessionStatus,
        error_code: Option<GenerationErrorCode>,
    ) -> Result<Option<i32>, PipelineError> {
        let mut state = self.lock()?;
        if state.close(id, status, error_code)?.is_none() {
            return Ok(None);
        }
        Ok(Some(state.return_charge(id).unwrap_or(0)))
    }

    async fn advance_cursor(&self, id: SessionId, pass: u32) -> Result<(), PipelineError> {
        let mut state = self.lock()?;
        if let Some(session) = state.sessions.get_mut(&id) {
            session.delivery_cursor = session.delivery_cursor.max(pass);
        }
        Ok(())
    }

    async fn record_turn(
        &self,
        project_id: DbId,
        role: ChatRole,
        content: &str,
    ) -> Result<(), PipelineError> {
        let mut state = self.lock()?;
        let project = state
            .projects
            .get_mut(&project_id)
            .ok_or_else(|| PipelineError::from(CoreError::not_found("Project", project_id)))?;
        project.turns.push(ChatMessage {
            role,
            content: content.to_string(),
        });
        Ok(())
    }

    async fn stale_interrupted(
        &self,
        cutoff: Timestamp,
    ) -> Result<Vec<GenerationSession>, PipelineError> {
        let state = self.lock()?;
        Ok(state
            .sessions
            .values()
            .filter(|s| {
                s.status == SessionStatus::Interrupted
                    && s.closed_at.is_none()
                    && s.interrupted_at.is_some_and(|at| at < cutoff)
            })
            .cloned()
            .collect())
    }

    async fn orphaned_running(&self) -> Result<Vec<SessionId>, PipelineError> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let mut ids = Vec::new();
        for session in state.sessions.values_mut() {
            if session.closed_at.is_none() && session.status.is_running() {
                session.status = SessionStatus::Interrupted;
                session.interrupted_at = Some(now);
                session.updated_at = now;
                ids.push(session.id);
            }
        }
        Ok(ids)
    }

    async fn balance(&self, account_id: DbId) -> Result<Option<i32>, PipelineError> {
        Ok(self.lock()?.accounts.get(&account_id).map(|a| a.balance))
    }

    async fn recent_ledger(
        &self,
        account_id: DbId,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, PipelineError> {
        let state = self.lock()?;
        Ok(state
            .ledger
            .iter()
            .rev()
            .filter(|(owner, _)| *owner == account_id)
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect())
    }
}
