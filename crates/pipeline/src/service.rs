//! Generation service.
//!
//! The entry point the HTTP layer talks to. `open` runs everything that must
//! happen before a credit is charged (rate limit, validation and
//! sanitization, entitlement, lock and balance pre-checks, brief synthesis,
//! prompt assembly), opens the charged session and starts its orchestrator.
//! `resume`, `cancel`, `session` and `credits` operate on existing sessions.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use pagecraft_core::assembly::{assemble, ChatRole, ConversationContext, SystemTemplate};
use pagecraft_core::error::{CoreError, GenerationErrorCode};
use pagecraft_core::policy::plan_for;
use pagecraft_core::prompt::Prompt;
use pagecraft_core::resume::{plan_resume, ResumeNext};
use pagecraft_core::session::{GenerationSession, NewSession, SessionStatus, Snapshot};
use pagecraft_core::stream::StreamEvent;
use pagecraft_core::types::{DbId, SessionId, Timestamp};
use pagecraft_events::bus::{self, EventBus, GenerationEvent};
use pagecraft_llm::ModelClient;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::PipelineError;
use crate::hub::{Reader, SessionControl, StreamHub};
use crate::orchestrator::Orchestrator;
use crate::rate_limit::RateLimiter;
use crate::store::{GenerationStore, LedgerEntry};
use crate::synthesizer::BriefSynthesizer;

/// Number of ledger entries returned with a credit summary.
const LEDGER_PAGE: usize = 20;

/// Stream of events for one reader. Dropping it detaches the reader.
pub type SessionStream = BoxStream<'static, StreamEvent>;

/// Model settings for generation.
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    /// Model used for the page passes.
    pub model: String,
    /// Model used for brief synthesis.
    pub brief_model: String,
    /// Output token limit per pass.
    pub max_tokens: u32,
}

/// Balance plus recent ledger activity for an account.
#[derive(Debug, Clone, Serialize)]
pub struct CreditSummary {
    pub balance: i32,
    pub entries: Vec<LedgerEntry>,
}

pub struct GenerationService {
    store: Arc<dyn GenerationStore>,
    hub: Arc<StreamHub>,
    events: Arc<EventBus>,
    limiter: Arc<dyn RateLimiter>,
    synthesizer: BriefSynthesizer,
    orchestrator: Arc<Orchestrator>,
    template: SystemTemplate,
    tasks: TaskTracker,
}

impl GenerationService {
    /// `shutdown` is the parent of every session's stop signal.
    pub fn new(
        store: Arc<dyn GenerationStore>,
        client: Arc<dyn ModelClient>,
        events: Arc<EventBus>,
        limiter: Arc<dyn RateLimiter>,
        template: SystemTemplate,
        settings: GenerationSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let hub = Arc::new(StreamHub::new(shutdown));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            client.clone(),
            hub.clone(),
            events.clone(),
            settings.model,
            settings.max_tokens,
        ));
        Self {
            synthesizer: BriefSynthesizer::new(client, settings.brief_model),
            store,
            hub,
            events,
            limiter,
            orchestrator,
            template,
            tasks: TaskTracker::new(),
        }
    }

    pub fn hub(&self) -> &Arc<StreamHub> {
        &self.hub
    }

    // -----------------------------------------------------------------------
    // Open
    // -----------------------------------------------------------------------

    /// Start a generation for `project_id` and return its live stream.
    ///
    /// Every check that can reject the request runs before the charge; a
    /// rejected request leaves no session and no ledger entry behind.
    pub async fn open(
        &self,
        account_id: DbId,
        project_id: DbId,
        raw_prompt: &str,
    ) -> Result<SessionStream, PipelineError> {
        if !self.limiter.check(account_id) {
            tracing::info!(account_id, "Generation request rate limited");
            return Err(GenerationErrorCode::RateLimited.into());
        }

        let prompt = Prompt::new(raw_prompt)?;
        if prompt.is_flagged() {
            tracing::info!(account_id, project_id, "Prompt contained injection patterns, fenced");
        }

        let ctx = self.store.load_project_context(project_id).await?;
        if ctx.account_id != account_id {
            return Err(PipelineError::not_found("Project", project_id));
        }
        let plan = plan_for(ctx.tier)?;
        if ctx.active_session.is_some() {
            return Err(GenerationErrorCode::GenerationInProgress.into());
        }
        if ctx.balance < plan.cost {
            return Err(GenerationErrorCode::CreditsExhausted.into());
        }

        let (brief, brief_fallback) = self.synthesizer.synthesize(prompt.sanitized()).await;
        let request = assemble(
            &self.template,
            &brief,
            &ConversationContext {
                history: ctx.history,
                request: prompt.sanitized().to_string(),
            },
        );

        let session = self
            .store
            .open_session(NewSession {
                project_id,
                account_id,
                tier: plan.tier,
                mode: plan.mode,
                credit_cost: plan.cost,
                passes_total: plan.passes,
                brief,
                brief_fallback,
                request,
            })
            .await?;

        if let Err(e) = self
            .store
            .record_turn(project_id, ChatRole::User, prompt.sanitized())
            .await
        {
            tracing::warn!(
                session_id = %session.id,
                error = %e,
                "Failed to record conversation turn"
            );
        }

        self.events.publish(
            GenerationEvent::new(bus::SESSION_OPENED, session.id, project_id)
                .with_account(account_id)
                .with_status(SessionStatus::Pending),
        );
        tracing::info!(
            session_id = %session.id,
            project_id,
            account_id,
            mode = plan.mode.as_str(),
            cost = plan.cost,
            passes = plan.passes,
            prompt_chars = prompt.char_len(),
            brief_fallback,
            "Generation session opened"
        );

        let (reader, control) = self.hub.open(session.id).ok_or_else(|| {
            PipelineError::from(CoreError::Internal(format!("session {} already live", session.id)))
        })?;
        self.spawn(session, 1, control);
        Ok(self.into_stream(reader))
    }

    // -----------------------------------------------------------------------
    // Resume
    // -----------------------------------------------------------------------

    /// Reconnect to a session.
    ///
    /// `cursor` is the highest snapshot pass the caller already holds; when
    /// absent the stored delivery cursor is used. A snapshot is redelivered
    /// only when it is newer than the cursor. A session that nothing in this
    /// process is driving is restarted from its first uncommitted pass.
    pub async fn resume(
        &self,
        account_id: DbId,
        session_id: SessionId,
        cursor: Option<u32>,
    ) -> Result<SessionStream, PipelineError> {
        let session = self.owned_session(account_id, session_id).await?;
        let cursor = cursor.unwrap_or(session.delivery_cursor);
        let latest = self.store.latest_snapshot(session_id).await?;
        let plan = plan_resume(
            &session,
            latest.as_ref().map(|s| s.pass),
            cursor,
            self.hub.is_live(session_id),
        );

        tracing::info!(session_id = %session_id, cursor, ?plan, "Resuming generation stream");

        match plan.next {
            ResumeNext::Terminal(event) => {
                let mut events = Vec::with_capacity(2);
                let replayed = latest.filter(|_| plan.replay.is_some());
                if let Some(Snapshot { pass, html, .. }) = replayed {
                    events.push(StreamEvent::Snapshot { pass, html });
                }
                events.push(event);
                Ok(self.into_stream(Reader::detached(session_id, events)))
            }
            ResumeNext::Attach | ResumeNext::Restart { .. } => {
                let (reader, registered) = self.hub.attach_or_register(session_id, cursor, latest);
                if let Some(control) = registered {
                    let from_pass = session.next_pass();
                    tracing::info!(session_id = %session_id, from_pass, "Restarting generation");
                    self.spawn(session, from_pass, control);
                }
                Ok(self.into_stream(reader))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Cancel, views
    // -----------------------------------------------------------------------

    /// Cancel a session. Closes it and releases the project lock at once;
    /// an in-flight pass is stopped. Cancelling a closed session changes
    /// nothing.
    pub async fn cancel(
        &self,
        account_id: DbId,
        session_id: SessionId,
    ) -> Result<GenerationSession, PipelineError> {
        let session = self.owned_session(account_id, session_id).await?;
        if session.is_closed() {
            return Ok(session);
        }

        let closed = self
            .store
            .finish(
                session_id,
                SessionStatus::Interrupted,
                Some(GenerationErrorCode::StreamInterrupted),
            )
            .await?;
        if closed {
            self.events.publish(
                GenerationEvent::new(bus::SESSION_CANCELLED, session_id, session.project_id)
                    .with_account(account_id)
                    .with_status(SessionStatus::Interrupted)
                    .with_error(GenerationErrorCode::StreamInterrupted),
            );
            tracing::info!(session_id = %session_id, "Generation cancelled by owner");
        }
        self.hub.cancel(session_id);

        self.owned_session(account_id, session_id).await
    }

    /// A session record, visible only to its owner.
    pub async fn session(
        &self,
        account_id: DbId,
        session_id: SessionId,
    ) -> Result<GenerationSession, PipelineError> {
        self.owned_session(account_id, session_id).await
    }

    pub async fn credits(&self, account_id: DbId) -> Result<CreditSummary, PipelineError> {
        let balance = self
            .store
            .balance(account_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("Account", account_id))?;
        let entries = self.store.recent_ledger(account_id, LEDGER_PAGE).await?;
        Ok(CreditSummary { balance, entries })
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Close INTERRUPTED sessions that have waited for a reconnect since
    /// before `cutoff`. Their latest snapshot becomes the project's page.
    pub async fn expire_stale(&self, cutoff: Timestamp) -> Result<usize, PipelineError> {
        let mut expired = 0;
        for session in self.store.stale_interrupted(cutoff).await? {
            if self.hub.is_live(session.id) {
                continue;
            }
            let closed = self
                .store
                .finish(
                    session.id,
                    SessionStatus::Interrupted,
                    Some(GenerationErrorCode::StreamInterrupted),
                )
                .await?;
            if closed {
                expired += 1;
                self.events.publish(
                    GenerationEvent::new(bus::SESSION_EXPIRED, session.id, session.project_id)
                        .with_account(session.account_id)
                        .with_status(SessionStatus::Interrupted)
                        .with_pass(session.passes_completed),
                );
            }
        }
        if expired > 0 {
            tracing::info!(expired, "Expired interrupted generation sessions");
        }
        Ok(expired)
    }

    /// Mark sessions left running by a previous process as INTERRUPTED so
    /// their owners can resume them.
    pub async fn recover_orphans(&self) -> Result<usize, PipelineError> {
        let ids = self.store.orphaned_running().await?;
        for id in &ids {
            tracing::warn!(session_id = %id, "Recovered orphaned generation session");
        }
        Ok(ids.len())
    }

    /// Stop every live session, leaving each resumable, and wait for their
    /// orchestrators to exit.
    pub async fn shutdown(&self) {
        self.hub.shutdown_all();
        self.tasks.close();
        self.tasks.wait().await;
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn owned_session(
        &self,
        account_id: DbId,
        session_id: SessionId,
    ) -> Result<GenerationSession, PipelineError> {
        match self.store.find_session(session_id).await? {
            Some(session) if session.account_id == account_id => Ok(session),
            _ => Err(PipelineError::not_found("GenerationSession", session_id)),
        }
    }

    fn spawn(&self, session: GenerationSession, from_pass: u32, control: Arc<SessionControl>) {
        let orchestrator = self.orchestrator.clone();
        self.tasks
            .spawn(async move { orchestrator.run(session, from_pass, control).await });
    }

    /// Wrap a reader as a stream that records delivered snapshots on the
    /// durable cursor and detaches from the hub when dropped.
    ///
    /// A snapshot counts as delivered only once the consumer pulls the event
    /// after it (or the end of the stream), so one lost in a disconnect is
    /// redelivered from the stored cursor rather than skipped. Clients that
    /// echo `Last-Event-ID` resume from the exact snapshot they hold.
    fn into_stream(&self, reader: Reader) -> SessionStream {
        let guard = DetachGuard {
            hub: self.hub.clone(),
            session_id: reader.session_id,
            attach_id: reader.attach_id(),
        };
        let store = self.store.clone();

        stream::unfold(
            (reader, guard, store, None::<u32>),
            |(mut reader, guard, store, handed_out)| async move {
                if let Some(pass) = handed_out {
                    if let Err(e) = store.advance_cursor(reader.session_id, pass).await {
                        tracing::warn!(
                            session_id = %reader.session_id,
                            error = %e,
                            "Failed to advance delivery cursor"
                        );
                    }
                }
                let event = reader.recv().await?;
                let handed_out = match &event {
                    StreamEvent::Snapshot { pass, .. } => Some(*pass),
                    _ => None,
                };
                Some((event, (reader, guard, store, handed_out)))
            },
        )
        .boxed()
    }
}

/// Detaches a reader from the hub when its stream is dropped.
struct DetachGuard {
    hub: Arc<StreamHub>,
    session_id: SessionId,
    attach_id: u64,
}

impl Drop for DetachGuard {
    fn drop(&mut self) {
        self.hub.detach(self.session_id, self.attach_id);
    }
}
