//! Refinement orchestrator.
//!
//! Drives one session through its passes in order: pass 1 generates from the
//! assembled request, every later pass critiques and rewrites the previous
//! pass's document. Each finished pass is committed as a snapshot before the
//! next one starts, so a session that stops for any reason can be resumed
//! from the first uncommitted pass.

use std::sync::Arc;

use pagecraft_core::assembly::{extract_document, refine_request, AssembledPrompt};
use pagecraft_core::error::GenerationErrorCode;
use pagecraft_core::resume::terminal_event;
use pagecraft_core::session::{
    failure_outcome, status_for_pass, FailureOutcome, GenerationSession, SessionStatus,
};
use pagecraft_core::stream::StreamEvent;
use pagecraft_core::types::SessionId;
use pagecraft_events::bus::{self, EventBus, GenerationEvent};
use pagecraft_llm::{ModelClient, ModelRequest};

use crate::error::PipelineError;
use crate::hub::{SessionControl, StopReason, StreamHub};
use crate::store::GenerationStore;

/// How a single pass ended.
enum PassOutcome {
    Output(String),
    Failed(GenerationErrorCode),
    Stopped(StopReason),
}

pub struct Orchestrator {
    store: Arc<dyn GenerationStore>,
    client: Arc<dyn ModelClient>,
    hub: Arc<StreamHub>,
    events: Arc<EventBus>,
    model: String,
    max_tokens: u32,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn GenerationStore>,
        client: Arc<dyn ModelClient>,
        hub: Arc<StreamHub>,
        events: Arc<EventBus>,
        model: impl Into<String>,
        max_tokens: u32,
    ) -> Self {
        Self {
            store,
            client,
            hub,
            events,
            model: model.into(),
            max_tokens,
        }
    }

    /// Run `session` from `from_pass` until it closes or is stopped, then
    /// release it from the hub.
    pub async fn run(
        &self,
        session: GenerationSession,
        from_pass: u32,
        control: Arc<SessionControl>,
    ) {
        let id = session.id;
        tracing::info!(
            session_id = %id,
            from_pass,
            passes_total = session.passes_total,
            "Generation started"
        );

        if let Err(e) = self.drive(&session, from_pass, &control).await {
            tracing::error!(session_id = %id, error = %e, "Generation driver failed");
            let completed = match self.store.find_session(id).await {
                Ok(Some(current)) => current.passes_completed,
                _ => session.passes_completed,
            };
            // Every pass is committed when only the final close failed.
            let closed = if completed >= session.passes_total {
                self.complete(&session).await
            } else {
                self.fail(&session, completed, GenerationErrorCode::StreamError).await
            };
            if let Err(e) = closed {
                tracing::error!(
                    session_id = %id,
                    error = %e,
                    "Failed to close session after driver error"
                );
                self.hub.emit(id, StreamEvent::failed(GenerationErrorCode::StreamError));
            }
        }

        self.hub.release(id);
    }

    async fn drive(
        &self,
        session: &GenerationSession,
        from_pass: u32,
        control: &SessionControl,
    ) -> Result<(), PipelineError> {
        let id = session.id;
        let mut previous = if from_pass > 1 {
            self.store.latest_snapshot(id).await?.map(|s| s.html)
        } else {
            None
        };

        if from_pass > session.passes_total {
            // Restarted with every pass committed; re-enter the last pass's
            // status so the session can close as COMPLETE.
            if !self.store.set_status(id, status_for_pass(session.passes_total)).await? {
                return self.emit_closed(id).await;
            }
        }

        for pass in from_pass..=session.passes_total {
            let status = status_for_pass(pass);
            if !self.store.set_status(id, status).await? {
                return self.emit_closed(id).await;
            }
            self.hub.emit(id, StreamEvent::Status { status, pass });
            self.publish(
                GenerationEvent::new(bus::STATUS_CHANGED, id, session.project_id)
                    .with_status(status)
                    .with_pass(pass),
            );

            let prompt = match &previous {
                Some(html) => refine_request(&session.request.system, html),
                None => session.request.clone(),
            };

            match self.run_pass(id, pass, prompt, control).await {
                PassOutcome::Output(text) => {
                    let Some(html) = extract_document(&text) else {
                        tracing::warn!(session_id = %id, pass, "Pass produced no document");
                        return self.fail(session, pass - 1, GenerationErrorCode::StreamError).await;
                    };
                    if !self.store.commit_snapshot(id, pass, &html).await? {
                        return self.emit_closed(id).await;
                    }
                    self.hub.emit(
                        id,
                        StreamEvent::Snapshot {
                            pass,
                            html: html.clone(),
                        },
                    );
                    self.publish(
                        GenerationEvent::new(bus::SNAPSHOT_COMMITTED, id, session.project_id)
                            .with_pass(pass),
                    );
                    previous = Some(html);
                }
                PassOutcome::Failed(code) => return self.fail(session, pass - 1, code).await,
                PassOutcome::Stopped(reason) => return self.stop(session, pass, reason).await,
            }
        }

        self.complete(session).await
    }

    /// Stream one pass, racing the model call against the stop signal.
    async fn run_pass(
        &self,
        id: SessionId,
        pass: u32,
        prompt: AssembledPrompt,
        control: &SessionControl,
    ) -> PassOutcome {
        let request = ModelRequest::new(self.model.clone(), self.max_tokens, prompt);
        let hub = &self.hub;
        let mut seq: u64 = 0;
        let mut on_chunk = |text: &str| {
            hub.emit(
                id,
                StreamEvent::Chunk {
                    pass,
                    seq,
                    text: text.to_string(),
                },
            );
            seq += 1;
        };

        tokio::select! {
            biased;
            _ = control.stopped() => PassOutcome::Stopped(control.reason()),
            result = self.client.stream(&request, &mut on_chunk) => match result {
                Ok(completion) => PassOutcome::Output(completion.text),
                Err(e) => {
                    tracing::warn!(session_id = %id, pass, error = %e, "Model pass failed");
                    PassOutcome::Failed(e.error_code())
                }
            },
        }
    }

    async fn complete(&self, session: &GenerationSession) -> Result<(), PipelineError> {
        let id = session.id;
        if !self.store.finish(id, SessionStatus::Complete, None).await? {
            return self.emit_closed(id).await;
        }
        self.publish(
            GenerationEvent::new(bus::SESSION_COMPLETED, id, session.project_id)
                .with_status(SessionStatus::Complete)
                .with_pass(session.passes_total),
        );
        self.hub.emit(
            id,
            StreamEvent::Complete {
                passes_completed: session.passes_total,
                degraded: None,
            },
        );
        tracing::info!(session_id = %id, passes = session.passes_total, "Generation complete");
        Ok(())
    }

    /// Close a session after a pass error. `completed` is the number of
    /// passes committed before the failing one.
    async fn fail(
        &self,
        session: &GenerationSession,
        completed: u32,
        code: GenerationErrorCode,
    ) -> Result<(), PipelineError> {
        let id = session.id;
        let outcome = failure_outcome(completed, code);
        let (status, error_code) = (outcome.status(), Some(outcome.code()));

        if outcome.refunds() {
            let Some(amount) = self.store.finish_with_refund(id, status, error_code).await? else {
                return self.emit_closed(id).await;
            };
            tracing::info!(session_id = %id, amount, "Refunded generation charge");
            self.publish(
                GenerationEvent::new(bus::CREDITS_REFUNDED, id, session.project_id)
                    .with_account(session.account_id),
            );
        } else if !self.store.finish(id, status, error_code).await? {
            return self.emit_closed(id).await;
        }

        let (event_type, event) = match outcome {
            FailureOutcome::CompleteWithLastSnapshot { code } => (
                bus::SESSION_COMPLETED,
                StreamEvent::Complete {
                    passes_completed: completed,
                    degraded: Some(code),
                },
            ),
            other => (bus::SESSION_FAILED, StreamEvent::failed(other.code())),
        };
        self.publish(
            GenerationEvent::new(event_type, id, session.project_id)
                .with_status(outcome.status())
                .with_pass(completed)
                .with_error(outcome.code()),
        );
        self.hub.emit(id, event);
        tracing::warn!(
            session_id = %id,
            completed,
            code = %outcome.code(),
            status = %outcome.status(),
            "Generation ended early"
        );
        Ok(())
    }

    /// React to a stop request arriving while `pass` was in flight.
    async fn stop(
        &self,
        session: &GenerationSession,
        pass: u32,
        reason: StopReason,
    ) -> Result<(), PipelineError> {
        let id = session.id;
        match reason {
            StopReason::Cancelled => {
                // The cancel request normally closes the session before
                // signalling; closing here covers the case it did not.
                self.store
                    .finish(
                        id,
                        SessionStatus::Interrupted,
                        Some(GenerationErrorCode::StreamInterrupted),
                    )
                    .await?;
                self.hub.emit(
                    id,
                    StreamEvent::Interrupted {
                        code: GenerationErrorCode::StreamInterrupted,
                        resume_from_pass: pass,
                        resumable: false,
                    },
                );
                tracing::info!(session_id = %id, pass, "Generation cancelled");
            }
            StopReason::Disconnected | StopReason::Shutdown => {
                if !self.store.set_status(id, SessionStatus::Interrupted).await? {
                    return self.emit_closed(id).await;
                }
                self.publish(
                    GenerationEvent::new(bus::SESSION_INTERRUPTED, id, session.project_id)
                        .with_status(SessionStatus::Interrupted)
                        .with_pass(pass),
                );
                self.hub.emit(
                    id,
                    StreamEvent::Interrupted {
                        code: GenerationErrorCode::StreamInterrupted,
                        resume_from_pass: pass,
                        resumable: true,
                    },
                );
                tracing::info!(session_id = %id, pass, ?reason, "Generation interrupted");
            }
        }
        Ok(())
    }

    /// The session was closed by someone else; tell the reader how it ended.
    async fn emit_closed(&self, id: SessionId) -> Result<(), PipelineError> {
        if let Some(event) = self.store.find_session(id).await?.as_ref().and_then(terminal_event) {
            self.hub.emit(id, event);
        }
        tracing::debug!(session_id = %id, "Session closed by another actor");
        Ok(())
    }

    fn publish(&self, event: GenerationEvent) {
        self.events.publish(event);
    }
}
