//! End-to-end generation scenarios against the in-memory store and a
//! scripted model client.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use pagecraft_core::assembly::{AssembledPrompt, ChatRole, SystemTemplate};
use pagecraft_core::brief::Brief;
use pagecraft_core::error::{CoreError, GenerationErrorCode};
use pagecraft_core::policy::{GenerationMode, Tier};
use pagecraft_core::session::{GenerationSession, NewSession, SessionStatus, Snapshot};
use pagecraft_core::stream::StreamEvent;
use pagecraft_core::types::{DbId, SessionId, Timestamp};
use pagecraft_events::bus;
use pagecraft_events::EventBus;
use pagecraft_llm::{ChunkSink, Completion, LlmError, ModelClient, ModelRequest};
use pagecraft_pipeline::store::{LedgerEntry, ProjectContext};
use pagecraft_pipeline::{
    FixedWindowLimiter, GenerationService, GenerationSettings, GenerationStore,
    MemoryGenerationStore, PipelineError, RateLimiter, SessionStream, Unlimited,
};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Scripted model
// ---------------------------------------------------------------------------

const BRIEF: &str = "BRAND: Crumb | Bread worth waking up for\n\
                     STYLE: warm, rustic, editorial\n\
                     PALETTE: #FFF8F0, #F2E3D5, #C26A3D, #2B1D14\n\
                     VIBE: cozy, artisanal\n\
                     TYPE: product";

enum Step {
    Reply(&'static str),
    Fail(LlmError),
    /// Never finishes; only a stop signal ends the pass.
    Hang,
}

struct ScriptedClient {
    brief: &'static str,
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedClient {
    fn new(brief: &'static str, steps: Vec<Step>) -> Self {
        Self {
            brief,
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, step: Step) {
        self.steps.lock().unwrap().push_back(step);
    }

    fn stream_requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn complete(&self, _request: &ModelRequest) -> Result<Completion, LlmError> {
        Ok(Completion {
            text: self.brief.to_string(),
        })
    }

    async fn stream(
        &self,
        request: &ModelRequest,
        on_chunk: ChunkSink<'_>,
    ) -> Result<Completion, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        let step = self.steps.lock().unwrap().pop_front().expect("script exhausted");
        match step {
            Step::Reply(text) => {
                let (head, tail) = text.split_at(text.len() / 2);
                on_chunk(head);
                on_chunk(tail);
                Ok(Completion { text: text.into() })
            }
            Step::Fail(e) => Err(e),
            Step::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Store that fails on demand
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Write {
    CommitSnapshot,
    Finish,
    FinishWithRefund,
}

/// Delegates to the memory store, failing chosen writes without applying
/// them.
struct FlakyStore {
    inner: Arc<MemoryGenerationStore>,
    /// Per write: calls to let through, then calls to fail.
    armed: Mutex<HashMap<Write, (u32, u32)>>,
}

impl FlakyStore {
    fn new(inner: Arc<MemoryGenerationStore>) -> Self {
        Self {
            inner,
            armed: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the call of `write` that follows `skip` successful ones.
    fn fail_once(&self, write: Write, skip: u32) {
        self.armed.lock().unwrap().insert(write, (skip, 1));
    }

    fn check(&self, write: Write) -> Result<(), PipelineError> {
        let mut armed = self.armed.lock().unwrap();
        match armed.get_mut(&write) {
            Some((skip, _)) if *skip > 0 => {
                *skip -= 1;
                Ok(())
            }
            Some((_, fails)) if *fails > 0 => {
                *fails -= 1;
                Err(CoreError::Internal(format!("{write:?} unavailable")).into())
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl GenerationStore for FlakyStore {
    async fn load_project_context(
        &self,
        project_id: DbId,
    ) -> Result<ProjectContext, PipelineError> {
        self.inner.load_project_context(project_id).await
    }

    async fn open_session(&self, input: NewSession) -> Result<GenerationSession, PipelineError> {
        self.inner.open_session(input).await
    }

    async fn find_session(
        &self,
        id: SessionId,
    ) -> Result<Option<GenerationSession>, PipelineError> {
        self.inner.find_session(id).await
    }

    async fn latest_snapshot(&self, id: SessionId) -> Result<Option<Snapshot>, PipelineError> {
        self.inner.latest_snapshot(id).await
    }

    async fn set_status(
        &self,
        id: SessionId,
        status: SessionStatus,
    ) -> Result<bool, PipelineError> {
        self.inner.set_status(id, status).await
    }

    async fn commit_snapshot(
        &self,
        id: SessionId,
        pass: u32,
        html: &str,
    ) -> Result<bool, PipelineError> {
        self.check(Write::CommitSnapshot)?;
        self.inner.commit_snapshot(id, pass, html).await
    }

    async fn finish(
        &self,
        id: SessionId,
        status: SessionStatus,
        error_code: Option<GenerationErrorCode>,
    ) -> Result<bool, PipelineError> {
        self.check(Write::Finish)?;
        self.inner.finish(id, status, error_code).await
    }

    async fn finish_with_refund(
        &self,
        id: SessionId,
        status: SessionStatus,
        error_code: Option<GenerationErrorCode>,
    ) -> Result<Option<i32>, PipelineError> {
        self.check(Write::FinishWithRefund)?;
        self.inner.finish_with_refund(id, status, error_code).await
    }

    async fn advance_cursor(&self, id: SessionId, pass: u32) -> Result<(), PipelineError> {
        self.inner.advance_cursor(id, pass).await
    }

    async fn record_turn(
        &self,
        project_id: DbId,
        role: ChatRole,
        content: &str,
    ) -> Result<(), PipelineError> {
        self.inner.record_turn(project_id, role, content).await
    }

    async fn stale_interrupted(
        &self,
        cutoff: Timestamp,
    ) -> Result<Vec<GenerationSession>, PipelineError> {
        self.inner.stale_interrupted(cutoff).await
    }

    async fn orphaned_running(&self) -> Result<Vec<SessionId>, PipelineError> {
        self.inner.orphaned_running().await
    }

    async fn balance(&self, account_id: DbId) -> Result<Option<i32>, PipelineError> {
        self.inner.balance(account_id).await
    }

    async fn recent_ledger(
        &self,
        account_id: DbId,
        limit: usize,
    ) -> Result<Vec<LedgerEntry>, PipelineError> {
        self.inner.recent_ledger(account_id, limit).await
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    store: Arc<MemoryGenerationStore>,
    flaky: Arc<FlakyStore>,
    client: Arc<ScriptedClient>,
    events: Arc<EventBus>,
    service: GenerationService,
    account: DbId,
    project: DbId,
}

fn harness_with(
    tier: Tier,
    balance: i32,
    client: ScriptedClient,
    limiter: Arc<dyn RateLimiter>,
) -> Harness {
    let store = Arc::new(MemoryGenerationStore::new());
    let account = store.add_account(tier, balance);
    let project = store.add_project(account);
    let flaky = Arc::new(FlakyStore::new(store.clone()));
    let client = Arc::new(client);
    let events = Arc::new(EventBus::default());
    let service = GenerationService::new(
        flaky.clone(),
        client.clone(),
        events.clone(),
        limiter,
        SystemTemplate::from_text("You build landing pages.\n\n{brief}").unwrap(),
        GenerationSettings {
            model: "page-model".into(),
            brief_model: "brief-model".into(),
            max_tokens: 4096,
        },
        CancellationToken::new(),
    );
    Harness {
        store,
        flaky,
        client,
        events,
        service,
        account,
        project,
    }
}

fn harness(tier: Tier, balance: i32, steps: Vec<Step>) -> Harness {
    harness_with(tier, balance, ScriptedClient::new(BRIEF, steps), Arc::new(Unlimited))
}

async fn collect(stream: SessionStream) -> Vec<StreamEvent> {
    tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
        .await
        .expect("stream did not finish")
}

/// Read events until one matches, returning everything read so far.
async fn read_until(
    stream: &mut SessionStream,
    stop: impl Fn(&StreamEvent) -> bool,
) -> Vec<StreamEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("no event")
            .expect("stream ended early");
        let done = stop(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

async fn wait_until_released(h: &Harness, id: SessionId) {
    for _ in 0..500 {
        if !h.service.hub().is_live(id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {id} never released");
}

async fn active_session(h: &Harness) -> Option<SessionId> {
    h.store.load_project_context(h.project).await.unwrap().active_session
}

fn snapshot_passes(events: &[StreamEvent]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Snapshot { pass, .. } => Some(*pass),
            _ => None,
        })
        .collect()
}

fn code_of<T>(result: Result<T, PipelineError>) -> Option<GenerationErrorCode> {
    result.err().and_then(|e| e.code())
}

// ---------------------------------------------------------------------------
// Charging and completion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn enhanced_generation_charges_once_and_commits_final_pass() {
    let h = harness(
        Tier::Enhanced,
        10,
        vec![Step::Reply("<html>p1</html>"), Step::Reply("<html>p2</html>")],
    );
    let mut bus_rx = h.events.subscribe();

    let stream = h.service.open(h.account, h.project, "A bakery in Lisbon").await.unwrap();
    let session_id = active_session(&h).await.expect("session holds the lock");
    let events = collect(stream).await;

    assert_eq!(snapshot_passes(&events), vec![1, 2]);
    assert_matches!(
        events.last(),
        Some(StreamEvent::Complete {
            passes_completed: 2,
            degraded: None
        })
    );

    // Chunks of each pass arrive in sequence order.
    let pass1_seqs: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Chunk { pass: 1, seq, .. } => Some(*seq),
            _ => None,
        })
        .collect();
    assert_eq!(pass1_seqs, vec![0, 1]);

    let session = h.store.find_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Complete);
    assert_eq!(session.passes_completed, 2);
    assert_eq!(session.delivery_cursor, 2);
    assert!(!session.brief_fallback);
    assert_eq!(h.store.snapshot_passes(session_id), vec![1, 2]);
    assert_eq!(h.store.balance(h.account).await.unwrap(), Some(8));
    assert_eq!(h.store.session_ledger(session_id), vec![-2]);
    assert_eq!(h.store.committed_html(h.project).as_deref(), Some("<html>p2</html>"));

    // Snapshot 1 is the literal input of pass 2.
    let requests = h.client.stream_requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].messages[0].content.ends_with("<html>p1</html>"));

    let opened = bus_rx.recv().await.unwrap();
    assert_eq!(opened.event_type, bus::SESSION_OPENED);
    assert_eq!(opened.session_id, session_id);
}

#[tokio::test]
async fn first_pass_failure_fails_and_refunds() {
    let h = harness(
        Tier::Enhanced,
        10,
        vec![Step::Fail(LlmError::Api {
            status: 502,
            body: "upstream exploded".into(),
        })],
    );

    let stream = h.service.open(h.account, h.project, "A bakery").await.unwrap();
    let session_id = active_session(&h).await.unwrap();
    let events = collect(stream).await;

    assert_matches!(
        events.last(),
        Some(StreamEvent::Failed { code: GenerationErrorCode::ApiError, message })
            if !message.contains("exploded")
    );
    let session = h.store.find_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.error_code, Some(GenerationErrorCode::ApiError));
    assert_eq!(h.store.balance(h.account).await.unwrap(), Some(10));
    assert_eq!(h.store.session_ledger(session_id), vec![-2, 2]);
    assert_eq!(h.store.committed_html(h.project), None);
    assert_eq!(active_session(&h).await, None);
}

#[tokio::test]
async fn unparsable_brief_uses_fallback_and_still_streams() {
    let client = ScriptedClient::new(
        "Sure! Here's a brief for you.",
        vec![Step::Reply("<html>ok</html>")],
    );
    let h = harness_with(Tier::Refined, 5, client, Arc::new(Unlimited));

    let stream = h.service.open(h.account, h.project, "A bakery").await.unwrap();
    let session_id = active_session(&h).await.unwrap();
    let events = collect(stream).await;

    assert_matches!(
        events.first(),
        Some(StreamEvent::Status {
            status: SessionStatus::Streaming,
            pass: 1
        })
    );
    let session = h.store.find_session(session_id).await.unwrap().unwrap();
    assert!(session.brief_fallback);
    assert_eq!(session.brief, Brief::fallback());
    assert_eq!(session.status, SessionStatus::Complete);
}

// ---------------------------------------------------------------------------
// Rejections before the charge
// ---------------------------------------------------------------------------

#[tokio::test]
async fn validation_and_entitlement_errors_leave_no_trace() {
    let h = harness(Tier::Enhanced, 10, vec![]);
    assert_eq!(
        code_of(h.service.open(h.account, h.project, "   ").await),
        Some(GenerationErrorCode::EmptyPrompt)
    );
    let too_long = "x".repeat(10_001);
    assert_eq!(
        code_of(h.service.open(h.account, h.project, &too_long).await),
        Some(GenerationErrorCode::PromptTooLong)
    );

    let free = harness(Tier::Free, 10, vec![]);
    assert_eq!(
        code_of(free.service.open(free.account, free.project, "A bakery").await),
        Some(GenerationErrorCode::UpgradeRequired)
    );

    let broke = harness(Tier::Ultimate, 3, vec![]);
    assert_eq!(
        code_of(broke.service.open(broke.account, broke.project, "A bakery").await),
        Some(GenerationErrorCode::CreditsExhausted)
    );

    for x in [&h, &free, &broke] {
        assert_eq!(active_session(x).await, None);
        assert!(x.service.credits(x.account).await.unwrap().entries.is_empty());
    }
    assert!(h.client.stream_requests().is_empty());
}

#[tokio::test]
async fn rate_limit_applies_before_validation() {
    let limiter = Arc::new(FixedWindowLimiter::per_minute(1));
    let h = harness_with(Tier::Enhanced, 10, ScriptedClient::new(BRIEF, vec![]), limiter);

    assert_eq!(
        code_of(h.service.open(h.account, h.project, "").await),
        Some(GenerationErrorCode::EmptyPrompt)
    );
    assert_eq!(
        code_of(h.service.open(h.account, h.project, "").await),
        Some(GenerationErrorCode::RateLimited)
    );
}

#[tokio::test]
async fn foreign_project_is_not_found() {
    let h = harness(Tier::Enhanced, 10, vec![]);
    let stranger = h.store.add_account(Tier::Enhanced, 10);

    let result = h.service.open(stranger, h.project, "A bakery").await;
    assert_matches!(result.err(), Some(PipelineError::Core(CoreError::NotFound { .. })));
}

#[tokio::test]
async fn concurrent_opens_charge_at_most_once() {
    let h = harness(Tier::Enhanced, 10, vec![Step::Hang]);

    let (a, b) = tokio::join!(
        h.service.open(h.account, h.project, "A bakery"),
        h.service.open(h.account, h.project, "A bakery"),
    );
    let opened = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    let rejected = [code_of(a), code_of(b)];

    assert_eq!(opened, 1);
    assert!(rejected.contains(&Some(GenerationErrorCode::GenerationInProgress)));
    assert_eq!(h.store.balance(h.account).await.unwrap(), Some(8));
    assert_eq!(h.service.credits(h.account).await.unwrap().entries.len(), 1);
}

// ---------------------------------------------------------------------------
// Interruption, resume, cancel, expiry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn interrupted_session_resumes_without_redelivering_snapshot() {
    let h = harness(
        Tier::Ultimate,
        10,
        vec![
            Step::Reply("<html>p1</html>"),
            Step::Hang,
            Step::Reply("<html>p2</html>"),
            Step::Reply("<html>p3</html>"),
        ],
    );

    let mut stream = h.service.open(h.account, h.project, "A bakery").await.unwrap();
    let session_id = active_session(&h).await.unwrap();
    read_until(&mut stream, |e| matches!(e, StreamEvent::Status { pass: 2, .. })).await;
    drop(stream);
    wait_until_released(&h, session_id).await;

    let session = h.store.find_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Interrupted);
    assert!(!session.is_closed());
    assert_eq!(session.passes_completed, 1);
    assert_eq!(session.delivery_cursor, 1);
    assert_eq!(h.store.balance(h.account).await.unwrap(), Some(6));

    // The client lost the pass-1 snapshot in flight and reconnects from 0.
    let events = collect(h.service.resume(h.account, session_id, Some(0)).await.unwrap()).await;
    assert_eq!(snapshot_passes(&events), vec![1, 2, 3]);
    assert_matches!(events.first(), Some(StreamEvent::Snapshot { pass: 1, .. }));
    assert_matches!(
        events.last(),
        Some(StreamEvent::Complete {
            passes_completed: 3,
            degraded: None
        })
    );

    // Pass 2 was restarted from the committed pass-1 snapshot.
    let requests = h.client.stream_requests();
    assert_eq!(requests.len(), 4);
    assert!(requests[2].messages[0].content.ends_with("<html>p1</html>"));

    assert_eq!(h.store.balance(h.account).await.unwrap(), Some(6));
    assert_eq!(h.store.session_ledger(session_id), vec![-4]);
    assert_eq!(h.store.committed_html(h.project).as_deref(), Some("<html>p3</html>"));
}

#[tokio::test]
async fn resume_with_stored_cursor_skips_delivered_snapshot() {
    let h = harness(
        Tier::Enhanced,
        10,
        vec![Step::Reply("<html>p1</html>"), Step::Hang, Step::Reply("<html>p2</html>")],
    );

    let mut stream = h.service.open(h.account, h.project, "A bakery").await.unwrap();
    let session_id = active_session(&h).await.unwrap();
    read_until(&mut stream, |e| matches!(e, StreamEvent::Status { pass: 2, .. })).await;
    drop(stream);
    wait_until_released(&h, session_id).await;

    let events = collect(h.service.resume(h.account, session_id, None).await.unwrap()).await;
    assert_eq!(snapshot_passes(&events), vec![2]);
    assert_matches!(
        events.first(),
        Some(StreamEvent::Status {
            status: SessionStatus::Refining,
            pass: 2
        })
    );
}

#[tokio::test]
async fn snapshot_dropped_with_the_connection_is_redelivered() {
    let h = harness(
        Tier::Enhanced,
        10,
        vec![Step::Reply("<html>p1</html>"), Step::Hang, Step::Reply("<html>p2</html>")],
    );

    let mut stream = h.service.open(h.account, h.project, "A bakery").await.unwrap();
    let session_id = active_session(&h).await.unwrap();
    read_until(&mut stream, |e| matches!(e, StreamEvent::Snapshot { pass: 1, .. })).await;
    // Gone before asking for anything after the snapshot.
    drop(stream);
    wait_until_released(&h, session_id).await;

    let session = h.store.find_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.delivery_cursor, 0);

    let events = collect(h.service.resume(h.account, session_id, None).await.unwrap()).await;
    assert_eq!(snapshot_passes(&events), vec![1, 2]);
    assert_matches!(events.first(), Some(StreamEvent::Snapshot { pass: 1, .. }));
}

#[tokio::test]
async fn resuming_a_closed_session_returns_its_terminal_event() {
    let h = harness(Tier::Refined, 10, vec![Step::Reply("<html>done</html>")]);
    let stream = h.service.open(h.account, h.project, "A bakery").await.unwrap();
    let session_id = active_session(&h).await.unwrap();
    collect(stream).await;

    let events = collect(h.service.resume(h.account, session_id, Some(0)).await.unwrap()).await;
    assert_eq!(events.len(), 2);
    assert_matches!(
        &events[0],
        StreamEvent::Snapshot { pass: 1, html } if html == "<html>done</html>"
    );
    assert_matches!(events[1], StreamEvent::Complete { passes_completed: 1, .. });

    let events = collect(h.service.resume(h.account, session_id, Some(1)).await.unwrap()).await;
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn cancel_is_immediate_and_idempotent() {
    let h = harness(Tier::Enhanced, 10, vec![Step::Hang]);

    let mut stream = h.service.open(h.account, h.project, "A bakery").await.unwrap();
    let session_id = active_session(&h).await.unwrap();
    read_until(&mut stream, |e| matches!(e, StreamEvent::Status { .. })).await;

    let cancelled = h.service.cancel(h.account, session_id).await.unwrap();
    assert_eq!(cancelled.status, SessionStatus::Interrupted);
    assert!(cancelled.is_closed());
    assert_eq!(active_session(&h).await, None);

    let rest = collect(stream).await;
    assert_matches!(rest.last(), Some(StreamEvent::Interrupted { resumable: false, .. }));

    let again = h.service.cancel(h.account, session_id).await.unwrap();
    assert_eq!(again.closed_at, cancelled.closed_at);
    assert_eq!(h.store.balance(h.account).await.unwrap(), Some(8));
    assert_eq!(h.store.session_ledger(session_id), vec![-2]);
}

#[tokio::test]
async fn stale_interrupted_sessions_expire_on_last_snapshot() {
    let h = harness(Tier::Enhanced, 10, vec![Step::Reply("<html>p1</html>"), Step::Hang]);

    let mut stream = h.service.open(h.account, h.project, "A bakery").await.unwrap();
    let session_id = active_session(&h).await.unwrap();
    read_until(&mut stream, |e| matches!(e, StreamEvent::Snapshot { pass: 1, .. })).await;
    drop(stream);
    wait_until_released(&h, session_id).await;

    let now = Utc::now();
    assert_eq!(h.service.expire_stale(now - chrono::Duration::minutes(10)).await.unwrap(), 0);

    h.store.set_interrupted_at(session_id, now - chrono::Duration::hours(1));
    assert_eq!(h.service.expire_stale(now - chrono::Duration::minutes(10)).await.unwrap(), 1);

    let session = h.store.find_session(session_id).await.unwrap().unwrap();
    assert!(session.is_closed());
    assert_eq!(h.store.committed_html(h.project).as_deref(), Some("<html>p1</html>"));
    assert_eq!(h.store.balance(h.account).await.unwrap(), Some(8));

    let events = collect(h.service.resume(h.account, session_id, None).await.unwrap()).await;
    assert_matches!(events.as_slice(), [StreamEvent::Interrupted { resumable: false, .. }]);
}

#[tokio::test]
async fn orphaned_sessions_are_recovered_and_resumable() {
    let h = harness(Tier::Refined, 10, vec![]);
    let session = h
        .store
        .open_session(NewSession {
            project_id: h.project,
            account_id: h.account,
            tier: Tier::Refined,
            mode: GenerationMode::Refined,
            credit_cost: 1,
            passes_total: 1,
            brief: Brief::fallback(),
            brief_fallback: true,
            request: AssembledPrompt {
                system: "sys".into(),
                messages: vec![],
            },
        })
        .await
        .unwrap();
    h.store.set_status(session.id, SessionStatus::Streaming).await.unwrap();

    assert_eq!(h.service.recover_orphans().await.unwrap(), 1);
    let recovered = h.store.find_session(session.id).await.unwrap().unwrap();
    assert_eq!(recovered.status, SessionStatus::Interrupted);

    h.client.push(Step::Reply("<html>again</html>"));
    let events = collect(h.service.resume(h.account, session.id, None).await.unwrap()).await;
    assert_matches!(events.last(), Some(StreamEvent::Complete { passes_completed: 1, .. }));
    assert_eq!(h.store.balance(h.account).await.unwrap(), Some(9));
}

#[tokio::test]
async fn shutdown_leaves_sessions_resumable() {
    let h = harness(Tier::Enhanced, 10, vec![Step::Hang]);

    let mut stream = h.service.open(h.account, h.project, "A bakery").await.unwrap();
    let session_id = active_session(&h).await.unwrap();
    read_until(&mut stream, |e| matches!(e, StreamEvent::Status { .. })).await;

    h.service.shutdown().await;

    let rest = collect(stream).await;
    assert_matches!(
        rest.last(),
        Some(StreamEvent::Interrupted {
            resume_from_pass: 1,
            resumable: true,
            ..
        })
    );
    let session = h.store.find_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Interrupted);
    assert!(!session.is_closed());
}

// ---------------------------------------------------------------------------
// Store failures mid-session
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_refunding_close_is_retried_and_refunds() {
    let h = harness(
        Tier::Enhanced,
        10,
        vec![Step::Fail(LlmError::Api {
            status: 500,
            body: String::new(),
        })],
    );
    h.flaky.fail_once(Write::FinishWithRefund, 0);

    let stream = h.service.open(h.account, h.project, "A bakery").await.unwrap();
    let session_id = active_session(&h).await.unwrap();
    let events = collect(stream).await;

    assert_matches!(
        events.last(),
        Some(StreamEvent::Failed {
            code: GenerationErrorCode::StreamError,
            ..
        })
    );
    let session = h.store.find_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.passes_completed, 0);
    assert!(session.refunded_at.is_some());
    assert_eq!(h.store.balance(h.account).await.unwrap(), Some(10));
    assert_eq!(h.store.session_ledger(session_id), vec![-2, 2]);
    assert_eq!(active_session(&h).await, None);
}

#[tokio::test]
async fn first_snapshot_write_failure_fails_and_refunds() {
    let h = harness(
        Tier::Enhanced,
        10,
        vec![Step::Reply("<html>p1</html>"), Step::Reply("<html>p2</html>")],
    );
    h.flaky.fail_once(Write::CommitSnapshot, 0);

    let stream = h.service.open(h.account, h.project, "A bakery").await.unwrap();
    let session_id = active_session(&h).await.unwrap();
    let events = collect(stream).await;

    assert!(snapshot_passes(&events).is_empty());
    assert_matches!(
        events.last(),
        Some(StreamEvent::Failed {
            code: GenerationErrorCode::StreamError,
            ..
        })
    );
    let session = h.store.find_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert!(session.refunded_at.is_some());
    assert_eq!(h.store.balance(h.account).await.unwrap(), Some(10));
    assert_eq!(h.store.committed_html(h.project), None);
}

#[tokio::test]
async fn later_snapshot_write_failure_keeps_first_pass() {
    let h = harness(
        Tier::Enhanced,
        10,
        vec![Step::Reply("<html>p1</html>"), Step::Reply("<html>p2</html>")],
    );
    h.flaky.fail_once(Write::CommitSnapshot, 1);

    let stream = h.service.open(h.account, h.project, "A bakery").await.unwrap();
    let session_id = active_session(&h).await.unwrap();
    let events = collect(stream).await;

    assert_eq!(snapshot_passes(&events), vec![1]);
    assert_matches!(
        events.last(),
        Some(StreamEvent::Failed {
            code: GenerationErrorCode::StreamError,
            ..
        })
    );
    let session = h.store.find_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.passes_completed, 1);
    assert_eq!(session.refunded_at, None);
    assert_eq!(h.store.balance(h.account).await.unwrap(), Some(8));
    assert_eq!(h.store.committed_html(h.project).as_deref(), Some("<html>p1</html>"));
}

#[tokio::test]
async fn failed_final_close_still_completes() {
    let h = harness(
        Tier::Enhanced,
        10,
        vec![Step::Reply("<html>p1</html>"), Step::Reply("<html>p2</html>")],
    );
    h.flaky.fail_once(Write::Finish, 0);

    let stream = h.service.open(h.account, h.project, "A bakery").await.unwrap();
    let session_id = active_session(&h).await.unwrap();
    let events = collect(stream).await;

    let terminal: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::Complete { .. } | StreamEvent::Failed { .. }))
        .collect();
    assert_matches!(
        terminal.as_slice(),
        [StreamEvent::Complete {
            passes_completed: 2,
            degraded: None
        }]
    );
    let session = h.store.find_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Complete);
    assert_eq!(session.refunded_at, None);
    assert_eq!(h.store.balance(h.account).await.unwrap(), Some(8));
    assert_eq!(h.store.committed_html(h.project).as_deref(), Some("<html>p2</html>"));
}
