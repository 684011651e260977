//! Live session streams.
//!
//! [`StreamHub`] tracks every session driven by an orchestrator in this
//! process. Each session has one writer (its orchestrator) and at most one
//! attached reader; attaching a new reader replaces the previous one, whose
//! stream then ends. Events emitted while no reader is attached are dropped;
//! the hub remembers only the latest snapshot so a reader attaching mid-run
//! can be brought up to date.
//!
//! The hub uses a synchronous mutex because output chunks are emitted from a
//! synchronous callback inside the model call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use pagecraft_core::session::Snapshot;
use pagecraft_core::stream::StreamEvent;
use pagecraft_core::types::SessionId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Channel sender half for pushing events to a reader.
pub type EventSender = mpsc::UnboundedSender<StreamEvent>;

// ---------------------------------------------------------------------------
// Session control
// ---------------------------------------------------------------------------

/// Why an orchestrator was told to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The attached reader went away.
    Disconnected,
    /// The owner cancelled the session.
    Cancelled,
    /// The process is shutting down.
    Shutdown,
}

/// Stop signal shared between the hub and one orchestrator.
pub struct SessionControl {
    token: CancellationToken,
    reason: Mutex<Option<StopReason>>,
}

impl SessionControl {
    fn new(token: CancellationToken) -> Self {
        Self {
            token,
            reason: Mutex::new(None),
        }
    }

    /// Request a stop. The first reason recorded wins.
    pub fn stop(&self, reason: StopReason) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
            slot.get_or_insert(reason);
        }
        self.token.cancel();
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }

    /// The recorded reason. A cancelled token without a recorded reason
    /// comes from the parent shutdown token.
    pub fn reason(&self) -> StopReason {
        self.reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .unwrap_or(StopReason::Shutdown)
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// A reader's end of a session stream.
pub struct Reader {
    pub session_id: SessionId,
    attach_id: u64,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl Reader {
    /// A reader not attached to any live session, pre-filled with `events`.
    pub fn detached(session_id: SessionId, events: Vec<StreamEvent>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in events {
            let _ = tx.send(event);
        }
        Self {
            session_id,
            attach_id: 0,
            rx,
        }
    }

    pub fn attach_id(&self) -> u64 {
        self.attach_id
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

struct LiveSession {
    reader: Option<(u64, EventSender)>,
    latest_snapshot: Option<(u32, String)>,
    control: Arc<SessionControl>,
}

impl LiveSession {
    /// Send to the attached reader, detaching it if its receiver is gone.
    fn send(&mut self, event: StreamEvent) -> bool {
        let Some((_, tx)) = &self.reader else {
            return false;
        };
        if tx.send(event).is_err() {
            self.reader = None;
            return false;
        }
        true
    }
}

#[derive(Default)]
struct HubState {
    next_attach_id: u64,
    sessions: HashMap<SessionId, LiveSession>,
}

impl HubState {
    fn new_reader(&mut self, session_id: SessionId) -> (Reader, (u64, EventSender)) {
        self.next_attach_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = Reader {
            session_id,
            attach_id: self.next_attach_id,
            rx,
        };
        (reader, (self.next_attach_id, tx))
    }
}

/// Registry of live session streams.
///
/// Designed to be wrapped in `Arc` and shared across the application.
pub struct StreamHub {
    state: Mutex<HubState>,
    /// Parent of every session's stop token; cancelled on shutdown.
    shutdown: CancellationToken,
}

impl StreamHub {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            shutdown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new live session with its first reader.
    ///
    /// Returns `None` if the session is already live.
    pub fn open(&self, session_id: SessionId) -> Option<(Reader, Arc<SessionControl>)> {
        let mut state = self.lock();
        if state.sessions.contains_key(&session_id) {
            return None;
        }
        let (reader, slot) = state.new_reader(session_id);
        let control = Arc::new(SessionControl::new(self.shutdown.child_token()));
        state.sessions.insert(
            session_id,
            LiveSession {
                reader: Some(slot),
                latest_snapshot: None,
                control: control.clone(),
            },
        );
        Some((reader, control))
    }

    /// Attach a reader to a live session, or register the session if it is
    /// not live.
    ///
    /// The latest snapshot (the hub's own for a live session, `stored` for a
    /// newly registered one) is delivered first when its pass is above
    /// `cursor`. The control is returned only when the session was
    /// registered by this call, meaning the caller must start a driver.
    pub fn attach_or_register(
        &self,
        session_id: SessionId,
        cursor: u32,
        stored: Option<Snapshot>,
    ) -> (Reader, Option<Arc<SessionControl>>) {
        let mut state = self.lock();
        let (reader, slot) = state.new_reader(session_id);

        let mut registered = None;
        let live = state.sessions.entry(session_id).or_insert_with(|| {
            let control = Arc::new(SessionControl::new(self.shutdown.child_token()));
            registered = Some(control.clone());
            LiveSession {
                reader: None,
                latest_snapshot: stored.map(|s| (s.pass, s.html)),
                control,
            }
        });

        if let Some((pass, html)) = &live.latest_snapshot {
            if *pass > cursor {
                let _ = slot.1.send(StreamEvent::Snapshot {
                    pass: *pass,
                    html: html.clone(),
                });
            }
        }
        // Replacing the sender ends the previous reader's stream.
        live.reader = Some(slot);

        (reader, registered)
    }

    /// A reader's stream was dropped.
    ///
    /// If it was still the attached reader, the session's driver is told the
    /// client disconnected. A reader that was already replaced is ignored.
    pub fn detach(&self, session_id: SessionId, attach_id: u64) {
        let mut state = self.lock();
        let Some(live) = state.sessions.get_mut(&session_id) else {
            return;
        };
        if live.reader.as_ref().map(|(id, _)| *id) == Some(attach_id) {
            live.reader = None;
            live.control.stop(StopReason::Disconnected);
        }
    }

    /// Deliver an event from the session's driver.
    ///
    /// Snapshots are remembered for later attachers. A terminal event ends
    /// the reader's stream. Returns whether a reader received the event.
    pub fn emit(&self, session_id: SessionId, event: StreamEvent) -> bool {
        let mut state = self.lock();
        let Some(live) = state.sessions.get_mut(&session_id) else {
            return false;
        };
        if let StreamEvent::Snapshot { pass, html } = &event {
            live.latest_snapshot = Some((*pass, html.clone()));
        }
        let terminal = event.is_terminal();
        let delivered = live.send(event);
        if terminal {
            live.reader = None;
        }
        delivered
    }

    /// Ask a live session's driver to stop because its owner cancelled.
    ///
    /// Returns `false` if the session is not live.
    pub fn cancel(&self, session_id: SessionId) -> bool {
        let state = self.lock();
        match state.sessions.get(&session_id) {
            Some(live) => {
                live.control.stop(StopReason::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Remove a session once its driver has exited.
    pub fn release(&self, session_id: SessionId) {
        self.lock().sessions.remove(&session_id);
    }

    pub fn is_live(&self, session_id: SessionId) -> bool {
        self.lock().sessions.contains_key(&session_id)
    }

    pub fn live_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Stop every live session. Their drivers leave them resumable.
    pub fn shutdown_all(&self) {
        let count = self.live_count();
        self.shutdown.cancel();
        tracing::info!(count, "Stopped all live generation sessions");
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pagecraft_core::error::GenerationErrorCode;

    use super::*;

    fn hub() -> StreamHub {
        StreamHub::new(CancellationToken::new())
    }

    fn chunk(pass: u32, seq: u64) -> StreamEvent {
        StreamEvent::Chunk {
            pass,
            seq,
            text: format!("c{seq}"),
        }
    }

    #[tokio::test]
    async fn chunks_reach_reader_in_order() {
        let hub = hub();
        let id = uuid::Uuid::now_v7();
        let (mut reader, _control) = hub.open(id).unwrap();

        for seq in 0..3 {
            assert!(hub.emit(id, chunk(1, seq)));
        }
        for seq in 0..3 {
            assert_eq!(reader.recv().await, Some(chunk(1, seq)));
        }
    }

    #[test]
    fn second_open_is_rejected() {
        let hub = hub();
        let id = uuid::Uuid::now_v7();
        assert!(hub.open(id).is_some());
        assert!(hub.open(id).is_none());
    }

    #[tokio::test]
    async fn terminal_event_ends_the_stream() {
        let hub = hub();
        let id = uuid::Uuid::now_v7();
        let (mut reader, _control) = hub.open(id).unwrap();

        hub.emit(id, StreamEvent::failed(GenerationErrorCode::ApiError));
        assert!(!hub.emit(id, chunk(1, 0)));

        assert_matches!(reader.recv().await, Some(StreamEvent::Failed { .. }));
        assert_eq!(reader.recv().await, None);
    }

    #[tokio::test]
    async fn attaching_replaces_previous_reader_and_replays_newer_snapshot() {
        let hub = hub();
        let id = uuid::Uuid::now_v7();
        let (mut first, control) = hub.open(id).unwrap();
        hub.emit(
            id,
            StreamEvent::Snapshot {
                pass: 1,
                html: "<p>1</p>".into(),
            },
        );

        let (mut second, registered) = hub.attach_or_register(id, 0, None);
        assert!(registered.is_none());

        // Old reader got the snapshot, then its stream ended.
        assert_matches!(first.recv().await, Some(StreamEvent::Snapshot { pass: 1, .. }));
        assert_eq!(first.recv().await, None);

        // New reader lacked pass 1, so it is replayed.
        assert_matches!(second.recv().await, Some(StreamEvent::Snapshot { pass: 1, .. }));

        // Detaching the replaced reader does not stop the session.
        hub.detach(id, first.attach_id());
        assert!(!control.token.is_cancelled());
    }

    #[tokio::test]
    async fn snapshot_at_cursor_is_not_replayed() {
        let hub = hub();
        let id = uuid::Uuid::now_v7();
        let stored = Snapshot {
            session_id: id,
            pass: 2,
            html: "<p>2</p>".into(),
        };
        let (mut reader, registered) = hub.attach_or_register(id, 2, Some(stored));
        assert!(registered.is_some());

        hub.emit(id, chunk(3, 0));
        assert_eq!(reader.recv().await, Some(chunk(3, 0)));
    }

    #[test]
    fn detaching_current_reader_signals_disconnect() {
        let hub = hub();
        let id = uuid::Uuid::now_v7();
        let (reader, control) = hub.open(id).unwrap();
        hub.detach(id, reader.attach_id());
        assert!(control.token.is_cancelled());
        assert_eq!(control.reason(), StopReason::Disconnected);
    }

    #[test]
    fn first_stop_reason_wins() {
        let hub = hub();
        let id = uuid::Uuid::now_v7();
        let (reader, control) = hub.open(id).unwrap();
        assert!(hub.cancel(id));
        hub.detach(id, reader.attach_id());
        assert_eq!(control.reason(), StopReason::Cancelled);
    }

    #[test]
    fn shutdown_stops_sessions_without_reason() {
        let hub = hub();
        let id = uuid::Uuid::now_v7();
        let (_reader, control) = hub.open(id).unwrap();
        hub.shutdown_all();
        assert!(control.token.is_cancelled());
        assert_eq!(control.reason(), StopReason::Shutdown);
    }

    #[tokio::test]
    async fn detached_reader_yields_prefilled_events_then_ends() {
        let id = uuid::Uuid::now_v7();
        let mut reader = Reader::detached(
            id,
            vec![StreamEvent::Complete {
                passes_completed: 1,
                degraded: None,
            }],
        );
        assert_matches!(reader.recv().await, Some(StreamEvent::Complete { .. }));
        assert_eq!(reader.recv().await, None);
    }
}
