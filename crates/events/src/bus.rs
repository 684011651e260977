//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is shared via `Arc<EventBus>` between the generation
//! service, the orchestrator tasks and the background sweeper.

use chrono::{DateTime, Utc};
use pagecraft_core::error::GenerationErrorCode;
use pagecraft_core::session::SessionStatus;
use pagecraft_core::types::{DbId, SessionId};
use serde::Serialize;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Event names
// ---------------------------------------------------------------------------

pub const SESSION_OPENED: &str = "generation.opened";
pub const STATUS_CHANGED: &str = "generation.status_changed";
pub const SNAPSHOT_COMMITTED: &str = "generation.snapshot_committed";
pub const SESSION_COMPLETED: &str = "generation.completed";
pub const SESSION_FAILED: &str = "generation.failed";
pub const SESSION_INTERRUPTED: &str = "generation.interrupted";
pub const SESSION_CANCELLED: &str = "generation.cancelled";
pub const SESSION_EXPIRED: &str = "generation.expired";
pub const CREDITS_REFUNDED: &str = "generation.refunded";

// ---------------------------------------------------------------------------
// GenerationEvent
// ---------------------------------------------------------------------------

/// Something that happened to a generation session.
///
/// Constructed via [`GenerationEvent::new`] and enriched with the builder
/// methods.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationEvent {
    /// Dot-separated event name, e.g. `"generation.completed"`.
    pub event_type: &'static str,
    pub session_id: SessionId,
    pub project_id: DbId,
    pub account_id: Option<DbId>,
    pub status: Option<SessionStatus>,
    pub pass: Option<u32>,
    pub error_code: Option<GenerationErrorCode>,
    pub timestamp: DateTime<Utc>,
}

impl GenerationEvent {
    pub fn new(event_type: &'static str, session_id: SessionId, project_id: DbId) -> Self {
        Self {
            event_type,
            session_id,
            project_id,
            account_id: None,
            status: None,
            pass: None,
            error_code: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_account(mut self, account_id: DbId) -> Self {
        self.account_id = Some(account_id);
        self
    }

    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_pass(mut self, pass: u32) -> Self {
        self.pass = Some(pass);
        self
    }

    pub fn with_error(mut self, code: GenerationErrorCode) -> Self {
        self.error_code = Some(code);
        self
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// When the buffer is full the oldest un-consumed events are dropped and
/// slow receivers observe `RecvError::Lagged`.
pub struct EventBus {
    sender: broadcast::Sender<GenerationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// With no active subscribers the event is dropped.
    pub fn publish(&self, event: GenerationEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GenerationEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_receive_single_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let session_id = uuid::Uuid::now_v7();

        bus.publish(
            GenerationEvent::new(STATUS_CHANGED, session_id, 42)
                .with_account(7)
                .with_status(SessionStatus::Refining)
                .with_pass(2),
        );

        let received = rx.recv().await.expect("should receive the event");
        assert_eq!(received.event_type, STATUS_CHANGED);
        assert_eq!(received.session_id, session_id);
        assert_eq!(received.project_id, 42);
        assert_eq!(received.account_id, Some(7));
        assert_eq!(received.status, Some(SessionStatus::Refining));
        assert_eq!(received.pass, Some(2));
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(GenerationEvent::new(SESSION_COMPLETED, uuid::Uuid::now_v7(), 1));

        let e1 = rx1.recv().await.expect("subscriber 1 should receive");
        let e2 = rx2.recv().await.expect("subscriber 2 should receive");
        assert_eq!(e1.event_type, SESSION_COMPLETED);
        assert_eq!(e2.event_type, SESSION_COMPLETED);
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(GenerationEvent::new(SESSION_FAILED, uuid::Uuid::now_v7(), 1));
    }

    #[test]
    fn error_code_serializes_in_wire_form() {
        let event = GenerationEvent::new(SESSION_FAILED, uuid::Uuid::nil(), 3)
            .with_error(GenerationErrorCode::Timeout);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "generation.failed");
        assert_eq!(json["error_code"], "TIMEOUT");
    }
}
