//! Resume planning.
//!
//! What a reconnecting reader receives depends only on the durable session
//! record, the pass of the latest committed snapshot and the reader's cursor,
//! so the same plan is produced after a process restart.

use crate::error::GenerationErrorCode;
use crate::session::{GenerationSession, SessionStatus};
use crate::stream::StreamEvent;

/// What happens after the optional snapshot replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeNext {
    /// The session is closed; deliver its terminal event and end the stream.
    Terminal(StreamEvent),
    /// An orchestrator is driving the session in this process; attach to it.
    Attach,
    /// Nothing is driving the session; restart passes at `from_pass`.
    Restart { from_pass: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePlan {
    /// Pass of the committed snapshot to redeliver, if the reader lacks it.
    pub replay: Option<u32>,
    pub next: ResumeNext,
}

/// Terminal event for a closed session, `None` while it is still open.
pub fn terminal_event(session: &GenerationSession) -> Option<StreamEvent> {
    if !session.is_closed() && !session.status.is_final() {
        return None;
    }
    let event = match session.status {
        SessionStatus::Complete => StreamEvent::Complete {
            passes_completed: session.passes_completed,
            degraded: session.error_code,
        },
        SessionStatus::Failed => {
            StreamEvent::failed(session.error_code.unwrap_or(GenerationErrorCode::StreamError))
        }
        _ => StreamEvent::Interrupted {
            code: GenerationErrorCode::StreamInterrupted,
            resume_from_pass: session.next_pass(),
            resumable: false,
        },
    };
    Some(event)
}

/// Plan a reconnect.
///
/// `cursor` is the highest snapshot pass the reader has received (0 for
/// none). A snapshot is replayed only when it is newer than the cursor, so
/// bytes of a snapshot the reader already holds are never sent twice.
pub fn plan_resume(
    session: &GenerationSession,
    latest_snapshot_pass: Option<u32>,
    cursor: u32,
    live: bool,
) -> ResumePlan {
    let replay = latest_snapshot_pass.filter(|pass| *pass > cursor);

    let next = if let Some(event) = terminal_event(session) {
        ResumeNext::Terminal(event)
    } else if live {
        ResumeNext::Attach
    } else {
        ResumeNext::Restart {
            from_pass: session.next_pass(),
        }
    };

    ResumePlan { replay, next }
}
