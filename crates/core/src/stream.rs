//! Events carried by the generation stream.

use serde::Serialize;

use crate::error::GenerationErrorCode;
use crate::session::SessionStatus;

/// One event delivered to the attached reader of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    Status {
        status: SessionStatus,
        pass: u32,
    },
    /// Incremental model output for the pass in progress.
    Chunk {
        pass: u32,
        seq: u64,
        text: String,
    },
    /// Full committed document of a finished pass.
    Snapshot {
        pass: u32,
        html: String,
    },
    Complete {
        passes_completed: u32,
        /// Set when a refinement pass was cut short and the session completed
        /// on an earlier snapshot.
        #[serde(skip_serializing_if = "Option::is_none")]
        degraded: Option<GenerationErrorCode>,
    },
    Failed {
        code: GenerationErrorCode,
        message: String,
    },
    Interrupted {
        code: GenerationErrorCode,
        /// First pass that will run when the session is resumed.
        resume_from_pass: u32,
        resumable: bool,
    },
}

impl StreamEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Status { .. } => "status",
            StreamEvent::Chunk { .. } => "chunk",
            StreamEvent::Snapshot { .. } => "snapshot",
            StreamEvent::Complete { .. } => "complete",
            StreamEvent::Failed { .. } => "failed",
            StreamEvent::Interrupted { .. } => "interrupted",
        }
    }

    /// Terminal events end a reader's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::Complete { .. }
                | StreamEvent::Failed { .. }
                | StreamEvent::Interrupted { .. }
        )
    }

    /// Failure event with the fixed caller-facing message for `code`.
    pub fn failed(code: GenerationErrorCode) -> Self {
        StreamEvent::Failed {
            code,
            message: code.message().to_string(),
        }
    }

    /// JSON payload without the event tag, for the SSE `data` field.
    pub fn payload(&self) -> serde_json::Value {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(mut map)) => {
                map.remove("data").unwrap_or(serde_json::Value::Null)
            }
            _ => serde_json::Value::Null,
        }
    }
}
