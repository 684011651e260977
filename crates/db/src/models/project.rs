use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use pagecraft_core::assembly::{ChatMessage, ChatRole};
use pagecraft_core::types::{DbId, Timestamp};

/// A row from the `projects` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Project {
    pub id: DbId,
    pub account_id: DbId,
    pub name: String,
    /// Final HTML of the last generation that committed content.
    pub committed_html: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Input for creating a project.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateProject {
    pub account_id: DbId,
    pub name: String,
}

/// A row from the `conversation_turns` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ConversationTurn {
    pub id: DbId,
    pub project_id: DbId,
    pub role: String,
    pub content: String,
    pub created_at: Timestamp,
}

impl ConversationTurn {
    /// Convert to a model message. Unknown roles are treated as user text.
    pub fn to_message(&self) -> ChatMessage {
        match self.role.as_str() {
            "assistant" => ChatMessage::assistant(self.content.clone()),
            _ => ChatMessage::user(self.content.clone()),
        }
    }
}

/// Database form of a conversation role.
pub fn role_str(role: ChatRole) -> &'static str {
    match role {
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
    }
}
