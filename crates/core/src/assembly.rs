//! System prompt assembly.
//!
//! The system prompt template is read from disk exactly once per process and
//! cached in a [`OnceLock`]. A template that is missing, unreadable, or does
//! not contain exactly one `{brief}` placeholder is a startup-class failure:
//! the error is cached too, so every later caller observes the same failure
//! instead of retrying the read.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::brief::Brief;
use crate::sanitize;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One conversation turn sent to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A fully assembled model request: system prompt plus ordered turns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssembledPrompt {
    pub system: String,
    pub messages: Vec<ChatMessage>,
}

/// Prior conversation for a project plus the new (sanitized) request.
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    pub history: Vec<ChatMessage>,
    pub request: String,
}

/// Only the most recent turns of history are replayed to the model.
pub const MAX_HISTORY_TURNS: usize = 20;

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// The single placeholder the template must contain.
pub const BRIEF_PLACEHOLDER: &str = "{brief}";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("system prompt template {} could not be read: {reason}", path.display())]
    Unreadable { path: PathBuf, reason: String },

    #[error("system prompt template must contain exactly one {{brief}} placeholder, found {0}")]
    Placeholder(usize),
}

/// A validated system prompt template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemTemplate {
    text: String,
}

impl SystemTemplate {
    /// Validate template text.
    pub fn from_text(text: impl Into<String>) -> Result<Self, TemplateError> {
        let text = text.into();
        let count = text.matches(BRIEF_PLACEHOLDER).count();
        if count != 1 {
            return Err(TemplateError::Placeholder(count));
        }
        Ok(Self { text })
    }

    /// Read and validate a template file.
    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        let text = std::fs::read_to_string(path).map_err(|e| TemplateError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_text(text)
    }

    /// Substitute the rendered brief for the placeholder.
    pub fn render(&self, brief: &Brief) -> String {
        self.text.replacen(BRIEF_PLACEHOLDER, &brief.render(), 1)
    }
}

static GLOBAL_TEMPLATE: OnceLock<Result<SystemTemplate, TemplateError>> = OnceLock::new();

/// Load the process-wide template on first call; later calls return the
/// cached result (success or failure) without touching the filesystem.
pub fn init_global_template(path: &Path) -> Result<&'static SystemTemplate, TemplateError> {
    GLOBAL_TEMPLATE
        .get_or_init(|| SystemTemplate::load(path))
        .as_ref()
        .map_err(Clone::clone)
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

/// Build the pass-1 request from the brief and conversation context.
///
/// User turns from history are sanitized again (a no-op for text that was
/// sanitized on the way in); assistant turns are model output and are passed
/// through unchanged.
pub fn assemble(
    template: &SystemTemplate,
    brief: &Brief,
    context: &ConversationContext,
) -> AssembledPrompt {
    let skip = context.history.len().saturating_sub(MAX_HISTORY_TURNS);
    let mut messages: Vec<ChatMessage> = context
        .history
        .iter()
        .skip(skip)
        .map(|m| match m.role {
            ChatRole::User => ChatMessage::user(sanitize::sanitize(&m.content)),
            ChatRole::Assistant => m.clone(),
        })
        .collect();
    messages.push(ChatMessage::user(sanitize::sanitize(&context.request)));

    AssembledPrompt {
        system: template.render(brief),
        messages,
    }
}

/// Fixed critique/refine instruction prepended to the previous document for
/// every pass after the first.
pub const REFINE_INSTRUCTION: &str = "Critique the HTML document below against the brief in \
your instructions: layout rules for the brand type, palette usage, typography hierarchy, \
spacing rhythm, responsive behaviour and accessibility (contrast, alt text, landmarks). \
Then output the complete revised document, from <!DOCTYPE html> to </html>, fixing every \
issue you found. Output only the HTML.";

/// Build the request for a refinement pass.
///
/// `previous_html` is the committed snapshot of the previous pass and is sent
/// verbatim.
pub fn refine_request(system: &str, previous_html: &str) -> AssembledPrompt {
    AssembledPrompt {
        system: system.to_string(),
        messages: vec![ChatMessage::user(format!(
            "{REFINE_INSTRUCTION}\n\n{previous_html}"
        ))],
    }
}

/// Extract the HTML document from a pass output.
///
/// Models occasionally wrap the document in a Markdown code fence; the fence
/// is removed. Returns `None` when nothing but whitespace remains.
pub fn extract_document(output: &str) -> Option<String> {
    let mut text = output.trim();
    if let Some(rest) = text.strip_prefix("```") {
        // Drop the info string (e.g. `html`) on the opening fence line.
        text = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
        text = text.trim_end();
        text = text.strip_suffix("```").unwrap_or(text);
        text = text.trim();
    }
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}
