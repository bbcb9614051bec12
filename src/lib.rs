//! Notechat - streaming LLM chat with markdown transcript history
//!
//! A chat panel that talks to a chat-completions endpoint:
//! - Streams assistant replies and live-renders the growing text
//! - Checkpoints the conversation to a live markdown transcript after every turn
//! - Archives retired conversations and navigates between them

pub mod client;
pub mod clipboard;
pub mod commands;
pub mod config;
pub mod endpoints;
pub mod history;
pub mod panel;
pub mod session;
pub mod transcript;

pub use client::{CompletionClient, CompletionRequest, OpenAiCompatClient};
pub use config::ChatConfig;
pub use endpoints::{Endpoint, EndpointKind, EndpointSet};
pub use history::{ArchivedTranscript, Direction, HistoryStore, NavigateOutcome};
pub use panel::{PanelId, PanelRegistry};
pub use session::{ConversationSession, SessionOptions, SessionState, TurnOutcome};
pub use transcript::{Conversation, Role, Turn};

use std::path::PathBuf;

/// Result type for Notechat operations
pub type Result<T> = std::result::Result<T, ChatError>;

/// Errors that can occur in Notechat
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("network error: {0}")]
    Network(String),

    #[error("API request failed: {status} - {status_text}\n{body}")]
    HttpStatus {
        status: u16,
        status_text: String,
        body: String,
    },

    #[error("malformed stream frame: {0}")]
    StreamDecode(String),

    #[error("transcript parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("a request is already in flight for this conversation")]
    AlreadyInFlight,

    #[error("request cancelled")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),

    #[error("clipboard error: {0}")]
    Clipboard(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChatError {
    /// Wrap an IO error with the path it happened on.
    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ChatError::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Short message for display, with API error bodies reduced to their message.
    pub fn notice(&self) -> String {
        match self {
            ChatError::HttpStatus {
                status,
                status_text,
                body,
            } => {
                let detail = client::extract_error_detail(body);
                if detail.is_empty() {
                    format!("API request failed: {status} - {status_text}")
                } else {
                    format!("API request failed: {status} - {status_text}: {detail}")
                }
            }
            other => other.to_string(),
        }
    }
}
