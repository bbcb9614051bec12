//! Chat turns and the in-memory conversation
//!
//! A [`Conversation`] is append-only: turns are never reordered once pushed.
//! Only the trailing assistant turn is mutated, while its reply streams in.

mod codec;

pub use codec::{deserialize, serialize, ROLE_MARKER_ASSISTANT, ROLE_MARKER_USER};

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Wire name used in chat-completions messages
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message in a conversation.
///
/// `timestamp` is local wall-clock time. Turns decoded from a transcript
/// only carry the time of day; their date is a fixed placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub timestamp: NaiveDateTime,
    /// Base64 image payloads, only meaningful on user turns
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl Turn {
    pub fn user(text: impl Into<String>, images: Vec<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            timestamp: Local::now().naive_local(),
            images,
        }
    }

    /// Empty assistant turn, filled in while the reply streams
    pub fn assistant_placeholder() -> Self {
        Self::assistant(String::new())
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            timestamp: Local::now().naive_local(),
            images: Vec::new(),
        }
    }

    pub fn has_images(&self) -> bool {
        !self.images.is_empty()
    }
}

/// Ordered sequence of turns; insertion order is chronological order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_turns(turns: Vec<Turn>) -> Self {
        Self { turns }
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Mutable access to the newest turn only. Earlier turns are frozen.
    pub fn last_mut(&mut self) -> Option<&mut Turn> {
        self.turns.last_mut()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Most recent assistant turn, if any
    pub fn last_assistant(&self) -> Option<&Turn> {
        self.turns.iter().rev().find(|t| t.role == Role::Assistant)
    }

    pub fn into_turns(self) -> Vec<Turn> {
        self.turns
    }
}

/// Strip leading and trailing blank lines, keeping inner spacing intact.
pub fn clean_text(text: &str) -> String {
    text.trim().trim_matches('\n').to_string()
}
