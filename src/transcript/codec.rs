//! Markdown transcript format
//!
//! ```text
//! ### 你 (14:03:22)
//!
//! user text
//!
//! ### AI (14:03:25)
//!
//! assistant text
//!
//! ```
//!
//! Only role, text and time of day survive a round trip. Images and the date
//! are not written.

use super::{Conversation, Role, Turn};
use crate::{ChatError, Result};
use chrono::{NaiveDate, NaiveTime};
use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, warn};

pub const ROLE_MARKER_USER: &str = "你";
pub const ROLE_MARKER_ASSISTANT: &str = "AI";

const TIME_FORMAT: &str = "%H:%M:%S";

static HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^###\s*(\S+?)\s*\((\d{1,2}:\d{2}:\d{2})\)").expect("header regex is valid")
});

fn marker_for(role: Role) -> &'static str {
    match role {
        Role::User => ROLE_MARKER_USER,
        Role::Assistant => ROLE_MARKER_ASSISTANT,
    }
}

fn role_for(marker: &str) -> Option<Role> {
    match marker {
        ROLE_MARKER_USER => Some(Role::User),
        ROLE_MARKER_ASSISTANT => Some(Role::Assistant),
        _ => None,
    }
}

/// Render turns as a markdown transcript.
pub fn serialize(turns: &[Turn]) -> String {
    let mut md = String::new();
    for turn in turns {
        md.push_str(&format!(
            "### {} ({})\n\n{}\n\n",
            marker_for(turn.role),
            turn.timestamp.format(TIME_FORMAT),
            turn.text
        ));
    }
    md
}

/// Turn being accumulated while scanning lines
struct PendingTurn {
    role: Role,
    time: NaiveTime,
    lines: Vec<String>,
}

impl PendingTurn {
    fn finish(mut self) -> Option<Turn> {
        // A header directly followed by another header carries no turn.
        if self.lines.is_empty() {
            return None;
        }
        // Drop the blank line after the header and the one closing the block.
        if self.lines.first().is_some_and(|l| l.is_empty()) {
            self.lines.remove(0);
        }
        if self.lines.last().is_some_and(|l| l.is_empty()) {
            self.lines.pop();
        }
        Some(Turn {
            role: self.role,
            text: self.lines.join("\n"),
            timestamp: NaiveDate::default().and_time(self.time),
            images: Vec::new(),
        })
    }
}

enum Header {
    Turn(Role, NaiveTime),
    Malformed(String),
}

fn parse_header(line: &str) -> Option<Header> {
    let caps = HEADER_RE.captures(line)?;
    let marker = &caps[1];
    let Some(role) = role_for(marker) else {
        return Some(Header::Malformed(format!("unknown role marker '{marker}'")));
    };
    match NaiveTime::parse_from_str(&caps[2], TIME_FORMAT) {
        Ok(time) => Some(Header::Turn(role, time)),
        Err(e) => Some(Header::Malformed(format!("invalid time '{}': {e}", &caps[2]))),
    }
}

/// Parse a markdown transcript back into a conversation.
///
/// In permissive mode a header with an unknown role marker or a bad time is
/// kept as body text of the current turn, and text before the first header is
/// discarded. Strict mode rejects both with [`ChatError::Parse`].
pub fn deserialize(text: &str, strict: bool) -> Result<Conversation> {
    let mut turns = Vec::new();
    let mut current: Option<PendingTurn> = None;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        match parse_header(line) {
            Some(Header::Turn(role, time)) => {
                if let Some(turn) = current.take().and_then(PendingTurn::finish) {
                    turns.push(turn);
                }
                current = Some(PendingTurn {
                    role,
                    time,
                    lines: Vec::new(),
                });
                continue;
            }
            Some(Header::Malformed(reason)) => {
                if strict {
                    return Err(ChatError::Parse {
                        line: line_no,
                        reason,
                    });
                }
                warn!("Transcript line {}: {}, keeping as text", line_no, reason);
            }
            None => {}
        }

        match current.as_mut() {
            Some(pending) => pending.lines.push(line.to_string()),
            None if line.trim().is_empty() => {}
            None => {
                if strict {
                    return Err(ChatError::Parse {
                        line: line_no,
                        reason: "text before first turn header".to_string(),
                    });
                }
                debug!("Discarding transcript line {} before first header", line_no);
            }
        }
    }

    if let Some(turn) = current.and_then(PendingTurn::finish) {
        turns.push(turn);
    }

    Ok(Conversation::from_turns(turns))
}
