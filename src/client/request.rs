//! Chat Completions request payload

use crate::endpoints::Endpoint;
use crate::transcript::Turn;
use serde::{Deserialize, Serialize};

pub const IMAGE_MEDIA_TYPE: &str = "image/jpeg";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub stream: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

/// Plain text, or a text part followed by image parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

impl ChatMessage {
    pub fn from_turn(turn: &Turn) -> Self {
        let content = if turn.has_images() {
            let mut parts = Vec::with_capacity(turn.images.len() + 1);
            parts.push(ContentPart::Text {
                text: turn.text.clone(),
            });
            parts.extend(turn.images.iter().map(|payload| ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: image_data_uri(payload),
                },
            }));
            MessageContent::Parts(parts)
        } else {
            MessageContent::Text(turn.text.clone())
        };
        Self {
            role: turn.role.as_str().to_string(),
            content,
        }
    }
}

pub fn image_data_uri(base64_payload: &str) -> String {
    format!("data:{IMAGE_MEDIA_TYPE};base64,{base64_payload}")
}

/// Everything needed to ask for one completion
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub endpoint: Endpoint,
    pub messages: Vec<ChatMessage>,
}

impl CompletionRequest {
    /// Build the request from the ordered history, newest turn last.
    pub fn from_turns(endpoint: Endpoint, turns: &[Turn]) -> Self {
        Self {
            endpoint,
            messages: turns.iter().map(ChatMessage::from_turn).collect(),
        }
    }

    pub fn body(&self) -> ChatRequest<'_> {
        ChatRequest {
            model: &self.endpoint.model,
            messages: &self.messages,
            stream: true,
        }
    }
}
