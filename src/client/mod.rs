//! Streaming completion client
//!
//! POSTs the conversation to `{base_url}/v1/chat/completions` with
//! `stream: true` and reassembles the streamed deltas into the reply.

mod request;
mod stream;

pub use request::{
    image_data_uri, ChatMessage, ChatRequest, CompletionRequest, ContentPart, ImageUrl,
    MessageContent, IMAGE_MEDIA_TYPE,
};
pub use stream::{consume_stream, StreamDecoder};

use crate::{ChatError, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const USER_AGENT: &str = concat!("notechat/", env!("CARGO_PKG_VERSION"));

/// Produces an assistant reply for a conversation.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Stream a completion. `on_partial` receives the full accumulated text
    /// after every delta; the final text is returned.
    async fn complete(
        &self,
        request: &CompletionRequest,
        on_partial: &mut (dyn for<'p> FnMut(&'p str) + Send),
        cancel: &CancellationToken,
    ) -> Result<String>;
}

/// Client for OpenAI-compatible chat-completions endpoints
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    client: Client,
    strict: bool,
}

impl OpenAiCompatClient {
    /// Build a client. `timeout` of `None` waits on the request indefinitely.
    pub fn new(timeout: Option<Duration>) -> Self {
        let mut builder = Client::builder().user_agent(USER_AGENT);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().unwrap_or_else(|_| Client::new());
        Self {
            client,
            strict: false,
        }
    }

    /// Fail on malformed stream frames instead of skipping them.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    async fn send(&self, request: &CompletionRequest) -> Result<reqwest::Response> {
        let url = request.endpoint.completions_url();
        debug!(
            "POST {} model={} messages={}",
            url,
            request.endpoint.model,
            request.messages.len()
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .bearer_auth(&request.endpoint.api_key)
            .json(&request.body())
            .send()
            .await
            .map_err(map_reqwest_error)?;

        check_response_status(response).await
    }
}

#[async_trait]
impl CompletionClient for OpenAiCompatClient {
    async fn complete(
        &self,
        request: &CompletionRequest,
        on_partial: &mut (dyn for<'p> FnMut(&'p str) + Send),
        cancel: &CancellationToken,
    ) -> Result<String> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChatError::Cancelled),
            response = self.send(request) => response?,
        };

        let text = consume_stream(response.bytes_stream(), self.strict, on_partial, cancel).await?;
        info!("Completion finished ({} chars)", text.chars().count());
        Ok(text)
    }
}

async fn check_response_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ChatError::HttpStatus {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_string(),
        body,
    })
}

fn map_reqwest_error(e: reqwest::Error) -> ChatError {
    if e.is_timeout() {
        ChatError::Network(format!("timeout: {e}"))
    } else if e.is_connect() {
        ChatError::Network(format!("connect: {e}"))
    } else {
        ChatError::Network(e.to_string())
    }
}

/// Pull a human-readable message out of an API error body.
pub fn extract_error_detail(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(msg) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return msg.to_string();
        }
        if let Some(msg) = value.get("message").and_then(|m| m.as_str()) {
            return msg.to_string();
        }
    }

    trimmed.to_string()
}
