//! Saved credentials, base addresses and models
//!
//! Each list entry may carry a human label in front of the actual value,
//! e.g. `work sk-abc123` or `Yunwu https://yunwu.ai`. Only the token that
//! matches the expected shape goes on the wire.

use crate::{ChatError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

pub const DEFAULT_BASE_URL: &str = "https://yunwu.ai";
pub const DEFAULT_MODEL: &str = "gpt-4";

static API_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"sk-\S+").expect("api key regex is valid"));
static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://\S+").expect("url regex is valid"));

/// Which list a selection applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    ApiKey,
    BaseUrl,
    Model,
}

impl EndpointKind {
    pub fn name(&self) -> &'static str {
        match self {
            EndpointKind::ApiKey => "api key",
            EndpointKind::BaseUrl => "base url",
            EndpointKind::Model => "model",
        }
    }

    /// Key of the current-selection pointer in `config.toml`
    pub fn config_key(&self) -> &'static str {
        match self {
            EndpointKind::ApiKey => "current_api_key",
            EndpointKind::BaseUrl => "current_base_url",
            EndpointKind::Model => "current_model",
        }
    }

    fn token_re(&self) -> Option<&'static Regex> {
        match self {
            EndpointKind::ApiKey => Some(&*API_KEY_RE),
            EndpointKind::BaseUrl => Some(&*URL_RE),
            EndpointKind::Model => None,
        }
    }
}

/// Connection parameters resolved from the current selections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

impl Endpoint {
    pub fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }
}

/// Three independent lists, each with one current selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSet {
    pub api_keys: Vec<String>,
    pub base_urls: Vec<String>,
    pub models: Vec<String>,
    pub current_api_key: usize,
    pub current_base_url: usize,
    pub current_model: usize,
}

impl Default for EndpointSet {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            base_urls: vec![DEFAULT_BASE_URL.to_string()],
            models: vec![DEFAULT_MODEL.to_string()],
            current_api_key: 0,
            current_base_url: 0,
            current_model: 0,
        }
    }
}

/// Extract the raw token from a possibly labelled entry.
pub fn strip_label(kind: EndpointKind, entry: &str) -> String {
    let entry = entry.trim();
    let raw = kind
        .token_re()
        .and_then(|re| re.find(entry))
        .map(|m| m.as_str())
        .unwrap_or(entry);
    match kind {
        EndpointKind::BaseUrl => raw.trim_end_matches('/').to_string(),
        _ => raw.to_string(),
    }
}

/// Human label for an entry: the text before the token, or the token itself.
pub fn display_label(kind: EndpointKind, entry: &str) -> String {
    let entry = entry.trim();
    if let Some(m) = kind.token_re().and_then(|re| re.find(entry)) {
        let label = entry[..m.start()].trim();
        if !label.is_empty() {
            return label.to_string();
        }
    }
    entry.to_string()
}

impl EndpointSet {
    /// Drop blank entries and clamp current pointers into range.
    pub fn normalize(&mut self) {
        for list in [&mut self.api_keys, &mut self.base_urls, &mut self.models] {
            list.retain(|e| !e.trim().is_empty());
        }
        if self.base_urls.is_empty() {
            self.base_urls.push(DEFAULT_BASE_URL.to_string());
        }
        if self.models.is_empty() {
            self.models.push(DEFAULT_MODEL.to_string());
        }
        self.current_api_key = clamp(self.current_api_key, self.api_keys.len());
        self.current_base_url = clamp(self.current_base_url, self.base_urls.len());
        self.current_model = clamp(self.current_model, self.models.len());
    }

    pub fn entries(&self, kind: EndpointKind) -> &[String] {
        match kind {
            EndpointKind::ApiKey => &self.api_keys,
            EndpointKind::BaseUrl => &self.base_urls,
            EndpointKind::Model => &self.models,
        }
    }

    pub fn current_index(&self, kind: EndpointKind) -> usize {
        match kind {
            EndpointKind::ApiKey => self.current_api_key,
            EndpointKind::BaseUrl => self.current_base_url,
            EndpointKind::Model => self.current_model,
        }
    }

    pub fn current(&self, kind: EndpointKind) -> Option<&str> {
        self.entries(kind)
            .get(self.current_index(kind))
            .map(String::as_str)
    }

    /// Change the current selection for one list.
    pub fn select(&mut self, kind: EndpointKind, index: usize) -> Result<()> {
        let len = self.entries(kind).len();
        if index >= len {
            return Err(ChatError::Config(format!(
                "{} index {} out of range (have {})",
                kind.name(),
                index,
                len
            )));
        }
        match kind {
            EndpointKind::ApiKey => self.current_api_key = index,
            EndpointKind::BaseUrl => self.current_base_url = index,
            EndpointKind::Model => self.current_model = index,
        }
        Ok(())
    }

    /// Raw wire values for the current selections.
    pub fn resolve(&self) -> Result<Endpoint> {
        let api_key = self
            .current(EndpointKind::ApiKey)
            .map(|e| strip_label(EndpointKind::ApiKey, e))
            .ok_or_else(|| ChatError::Config("no API key configured".to_string()))?;
        let base_url = self
            .current(EndpointKind::BaseUrl)
            .map(|e| strip_label(EndpointKind::BaseUrl, e))
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let model = self
            .current(EndpointKind::Model)
            .map(|e| e.trim().to_string())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        Ok(Endpoint {
            api_key,
            base_url,
            model,
        })
    }
}

fn clamp(index: usize, len: usize) -> usize {
    index.min(len.saturating_sub(1))
}
