//! Persisted configuration in `config.toml`
//!
//! Located under `$NOTECHAT_HOME` when set, otherwise `{config_dir}/notechat`.
//! Reads go through `serde`; selection changes are written back with
//! `toml_edit` so the rest of the user's file (comments included) survives.

use crate::endpoints::{EndpointKind, EndpointSet};
use crate::history::{HistoryStore, DEFAULT_LIVE_FILE};
use crate::session::SessionOptions;
use crate::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const CONFIG_FILE: &str = "config.toml";
pub const HOME_ENV: &str = "NOTECHAT_HOME";
const ENDPOINTS_TABLE: &str = "endpoints";

/// Directory holding `config.toml`
pub fn notechat_home() -> PathBuf {
    if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(home);
    }
    dirs::config_dir()
        .map(|d| d.join("notechat"))
        .or_else(|| dirs::home_dir().map(|h| h.join(".notechat")))
        .unwrap_or_else(|| PathBuf::from(".notechat"))
}

pub fn default_config_path() -> PathBuf {
    notechat_home().join(CONFIG_FILE)
}

fn default_history_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("notechat"))
        .unwrap_or_else(notechat_home)
        .join("history")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Directory holding the live transcript and the archives
    pub history_dir: PathBuf,

    /// File name of the live transcript inside `history_dir`
    pub live_file: String,

    /// Archive the live transcript when a session opens
    pub auto_clear_on_restart: bool,

    /// Fail on malformed transcript lines and stream frames
    pub strict_parsing: bool,

    /// Whole-request timeout in seconds, 0 for none
    pub request_timeout_secs: u64,

    pub endpoints: EndpointSet,

    /// Where this config was loaded from
    #[serde(skip)]
    pub path: Option<PathBuf>,

    /// Models appended by [`ChatConfig::with_model`], absent from the file
    #[serde(skip)]
    pub extra_models: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_dir: default_history_dir(),
            live_file: DEFAULT_LIVE_FILE.to_string(),
            auto_clear_on_restart: false,
            strict_parsing: false,
            request_timeout_secs: 0,
            endpoints: EndpointSet::default(),
            path: None,
            extra_models: 0,
        }
    }
}

impl ChatConfig {
    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str::<ChatConfig>(&text)
                .map_err(|e| ChatError::Config(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {:?}, using defaults", path);
                ChatConfig::default()
            }
            Err(e) => return Err(ChatError::fs(path, e)),
        };
        config.path = Some(path.to_path_buf());
        config.normalize();
        Ok(config)
    }

    /// Tidy values a user may have entered loosely.
    pub fn normalize(&mut self) {
        let raw = self.history_dir.to_string_lossy();
        let trimmed = raw.trim().trim_end_matches(['/', '\\']);
        self.history_dir = if trimmed.is_empty() {
            if raw.trim().starts_with('/') {
                PathBuf::from("/")
            } else {
                default_history_dir()
            }
        } else {
            PathBuf::from(trimmed)
        };

        let live = self.live_file.trim().trim_matches(['/', '\\']);
        self.live_file = if live.is_empty() {
            DEFAULT_LIVE_FILE.to_string()
        } else {
            live.to_string()
        };

        self.endpoints.normalize();
    }

    pub fn with_history_dir(mut self, dir: PathBuf) -> Self {
        self.history_dir = dir;
        self.normalize();
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict_parsing = strict;
        self
    }

    /// Use `model` for this run without touching the file.
    ///
    /// An unknown model is appended, so the indices of the configured models
    /// stay the ones stored in the file.
    pub fn with_model(mut self, model: &str) -> Self {
        let model = model.trim();
        if model.is_empty() {
            return self;
        }
        let models = &mut self.endpoints.models;
        let index = match models.iter().position(|m| m.trim() == model) {
            Some(i) => i,
            None => {
                models.push(model.to_string());
                self.extra_models += 1;
                models.len() - 1
            }
        };
        self.endpoints.current_model = index;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }

    pub fn live_path(&self) -> PathBuf {
        self.history_dir.join(&self.live_file)
    }

    pub fn history_store(&self) -> HistoryStore {
        HistoryStore::new(&self.history_dir, &self.live_file).with_strict(self.strict_parsing)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            auto_clear_on_restart: self.auto_clear_on_restart,
        }
    }

    /// Persist the current selection for `kind`, if this config came from a file.
    ///
    /// A model that only exists for this run is not written.
    pub fn save_selection(&self, kind: EndpointKind) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let index = self.endpoints.current_index(kind);
        if kind == EndpointKind::Model {
            let stored = self.endpoints.models.len().saturating_sub(self.extra_models);
            if index >= stored {
                debug!("Model {} is a command-line override, not saved", index);
                return Ok(());
            }
        }
        write_selection(path, kind, index)
    }
}

/// Set `[endpoints].current_*` in the file at `path`, keeping everything else.
pub fn write_selection(path: &Path, kind: EndpointKind, index: usize) -> Result<()> {
    let existing = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(ChatError::fs(path, e)),
    };

    let mut doc: toml_edit::DocumentMut = existing
        .parse()
        .map_err(|e| ChatError::Config(format!("{}: {}", path.display(), e)))?;

    let root = doc.as_table_mut();
    if !root.get(ENDPOINTS_TABLE).is_some_and(|i| i.is_table()) {
        root.insert(ENDPOINTS_TABLE, toml_edit::table());
    }
    let endpoints = doc[ENDPOINTS_TABLE]
        .as_table_mut()
        .ok_or_else(|| ChatError::Config("endpoints table missing after initialization".into()))?;
    endpoints[kind.config_key()] = toml_edit::value(index as i64);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ChatError::fs(parent, e))?;
    }
    std::fs::write(path, doc.to_string()).map_err(|e| ChatError::fs(path, e))?;
    info!("Saved {} = {} to {:?}", kind.config_key(), index, path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let config = ChatConfig::load(&path).unwrap();
        assert_eq!(config.live_file, DEFAULT_LIVE_FILE);
        assert_eq!(config.endpoints.models, vec!["gpt-4".to_string()]);
        assert_eq!(config.timeout(), None);
        assert_eq!(config.path.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn test_load_and_normalize() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            r#"
history_dir = "/vault/AI/history/"
live_file = " /live.md "
request_timeout_secs = 30

[endpoints]
api_keys = ["work sk-abc", "", "sk-def"]
current_api_key = 7
"#,
        )
        .unwrap();

        let config = ChatConfig::load(&path).unwrap();
        assert_eq!(config.history_dir, PathBuf::from("/vault/AI/history"));
        assert_eq!(config.live_path(), PathBuf::from("/vault/AI/history/live.md"));
        assert_eq!(config.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.endpoints.api_keys.len(), 2);
        assert_eq!(config.endpoints.current_api_key, 1);
        // Lists not given keep their defaults
        assert_eq!(config.endpoints.base_urls, vec!["https://yunwu.ai".to_string()]);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "history_dir = [").unwrap();
        assert!(matches!(ChatConfig::load(&path), Err(ChatError::Config(_))));
    }

    #[test]
    fn test_with_model_selects_or_appends() {
        let mut config = ChatConfig::default();
        config.endpoints.models = vec!["gpt-4".into(), "gpt-4o".into()];

        let config = config.with_model("gpt-4o");
        assert_eq!(config.endpoints.current_model, 1);
        assert_eq!(config.extra_models, 0);

        let config = config.with_model("claude");
        assert_eq!(config.endpoints.models, vec!["gpt-4", "gpt-4o", "claude"]);
        assert_eq!(config.endpoints.current_model, 2);
        assert_eq!(config.extra_models, 1);
    }

    #[test]
    fn test_selection_with_model_override_keeps_file_indices() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            "[endpoints]\nmodels = [\"a\", \"b\"]\ncurrent_model = 0\n",
        )
        .unwrap();

        let mut config = ChatConfig::load(&path).unwrap().with_model("c");
        // The override itself is never written back
        config.save_selection(EndpointKind::Model).unwrap();
        assert_eq!(ChatConfig::load(&path).unwrap().endpoints.current_model, 0);

        config.endpoints.select(EndpointKind::Model, 1).unwrap();
        config.save_selection(EndpointKind::Model).unwrap();
        let reloaded = ChatConfig::load(&path).unwrap();
        assert_eq!(reloaded.endpoints.models, vec!["a", "b"]);
        assert_eq!(reloaded.endpoints.current(EndpointKind::Model), Some("b"));
    }

    #[test]
    fn test_write_selection_preserves_other_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            "# my settings\nstrict_parsing = true\n\n[endpoints]\nmodels = [\"a\", \"b\"]\ncurrent_model = 0\n",
        )
        .unwrap();

        write_selection(&path, EndpointKind::Model, 1).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("# my settings"));
        assert!(text.contains("current_model = 1"));

        let config = ChatConfig::load(&path).unwrap();
        assert!(config.strict_parsing);
        assert_eq!(config.endpoints.current_model, 1);
    }

    #[test]
    fn test_write_selection_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        write_selection(&path, EndpointKind::ApiKey, 2).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("[endpoints]"));
        assert!(text.contains("current_api_key = 2"));
    }
}
