//! Transcript files on disk.
//!
//! Directory layout:
//!   {history_dir}/{live_file}                      live transcript, overwritten every turn
//!   {history_dir}/{YYYY-MM-DD_HH-MM-SS-mmm}.md     archived transcripts, write-once
//!
//! Archived names sort lexically in creation order. Listing orders by
//! modification time, newest first, with the name as tie-break.

use crate::transcript::{self, Conversation};
use crate::{ChatError, Result};
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub const TRANSCRIPT_EXTENSION: &str = "md";
pub const DEFAULT_LIVE_FILE: &str = "临时对话.md";

/// Same-millisecond archives get a numeric suffix; give up after this many.
const MAX_ARCHIVE_SUFFIX: u32 = 100;

/// Direction of travel through archived transcripts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Older,
    Newer,
}

/// Handle to an archived transcript file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedTranscript {
    pub path: PathBuf,
    pub modified: SystemTime,
}

impl ArchivedTranscript {
    /// File name without extension
    pub fn basename(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Result of stepping through the archive list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigateOutcome {
    /// The archive directory holds no transcripts
    NoArchives,
    /// Already at the oldest (or newest) transcript
    AtBoundary,
    Moved(ArchivedTranscript),
}

/// Reads and writes the live transcript and the archive directory.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    history_dir: PathBuf,
    live_path: PathBuf,
    strict: bool,
}

impl HistoryStore {
    pub fn new(history_dir: impl Into<PathBuf>, live_file: &str) -> Self {
        let history_dir = history_dir.into();
        let live_path = history_dir.join(live_file);
        Self {
            history_dir,
            live_path,
            strict: false,
        }
    }

    /// Reject malformed transcripts instead of skipping bad lines.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn history_dir(&self) -> &Path {
        &self.history_dir
    }

    pub fn live_path(&self) -> &Path {
        &self.live_path
    }

    /// Load the live transcript.
    ///
    /// Never fails: a missing file is created empty, and an unreadable or
    /// unparsable one yields an empty conversation.
    pub async fn load_live(&self) -> Conversation {
        match fs::read_to_string(&self.live_path).await {
            Ok(content) => match transcript::deserialize(&content, self.strict) {
                Ok(conversation) => {
                    info!(
                        "Loaded live transcript {:?} ({} turns)",
                        self.live_path,
                        conversation.len()
                    );
                    conversation
                }
                Err(e) => {
                    warn!("Failed to parse live transcript {:?}: {}", self.live_path, e);
                    Conversation::new()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No live transcript at {:?}, creating one", self.live_path);
                if let Err(e) = self.save_live(&Conversation::new()).await {
                    warn!("Failed to create live transcript: {}", e);
                }
                Conversation::new()
            }
            Err(e) => {
                warn!("Failed to read live transcript {:?}: {}", self.live_path, e);
                Conversation::new()
            }
        }
    }

    /// Overwrite the live transcript with the conversation.
    pub async fn save_live(&self, conversation: &Conversation) -> Result<()> {
        let content = transcript::serialize(conversation.turns());
        self.ensure_dir().await?;
        write_truncate(&self.live_path, &content).await?;
        debug!(
            "Saved live transcript ({} turns, {} bytes)",
            conversation.len(),
            content.len()
        );
        Ok(())
    }

    /// Empty the live transcript.
    pub async fn clear_live(&self) -> Result<()> {
        self.save_live(&Conversation::new()).await
    }

    /// Write the conversation to a new archived transcript.
    ///
    /// Returns `None` for an empty conversation, in which case nothing is written.
    pub async fn archive(&self, conversation: &Conversation) -> Result<Option<PathBuf>> {
        if conversation.is_empty() {
            return Ok(None);
        }
        self.ensure_dir().await?;

        let content = transcript::serialize(conversation.turns());
        let stamp = Utc::now().format("%Y-%m-%d_%H-%M-%S-%3f").to_string();

        for attempt in 0..MAX_ARCHIVE_SUFFIX {
            let name = if attempt == 0 {
                format!("{stamp}.{TRANSCRIPT_EXTENSION}")
            } else {
                format!("{stamp}-{attempt}.{TRANSCRIPT_EXTENSION}")
            };
            let path = self.history_dir.join(name);
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(content.as_bytes())
                        .await
                        .map_err(|e| ChatError::fs(&path, e))?;
                    file.flush().await.map_err(|e| ChatError::fs(&path, e))?;
                    info!(
                        "Archived conversation ({} turns) to {:?}",
                        conversation.len(),
                        path
                    );
                    return Ok(Some(path));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(ChatError::fs(&path, e)),
            }
        }

        Err(ChatError::fs(
            &self.history_dir,
            std::io::Error::new(
                ErrorKind::AlreadyExists,
                format!("no free archive name for {stamp}"),
            ),
        ))
    }

    /// Archived transcripts, newest first.
    pub async fn list_archived(&self) -> Result<Vec<ArchivedTranscript>> {
        let mut entries = match fs::read_dir(&self.history_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ChatError::fs(&self.history_dir, e)),
        };

        let mut archived = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ChatError::fs(&self.history_dir, e))?
        {
            let path = entry.path();
            if path == self.live_path {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(TRANSCRIPT_EXTENSION) {
                continue;
            }
            match entry.metadata().await {
                Ok(meta) if meta.is_file() => {
                    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                    archived.push(ArchivedTranscript { path, modified });
                }
                Ok(_) => {}
                Err(e) => warn!("Skipping {:?}: {}", path, e),
            }
        }

        archived.sort_by(|a, b| {
            b.modified
                .cmp(&a.modified)
                .then_with(|| b.path.cmp(&a.path))
        });
        Ok(archived)
    }

    /// Step one archived transcript older or newer than `current`.
    ///
    /// With no current position (or one that is no longer listed), both
    /// directions land on the newest transcript.
    pub async fn navigate(
        &self,
        direction: Direction,
        current: Option<&Path>,
    ) -> Result<NavigateOutcome> {
        let files = self.list_archived().await?;
        if files.is_empty() {
            return Ok(NavigateOutcome::NoArchives);
        }

        let current_index = current.and_then(|p| files.iter().position(|f| f.path == p));
        let next_index = match (current_index, direction) {
            (None, _) => 0,
            (Some(i), Direction::Older) => (i + 1).min(files.len() - 1),
            (Some(i), Direction::Newer) => i.saturating_sub(1),
        };

        if Some(next_index) == current_index {
            return Ok(NavigateOutcome::AtBoundary);
        }
        Ok(NavigateOutcome::Moved(files[next_index].clone()))
    }

    /// Read and decode one archived transcript.
    pub async fn load(&self, path: &Path) -> Result<Conversation> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| ChatError::fs(path, e))?;
        let conversation = transcript::deserialize(&content, self.strict)?;
        debug!("Loaded {:?} ({} turns)", path, conversation.len());
        Ok(conversation)
    }

    async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.history_dir)
            .await
            .map_err(|e| ChatError::fs(&self.history_dir, e))
    }
}

async fn write_truncate(path: &Path, content: &str) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await
        .map_err(|e| ChatError::fs(path, e))?;
    file.write_all(content.as_bytes())
        .await
        .map_err(|e| ChatError::fs(path, e))?;
    file.flush().await.map_err(|e| ChatError::fs(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::Turn;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> HistoryStore {
        HistoryStore::new(dir.path().join("history"), DEFAULT_LIVE_FILE)
    }

    fn sample() -> Conversation {
        let mut conv = Conversation::new();
        conv.push(Turn::user("Hi", Vec::new()));
        conv.push(Turn::assistant("Hello"));
        conv
    }

    #[tokio::test]
    async fn test_load_live_creates_missing_file() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let conv = store.load_live().await;
        assert!(conv.is_empty());
        assert!(store.live_path().exists());
    }

    #[tokio::test]
    async fn test_load_live_falls_back_on_unreadable_file() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        // A directory where the file should be cannot be read as text
        std::fs::create_dir_all(store.live_path()).unwrap();
        assert!(store.load_live().await.is_empty());
    }

    #[tokio::test]
    async fn test_load_live_strict_parse_failure_is_silent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).with_strict(true);
        std::fs::create_dir_all(store.history_dir()).unwrap();
        std::fs::write(store.live_path(), "garbage before header\n").unwrap();
        assert!(store.load_live().await.is_empty());
    }

    #[tokio::test]
    async fn test_save_live_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let conv = sample();
        store.save_live(&conv).await.unwrap();
        let first = std::fs::read(store.live_path()).unwrap();
        store.save_live(&conv).await.unwrap();
        let second = std::fs::read(store.live_path()).unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_archive_empty_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert_eq!(store.archive(&Conversation::new()).await.unwrap(), None);
        assert!(!store.history_dir().exists());
    }

    #[tokio::test]
    async fn test_archive_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let a = store.archive(&sample()).await.unwrap().unwrap();
        let b = store.archive(&sample()).await.unwrap().unwrap();
        assert_ne!(a, b);
        assert_eq!(store.list_archived().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_list_excludes_live_and_other_files() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.save_live(&sample()).await.unwrap();
        std::fs::write(store.history_dir().join("notes.txt"), "x").unwrap();
        std::fs::create_dir_all(store.history_dir().join("sub.md")).unwrap();
        let archived = store.archive(&sample()).await.unwrap().unwrap();
        let listed = store.list_archived().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, archived);
    }

    #[tokio::test]
    async fn test_list_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(store(&dir).list_archived().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_navigate_no_archives() {
        let dir = TempDir::new().unwrap();
        let outcome = store(&dir).navigate(Direction::Older, None).await.unwrap();
        assert_eq!(outcome, NavigateOutcome::NoArchives);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_error() {
        let dir = TempDir::new().unwrap();
        let err = store(&dir)
            .load(&dir.path().join("nope.md"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Filesystem { .. }));
    }
}
