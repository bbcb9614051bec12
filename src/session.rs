//! Conversation session: one conversation, at most one request in flight.
//!
//! State machine: `Idle` → `Sending` (user turn appended, reply streaming)
//! → `Idle`. Operations that replace the conversation (`new_conversation`,
//! `clear`, `restore`) take the same slot, so none of them can interleave
//! with a streaming reply.

use crate::client::{CompletionClient, CompletionRequest};
use crate::endpoints::{EndpointKind, EndpointSet};
use crate::history::{Direction, HistoryStore, NavigateOutcome};
use crate::transcript::{clean_text, Conversation, Turn};
use crate::{ChatError, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Prefix of the text shown in place of a failed reply
pub const ERROR_MARKER: &str = "error: ";

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Archive whatever the live transcript holds when the session opens
    pub auto_clear_on_restart: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Sending,
}

/// How a submitted turn ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Nothing to send
    Ignored,
    Replied(String),
    /// The request failed; the assistant turn holds the error marker
    Failed(String),
    /// Cancelled mid-stream; the assistant turn keeps the partial text
    Cancelled,
}

/// Clears the in-flight flag when dropped, including on early return.
struct InFlightGuard {
    flag: Arc<AtomicBool>,
}

impl InFlightGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ChatError::AlreadyInFlight)?;
        Ok(Self {
            flag: Arc::clone(flag),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ConversationSession {
    conversation: Mutex<Conversation>,
    current_archive: Mutex<Option<PathBuf>>,
    endpoints: Mutex<EndpointSet>,
    store: HistoryStore,
    client: Arc<dyn CompletionClient>,
    in_flight: Arc<AtomicBool>,
}

impl ConversationSession {
    /// Open a session on the live transcript.
    pub async fn open(
        store: HistoryStore,
        client: Arc<dyn CompletionClient>,
        endpoints: EndpointSet,
        options: SessionOptions,
    ) -> Self {
        let mut conversation = store.load_live().await;

        if options.auto_clear_on_restart && !conversation.is_empty() {
            match store.archive(&conversation).await {
                Ok(path) => {
                    info!("Archived previous conversation to {:?} on open", path);
                    conversation.clear();
                    if let Err(e) = store.clear_live().await {
                        warn!("Failed to wipe live transcript: {}", e);
                    }
                }
                Err(e) => warn!("Failed to archive previous conversation: {}", e),
            }
        }

        Self {
            conversation: Mutex::new(conversation),
            current_archive: Mutex::new(None),
            endpoints: Mutex::new(endpoints),
            store,
            client,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> SessionState {
        if self.in_flight.load(Ordering::Acquire) {
            SessionState::Sending
        } else {
            SessionState::Idle
        }
    }

    /// Copy of the current conversation
    pub fn conversation(&self) -> Conversation {
        lock(&self.conversation).clone()
    }

    pub fn current_archive(&self) -> Option<PathBuf> {
        lock(&self.current_archive).clone()
    }

    pub fn store(&self) -> &HistoryStore {
        &self.store
    }

    pub fn endpoints(&self) -> EndpointSet {
        lock(&self.endpoints).clone()
    }

    pub fn select_endpoint(&self, kind: EndpointKind, index: usize) -> Result<()> {
        lock(&self.endpoints).select(kind, index)
    }

    /// Text of the newest assistant reply with surrounding blank lines removed
    pub fn last_reply_text(&self) -> Option<String> {
        lock(&self.conversation)
            .last_assistant()
            .map(|t| clean_text(&t.text))
    }

    /// Send a user turn and stream the reply.
    ///
    /// `on_partial` receives the full reply text after every streamed delta.
    /// Request failures do not fail this call: they end up as an error entry
    /// in the conversation and a [`TurnOutcome::Failed`]. Only a concurrent
    /// request is rejected, with [`ChatError::AlreadyInFlight`].
    pub async fn submit(
        &self,
        text: &str,
        images: Vec<String>,
        on_partial: &mut (dyn for<'p> FnMut(&'p str) + Send),
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        let text = text.trim();
        if text.is_empty() && images.is_empty() {
            return Ok(TurnOutcome::Ignored);
        }
        let _guard = InFlightGuard::acquire(&self.in_flight)?;

        lock(&self.conversation).push(Turn::user(text, images));
        self.checkpoint().await;

        let request = {
            let mut conversation = lock(&self.conversation);
            let request = self
                .endpoints()
                .resolve()
                .map(|endpoint| CompletionRequest::from_turns(endpoint, conversation.turns()));
            conversation.push(Turn::assistant_placeholder());
            request
        };

        let result = match request {
            Ok(request) => {
                let mut forward = |partial: &str| {
                    if let Some(turn) = lock(&self.conversation).last_mut() {
                        turn.text = partial.to_string();
                    }
                    on_partial(partial);
                };
                self.client.complete(&request, &mut forward, cancel).await
            }
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok(reply) => {
                self.set_reply_text(reply.clone());
                TurnOutcome::Replied(reply)
            }
            Err(ChatError::Cancelled) => {
                info!("Reply cancelled, keeping partial text");
                TurnOutcome::Cancelled
            }
            Err(e) => {
                let message = e.notice();
                warn!("Completion failed: {}", message);
                self.set_reply_text(format!("{ERROR_MARKER}{message}"));
                TurnOutcome::Failed(message)
            }
        };

        self.checkpoint().await;
        Ok(outcome)
    }

    /// Archive the current conversation and start an empty one.
    ///
    /// Returns the archive path, or `None` when there was nothing to archive.
    /// On archive failure the conversation is left untouched.
    pub async fn new_conversation(&self) -> Result<Option<PathBuf>> {
        let _guard = InFlightGuard::acquire(&self.in_flight)?;

        let snapshot = self.conversation();
        let archived = self.store.archive(&snapshot).await?;

        lock(&self.conversation).clear();
        *lock(&self.current_archive) = None;
        if let Err(e) = self.store.clear_live().await {
            warn!("Failed to wipe live transcript after archiving: {}", e);
        }
        Ok(archived)
    }

    /// Drop all turns and wipe the live transcript without archiving.
    ///
    /// Returns `false` when the conversation was already empty.
    pub async fn clear(&self) -> Result<bool> {
        let _guard = InFlightGuard::acquire(&self.in_flight)?;

        if lock(&self.conversation).is_empty() {
            return Ok(false);
        }
        self.store.clear_live().await?;
        lock(&self.conversation).clear();
        *lock(&self.current_archive) = None;
        debug!("Conversation cleared");
        Ok(true)
    }

    /// Replace the conversation with the adjacent archived transcript.
    ///
    /// The live transcript is left alone until the next submitted turn.
    pub async fn restore(&self, direction: Direction) -> Result<NavigateOutcome> {
        let _guard = InFlightGuard::acquire(&self.in_flight)?;

        let current = self.current_archive();
        let outcome = self
            .store
            .navigate(direction, current.as_deref())
            .await?;
        if let NavigateOutcome::Moved(file) = &outcome {
            self.load_archive(&file.path).await?;
        }
        Ok(outcome)
    }

    async fn load_archive(&self, path: &Path) -> Result<()> {
        let loaded = self.store.load(path).await?;
        info!("Restored {:?} ({} turns)", path, loaded.len());
        *lock(&self.conversation) = loaded;
        *lock(&self.current_archive) = Some(path.to_path_buf());
        Ok(())
    }

    fn set_reply_text(&self, text: String) {
        if let Some(turn) = lock(&self.conversation).last_mut() {
            turn.text = text;
        }
    }

    /// Best-effort save of the live transcript
    async fn checkpoint(&self) {
        let snapshot = self.conversation();
        if let Err(e) = self.store.save_live(&snapshot).await {
            warn!("Failed to save live transcript: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::DEFAULT_LIVE_FILE;
    use crate::transcript::Role;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    /// Replays fixed deltas, or fails with a fixed error
    struct ScriptedClient {
        deltas: Vec<&'static str>,
        fail_with: Option<fn() -> ChatError>,
        calls: AtomicUsize,
        seen_messages: Mutex<Vec<usize>>,
    }

    impl ScriptedClient {
        fn replying(deltas: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                deltas,
                fail_with: None,
                calls: AtomicUsize::new(0),
                seen_messages: Mutex::new(Vec::new()),
            })
        }

        fn failing(err: fn() -> ChatError) -> Arc<Self> {
            Arc::new(Self {
                deltas: Vec::new(),
                fail_with: Some(err),
                calls: AtomicUsize::new(0),
                seen_messages: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        async fn complete(
            &self,
            request: &CompletionRequest,
            on_partial: &mut (dyn for<'p> FnMut(&'p str) + Send),
            _cancel: &CancellationToken,
        ) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            lock(&self.seen_messages).push(request.messages.len());
            if let Some(err) = self.fail_with {
                return Err(err());
            }
            let mut text = String::new();
            for delta in &self.deltas {
                text.push_str(delta);
                on_partial(&text);
            }
            Ok(text)
        }
    }

    fn endpoints() -> EndpointSet {
        EndpointSet {
            api_keys: vec!["sk-test".to_string()],
            ..Default::default()
        }
    }

    async fn open(dir: &TempDir, client: Arc<ScriptedClient>) -> ConversationSession {
        let store = HistoryStore::new(dir.path(), DEFAULT_LIVE_FILE);
        ConversationSession::open(store, client, endpoints(), SessionOptions::default()).await
    }

    #[tokio::test]
    async fn test_empty_submit_is_noop() {
        let dir = TempDir::new().unwrap();
        let client = ScriptedClient::replying(vec!["x"]);
        let session = open(&dir, client.clone()).await;
        let cancel = CancellationToken::new();
        let outcome = session
            .submit("   ", Vec::new(), &mut |_: &str| {}, &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, TurnOutcome::Ignored);
        assert!(session.conversation().is_empty());
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_image_only_submit_is_sent() {
        let dir = TempDir::new().unwrap();
        let client = ScriptedClient::replying(vec!["a cat"]);
        let session = open(&dir, client.clone()).await;
        let cancel = CancellationToken::new();
        let outcome = session
            .submit("", vec!["AAAA".to_string()], &mut |_: &str| {}, &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, TurnOutcome::Replied("a cat".to_string()));
        assert_eq!(session.conversation().turns()[0].images, vec!["AAAA".to_string()]);
    }

    #[tokio::test]
    async fn test_submit_streams_into_placeholder() {
        let dir = TempDir::new().unwrap();
        let client = ScriptedClient::replying(vec!["Hel", "lo"]);
        let session = open(&dir, client.clone()).await;
        let cancel = CancellationToken::new();
        let mut partials = Vec::new();
        let outcome = session
            .submit("Hi", Vec::new(), &mut |t: &str| partials.push(t.to_string()), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome, TurnOutcome::Replied("Hello".to_string()));
        assert_eq!(partials, vec!["Hel", "Hello"]);
        let conv = session.conversation();
        assert_eq!(conv.len(), 2);
        assert_eq!(conv.turns()[1].role, Role::Assistant);
        assert_eq!(conv.turns()[1].text, "Hello");
        // The placeholder is not part of the request
        assert_eq!(*lock(&client.seen_messages), vec![1]);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_failed_request_leaves_error_entry() {
        let dir = TempDir::new().unwrap();
        let client = ScriptedClient::failing(|| ChatError::HttpStatus {
            status: 401,
            status_text: "Unauthorized".to_string(),
            body: r#"{"error":{"message":"bad key"}}"#.to_string(),
        });
        let session = open(&dir, client).await;
        let cancel = CancellationToken::new();
        let outcome = session
            .submit("Hi", Vec::new(), &mut |_: &str| {}, &cancel)
            .await
            .unwrap();

        assert!(matches!(outcome, TurnOutcome::Failed(ref m) if m.contains("bad key")));
        let conv = session.conversation();
        assert_eq!(conv.len(), 2);
        assert!(conv.turns()[1].text.starts_with(ERROR_MARKER));
        let saved = std::fs::read_to_string(session.store().live_path()).unwrap();
        assert!(saved.contains("bad key"));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_turn() {
        let dir = TempDir::new().unwrap();
        let client = ScriptedClient::replying(vec!["x"]);
        let store = HistoryStore::new(dir.path(), DEFAULT_LIVE_FILE);
        let session = ConversationSession::open(
            store,
            client.clone(),
            EndpointSet::default(),
            SessionOptions::default(),
        )
        .await;
        let cancel = CancellationToken::new();
        let outcome = session
            .submit("Hi", Vec::new(), &mut |_: &str| {}, &cancel)
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::Failed(_)));
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_second_operation_rejected_while_sending() {
        let dir = TempDir::new().unwrap();
        let session = open(&dir, ScriptedClient::replying(vec!["x"])).await;
        let _held = InFlightGuard::acquire(&session.in_flight).unwrap();
        assert_eq!(session.state(), SessionState::Sending);

        let cancel = CancellationToken::new();
        let err = session
            .submit("Hi", Vec::new(), &mut |_: &str| {}, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::AlreadyInFlight));
        assert!(matches!(session.clear().await, Err(ChatError::AlreadyInFlight)));
        assert!(session.conversation().is_empty());
    }

    #[tokio::test]
    async fn test_new_conversation_archives_and_resets() {
        let dir = TempDir::new().unwrap();
        let session = open(&dir, ScriptedClient::replying(vec!["yo"])).await;
        let cancel = CancellationToken::new();
        session
            .submit("Hi", Vec::new(), &mut |_: &str| {}, &cancel)
            .await
            .unwrap();

        let archived = session.new_conversation().await.unwrap().unwrap();
        assert!(archived.exists());
        assert!(session.conversation().is_empty());
        assert_eq!(session.current_archive(), None);
        let live = std::fs::read_to_string(session.store().live_path()).unwrap();
        assert!(live.is_empty());

        // Nothing left to archive
        assert_eq!(session.new_conversation().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clear_does_not_archive() {
        let dir = TempDir::new().unwrap();
        let session = open(&dir, ScriptedClient::replying(vec!["yo"])).await;
        let cancel = CancellationToken::new();
        session
            .submit("Hi", Vec::new(), &mut |_: &str| {}, &cancel)
            .await
            .unwrap();

        assert!(session.clear().await.unwrap());
        assert!(!session.clear().await.unwrap());
        assert!(session.store().list_archived().await.unwrap().is_empty());
        let live = std::fs::read_to_string(session.store().live_path()).unwrap();
        assert!(live.is_empty());
    }

    #[tokio::test]
    async fn test_restore_replaces_turns_but_not_live_file() {
        let dir = TempDir::new().unwrap();
        let session = open(&dir, ScriptedClient::replying(vec!["yo"])).await;
        let cancel = CancellationToken::new();
        session
            .submit("old question", Vec::new(), &mut |_: &str| {}, &cancel)
            .await
            .unwrap();
        let archived = session.new_conversation().await.unwrap().unwrap();

        let outcome = session.restore(Direction::Older).await.unwrap();
        assert!(matches!(outcome, NavigateOutcome::Moved(ref f) if f.path == archived));
        assert_eq!(session.conversation().turns()[0].text, "old question");
        assert_eq!(session.current_archive(), Some(archived));
        let live = std::fs::read_to_string(session.store().live_path()).unwrap();
        assert!(live.is_empty());

        assert_eq!(
            session.restore(Direction::Older).await.unwrap(),
            NavigateOutcome::AtBoundary
        );
    }

    #[tokio::test]
    async fn test_auto_clear_on_restart_archives_live() {
        let dir = TempDir::new().unwrap();
        let store = HistoryStore::new(dir.path(), DEFAULT_LIVE_FILE);
        let mut previous = Conversation::new();
        previous.push(Turn::user("left over", Vec::new()));
        store.save_live(&previous).await.unwrap();

        let session = ConversationSession::open(
            store,
            ScriptedClient::replying(vec![]),
            endpoints(),
            SessionOptions {
                auto_clear_on_restart: true,
            },
        )
        .await;
        assert!(session.conversation().is_empty());
        assert_eq!(session.store().list_archived().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_last_reply_text_is_cleaned() {
        let dir = TempDir::new().unwrap();
        let session = open(&dir, ScriptedClient::replying(vec!["\n\nanswer\n\n"])).await;
        let cancel = CancellationToken::new();
        session
            .submit("q", Vec::new(), &mut |_: &str| {}, &cancel)
            .await
            .unwrap();
        assert_eq!(session.last_reply_text().as_deref(), Some("answer"));
    }

    /// Streams one delta, then reports the turn as cancelled.
    struct InterruptedClient;

    #[async_trait]
    impl CompletionClient for InterruptedClient {
        async fn complete(
            &self,
            _request: &CompletionRequest,
            on_partial: &mut (dyn for<'p> FnMut(&'p str) + Send),
            _cancel: &CancellationToken,
        ) -> Result<String> {
            on_partial("par");
            Err(ChatError::Cancelled)
        }
    }

    #[tokio::test]
    async fn test_cancelled_turn_keeps_partial_text() {
        let dir = TempDir::new().unwrap();
        let store = HistoryStore::new(dir.path(), DEFAULT_LIVE_FILE);
        let session = ConversationSession::open(
            store,
            Arc::new(InterruptedClient),
            endpoints(),
            SessionOptions::default(),
        )
        .await;
        let outcome = session
            .submit("q", Vec::new(), &mut |_: &str| {}, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, TurnOutcome::Cancelled);
        assert_eq!(session.state(), SessionState::Idle);

        let conv = session.conversation();
        assert_eq!(conv.len(), 2);
        assert_eq!(conv.turns()[1].role, Role::Assistant);
        assert_eq!(conv.turns()[1].text, "par");

        let reloaded = session.store().load_live().await;
        assert_eq!(reloaded.turns()[1].text, "par");
    }
}
