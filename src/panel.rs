//! Registry of open chat panels.
//!
//! Each panel owns one [`ConversationSession`] and the cancellation token of
//! its current turn. The registry is created once at startup with
//! [`PanelRegistry::init`] and torn down on exit, which cancels every stream
//! still in flight.

use crate::session::ConversationSession;
use crate::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PanelId(u64);

impl std::fmt::Display for PanelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "panel-{}", self.0)
    }
}

struct Panel {
    session: Arc<ConversationSession>,
    turn: CancellationToken,
}

pub struct PanelRegistry {
    panels: Mutex<BTreeMap<PanelId, Panel>>,
    next_id: AtomicU64,
    root: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PanelRegistry {
    pub fn init() -> Self {
        debug!("Panel registry initialized");
        Self {
            panels: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            root: CancellationToken::new(),
        }
    }

    /// Cancel every in-flight turn and drop all panels.
    pub fn teardown(&self) {
        self.root.cancel();
        let closed = std::mem::take(&mut *lock(&self.panels));
        info!("Panel registry torn down ({} panels)", closed.len());
    }

    pub fn open_panel(&self, session: Arc<ConversationSession>) -> PanelId {
        let id = PanelId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let panel = Panel {
            session,
            turn: self.root.child_token(),
        };
        lock(&self.panels).insert(id, panel);
        debug!("Opened {}", id);
        id
    }

    /// Close a panel, cancelling its stream if one is running.
    pub fn close_panel(&self, id: PanelId) -> bool {
        match lock(&self.panels).remove(&id) {
            Some(panel) => {
                panel.turn.cancel();
                debug!("Closed {}", id);
                true
            }
            None => false,
        }
    }

    pub fn session(&self, id: PanelId) -> Option<Arc<ConversationSession>> {
        lock(&self.panels).get(&id).map(|p| Arc::clone(&p.session))
    }

    /// Fresh cancellation token for the next turn on `id`.
    pub fn begin_turn(&self, id: PanelId) -> Option<CancellationToken> {
        let mut panels = lock(&self.panels);
        let panel = panels.get_mut(&id)?;
        panel.turn = self.root.child_token();
        Some(panel.turn.clone())
    }

    /// Cancel the running turn on `id`. Returns `false` for unknown panels.
    pub fn cancel(&self, id: PanelId) -> bool {
        match lock(&self.panels).get(&id) {
            Some(panel) => {
                panel.turn.cancel();
                true
            }
            None => false,
        }
    }

    pub fn ids(&self) -> Vec<PanelId> {
        lock(&self.panels).keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.panels).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start a new conversation on every open panel.
    pub async fn new_conversation_all(&self) -> Vec<(PanelId, Result<Option<PathBuf>>)> {
        let sessions: Vec<_> = lock(&self.panels)
            .iter()
            .map(|(id, p)| (*id, Arc::clone(&p.session)))
            .collect();

        let mut results = Vec::with_capacity(sessions.len());
        for (id, session) in sessions {
            let result = session.new_conversation().await;
            if let Err(e) = &result {
                warn!("{}: new conversation failed: {}", id, e);
            }
            results.push((id, result));
        }
        results
    }
}
