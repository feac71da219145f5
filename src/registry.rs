//! Live session table.
//!
//! Streams, WebSockets, transfers and multipart uploads are registered here
//! under their caller-chosen id while they are alive. Each entry carries a
//! generation so a stale deregistration hook can never remove a newer
//! session that reused the same id.

use crate::base::neterror::NetError;
use crate::sse::StreamSession;
use crate::transfer::{MultipartUploadSession, TransferSession};
use crate::ws::WebSocketSession;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A registered session of any kind.
#[derive(Debug, Clone)]
pub enum SessionHandle {
    Stream(StreamSession),
    WebSocket(WebSocketSession),
    Transfer(TransferSession),
    Upload(MultipartUploadSession),
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        match self {
            SessionHandle::Stream(s) => s.id(),
            SessionHandle::WebSocket(s) => s.id(),
            SessionHandle::Transfer(s) => s.id(),
            SessionHandle::Upload(s) => s.id(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SessionHandle::Stream(_) => "stream",
            SessionHandle::WebSocket(_) => "websocket",
            SessionHandle::Transfer(_) => "transfer",
            SessionHandle::Upload(_) => "upload",
        }
    }

    /// Cancel the session. Returns false if it had already ended.
    pub fn cancel(&self) -> bool {
        match self {
            SessionHandle::Stream(s) => s.cancel(),
            SessionHandle::WebSocket(s) => s.cancel(),
            SessionHandle::Transfer(s) => s.cancel(),
            SessionHandle::Upload(s) => s.cancel(),
        }
    }

    /// Install the hook that runs when the session ends.
    fn on_terminal<F: FnOnce() + Send + 'static>(&self, f: F) {
        match self {
            SessionHandle::Stream(s) => s.on_terminal(f),
            SessionHandle::WebSocket(s) => s.on_terminal(f),
            SessionHandle::Transfer(s) => s.on_terminal(f),
            SessionHandle::Upload(s) => s.on_terminal(f),
        }
    }
}

#[derive(Default)]
struct Table {
    sessions: DashMap<String, (u64, SessionHandle)>,
    next_generation: AtomicU64,
}

/// Id → session map shared by a manager and its sessions' exit hooks.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    table: Arc<Table>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` and arrange for it to leave the table when it ends.
    /// Must be called before the session is started. Fails with
    /// `InvalidState` if the id is taken by a live session.
    pub fn insert(&self, handle: SessionHandle) -> Result<(), NetError> {
        let id = handle.id().to_string();
        let generation = self.table.next_generation.fetch_add(1, Ordering::Relaxed);
        match self.table.sessions.entry(id.clone()) {
            Entry::Occupied(_) => {
                tracing::debug!(session_id = %id, "session id already in use");
                return Err(NetError::InvalidState);
            }
            Entry::Vacant(v) => {
                v.insert((generation, handle.clone()));
            }
        }

        let table = Arc::downgrade(&self.table);
        handle.on_terminal(move || {
            if let Some(table) = table.upgrade() {
                table
                    .sessions
                    .remove_if(&id, |_, (current, _)| *current == generation);
            }
        });
        tracing::debug!(session_id = %handle.id(), kind = handle.kind(), "session registered");
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Option<SessionHandle> {
        self.table.sessions.remove(id).map(|(_, (_, handle))| handle)
    }

    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        self.table.sessions.get(id).map(|entry| entry.value().1.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.table.sessions.contains_key(id)
    }

    /// Cancel and deregister the session under `id`.
    pub fn cancel(&self, id: &str) -> bool {
        match self.get(id) {
            Some(handle) => {
                let cancelled = handle.cancel();
                self.remove(id);
                cancelled
            }
            None => false,
        }
    }

    /// Cancel every live session.
    pub fn cancel_all(&self) {
        let handles: Vec<SessionHandle> = self
            .table
            .sessions
            .iter()
            .map(|entry| entry.value().1.clone())
            .collect();
        for handle in handles {
            handle.cancel();
        }
        self.table.sessions.clear();
    }

    pub fn len(&self) -> usize {
        self.table.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.sessions.is_empty()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::events::channel;
    use crate::sse::StreamEvent;

    fn stream(id: &str) -> (StreamSession, tokio::sync::mpsc::UnboundedReceiver<StreamEvent>) {
        let (sink, rx) = channel();
        (StreamSession::new(id, sink), rx)
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = SessionRegistry::new();
        let (a, _rx_a) = stream("s1");
        let (b, _rx_b) = stream("s1");
        registry.insert(SessionHandle::Stream(a)).unwrap();
        assert_eq!(
            registry.insert(SessionHandle::Stream(b)),
            Err(NetError::InvalidState)
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_terminal_session_leaves_table() {
        let registry = SessionRegistry::new();
        let (session, _rx) = stream("s1");
        registry
            .insert(SessionHandle::Stream(session.clone()))
            .unwrap();
        assert!(registry.contains("s1"));

        assert!(session.cancel());
        assert!(!registry.contains("s1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_hook_keeps_newer_session() {
        let registry = SessionRegistry::new();
        let (old, _rx_old) = stream("s1");
        registry.insert(SessionHandle::Stream(old.clone())).unwrap();
        registry.remove("s1");

        let (new, _rx_new) = stream("s1");
        registry.insert(SessionHandle::Stream(new)).unwrap();

        old.cancel();
        assert!(registry.contains("s1"));
    }

    #[test]
    fn test_cancel_unknown() {
        let registry = SessionRegistry::new();
        assert!(!registry.cancel("nope"));
    }
}
