//! Per-connection session state.

use std::collections::HashMap;

use parking_lot::Mutex;

/// State for a single authenticated WebSocket connection.
///
/// The user id is fixed at handshake and immutable afterwards. Everything
/// else here is ephemeral and dies with the connection.
pub struct ConnectionSession {
    /// Unique connection identifier (`conn_` prefixed ULID).
    pub connection_id: String,
    /// Authenticated user id.
    pub user_id: String,
    /// Active typing indicators: conversation id -> generation. A stale
    /// expiry task compares its generation against the current one so a
    /// refreshed indicator is not expired early.
    typing: Mutex<HashMap<String, u64>>,
    /// Peer user id of the call this connection is signaling for, if any.
    call_peer: Mutex<Option<String>>,
}

impl ConnectionSession {
    pub fn new(connection_id: String, user_id: String) -> Self {
        Self {
            connection_id,
            user_id,
            typing: Mutex::new(HashMap::new()),
            call_peer: Mutex::new(None),
        }
    }

    /// Record (or refresh) a typing indicator and return its generation.
    pub fn begin_typing(&self, conversation_id: &str) -> u64 {
        let mut typing = self.typing.lock();
        let generation = typing.get(conversation_id).copied().unwrap_or(0) + 1;
        typing.insert(conversation_id.to_string(), generation);
        generation
    }

    /// Whether the indicator for a conversation is still at `generation`.
    pub fn still_typing(&self, conversation_id: &str, generation: u64) -> bool {
        self.typing.lock().get(conversation_id).copied() == Some(generation)
    }

    /// Clear a typing indicator. Returns whether one was active.
    pub fn stop_typing(&self, conversation_id: &str) -> bool {
        self.typing.lock().remove(conversation_id).is_some()
    }

    /// Take every active typing indicator (teardown).
    pub fn drain_typing(&self) -> Vec<String> {
        self.typing.lock().drain().map(|(id, _)| id).collect()
    }

    /// Bind this connection to a call with `peer_user_id`.
    pub fn set_call_peer(&self, peer_user_id: &str) {
        *self.call_peer.lock() = Some(peer_user_id.to_string());
    }

    /// Clear the call binding if it points at `peer_user_id`.
    pub fn clear_call_peer(&self, peer_user_id: &str) {
        let mut peer = self.call_peer.lock();
        if peer.as_deref() == Some(peer_user_id) {
            *peer = None;
        }
    }

    pub fn call_peer(&self) -> Option<String> {
        self.call_peer.lock().clone()
    }
}
