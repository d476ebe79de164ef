//! Room/broadcast router: maps room ids to live connections and fans events
//! out through one mpsc channel per connection.
//!
//! Delivery is best-effort fire-and-forget. A connection mid-disconnect may
//! silently miss an event; durability is the protocol handler's job (it
//! persists before it broadcasts). Per-connection ordering is preserved
//! because every event to a connection flows through its single channel.
//! Queues are bounded: a stalled-but-open client drops events once its
//! buffer is full instead of growing the queue without limit.

use std::collections::HashSet;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::events::ServerEvent;

pub type OutboundSender = mpsc::Sender<ServerEvent>;

/// Outbound queue depth per connection.
pub const OUTBOUND_BUFFER: usize = 256;

/// Name of a user's personal room: every device of the user is joined to it
/// for the lifetime of its connection, so any component can reach "all of
/// user U's devices" without knowing connection ids.
pub fn personal_room(user_id: &str) -> String {
    format!("user:{user_id}")
}

struct ConnectionHandle {
    user_id: String,
    sender: OutboundSender,
}

pub struct RoomRouter {
    connections: DashMap<String, ConnectionHandle>,
    /// room id -> connection ids
    rooms: DashMap<String, HashSet<String>>,
    /// connection id -> room ids, for teardown
    joined: DashMap<String, HashSet<String>>,
}

impl RoomRouter {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
            joined: DashMap::new(),
        }
    }

    /// Register a connection's outbound channel and join its personal room.
    pub fn register_connection(&self, connection_id: &str, user_id: &str, sender: OutboundSender) {
        self.connections.insert(
            connection_id.to_string(),
            ConnectionHandle {
                user_id: user_id.to_string(),
                sender,
            },
        );
        self.join(connection_id, &personal_room(user_id));
    }

    /// Drop a connection and leave every room it had joined.
    pub fn remove_connection(&self, connection_id: &str) {
        let rooms = self
            .joined
            .remove(connection_id)
            .map(|(_, rooms)| rooms)
            .unwrap_or_default();
        for room_id in rooms {
            self.leave_room_set(connection_id, &room_id);
        }
        self.connections.remove(connection_id);
    }

    /// Subscribe a connection to a room. Idempotent; a no-op for connections
    /// that are already gone.
    pub fn join(&self, connection_id: &str, room_id: &str) {
        if !self.connections.contains_key(connection_id) {
            return;
        }
        self.rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
        self.joined
            .entry(connection_id.to_string())
            .or_default()
            .insert(room_id.to_string());
    }

    pub fn leave(&self, connection_id: &str, room_id: &str) {
        if let Some(mut rooms) = self.joined.get_mut(connection_id) {
            rooms.remove(room_id);
        }
        self.leave_room_set(connection_id, room_id);
    }

    fn leave_room_set(&self, connection_id: &str, room_id: &str) {
        if let Entry::Occupied(mut occupied) = self.rooms.entry(room_id.to_string()) {
            occupied.get_mut().remove(connection_id);
            if occupied.get().is_empty() {
                occupied.remove();
            }
        }
    }

    pub fn is_joined(&self, connection_id: &str, room_id: &str) -> bool {
        self.joined
            .get(connection_id)
            .map(|rooms| rooms.contains(room_id))
            .unwrap_or(false)
    }

    /// Deliver an event to every connection joined to a room.
    pub fn emit_to_room(&self, room_id: &str, event: &ServerEvent) {
        self.emit_filtered(room_id, event, None);
    }

    /// Same, excluding the originating connection (typing indicators).
    pub fn emit_to_room_except(&self, room_id: &str, exclude: &str, event: &ServerEvent) {
        self.emit_filtered(room_id, event, Some(exclude));
    }

    /// Deliver to every device of a user, regardless of joined rooms.
    pub fn emit_to_user(&self, user_id: &str, event: &ServerEvent) {
        self.emit_to_room(&personal_room(user_id), event);
    }

    /// Deliver to one connection.
    pub fn emit_to_connection(&self, connection_id: &str, event: &ServerEvent) {
        if let Some(handle) = self.connections.get(connection_id) {
            let _ = handle.sender.try_send(event.clone());
        }
    }

    /// Deliver to every live connection (status change broadcasts).
    pub fn emit_to_all(&self, event: &ServerEvent) {
        for handle in self.connections.iter() {
            let _ = handle.sender.try_send(event.clone());
        }
    }

    fn emit_filtered(&self, room_id: &str, event: &ServerEvent, exclude: Option<&str>) {
        let Some(members) = self.rooms.get(room_id) else {
            return;
        };
        for connection_id in members.iter() {
            if exclude == Some(connection_id.as_str()) {
                continue;
            }
            if let Some(handle) = self.connections.get(connection_id) {
                // Fails when the receiver is gone or its buffer is full.
                let _ = handle.sender.try_send(event.clone());
            }
        }
    }

    /// Distinct user ids with at least one connection in the room. Used to
    /// decide who gets a push notification instead of a live event.
    pub fn users_in_room(&self, room_id: &str) -> HashSet<String> {
        let Some(members) = self.rooms.get(room_id) else {
            return HashSet::new();
        };
        members
            .iter()
            .filter_map(|connection_id| {
                self.connections
                    .get(connection_id.as_str())
                    .map(|handle| handle.user_id.clone())
            })
            .collect()
    }
}

impl Default for RoomRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::Receiver;

    fn connect(router: &RoomRouter, connection_id: &str, user_id: &str) -> Receiver<ServerEvent> {
        let (tx, rx) = mpsc::channel(8);
        router.register_connection(connection_id, user_id, tx);
        rx
    }

    fn typing_event() -> ServerEvent {
        ServerEvent::UserTyping {
            user_id: "usr_a".to_string(),
            conversation_id: "conv_1".to_string(),
        }
    }

    #[tokio::test]
    async fn emit_to_room_reaches_only_members() {
        let router = RoomRouter::new();
        let mut rx_a = connect(&router, "c_a", "usr_a");
        let mut rx_b = connect(&router, "c_b", "usr_b");

        router.join("c_a", "conv_1");
        router.emit_to_room("conv_1", &typing_event());

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let router = RoomRouter::new();
        let mut rx = connect(&router, "c_a", "usr_a");

        router.join("c_a", "conv_1");
        router.join("c_a", "conv_1");
        router.emit_to_room("conv_1", &typing_event());

        assert!(rx.try_recv().is_ok());
        // A second join must not produce a second delivery.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn personal_room_reaches_every_device() {
        let router = RoomRouter::new();
        let mut rx_1 = connect(&router, "c_1", "usr_a");
        let mut rx_2 = connect(&router, "c_2", "usr_a");
        let mut rx_other = connect(&router, "c_3", "usr_b");

        router.emit_to_user("usr_a", &typing_event());

        assert!(rx_1.try_recv().is_ok());
        assert!(rx_2.try_recv().is_ok());
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn except_excludes_the_originating_connection() {
        let router = RoomRouter::new();
        let mut rx_a = connect(&router, "c_a", "usr_a");
        let mut rx_b = connect(&router, "c_b", "usr_b");

        router.join("c_a", "conv_1");
        router.join("c_b", "conv_1");
        router.emit_to_room_except("conv_1", "c_a", &typing_event());

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn remove_connection_leaves_all_rooms() {
        let router = RoomRouter::new();
        let _rx = connect(&router, "c_a", "usr_a");
        router.join("c_a", "conv_1");

        router.remove_connection("c_a");

        assert!(!router.is_joined("c_a", "conv_1"));
        assert!(router.users_in_room("conv_1").is_empty());
        assert!(router.users_in_room(&personal_room("usr_a")).is_empty());
    }

    #[tokio::test]
    async fn join_after_disconnect_is_a_noop() {
        let router = RoomRouter::new();
        let _rx = connect(&router, "c_a", "usr_a");
        router.remove_connection("c_a");

        router.join("c_a", "conv_1");
        assert!(router.users_in_room("conv_1").is_empty());
    }

    #[tokio::test]
    async fn users_in_room_is_per_user_not_per_connection() {
        let router = RoomRouter::new();
        let _rx_1 = connect(&router, "c_1", "usr_a");
        let _rx_2 = connect(&router, "c_2", "usr_a");
        let _rx_3 = connect(&router, "c_3", "usr_b");

        router.join("c_1", "conv_1");
        router.join("c_2", "conv_1");
        router.join("c_3", "conv_1");

        let users = router.users_in_room("conv_1");
        assert_eq!(users.len(), 2);
        assert!(users.contains("usr_a"));
        assert!(users.contains("usr_b"));
    }

    #[tokio::test]
    async fn stalled_connection_drops_overflow_instead_of_queueing() {
        let router = RoomRouter::new();
        let (tx, mut rx) = mpsc::channel(2);
        router.register_connection("c_a", "usr_a", tx);
        router.join("c_a", "conv_1");

        // Nobody drains rx: deliveries past the buffer are dropped.
        for _ in 0..5 {
            router.emit_to_room("conv_1", &typing_event());
        }

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn emit_to_closed_connection_is_swallowed() {
        let router = RoomRouter::new();
        let rx = connect(&router, "c_a", "usr_a");
        router.join("c_a", "conv_1");
        drop(rx);

        // Must not panic; the send error is ignored.
        router.emit_to_room("conv_1", &typing_event());
    }
}
