//! In-memory per-user presence tracking with multi-device support.
//!
//! Presence is per-**user**, not per-connection. A user is online iff their
//! connection set is non-empty; online/offline transitions are reported at
//! most once per true transition, atomically with the empty/non-empty check.

use std::collections::{HashMap, HashSet};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Thread-safe, DashMap-backed presence registry.
///
/// `register`/`deregister` mutate the per-user connection set under the
/// shard lock, so two near-simultaneous disconnects cannot both observe
/// "set became empty".
pub struct PresenceRegistry {
    inner: DashMap<String, HashSet<String>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Attribute a connection to a user. Returns `true` when the user just
    /// came online (the set transitioned from empty to non-empty).
    pub fn register(&self, user_id: &str, connection_id: &str) -> bool {
        let mut connections = self.inner.entry(user_id.to_string()).or_default();
        let became_online = connections.is_empty();
        connections.insert(connection_id.to_string());
        became_online
    }

    /// Remove a connection. Returns `true` when the user just went offline
    /// (the set became empty; the entry is deleted).
    ///
    /// Deregistering an unknown (user, connection) pair is a no-op so that
    /// double-disconnect races stay harmless.
    pub fn deregister(&self, user_id: &str, connection_id: &str) -> bool {
        match self.inner.entry(user_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get_mut().remove(connection_id) {
                    return false;
                }
                if occupied.get().is_empty() {
                    occupied.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => false,
        }
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.inner
            .get(user_id)
            .map(|connections| !connections.is_empty())
            .unwrap_or(false)
    }

    /// Batch form of `is_online`. O(n) in the requested ids.
    pub fn are_online(&self, user_ids: &[String]) -> HashMap<String, bool> {
        user_ids
            .iter()
            .map(|id| (id.clone(), self.is_online(id)))
            .collect()
    }

    /// Connection ids currently attributed to a user.
    pub fn connections_of(&self, user_id: &str) -> HashSet<String> {
        self.inner
            .get(user_id)
            .map(|connections| connections.clone())
            .unwrap_or_default()
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_connection_comes_online_once() {
        let reg = PresenceRegistry::new();

        assert!(reg.register("u1", "c1"));
        assert!(!reg.register("u1", "c2"));
        assert!(!reg.register("u1", "c3"));
        assert!(reg.is_online("u1"));
    }

    #[test]
    fn n_connects_then_n_minus_one_disconnects_stay_online() {
        let reg = PresenceRegistry::new();

        let mut online_events = 0;
        for i in 0..5 {
            if reg.register("u1", &format!("c{i}")) {
                online_events += 1;
            }
        }
        assert_eq!(online_events, 1);

        let mut offline_events = 0;
        for i in 0..4 {
            if reg.deregister("u1", &format!("c{i}")) {
                offline_events += 1;
            }
        }
        assert_eq!(offline_events, 0);
        assert!(reg.is_online("u1"));

        // The final disconnect fires exactly one offline.
        assert!(reg.deregister("u1", "c4"));
        assert!(!reg.is_online("u1"));
    }

    #[test]
    fn deregister_unknown_pair_is_noop() {
        let reg = PresenceRegistry::new();
        assert!(!reg.deregister("ghost", "c1"));

        reg.register("u1", "c1");
        // Wrong connection id: no transition, still online.
        assert!(!reg.deregister("u1", "c2"));
        assert!(reg.is_online("u1"));

        // Double-disconnect of the same connection.
        assert!(reg.deregister("u1", "c1"));
        assert!(!reg.deregister("u1", "c1"));
    }

    #[test]
    fn reconnect_after_offline_fires_online_again() {
        let reg = PresenceRegistry::new();
        assert!(reg.register("u1", "c1"));
        assert!(reg.deregister("u1", "c1"));
        assert!(reg.register("u1", "c2"));
    }

    #[test]
    fn are_online_batch() {
        let reg = PresenceRegistry::new();
        reg.register("u1", "c1");
        reg.register("u2", "c2");
        reg.deregister("u2", "c2");

        let ids = vec!["u1".to_string(), "u2".to_string(), "u3".to_string()];
        let statuses = reg.are_online(&ids);
        assert_eq!(statuses["u1"], true);
        assert_eq!(statuses["u2"], false);
        assert_eq!(statuses["u3"], false);
    }

    #[test]
    fn connections_of_reflects_live_set() {
        let reg = PresenceRegistry::new();
        reg.register("u1", "c1");
        reg.register("u1", "c2");

        let connections = reg.connections_of("u1");
        assert_eq!(connections.len(), 2);
        assert!(connections.contains("c1"));

        reg.deregister("u1", "c1");
        assert_eq!(reg.connections_of("u1").len(), 1);
    }
}
