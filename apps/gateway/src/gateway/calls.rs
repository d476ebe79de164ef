//! Call signaling: per-pair state machine and relay.
//!
//! The state machine is advisory, not authoritative over WebRTC's own
//! negotiation: offers, answers, and ICE candidates are relayed verbatim
//! even when no matching session exists, because signaling can legitimately
//! outrun the local call-initiate bookkeeping. State transitions themselves
//! are guarded explicitly instead of with ad hoc "is answering" flags.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::GatewayError;
use crate::AppState;

use super::events::ServerEvent;
use super::session::ConnectionSession;

/// Lifecycle of one call attempt. Terminal transitions (ended, rejected,
/// cancelled) remove the session from the registry instead of being states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Ringing,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct CallSession {
    pub caller_id: String,
    pub callee_id: String,
    pub has_video: bool,
    pub state: CallState,
    /// Distinguishes this attempt from later attempts between the same pair,
    /// so a stale ringing-timeout cannot cancel a successor call.
    pub generation: u64,
}

/// At most one active call attempt per unordered user pair.
fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

pub struct CallRegistry {
    calls: DashMap<(String, String), CallSession>,
    generation: AtomicU64,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    /// Start a call attempt in `ringing`. Returns the attempt's generation,
    /// or `None` when the pair already has an active session.
    pub fn begin(&self, caller_id: &str, callee_id: &str, has_video: bool) -> Option<u64> {
        match self.calls.entry(pair_key(caller_id, callee_id)) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                vacant.insert(CallSession {
                    caller_id: caller_id.to_string(),
                    callee_id: callee_id.to_string(),
                    has_video,
                    state: CallState::Ringing,
                    generation,
                });
                Some(generation)
            }
        }
    }

    /// Advance `ringing -> connecting` when an offer passes through.
    pub fn note_offer(&self, from: &str, to: &str) {
        if let Some(mut call) = self.calls.get_mut(&pair_key(from, to)) {
            if call.state == CallState::Ringing && call.is_participant(from) {
                call.state = CallState::Connecting;
            }
        }
    }

    /// Advance to `connected` when an answer passes through. Only legal from
    /// `ringing`/`connecting`; a duplicate answer leaves the state alone.
    pub fn note_answer(&self, from: &str, to: &str) {
        if let Some(mut call) = self.calls.get_mut(&pair_key(from, to)) {
            if matches!(call.state, CallState::Ringing | CallState::Connecting)
                && call.is_participant(from)
            {
                call.state = CallState::Connected;
            }
        }
    }

    /// Remove the pair's session. Idempotent: terminating an absent session
    /// returns `None`.
    pub fn terminate(&self, a: &str, b: &str) -> Option<CallSession> {
        self.calls.remove(&pair_key(a, b)).map(|(_, call)| call)
    }

    /// Remove the session only if it is still this attempt and still ringing
    /// (the ringing-timeout path).
    pub fn expire_ringing(&self, caller_id: &str, callee_id: &str, generation: u64) -> bool {
        self.calls
            .remove_if(&pair_key(caller_id, callee_id), |_, call| {
                call.generation == generation && call.state == CallState::Ringing
            })
            .is_some()
    }

    /// Remove and return every session referencing a user (disconnect sweep).
    pub fn end_all_for(&self, user_id: &str) -> Vec<CallSession> {
        let keys: Vec<(String, String)> = self
            .calls
            .iter()
            .filter(|entry| entry.value().is_participant(user_id))
            .map(|entry| entry.key().clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| self.calls.remove(&key).map(|(_, call)| call))
            .collect()
    }

    pub fn get(&self, a: &str, b: &str) -> Option<CallSession> {
        self.calls.get(&pair_key(a, b)).map(|call| call.clone())
    }
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallSession {
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.caller_id == user_id || self.callee_id == user_id
    }

    pub fn peer_of(&self, user_id: &str) -> &str {
        if self.caller_id == user_id {
            &self.callee_id
        } else {
            &self.caller_id
        }
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

/// `call:initiate` — ring the callee on every device.
///
/// Only allowed when caller and callee share the named 1:1 conversation and
/// have no active session between them. `call:incoming` goes to the callee's
/// personal room only, never to the caller's other devices.
pub async fn initiate(
    state: &AppState,
    session: &ConnectionSession,
    conversation_id: String,
    callee_id: String,
    has_video: bool,
) -> Result<(), GatewayError> {
    let caller_id = session.user_id.clone();
    if callee_id == caller_id {
        return Err(GatewayError::invalid_argument("Cannot call yourself"));
    }

    let conversation = state
        .store
        .find_conversation(&conversation_id)
        .await?
        .ok_or_else(|| GatewayError::not_found("Conversation not found"))?;
    if conversation.is_group {
        return Err(GatewayError::invalid_argument(
            "Calls are only available in direct conversations",
        ));
    }
    if !conversation.has_participant(&caller_id) || !conversation.has_participant(&callee_id) {
        return Err(GatewayError::forbidden(
            "You are not a participant of this conversation",
        ));
    }

    let caller = state
        .store
        .find_user(&caller_id)
        .await?
        .ok_or_else(|| GatewayError::not_found("Caller profile not found"))?;

    let generation = state
        .calls
        .begin(&caller_id, &callee_id, has_video)
        .ok_or_else(|| {
            GatewayError::invalid_argument("A call with this user is already in progress")
        })?;
    session.set_call_peer(&callee_id);

    state.rooms.emit_to_user(
        &callee_id,
        &ServerEvent::CallIncoming {
            caller_id: caller_id.clone(),
            caller_name: caller.username,
            caller_avatar: caller.avatar_url,
            conversation_id,
            has_video,
        },
    );

    tracing::info!(
        caller_id = %caller_id,
        callee_id = %callee_id,
        has_video,
        "call ringing"
    );

    // Unanswered calls do not ring forever: auto-cancel as if the caller had
    // hung up, and tell the caller's devices the attempt is over.
    let timeout_state = state.clone();
    let timeout = state.config.ringing_timeout;
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if timeout_state
            .calls
            .expire_ringing(&caller_id, &callee_id, generation)
        {
            tracing::debug!(caller_id = %caller_id, callee_id = %callee_id, "ringing timeout");
            timeout_state.rooms.emit_to_user(
                &callee_id,
                &ServerEvent::CallCancelled {
                    from: caller_id.clone(),
                },
            );
            timeout_state
                .rooms
                .emit_to_user(&caller_id, &ServerEvent::CallEnded { from: callee_id });
        }
    });

    Ok(())
}

/// `call:offer` — relay verbatim; SDP contents are never inspected.
pub fn relay_offer(state: &AppState, session: &ConnectionSession, to: String, offer: Value) {
    state.calls.note_offer(&session.user_id, &to);
    session.set_call_peer(&to);
    state.rooms.emit_to_user(
        &to,
        &ServerEvent::CallOffer {
            from: session.user_id.clone(),
            offer,
        },
    );
}

/// `call:answer` — relay verbatim.
pub fn relay_answer(state: &AppState, session: &ConnectionSession, to: String, answer: Value) {
    state.calls.note_answer(&session.user_id, &to);
    session.set_call_peer(&to);
    state.rooms.emit_to_user(
        &to,
        &ServerEvent::CallAnswer {
            from: session.user_id.clone(),
            answer,
        },
    );
}

/// `call:ice-candidate` — always forwarded regardless of session state;
/// candidates may arrive before or after the handshake completes and the
/// receiving side queues what it cannot yet apply.
pub fn relay_ice_candidate(
    state: &AppState,
    session: &ConnectionSession,
    to: String,
    candidate: Value,
) {
    state.rooms.emit_to_user(
        &to,
        &ServerEvent::CallIceCandidate {
            from: session.user_id.clone(),
            candidate,
        },
    );
}

/// Which terminal command ended the call.
#[derive(Debug, Clone, Copy)]
pub enum Terminal {
    Rejected,
    Ended,
    Cancelled,
}

/// `call:reject` / `call:end` / `call:cancel` — clear the session and notify
/// the peer. Terminating an absent session is a no-op, not an error.
pub fn terminate(state: &AppState, session: &ConnectionSession, to: String, terminal: Terminal) {
    session.clear_call_peer(&to);
    if state.calls.terminate(&session.user_id, &to).is_none() {
        return;
    }
    let from = session.user_id.clone();
    let event = match terminal {
        Terminal::Rejected => ServerEvent::CallRejected { from },
        Terminal::Ended => ServerEvent::CallEnded { from },
        Terminal::Cancelled => ServerEvent::CallCancelled { from },
    };
    state.rooms.emit_to_user(&to, &event);
}

/// Teardown sweep: force any non-terminal call referencing this connection
/// (or, when the user's last device is gone, this user) to `ended` and
/// notify the remaining peer. The only termination path that does not
/// originate from an explicit client message.
pub fn end_on_disconnect(state: &AppState, session: &ConnectionSession, went_offline: bool) {
    if let Some(peer) = session.call_peer() {
        if state.calls.terminate(&session.user_id, &peer).is_some() {
            tracing::debug!(user_id = %session.user_id, peer = %peer, "call ended by disconnect");
            state.rooms.emit_to_user(
                &peer,
                &ServerEvent::CallEnded {
                    from: session.user_id.clone(),
                },
            );
        }
    }

    if went_offline {
        for call in state.calls.end_all_for(&session.user_id) {
            let peer = call.peer_of(&session.user_id).to_string();
            tracing::debug!(user_id = %session.user_id, peer = %peer, "call ended by disconnect");
            state.rooms.emit_to_user(
                &peer,
                &ServerEvent::CallEnded {
                    from: session.user_id.clone(),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_is_exclusive_per_pair() {
        let reg = CallRegistry::new();
        assert!(reg.begin("usr_a", "usr_b", false).is_some());
        // Same pair in either orientation is busy.
        assert!(reg.begin("usr_a", "usr_b", false).is_none());
        assert!(reg.begin("usr_b", "usr_a", true).is_none());
        // A different pair is independent.
        assert!(reg.begin("usr_a", "usr_c", false).is_some());
    }

    #[test]
    fn answer_guard_only_advances_from_ringing_or_connecting() {
        let reg = CallRegistry::new();
        reg.begin("usr_a", "usr_b", false);

        reg.note_offer("usr_a", "usr_b");
        assert_eq!(reg.get("usr_a", "usr_b").unwrap().state, CallState::Connecting);

        reg.note_answer("usr_b", "usr_a");
        assert_eq!(reg.get("usr_a", "usr_b").unwrap().state, CallState::Connected);

        // Duplicate answer: no transition, no panic.
        reg.note_answer("usr_b", "usr_a");
        assert_eq!(reg.get("usr_a", "usr_b").unwrap().state, CallState::Connected);

        // A late offer must not regress the state.
        reg.note_offer("usr_a", "usr_b");
        assert_eq!(reg.get("usr_a", "usr_b").unwrap().state, CallState::Connected);
    }

    #[test]
    fn answer_without_session_is_tolerated() {
        let reg = CallRegistry::new();
        reg.note_answer("usr_a", "usr_b");
        reg.note_offer("usr_a", "usr_b");
        assert!(reg.get("usr_a", "usr_b").is_none());
    }

    #[test]
    fn terminate_is_idempotent() {
        let reg = CallRegistry::new();
        reg.begin("usr_a", "usr_b", false);

        assert!(reg.terminate("usr_b", "usr_a").is_some());
        assert!(reg.terminate("usr_a", "usr_b").is_none());

        // The pair can call again afterwards.
        assert!(reg.begin("usr_a", "usr_b", false).is_some());
    }

    #[test]
    fn expire_ringing_respects_generation_and_state() {
        let reg = CallRegistry::new();
        let g1 = reg.begin("usr_a", "usr_b", false).unwrap();

        // Connected calls never expire.
        reg.note_answer("usr_b", "usr_a");
        assert!(!reg.expire_ringing("usr_a", "usr_b", g1));

        reg.terminate("usr_a", "usr_b");
        let g2 = reg.begin("usr_a", "usr_b", false).unwrap();

        // A stale generation (from the first attempt's timer) does nothing.
        assert!(!reg.expire_ringing("usr_a", "usr_b", g1));
        assert!(reg.get("usr_a", "usr_b").is_some());

        // The current attempt's timer expires it.
        assert!(reg.expire_ringing("usr_a", "usr_b", g2));
        assert!(reg.get("usr_a", "usr_b").is_none());
    }

    #[test]
    fn end_all_for_removes_every_call_of_a_user() {
        let reg = CallRegistry::new();
        reg.begin("usr_a", "usr_b", false);
        reg.begin("usr_c", "usr_a", true);
        reg.begin("usr_c", "usr_d", false);

        let ended = reg.end_all_for("usr_a");
        assert_eq!(ended.len(), 2);
        assert!(reg.get("usr_a", "usr_b").is_none());
        assert!(reg.get("usr_c", "usr_a").is_none());
        assert!(reg.get("usr_c", "usr_d").is_some());
    }

    #[test]
    fn peer_of_resolves_both_orientations() {
        let reg = CallRegistry::new();
        reg.begin("usr_a", "usr_b", false);
        let call = reg.get("usr_b", "usr_a").unwrap();
        assert_eq!(call.peer_of("usr_a"), "usr_b");
        assert_eq!(call.peer_of("usr_b"), "usr_a");
    }
}
