//! Wire-format commands and events.
//!
//! Frames are JSON discriminated unions: `{"event": <name>, "data": {...}}`.
//! Shapes are validated here at the boundary — a malformed payload is
//! rejected with an `error` ack before it reaches any handler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::{Message, Reaction};

// ---------------------------------------------------------------------------
// Client → Server commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientCommand {
    JoinRoom {
        conversation_id: String,
    },
    SendMessage {
        conversation_id: String,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        file_url: Option<String>,
        #[serde(default)]
        reply_to_id: Option<String>,
    },
    Typing {
        conversation_id: String,
    },
    StopTyping {
        conversation_id: String,
    },
    MarkMessagesAsRead {
        message_ids: Vec<String>,
    },
    #[serde(rename = "message:reaction:add")]
    ReactionAdd {
        message_id: String,
        emoji: String,
    },
    #[serde(rename = "message:reaction:remove")]
    ReactionRemove {
        message_id: String,
        emoji: String,
    },
    #[serde(rename = "call:initiate")]
    CallInitiate {
        conversation_id: String,
        callee_id: String,
        has_video: bool,
    },
    #[serde(rename = "call:offer")]
    CallOffer {
        to: String,
        offer: Value,
    },
    #[serde(rename = "call:answer")]
    CallAnswer {
        to: String,
        answer: Value,
    },
    #[serde(rename = "call:ice-candidate")]
    CallIceCandidate {
        to: String,
        candidate: Value,
    },
    #[serde(rename = "call:reject")]
    CallReject {
        to: String,
    },
    #[serde(rename = "call:end")]
    CallEnd {
        to: String,
    },
    #[serde(rename = "call:cancel")]
    CallCancel {
        to: String,
    },
}

// ---------------------------------------------------------------------------
// Server → Client events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    JoinedRoom {
        conversation_id: String,
    },
    UserStatusChanged {
        user_id: String,
        status: PresenceStatus,
    },
    NewMessage(Message),
    UserTyping {
        user_id: String,
        conversation_id: String,
    },
    UserStopTyping {
        user_id: String,
        conversation_id: String,
    },
    MessagesRead {
        message_ids: Vec<String>,
        user_id: String,
        read_at: DateTime<Utc>,
    },
    #[serde(rename = "message:reaction:add")]
    ReactionAdded(Reaction),
    #[serde(rename = "message:reaction:remove")]
    ReactionRemoved {
        message_id: String,
        user_id: String,
        emoji: String,
    },
    #[serde(rename = "call:incoming")]
    CallIncoming {
        caller_id: String,
        caller_name: String,
        caller_avatar: Option<String>,
        conversation_id: String,
        has_video: bool,
    },
    #[serde(rename = "call:offer")]
    CallOffer {
        from: String,
        offer: Value,
    },
    #[serde(rename = "call:answer")]
    CallAnswer {
        from: String,
        answer: Value,
    },
    #[serde(rename = "call:ice-candidate")]
    CallIceCandidate {
        from: String,
        candidate: Value,
    },
    #[serde(rename = "call:rejected")]
    CallRejected {
        from: String,
    },
    #[serde(rename = "call:ended")]
    CallEnded {
        from: String,
    },
    #[serde(rename = "call:cancelled")]
    CallCancelled {
        from: String,
    },
    NewGroup {
        group_id: String,
        group_name: String,
        message: String,
    },
    NewFriendRequest(Value),
    Error {
        code: String,
        message: String,
    },
}

impl ServerEvent {
    /// Build an `error` ack from a command rejection.
    pub fn from_error(err: &crate::error::GatewayError) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.message().to_string(),
        }
    }
}
