//! External collaborator interfaces.
//!
//! The gateway never owns durable state. Conversations, messages, read
//! receipts, reactions, and push delivery live behind these traits — backed
//! by the platform's database and FCM in production and by in-memory
//! implementations in single-process mode and tests.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::GatewayError;

pub use memory::{MemoryNotifier, MemoryStore};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    pub avatar_url: Option<String>,
    /// Push-notification device tokens. Opaque to the gateway.
    #[serde(skip)]
    pub fcm_tokens: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub name: Option<String>,
    pub is_group: bool,
    pub participant_ids: Vec<String>,
    pub last_message_id: Option<String>,
}

impl Conversation {
    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participant_ids.iter().any(|id| id == user_id)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields the gateway supplies when persisting a message. The store assigns
/// the id and creation timestamp — those define the authoritative order.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub sender_id: String,
    pub content: Option<String>,
    pub file_url: Option<String>,
    pub reply_to_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Store traits
// ---------------------------------------------------------------------------

/// Conversation and message persistence.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn find_conversation(&self, id: &str) -> Result<Option<Conversation>, GatewayError>;

    async fn find_user(&self, id: &str) -> Result<Option<User>, GatewayError>;

    async fn find_message(&self, id: &str) -> Result<Option<Message>, GatewayError>;

    async fn create_message(&self, new: NewMessage) -> Result<Message, GatewayError>;

    async fn update_last_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<(), GatewayError>;
}

/// Read markers. Both operations are upserts keyed on (message, user) and
/// (conversation, user) respectively — re-marking must not duplicate rows.
#[async_trait]
pub trait ReceiptStore: Send + Sync {
    async fn mark_message_read(
        &self,
        message_id: &str,
        user_id: &str,
        read_at: DateTime<Utc>,
    ) -> Result<(), GatewayError>;

    async fn mark_conversation_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        read_at: DateTime<Utc>,
    ) -> Result<(), GatewayError>;
}

/// Reaction markers with a (message, user, emoji) uniqueness constraint.
#[async_trait]
pub trait ReactionStore: Send + Sync {
    /// Returns `None` when the same user already placed the same emoji.
    async fn add_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<Option<Reaction>, GatewayError>;

    /// Returns whether a marker was actually removed.
    async fn remove_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<bool, GatewayError>;
}

// ---------------------------------------------------------------------------
// Push notification sender
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    pub data: HashMap<String, String>,
}

/// Partial-success report from a multi-device send.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendReport {
    pub success_count: usize,
    pub failure_count: usize,
}

/// External fan-out sender for push notifications.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send_to_devices(
        &self,
        tokens: &[String],
        payload: &PushPayload,
    ) -> Result<SendReport, GatewayError>;
}
