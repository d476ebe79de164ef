//! In-memory collaborator implementations (single-process mode and tests).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::GatewayError;

use super::{
    Conversation, ConversationStore, Message, NewMessage, NotificationSender, PushPayload,
    Reaction, ReactionStore, ReceiptStore, SendReport, User,
};

#[derive(Default)]
struct MemoryStoreInner {
    users: HashMap<String, User>,
    conversations: HashMap<String, Conversation>,
    messages: HashMap<String, Message>,
    /// (message_id, user_id) -> read_at
    message_reads: HashMap<(String, String), DateTime<Utc>>,
    /// (conversation_id, user_id) -> read up to this instant
    conversation_reads: HashMap<(String, String), DateTime<Utc>>,
    /// (message_id, user_id, emoji) -> created_at
    reactions: HashMap<(String, String, String), DateTime<Utc>>,
}

/// One struct backing all three store traits, mirroring how the external
/// database holds every table.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, user: User) {
        self.inner.lock().users.insert(user.id.clone(), user);
    }

    pub fn insert_conversation(&self, conversation: Conversation) {
        self.inner
            .lock()
            .conversations
            .insert(conversation.id.clone(), conversation);
    }

    /// Number of persisted messages in a conversation (test helper).
    pub fn message_count(&self, conversation_id: &str) -> usize {
        self.inner
            .lock()
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .count()
    }

    /// Number of read markers stored for a message (test helper).
    pub fn read_marker_count(&self, message_id: &str) -> usize {
        self.inner
            .lock()
            .message_reads
            .keys()
            .filter(|(mid, _)| mid == message_id)
            .count()
    }

    /// Unread count the way the conversation listing computes it: messages
    /// newer than the user's conversation read marker, not sent by the user.
    pub fn unread_count(&self, conversation_id: &str, user_id: &str) -> usize {
        let inner = self.inner.lock();
        let read_up_to = inner
            .conversation_reads
            .get(&(conversation_id.to_string(), user_id.to_string()))
            .copied()
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        inner
            .messages
            .values()
            .filter(|m| {
                m.conversation_id == conversation_id
                    && m.sender_id != user_id
                    && m.created_at > read_up_to
            })
            .count()
    }

    pub fn reaction_count(&self, message_id: &str) -> usize {
        self.inner
            .lock()
            .reactions
            .keys()
            .filter(|(mid, _, _)| mid == message_id)
            .count()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn find_conversation(&self, id: &str) -> Result<Option<Conversation>, GatewayError> {
        Ok(self.inner.lock().conversations.get(id).cloned())
    }

    async fn find_user(&self, id: &str) -> Result<Option<User>, GatewayError> {
        Ok(self.inner.lock().users.get(id).cloned())
    }

    async fn find_message(&self, id: &str) -> Result<Option<Message>, GatewayError> {
        Ok(self.inner.lock().messages.get(id).cloned())
    }

    async fn create_message(&self, new: NewMessage) -> Result<Message, GatewayError> {
        let message = Message {
            id: parley_common::id::prefixed_ulid(parley_common::id::prefix::MESSAGE),
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            content: new.content,
            file_url: new.file_url,
            reply_to_id: new.reply_to_id,
            created_at: Utc::now(),
        };
        self.inner
            .lock()
            .messages
            .insert(message.id.clone(), message.clone());
        Ok(message)
    }

    async fn update_last_message(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<(), GatewayError> {
        let mut inner = self.inner.lock();
        let conversation = inner
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| GatewayError::not_found("Conversation not found"))?;
        conversation.last_message_id = Some(message_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl ReceiptStore for MemoryStore {
    async fn mark_message_read(
        &self,
        message_id: &str,
        user_id: &str,
        read_at: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        self.inner
            .lock()
            .message_reads
            .insert((message_id.to_string(), user_id.to_string()), read_at);
        Ok(())
    }

    async fn mark_conversation_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        read_at: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        // Monotonic: a delayed request with an older timestamp must not pull
        // the marker backwards and resurface already-read messages.
        let mut inner = self.inner.lock();
        let marker = inner
            .conversation_reads
            .entry((conversation_id.to_string(), user_id.to_string()))
            .or_insert(read_at);
        if *marker < read_at {
            *marker = read_at;
        }
        Ok(())
    }
}

#[async_trait]
impl ReactionStore for MemoryStore {
    async fn add_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<Option<Reaction>, GatewayError> {
        let key = (
            message_id.to_string(),
            user_id.to_string(),
            emoji.to_string(),
        );
        let mut inner = self.inner.lock();
        if inner.reactions.contains_key(&key) {
            // Uniqueness constraint: same user, same emoji — duplicate.
            return Ok(None);
        }
        let created_at = Utc::now();
        inner.reactions.insert(key, created_at);
        Ok(Some(Reaction {
            message_id: message_id.to_string(),
            user_id: user_id.to_string(),
            emoji: emoji.to_string(),
            created_at,
        }))
    }

    async fn remove_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<bool, GatewayError> {
        let key = (
            message_id.to_string(),
            user_id.to_string(),
            emoji.to_string(),
        );
        Ok(self.inner.lock().reactions.remove(&key).is_some())
    }
}

// ---------------------------------------------------------------------------
// Notification sender
// ---------------------------------------------------------------------------

/// Records every send for inspection. Can be flipped into a failing mode to
/// exercise the logged-and-swallowed path.
#[derive(Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<(Vec<String>, PushPayload)>>,
    failing: std::sync::atomic::AtomicBool,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(Vec<String>, PushPayload)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl NotificationSender for MemoryNotifier {
    async fn send_to_devices(
        &self,
        tokens: &[String],
        payload: &PushPayload,
    ) -> Result<SendReport, GatewayError> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(GatewayError::transient("push sender unavailable"));
        }
        self.sent.lock().push((tokens.to_vec(), payload.clone()));
        Ok(SendReport {
            success_count: tokens.len(),
            failure_count: 0,
        })
    }
}
