pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;
pub mod store;

use std::sync::Arc;

use config::Config;
use gateway::calls::CallRegistry;
use gateway::presence::PresenceRegistry;
use gateway::rooms::RoomRouter;
use store::{ConversationStore, NotificationSender, ReactionStore, ReceiptStore};

/// Shared application state available to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn ConversationStore>,
    pub receipts: Arc<dyn ReceiptStore>,
    pub reactions: Arc<dyn ReactionStore>,
    pub notifier: Arc<dyn NotificationSender>,
    pub presence: Arc<PresenceRegistry>,
    pub rooms: Arc<RoomRouter>,
    pub calls: Arc<CallRegistry>,
}
