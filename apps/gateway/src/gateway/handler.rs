//! Messaging protocol handler: command dispatch and conversation fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use crate::error::GatewayError;
use crate::store::{Conversation, NewMessage, PushPayload};
use crate::AppState;

use super::calls;
use super::events::{ClientCommand, ServerEvent};
use super::session::ConnectionSession;

/// Push notification bodies are truncated to this many characters.
const PUSH_BODY_MAX_CHARS: usize = 100;

/// Dispatch one inbound command. An `Err` is acknowledged to the issuing
/// connection only and never mutates shared state.
pub async fn handle_command(
    state: &AppState,
    session: &Arc<ConnectionSession>,
    command: ClientCommand,
) -> Result<(), GatewayError> {
    match command {
        ClientCommand::JoinRoom { conversation_id } => {
            join_room(state, session, conversation_id).await
        }
        ClientCommand::SendMessage {
            conversation_id,
            content,
            file_url,
            reply_to_id,
        } => send_message(state, session, conversation_id, content, file_url, reply_to_id).await,
        ClientCommand::Typing { conversation_id } => typing(state, session, conversation_id),
        ClientCommand::StopTyping { conversation_id } => {
            stop_typing(state, session, &conversation_id);
            Ok(())
        }
        ClientCommand::MarkMessagesAsRead { message_ids } => {
            mark_messages_as_read(state, session, message_ids).await
        }
        ClientCommand::ReactionAdd { message_id, emoji } => {
            add_reaction(state, session, message_id, emoji).await
        }
        ClientCommand::ReactionRemove { message_id, emoji } => {
            remove_reaction(state, session, message_id, emoji).await
        }
        ClientCommand::CallInitiate {
            conversation_id,
            callee_id,
            has_video,
        } => calls::initiate(state, session, conversation_id, callee_id, has_video).await,
        ClientCommand::CallOffer { to, offer } => {
            calls::relay_offer(state, session, to, offer);
            Ok(())
        }
        ClientCommand::CallAnswer { to, answer } => {
            calls::relay_answer(state, session, to, answer);
            Ok(())
        }
        ClientCommand::CallIceCandidate { to, candidate } => {
            calls::relay_ice_candidate(state, session, to, candidate);
            Ok(())
        }
        ClientCommand::CallReject { to } => {
            calls::terminate(state, session, to, calls::Terminal::Rejected);
            Ok(())
        }
        ClientCommand::CallEnd { to } => {
            calls::terminate(state, session, to, calls::Terminal::Ended);
            Ok(())
        }
        ClientCommand::CallCancel { to } => {
            calls::terminate(state, session, to, calls::Terminal::Cancelled);
            Ok(())
        }
    }
}

/// Load a conversation and verify the user participates in it.
async fn authorized_conversation(
    state: &AppState,
    conversation_id: &str,
    user_id: &str,
) -> Result<Conversation, GatewayError> {
    let conversation = state
        .store
        .find_conversation(conversation_id)
        .await?
        .ok_or_else(|| GatewayError::not_found("Conversation not found"))?;
    if !conversation.has_participant(user_id) {
        return Err(GatewayError::forbidden(
            "You are not a participant of this conversation",
        ));
    }
    Ok(conversation)
}

async fn join_room(
    state: &AppState,
    session: &ConnectionSession,
    conversation_id: String,
) -> Result<(), GatewayError> {
    authorized_conversation(state, &conversation_id, &session.user_id).await?;

    state.rooms.join(&session.connection_id, &conversation_id);
    tracing::debug!(
        user_id = %session.user_id,
        connection_id = %session.connection_id,
        conversation_id = %conversation_id,
        "joined conversation room"
    );
    state.rooms.emit_to_connection(
        &session.connection_id,
        &ServerEvent::JoinedRoom { conversation_id },
    );
    Ok(())
}

async fn send_message(
    state: &AppState,
    session: &ConnectionSession,
    conversation_id: String,
    content: Option<String>,
    file_url: Option<String>,
    reply_to_id: Option<String>,
) -> Result<(), GatewayError> {
    // Membership is re-validated on every send; a prior join is not trusted.
    let conversation = authorized_conversation(state, &conversation_id, &session.user_id).await?;

    let content = content
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());
    let file_url = file_url.filter(|u| !u.is_empty());
    if content.is_none() && file_url.is_none() {
        return Err(GatewayError::invalid_argument(
            "Message must have content or a file",
        ));
    }

    // Persist first; a broadcast must never precede a successful write.
    let message = state
        .store
        .create_message(NewMessage {
            conversation_id: conversation.id.clone(),
            sender_id: session.user_id.clone(),
            content,
            file_url,
            reply_to_id,
        })
        .await?;
    state
        .store
        .update_last_message(&conversation.id, &message.id)
        .await?;

    tracing::debug!(
        message_id = %message.id,
        conversation_id = %conversation.id,
        sender_id = %session.user_id,
        "message persisted"
    );

    // Fan out to every participant's personal room so devices that haven't
    // joined the conversation room still learn about it (unread counters).
    let event = ServerEvent::NewMessage(message.clone());
    for participant_id in &conversation.participant_ids {
        state.rooms.emit_to_user(participant_id, &event);
    }

    // Push dispatch runs off the command path; failures never surface to the
    // sender.
    let push_state = state.clone();
    let sender_id = session.user_id.clone();
    let body = message
        .content
        .clone()
        .unwrap_or_else(|| "Sent a file".to_string());
    tokio::spawn(async move {
        dispatch_push_notifications(push_state, conversation, sender_id, body).await;
    });

    Ok(())
}

/// Notify participants who are not currently present in the conversation
/// room. All failures are logged and swallowed.
async fn dispatch_push_notifications(
    state: AppState,
    conversation: Conversation,
    sender_id: String,
    body: String,
) {
    let sender_name = match state.store.find_user(&sender_id).await {
        Ok(Some(user)) => user.username,
        Ok(None) => "Someone".to_string(),
        Err(err) => {
            tracing::warn!(%err, "push dispatch: sender lookup failed");
            return;
        }
    };

    let body: String = if body.chars().count() > PUSH_BODY_MAX_CHARS {
        let truncated: String = body.chars().take(PUSH_BODY_MAX_CHARS).collect();
        format!("{truncated}...")
    } else {
        body
    };

    let present = state.rooms.users_in_room(&conversation.id);
    let payload = PushPayload {
        title: format!("New message from {sender_name}"),
        body,
        data: HashMap::from([
            ("conversationId".to_string(), conversation.id.clone()),
            ("senderId".to_string(), sender_id.clone()),
            (
                "url".to_string(),
                format!("/?conversation={}", conversation.id),
            ),
        ]),
    };

    for recipient_id in conversation
        .participant_ids
        .iter()
        .filter(|id| **id != sender_id)
    {
        if present.contains(recipient_id) {
            continue;
        }
        let recipient = match state.store.find_user(recipient_id).await {
            Ok(Some(user)) => user,
            Ok(None) => continue,
            Err(err) => {
                tracing::warn!(%err, recipient_id = %recipient_id, "push dispatch: recipient lookup failed");
                continue;
            }
        };
        if recipient.fcm_tokens.is_empty() {
            continue;
        }
        match state
            .notifier
            .send_to_devices(&recipient.fcm_tokens, &payload)
            .await
        {
            Ok(report) if report.failure_count > 0 => {
                tracing::warn!(
                    recipient_id = %recipient_id,
                    failed = report.failure_count,
                    "push dispatch: partial failure"
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(%err, recipient_id = %recipient_id, "push dispatch failed");
            }
        }
    }
}

fn typing(
    state: &AppState,
    session: &Arc<ConnectionSession>,
    conversation_id: String,
) -> Result<(), GatewayError> {
    if !state.rooms.is_joined(&session.connection_id, &conversation_id) {
        return Err(GatewayError::forbidden(
            "Join the conversation room before typing",
        ));
    }

    let generation = session.begin_typing(&conversation_id);
    state.rooms.emit_to_room_except(
        &conversation_id,
        &session.connection_id,
        &ServerEvent::UserTyping {
            user_id: session.user_id.clone(),
            conversation_id: conversation_id.clone(),
        },
    );

    // Client stopTyping is advisory; stale indicators expire server-side.
    let state = state.clone();
    let session = session.clone();
    tokio::spawn(async move {
        tokio::time::sleep(state.config.typing_expiry).await;
        if session.still_typing(&conversation_id, generation) {
            session.stop_typing(&conversation_id);
            state.rooms.emit_to_room_except(
                &conversation_id,
                &session.connection_id,
                &ServerEvent::UserStopTyping {
                    user_id: session.user_id.clone(),
                    conversation_id: conversation_id.clone(),
                },
            );
        }
    });

    Ok(())
}

pub(super) fn stop_typing(state: &AppState, session: &ConnectionSession, conversation_id: &str) {
    if session.stop_typing(conversation_id) {
        state.rooms.emit_to_room_except(
            conversation_id,
            &session.connection_id,
            &ServerEvent::UserStopTyping {
                user_id: session.user_id.clone(),
                conversation_id: conversation_id.to_string(),
            },
        );
    }
}

async fn mark_messages_as_read(
    state: &AppState,
    session: &ConnectionSession,
    message_ids: Vec<String>,
) -> Result<(), GatewayError> {
    if message_ids.is_empty() {
        return Err(GatewayError::invalid_argument("messageIds must not be empty"));
    }

    let mut per_conversation: HashMap<String, Vec<String>> = HashMap::new();
    for message_id in &message_ids {
        let Some(message) = state.store.find_message(message_id).await? else {
            tracing::debug!(message_id = %message_id, "read marker skipped: unknown message");
            continue;
        };
        per_conversation
            .entry(message.conversation_id)
            .or_default()
            .push(message.id);
    }

    // Membership gates the whole batch: one foreign message rejects the
    // command before any marker is written or broadcast.
    for conversation_id in per_conversation.keys() {
        authorized_conversation(state, conversation_id, &session.user_id).await?;
    }

    let read_at = Utc::now();
    for (conversation_id, ids) in per_conversation {
        for message_id in &ids {
            state
                .receipts
                .mark_message_read(message_id, &session.user_id, read_at)
                .await?;
        }
        state
            .receipts
            .mark_conversation_read(&conversation_id, &session.user_id, read_at)
            .await?;
        state.rooms.emit_to_room(
            &conversation_id,
            &ServerEvent::MessagesRead {
                message_ids: ids,
                user_id: session.user_id.clone(),
                read_at,
            },
        );
    }

    Ok(())
}

async fn add_reaction(
    state: &AppState,
    session: &ConnectionSession,
    message_id: String,
    emoji: String,
) -> Result<(), GatewayError> {
    let message = state
        .store
        .find_message(&message_id)
        .await?
        .ok_or_else(|| GatewayError::not_found("Message not found"))?;

    let Some(reaction) = state
        .reactions
        .add_reaction(&message_id, &session.user_id, &emoji)
        .await?
    else {
        // Same user, same emoji: swallowed, not an error and not a toggle.
        return Ok(());
    };

    let conversation = state
        .store
        .find_conversation(&message.conversation_id)
        .await?
        .ok_or_else(|| GatewayError::not_found("Conversation not found"))?;

    let event = ServerEvent::ReactionAdded(reaction);
    for participant_id in &conversation.participant_ids {
        state.rooms.emit_to_user(participant_id, &event);
    }
    Ok(())
}

async fn remove_reaction(
    state: &AppState,
    session: &ConnectionSession,
    message_id: String,
    emoji: String,
) -> Result<(), GatewayError> {
    let message = state
        .store
        .find_message(&message_id)
        .await?
        .ok_or_else(|| GatewayError::not_found("Message not found"))?;

    let removed = state
        .reactions
        .remove_reaction(&message_id, &session.user_id, &emoji)
        .await?;
    if !removed {
        return Ok(());
    }

    let conversation = state
        .store
        .find_conversation(&message.conversation_id)
        .await?
        .ok_or_else(|| GatewayError::not_found("Conversation not found"))?;

    let event = ServerEvent::ReactionRemoved {
        message_id,
        user_id: session.user_id.clone(),
        emoji,
    };
    for participant_id in &conversation.participant_ids {
        state.rooms.emit_to_user(participant_id, &event);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Out-of-band fan-out, driven by the REST tier
// ---------------------------------------------------------------------------

/// Tell every member of a freshly created group about it.
pub fn notify_group_created(
    state: &AppState,
    participant_ids: &[String],
    group_id: &str,
    group_name: &str,
) {
    let event = ServerEvent::NewGroup {
        group_id: group_id.to_string(),
        group_name: group_name.to_string(),
        message: "You have been added to a new group".to_string(),
    };
    for participant_id in participant_ids {
        state.rooms.emit_to_user(participant_id, &event);
    }
}

/// Deliver a friend request notification to every device of the receiver.
pub fn notify_friend_request(state: &AppState, receiver_id: &str, request: serde_json::Value) {
    state
        .rooms
        .emit_to_user(receiver_id, &ServerEvent::NewFriendRequest(request));
}
