//! WebSocket upgrade handler and per-connection event loop.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use parley_common::id::{prefix, prefixed_ulid};

use crate::auth::authenticate;
use crate::AppState;

use super::calls;
use super::events::{ClientCommand, PresenceStatus, ServerEvent};
use super::handler::handle_command;
use super::session::ConnectionSession;

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

#[derive(Deserialize)]
struct ConnectParams {
    token: Option<String>,
}

/// Authenticate before upgrading: a bad or missing token gets a plain 401 and
/// never becomes a WebSocket connection.
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    let token = params.token.unwrap_or_default();
    let user_id = match authenticate(&state.config.jwt_secret, &token) {
        Ok(user_id) => user_id,
        Err(err) => {
            tracing::debug!(code = err.code(), "gateway handshake rejected");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_connection(socket, state, user_id))
        .into_response()
}

async fn handle_connection(socket: WebSocket, state: AppState, user_id: String) {
    let connection_id = prefixed_ulid(prefix::CONNECTION);
    let session = Arc::new(ConnectionSession::new(
        connection_id.clone(),
        user_id.clone(),
    ));

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerEvent>(super::rooms::OUTBOUND_BUFFER);
    state
        .rooms
        .register_connection(&connection_id, &user_id, outbound_tx);

    // Presence transition is computed atomically with the registration, so
    // two devices connecting at once still yield exactly one broadcast.
    if state.presence.register(&user_id, &connection_id) {
        state.rooms.emit_to_all(&ServerEvent::UserStatusChanged {
            user_id: user_id.clone(),
            status: PresenceStatus::Online,
        });
    }

    tracing::info!(
        connection_id = %connection_id,
        user_id = %user_id,
        "gateway connection established"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                let Some(event) = outbound else { break };
                let json = serde_json::to_string(&event).unwrap();
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            inbound = ws_rx.next() => {
                let msg = match inbound {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        tracing::debug!(?e, connection_id = %connection_id, "ws read error");
                        break;
                    }
                    None => break,
                };

                let text = match msg {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                    _ => continue,
                };

                // A malformed frame is acked with an error but does not cost
                // the client its connection.
                let command: ClientCommand = match serde_json::from_str(&text) {
                    Ok(command) => command,
                    Err(e) => {
                        tracing::debug!(?e, connection_id = %connection_id, "malformed frame");
                        let ack = ServerEvent::from_error(&crate::error::GatewayError::invalid_argument(
                            "Malformed frame",
                        ));
                        let json = serde_json::to_string(&ack).unwrap();
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                        continue;
                    }
                };

                if let Err(err) = handle_command(&state, &session, command).await {
                    tracing::debug!(
                        code = err.code(),
                        user_id = %user_id,
                        "command rejected"
                    );
                    let ack = ServerEvent::from_error(&err);
                    let json = serde_json::to_string(&ack).unwrap();
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    teardown(&state, &session);

    tracing::info!(
        connection_id = %connection_id,
        user_id = %user_id,
        "gateway connection ended"
    );
}

/// Disconnect cleanup. Runs exactly once per connection, whether the client
/// closed cleanly or the socket died.
fn teardown(state: &AppState, session: &ConnectionSession) {
    // Typing indicators this connection still holds are retracted for the
    // rooms that saw them.
    for conversation_id in session.drain_typing() {
        state.rooms.emit_to_room_except(
            &conversation_id,
            &session.connection_id,
            &ServerEvent::UserStopTyping {
                user_id: session.user_id.clone(),
                conversation_id: conversation_id.clone(),
            },
        );
    }

    state.rooms.remove_connection(&session.connection_id);

    let went_offline = state
        .presence
        .deregister(&session.user_id, &session.connection_id);
    if went_offline {
        state.rooms.emit_to_all(&ServerEvent::UserStatusChanged {
            user_id: session.user_id.clone(),
            status: PresenceStatus::Offline,
        });
    }

    calls::end_on_disconnect(state, session, went_offline);
}
