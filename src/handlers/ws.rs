//! WebSocket handler: token auth, registration with presence, initial chat subscriptions,
//! ping/pong keepalive, explicit join/leave, and cleanup on close or eviction.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::trace;

use crate::events::{ClientMessage, ServerEvent};
use crate::ids::UserId;
use crate::ws_registry::Connection;
use crate::AppState;

#[derive(Deserialize)]
pub struct WsQuery {
    access_token: Option<String>,
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Upgrades the connection after verifying the access token (query param or bearer header).
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(q): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = q.access_token.as_deref().or_else(|| bearer(&headers));
    let uid = match state.verifier.verify(token) {
        Ok(uid) => uid,
        Err(e) => {
            tracing::debug!("ws auth rejected: {}", e);
            return (StatusCode::UNAUTHORIZED, "Invalid or missing access token").into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, uid, state))
}

async fn handle_socket(mut socket: WebSocket, uid: UserId, state: AppState) {
    let presence = state.fanout.presence().clone();
    let (conn, mut rx) = presence.connect(uid);
    let conn_id = conn.id();

    join_participant_chats(&state, uid, &conn).await;

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(text) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = conn.closed() => {
                trace!(%uid, %conn_id, "ws closed by server");
                break;
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_client_message(&state, uid, &conn, text.as_str()).await;
                        if let Some(reply) = reply {
                            if socket.send(Message::Text(reply.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }
    presence.disconnect(&uid, conn_id);
}

async fn join_participant_chats(state: &AppState, uid: UserId, conn: &Arc<Connection>) {
    match state.directory.chats_of(&uid).await {
        Ok(chats) => {
            let rooms = state.fanout.presence().rooms();
            for chat_id in &chats {
                rooms.subscribe(*chat_id, conn);
            }
            trace!(%uid, conn_id = %conn.id(), chats = chats.len(), "ws subscribed to participant chats");
        }
        Err(e) => {
            tracing::warn!(%uid, "load participant chats: {}", e);
        }
    }
}

async fn handle_client_message(
    state: &AppState,
    uid: UserId,
    conn: &Arc<Connection>,
    text: &str,
) -> Option<String> {
    conn.touch();
    let parsed = match serde_json::from_str::<ClientMessage>(text) {
        Ok(parsed) => parsed,
        Err(_) => {
            trace!(%uid, "ws unrecognized client message");
            return reply(ServerEvent::Error {
                message: "Unrecognized message".to_string(),
            });
        }
    };

    let rooms = state.fanout.presence().rooms();
    match parsed {
        ClientMessage::Ping => {
            trace!(%uid, conn_id = %conn.id(), "ws ping received");
            reply(ServerEvent::Pong)
        }
        ClientMessage::JoinChat { chat_id } => {
            match state.directory.is_participant(&chat_id, &uid).await {
                Ok(true) => {
                    rooms.subscribe(chat_id, conn);
                    reply(ServerEvent::Subscribed { chat_id })
                }
                Ok(false) => reply(ServerEvent::Error {
                    message: "Not a participant of this chat".to_string(),
                }),
                Err(e) => {
                    tracing::warn!(%uid, %chat_id, "check participation: {}", e);
                    reply(ServerEvent::Error {
                        message: "Chat directory unavailable".to_string(),
                    })
                }
            }
        }
        ClientMessage::LeaveChat { chat_id } => {
            rooms.unsubscribe(chat_id, conn.id());
            reply(ServerEvent::Unsubscribed { chat_id })
        }
    }
}

fn reply(event: ServerEvent) -> Option<String> {
    match event.to_payload() {
        Ok(payload) => Some(payload),
        Err(e) => {
            tracing::error!("serialize ws reply: {:?}", e);
            None
        }
    }
}
