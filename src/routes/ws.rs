//! WebSocket session loop and event router.
//!
//! DESIGN
//! ======
//! On upgrade the connection registers in the presence registry and enters a
//! `select!` loop over three sources:
//! - inbound client events -> parse and route by event tag
//! - events queued by peers (unicast and broadcast) -> forward to the socket
//! - the close signal -> a newer login for the same user evicted us
//!
//! Handler functions return an `Outcome`; the dispatch layer owns all
//! outbound concerns (direct replies, receiver unicast, fan-out).
//! `process_event` is separated from the socket loop so tests can drive the
//! router through channels without a live socket.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade -> register connection (unauthenticated)
//! 2. Client sends `authenticate` -> verify token, bind user, broadcast online
//! 3. Routed events read/write the store, reply, unicast, or broadcast
//! 4. Close -> release the binding if still owned, broadcast offline

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::envelope::{ClientEvent, ServerEvent};
use crate::services::conversation::{Chat, NewChat, StoreError};
use crate::state::{AppState, ConnectionHandle};

/// Client-facing message when assembling the conversation list fails.
const MESSAGE_LIST_FAILED: &str = "Failed to fetch users with last messages";

// =============================================================================
// OUTCOME
// =============================================================================

/// Result of routing one client event. Handlers never touch the socket; the
/// dispatch layer turns an outcome into replies and deliveries.
enum Outcome {
    /// Send one event back to the requesting connection only.
    Reply(ServerEvent),
    /// Echo the event to the sender and unicast a copy to one user.
    Deliver { to: Uuid, event: ServerEvent },
    /// Fan out to every open connection, the sender's included.
    Broadcast(ServerEvent),
    /// Drop the event with no visible response.
    Silent,
    /// Terminate the connection without emitting anything.
    Close,
}

/// What the router decided for one inbound text message.
struct Routed {
    /// Events to write back on the requesting socket, in order.
    replies: Vec<ServerEvent>,
    /// Terminate the connection after the replies.
    close: bool,
}

impl Routed {
    fn silent() -> Self {
        Self {
            replies: Vec::new(),
            close: false,
        }
    }
}

// =============================================================================
// UPGRADE & SESSION LOOP
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    // Connections start unauthenticated; identity arrives as the first event.
    ws.on_upgrade(move |socket| run_session(socket, state))
}

async fn run_session(mut socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4();

    // Per-connection queue for events sent by peers and broadcasts.
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(256);
    let handle = ConnectionHandle::new(conn_id, tx);
    state.presence.register(handle.clone());

    info!(%conn_id, "ws: connection open");

    // The user bound to this session. Set once by `authenticate`.
    let mut bound_user: Option<Uuid> = None;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let routed = process_event(&state, &mut bound_user, &handle, &text).await;
                        for event in &routed.replies {
                            // A dead socket surfaces on the next recv.
                            let _ = send_event(&mut socket, event).await;
                        }
                        if routed.close {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(event) = rx.recv() => {
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
            }
            () = handle.closed() => {
                info!(%conn_id, "ws: evicted by a newer login");
                break;
            }
        }
    }

    finish_session(&state, conn_id, bound_user);
    info!(%conn_id, "ws: connection closed");
}

/// Release presence for a closing connection and, when this connection still
/// owned the user's binding, announce the offline transition.
fn finish_session(state: &AppState, conn_id: Uuid, bound_user: Option<Uuid>) {
    if let Some(user_id) = state.presence.remove(conn_id, bound_user) {
        state.presence.broadcast(&ServerEvent::user_status(user_id, false));
        info!(%conn_id, %user_id, "ws: user offline");
    }
}

// =============================================================================
// EVENT DISPATCH
// =============================================================================

/// Parse and route one inbound text message, apply the outcome, and return
/// what goes back on the requesting socket.
async fn process_event(
    state: &AppState,
    bound_user: &mut Option<Uuid>,
    handle: &ConnectionHandle,
    text: &str,
) -> Routed {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            // Unknown event names and malformed payloads get no response.
            warn!(conn_id = %handle.conn_id(), error = %e, "ws: ignoring unparseable event");
            return Routed::silent();
        }
    };

    let outcome = match event {
        ClientEvent::Authenticate { token } => {
            handle_authenticate(state, bound_user, handle, token)
        }
        ClientEvent::Message {
            receiver_id,
            message,
            images,
        } => handle_message(state, *bound_user, receiver_id, message, images).await,
        ClientEvent::FetchChats { receiver_id } => {
            handle_fetch_chats(state, *bound_user, receiver_id).await
        }
        ClientEvent::OnlineUsers => handle_online_users(state, *bound_user).await,
        ClientEvent::UnReadMessages { receiver_id } => {
            handle_unread_messages(state, *bound_user, receiver_id).await
        }
        ClientEvent::MessageList => handle_message_list(state, *bound_user).await,
    };

    match outcome {
        Outcome::Reply(event) => Routed {
            replies: vec![event],
            close: false,
        },
        Outcome::Deliver { to, event } => {
            // Receiver copy is best-effort; the sender echo always goes out.
            let _ = state.presence.unicast(to, event.clone());
            Routed {
                replies: vec![event],
                close: false,
            }
        }
        Outcome::Broadcast(event) => {
            // The sender's copy arrives through its own registered handle.
            state.presence.broadcast(&event);
            Routed::silent()
        }
        Outcome::Silent => Routed::silent(),
        Outcome::Close => Routed {
            replies: Vec::new(),
            close: true,
        },
    }
}

/// Authentication gate shared by every event except `authenticate`.
fn require_user(bound_user: Option<Uuid>, event_name: &str) -> Option<Uuid> {
    if bound_user.is_none() {
        info!(event = event_name, "ws: dropping event from unauthenticated connection");
    }
    bound_user
}

// =============================================================================
// AUTHENTICATION
// =============================================================================

fn handle_authenticate(
    state: &AppState,
    bound_user: &mut Option<Uuid>,
    handle: &ConnectionHandle,
    token: Option<String>,
) -> Outcome {
    // The binding is set once per session; repeats are dropped.
    if bound_user.is_some() {
        info!(conn_id = %handle.conn_id(), "ws: ignoring repeat authenticate");
        return Outcome::Silent;
    }

    let claims = match state.verifier.verify(token.as_deref()) {
        Ok(claims) => claims,
        Err(e) => {
            warn!(conn_id = %handle.conn_id(), error = %e, "ws: authentication failed, closing");
            return Outcome::Close;
        }
    };

    *bound_user = Some(claims.id);
    if let Some(evicted) = state.presence.bind_user(claims.id, handle.clone()) {
        // Same user on a new connection: the old session is told to shut
        // down, and its cleanup will find the binding already moved.
        info!(
            user_id = %claims.id,
            old_conn = %evicted.conn_id(),
            "ws: closing superseded connection"
        );
        evicted.close();
    }

    info!(
        conn_id = %handle.conn_id(),
        user_id = %claims.id,
        role = %claims.role,
        "ws: user authenticated"
    );
    Outcome::Broadcast(ServerEvent::user_status(claims.id, true))
}

// =============================================================================
// MESSAGE HANDLERS
// =============================================================================

async fn handle_message(
    state: &AppState,
    bound_user: Option<Uuid>,
    receiver_id: Uuid,
    message: String,
    images: Vec<String>,
) -> Outcome {
    let Some(sender_id) = require_user(bound_user, "message") else {
        return Outcome::Silent;
    };
    if message.is_empty() {
        info!(%sender_id, "ws: dropping empty message");
        return Outcome::Silent;
    }

    match store_message(state, sender_id, receiver_id, message, images).await {
        Ok(chat) => {
            let event = ServerEvent::new("message", serde_json::to_value(&chat).unwrap_or_default());
            Outcome::Deliver {
                to: receiver_id,
                event,
            }
        }
        Err(e) => {
            warn!(error = %e, %sender_id, %receiver_id, "ws: message persist failed");
            Outcome::Silent
        }
    }
}

/// Resolve the room (lookup first, upsert-create when absent) and persist
/// the chat.
async fn store_message(
    state: &AppState,
    sender_id: Uuid,
    receiver_id: Uuid,
    message: String,
    images: Vec<String>,
) -> Result<Chat, StoreError> {
    let room = match state.store.find_room(sender_id, receiver_id).await? {
        Some(room) => room,
        None => state.store.create_room(sender_id, receiver_id).await?,
    };
    state
        .store
        .create_chat(NewChat {
            room_id: room.id,
            sender_id,
            receiver_id,
            message,
            images,
        })
        .await
}

async fn handle_fetch_chats(
    state: &AppState,
    bound_user: Option<Uuid>,
    receiver_id: Uuid,
) -> Outcome {
    let Some(user_id) = require_user(bound_user, "fetchChats") else {
        return Outcome::Silent;
    };

    match fetch_and_mark_read(state, user_id, receiver_id).await {
        Ok(chats) => Outcome::Reply(ServerEvent::new(
            "fetchChats",
            serde_json::to_value(&chats).unwrap_or_default(),
        )),
        Err(e) => {
            warn!(error = %e, %user_id, "ws: fetchChats failed");
            Outcome::Silent
        }
    }
}

/// History oldest-first, then a bulk mark-read. The reply deliberately shows
/// the pre-update read state.
async fn fetch_and_mark_read(
    state: &AppState,
    user_id: Uuid,
    receiver_id: Uuid,
) -> Result<Vec<Chat>, StoreError> {
    let Some(room) = state.store.find_room(user_id, receiver_id).await? else {
        return Ok(Vec::new());
    };
    let chats = state.store.find_chats(room.id).await?;
    state.store.mark_read(room.id, user_id).await?;
    Ok(chats)
}

// =============================================================================
// PRESENCE & QUERY HANDLERS
// =============================================================================

async fn handle_online_users(state: &AppState, bound_user: Option<Uuid>) -> Outcome {
    let Some(user_id) = require_user(bound_user, "onlineUsers") else {
        return Outcome::Silent;
    };

    let online = state.presence.online_user_ids();
    match state.store.find_users(&online).await {
        Ok(profiles) => Outcome::Reply(ServerEvent::new(
            "onlineUsers",
            serde_json::to_value(&profiles).unwrap_or_default(),
        )),
        Err(e) => {
            warn!(error = %e, %user_id, "ws: onlineUsers lookup failed");
            Outcome::Silent
        }
    }
}

async fn handle_unread_messages(
    state: &AppState,
    bound_user: Option<Uuid>,
    receiver_id: Uuid,
) -> Outcome {
    let Some(user_id) = require_user(bound_user, "unReadMessages") else {
        return Outcome::Silent;
    };

    match unread_in_room(state, user_id, receiver_id).await {
        Ok(Some(unread)) => {
            let count = unread.len();
            Outcome::Reply(ServerEvent::new(
                "unReadMessages",
                json!({ "messages": unread, "count": count }),
            ))
        }
        Ok(None) => Outcome::Reply(ServerEvent::new("noUnreadMessages", json!([]))),
        Err(e) => {
            warn!(error = %e, %user_id, "ws: unReadMessages failed");
            Outcome::Silent
        }
    }
}

/// `None` when no room exists for the pair. The read flags are left
/// untouched; only `fetchChats` consumes unread state.
async fn unread_in_room(
    state: &AppState,
    user_id: Uuid,
    receiver_id: Uuid,
) -> Result<Option<Vec<Chat>>, StoreError> {
    let Some(room) = state.store.find_room(user_id, receiver_id).await? else {
        return Ok(None);
    };
    let unread = state.store.unread_chats(room.id, user_id).await?;
    Ok(Some(unread))
}

async fn handle_message_list(state: &AppState, bound_user: Option<Uuid>) -> Outcome {
    let Some(user_id) = require_user(bound_user, "messageList") else {
        return Outcome::Silent;
    };

    match build_message_list(state, user_id).await {
        Ok(list) => Outcome::Reply(ServerEvent::new(
            "messageList",
            serde_json::Value::Array(list),
        )),
        Err(e) => {
            warn!(error = %e, %user_id, "ws: messageList failed");
            Outcome::Reply(ServerEvent::error(MESSAGE_LIST_FAILED))
        }
    }
}

/// One `{user, lastMessage}` entry per room the user participates in.
/// `user` is null when the other participant has no profile row.
async fn build_message_list(
    state: &AppState,
    user_id: Uuid,
) -> Result<Vec<serde_json::Value>, StoreError> {
    let rooms = state.store.rooms_for(user_id).await?;

    let others: Vec<Uuid> = rooms
        .iter()
        .map(|room| {
            if room.sender_id == user_id {
                room.receiver_id
            } else {
                room.sender_id
            }
        })
        .collect();
    let profiles = state.store.find_users(&others).await?;

    let mut list = Vec::with_capacity(rooms.len());
    for (room, other) in rooms.iter().zip(&others) {
        let last_message = state.store.latest_chat(room.id).await?;
        let user = profiles.iter().find(|p| p.id == *other);
        list.push(json!({
            "user": user,
            "lastMessage": last_message,
        }));
    }
    Ok(list)
}

// =============================================================================
// SOCKET HELPERS
// =============================================================================

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize event");
            return Err(());
        }
    };
    info!(event = event.event, "ws: send event");
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
