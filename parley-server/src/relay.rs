//! WebSocket relay: connection broker, message fan-out, and conversation
//! archival.
//!
//! Each socket is authenticated exactly once, at handshake time, against the
//! session store; the resolved username is bound to the connection for its
//! whole lifetime and stamped onto every frame it sends. Inbound frames are
//! sanitized, broadcast to every other live connection, and appended to the
//! sender's room buffer. A buffer that fills a complete block is archived
//! synchronously, on the triggering frame's processing path, so at most one
//! flush per room is ever in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::buffer::StoredMessage;
use crate::db::Conversation;
use crate::server::SharedState;
use crate::session::{cookie_value, SESSION_COOKIE};

/// Outbound frames queued per connection before the socket applies
/// backpressure and further sends to that peer start failing.
const OUTBOUND_QUEUE: usize = 64;

/// A chat message as carried on the wire, in both directions.
///
/// The client-supplied `username` is never trusted; the relay overwrites it
/// with the identity bound to the sending connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatFrame {
    #[serde(rename = "roomId")]
    pub room_id: String,
    pub username: String,
    pub text: String,
}

/// Result of one fan-out pass. A failed send to one peer is isolated: it is
/// counted here and never aborts delivery to the remaining peers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    pub failed: usize,
}

/// `GET /ws` — upgrade the connection and hand it to the broker.
///
/// The token travels in the browser's cookie header, so authentication
/// happens against the handshake request. The HTTP upgrade itself always
/// succeeds; a socket that fails authentication is closed immediately with
/// no frames ever delivered or accepted.
pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<SharedState>>,
) -> impl IntoResponse {
    let identity = resolve_identity(&state, &headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

/// Resolve the handshake's session cookie to an authenticated username.
/// Missing cookie header, missing cookie, and unknown/expired token all
/// collapse to `None` — the broker treats them identically.
fn resolve_identity(state: &SharedState, headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(|cookies| cookie_value(cookies, SESSION_COOKIE))
        .and_then(|token| state.sessions.lookup(&token))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<SharedState>, identity: Option<String>) {
    let Some(username) = identity else {
        tracing::info!("WebSocket rejected: missing or invalid session");
        return; // dropping the socket closes it without sending a frame
    };

    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let conn_id = COUNTER.fetch_add(1, Ordering::Relaxed);

    // Register this connection's outbound channel so other handlers can
    // broadcast to it.
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    state.connections.lock().insert(conn_id, tx);
    tracing::info!(conn_id, %username, "WebSocket connection authenticated");

    let ws_send_timeout = tokio::time::Duration::from_secs(30);
    loop {
        tokio::select! {
            frame = socket.recv() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_frame(&state, conn_id, &username, text.as_str());
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // Ping/Pong handled by axum
                    Some(Err(_)) => break,
                }
            }
            outbound = rx.recv() => {
                match outbound {
                    Some(line) => {
                        match tokio::time::timeout(ws_send_timeout, socket.send(WsMessage::Text(line.into()))).await {
                            Ok(Ok(())) => {}
                            Ok(Err(_)) | Err(_) => {
                                tracing::debug!(conn_id, "WebSocket send failed or timed out");
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }
        }
    }

    state.connections.lock().remove(&conn_id);
    tracing::info!(conn_id, %username, "WebSocket disconnected");
}

/// Relay engine: process one inbound frame from an authenticated connection.
///
/// Holds no lock across any await point and performs no network I/O before
/// the buffer append, so a slow peer cannot delay archival for the room.
pub fn handle_frame(state: &Arc<SharedState>, sender_id: u64, username: &str, payload: &str) {
    // A malformed payload is fatal to this frame only; the connection stays
    // open.
    let Ok(mut frame) = serde_json::from_str::<ChatFrame>(payload) else {
        tracing::debug!(sender_id, "Dropping malformed frame");
        return;
    };

    frame.username = username.to_string();
    frame.text = sanitize(&frame.text);

    let outcome = broadcast(state, sender_id, &frame);
    if outcome.failed > 0 {
        tracing::warn!(
            sender_id,
            delivered = outcome.delivered,
            failed = outcome.failed,
            "Broadcast reached only part of the peer set"
        );
    }

    let message = StoredMessage {
        username: frame.username,
        text: frame.text,
    };
    if let Some(block) = state.buffers.append(&frame.room_id, message) {
        archive(state, &frame.room_id, block);
    }
}

/// Fan a frame out to every live connection except the sender.
///
/// Senders are snapshotted before delivery so a concurrent disconnect cannot
/// invalidate the iteration, and `try_send` keeps a stalled peer from ever
/// blocking the relay.
fn broadcast(state: &Arc<SharedState>, sender_id: u64, frame: &ChatFrame) -> BroadcastOutcome {
    let line = match serde_json::to_string(frame) {
        Ok(line) => line,
        Err(e) => {
            tracing::error!("Failed to encode frame: {e}");
            return BroadcastOutcome::default();
        }
    };

    let peers: Vec<(u64, mpsc::Sender<String>)> = {
        let connections = state.connections.lock();
        connections
            .iter()
            .filter(|(id, _)| **id != sender_id)
            .map(|(id, tx)| (*id, tx.clone()))
            .collect()
    };

    let mut outcome = BroadcastOutcome::default();
    for (peer_id, tx) in peers {
        if tx.try_send(line.clone()).is_ok() {
            outcome.delivered += 1;
        } else {
            tracing::debug!(peer_id, "Peer send failed, skipping");
            outcome.failed += 1;
        }
    }
    outcome
}

/// Archival trigger: persist a detached block as an immutable conversation.
///
/// A persistence failure drops the block — live clients already received the
/// messages, only history loses them.
fn archive(state: &Arc<SharedState>, room_id: &str, messages: Vec<StoredMessage>) {
    let conversation = Conversation {
        room_id: room_id.to_string(),
        timestamp: chrono::Utc::now().timestamp_millis() as u64,
        messages,
    };
    if state
        .with_db(|db| db.add_conversation(&conversation))
        .is_some()
    {
        tracing::info!(
            room_id,
            messages = conversation.messages.len(),
            "Archived conversation block"
        );
    } else {
        tracing::error!(room_id, "Failed to archive conversation block, dropping it");
    }
}

/// Escape `&`, `<`, and `>` for safe rendering in the browser.
///
/// Already-escaped entities are left alone, so sanitizing is idempotent:
/// `"&lt;"` stays `"&lt;"` instead of degrading to `"&amp;lt;"`.
pub fn sanitize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(['&', '<', '>']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if let Some(after) = tail.strip_prefix('<') {
            out.push_str("&lt;");
            rest = after;
        } else if let Some(after) = tail.strip_prefix('>') {
            out.push_str("&gt;");
            rest = after;
        } else if let Some(after) = tail.strip_prefix("&amp;") {
            out.push_str("&amp;");
            rest = after;
        } else if let Some(after) = tail.strip_prefix("&lt;") {
            out.push_str("&lt;");
            rest = after;
        } else if let Some(after) = tail.strip_prefix("&gt;") {
            out.push_str("&gt;");
            rest = after;
        } else {
            out.push_str("&amp;");
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}
