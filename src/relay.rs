//! Signaling relay: every peer's `sdp` event is forwarded to all other
//! connected peers.

use std::sync::Arc;

use axum::http::StatusCode;
use dashmap::DashMap;
use serde_json::{json, Value};
use wsproto_core::ConnectionId;
use wsproto_server::{fail, Connection, Context, HookError, RequestInfo, WebSocketServer};

pub const PEER_PARAM: &str = "peer";
pub const PEER_ID_KEY: &str = "peer_id";
pub const SDP_EVENT: &str = "sdp";

/// Live connections, keyed by connection id.
#[derive(Default)]
pub struct Room {
    peers: DashMap<ConnectionId, Connection>,
}

impl Room {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, conn: Connection) {
        self.peers.insert(conn.uid().clone(), conn);
    }

    pub fn leave(&self, uid: &ConnectionId) -> bool {
        self.peers.remove(uid).is_some()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Every peer except `uid`. Clones out so no map shard stays locked
    /// while sending.
    pub fn others(&self, uid: &ConnectionId) -> Vec<Connection> {
        self.peers
            .iter()
            .filter(|entry| entry.key() != uid)
            .map(|entry| entry.value().clone())
            .collect()
    }
}

/// Requires a non-empty `peer` query parameter and stores it as `peer_id`.
pub fn peer_hook(request: &RequestInfo) -> Result<Context, HookError> {
    match request.query_param(PEER_PARAM) {
        Some(peer) if !peer.is_empty() => Ok(Context::new().with(PEER_ID_KEY, peer)),
        _ => Err(fail("bad peer id", StatusCode::BAD_REQUEST)),
    }
}

/// Register the relay's connection callback on `server`.
pub fn install(server: &WebSocketServer, room: Arc<Room>) {
    server.on_connection(move |conn, _request| {
        let room = Arc::clone(&room);
        async move { welcome(room, conn).await }
    });
}

async fn welcome(room: Arc<Room>, conn: Connection) {
    let peer_id = conn.context().get_str(PEER_ID_KEY).unwrap_or_default().to_owned();
    room.join(conn.clone());
    tracing::info!(connection_id = %conn.uid(), peer_id = %peer_id, peers = room.len(), "Peer joined");

    let relay_room = Arc::clone(&room);
    conn.on(SDP_EVENT, move |conn, data| {
        let room = Arc::clone(&relay_room);
        async move { relay(&room, &conn, &data).await }
    });

    conn.on_message(|conn, event, _data| async move {
        tracing::debug!(connection_id = %conn.uid(), event = %event, "Peer message");
    });

    let close_room = Arc::clone(&room);
    conn.on_close(move |conn, reason| {
        let room = Arc::clone(&close_room);
        async move {
            if room.leave(conn.uid()) {
                tracing::info!(connection_id = %conn.uid(), code = reason.code, "Peer left");
            }
        }
    });

    let error_room = Arc::clone(&room);
    conn.on_error(move |conn, reason| {
        let room = Arc::clone(&error_room);
        async move {
            if room.leave(conn.uid()) {
                tracing::info!(
                    connection_id = %conn.uid(),
                    code = reason.code,
                    reason = %reason.reason,
                    "Peer dropped"
                );
            }
        }
    });

    let greeting = json!({"uid": conn.uid(), "peer_id": peer_id});
    if let Err(err) = conn.send("connection", &greeting).await {
        tracing::warn!(connection_id = %conn.uid(), error = %err, "Failed to send welcome");
    }
}

async fn relay(room: &Room, from: &Connection, data: &Value) {
    let others = room.others(from.uid());
    tracing::debug!(connection_id = %from.uid(), targets = others.len(), "Relaying sdp");
    for peer in others {
        if let Err(err) = peer.send(SDP_EVENT, data).await {
            tracing::warn!(
                connection_id = %peer.uid(),
                error = %err,
                kind = err.error_kind(),
                "Relay send failed"
            );
        }
    }
}
