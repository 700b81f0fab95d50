//! WebSocket collaboration server with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (room_id) ── DocumentReplica ── ConnectionHub
//! Client B ──┘                            │                │
//!                                  SessionRegistry    ClusterBridge ── broker
//! ```
//!
//! One task per connection: the read half drives the message loop, the
//! write half is a dedicated writer task fed through the hub. All document
//! mutation goes through the registry's write lock, which serializes
//! transform-then-apply per room. A separate dispatcher task applies events
//! relayed from other instances.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapter 8

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;

use crate::bridge::{ClusterBridge, RelayEvent};
use crate::config::ServerConfig;
use crate::document::ApplyOutcome;
use crate::hub::{ConnectionHub, ConnectionId};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::{token, SessionRegistry, User};

/// Close code sent when the target room does not exist.
pub const ROOM_NOT_FOUND_CLOSE_CODE: u16 = 4004;

/// Cursor color palette; assigned round-robin per room.
const USER_COLORS: [&str; 12] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#FFA07A", "#98D8C8", "#F7DC6F", "#BB8FCE", "#85C1E2",
    "#F8B739", "#52B788", "#E76F51", "#2A9D8F",
];

const USER_ID_LEN: usize = 8;

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    registry: Arc<RwLock<SessionRegistry>>,
    hub: Arc<ConnectionHub>,
    bridge: Arc<ClusterBridge>,
    /// Taken by `run` when the relay dispatcher starts.
    relay_rx: Mutex<Option<mpsc::UnboundedReceiver<RelayEvent>>>,
}

impl CollabServer {
    pub fn new(config: ServerConfig) -> Self {
        let (bridge, relay_rx) = ClusterBridge::new();
        Self {
            config,
            registry: Arc::new(RwLock::new(SessionRegistry::new())),
            hub: Arc::new(ConnectionHub::new()),
            bridge: Arc::new(bridge),
            relay_rx: Mutex::new(Some(relay_rx)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Shared session registry — the room-management boundary creates and
    /// deletes rooms through this.
    pub fn registry(&self) -> Arc<RwLock<SessionRegistry>> {
        self.registry.clone()
    }

    pub fn hub(&self) -> Arc<ConnectionHub> {
        self.hub.clone()
    }

    pub fn bridge(&self) -> Arc<ClusterBridge> {
        self.bridge.clone()
    }

    /// Run the accept loop. Call from an async runtime; never returns under
    /// normal operation.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        match &self.config.redis_url {
            Some(url) => {
                if let Err(e) = self.bridge.connect(url).await {
                    log::warn!("broker unavailable ({e}); running in single-instance mode");
                }
            }
            None => log::info!("relay disabled by configuration; single-instance mode"),
        }

        if let Some(mut relay_rx) = self.relay_rx.lock().await.take() {
            let registry = self.registry.clone();
            let hub = self.hub.clone();
            tokio::spawn(async move {
                while let Some(event) = relay_rx.recv().await {
                    dispatch_relay(&registry, &hub, event).await;
                }
            });
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("collab server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let registry = self.registry.clone();
            let hub = self.hub.clone();
            let bridge = self.bridge.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, registry, hub, bridge, config).await {
                    log::debug!("connection from {addr} ended with error: {e}");
                }
            });
        }
    }
}

/// Handle one WebSocket connection for its whole lifetime.
async fn handle_connection(
    stream: TcpStream,
    registry: Arc<RwLock<SessionRegistry>>,
    hub: Arc<ConnectionHub>,
    bridge: Arc<ClusterBridge>,
    config: ServerConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut path = String::new();
    let mut query: Option<String> = None;

    let ws_config = WebSocketConfig::default().max_message_size(Some(config.max_message_size));
    let ws = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        |req: &Request, resp: Response| {
            path = req.uri().path().to_string();
            query = req.uri().query().map(str::to_string);
            Ok(resp)
        },
        Some(ws_config),
    )
    .await?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    let Some(room_id) = parse_room_path(&path).map(str::to_string) else {
        let _ = ws_tx.send(room_not_found()).await;
        return Ok(());
    };
    let username = query
        .as_deref()
        .and_then(|q| query_param(q, "username"))
        .unwrap_or("Anonymous")
        .to_string();

    // Room must already exist; if its document is still empty, try to seed
    // it from a persisted snapshot before the first join.
    let needs_seed = match registry.read().await.get_room(&room_id) {
        None => {
            let _ = ws_tx.send(room_not_found()).await;
            return Ok(());
        }
        Some(room) => room.replica().version() == 0,
    };
    let snapshot = if needs_seed {
        bridge.load_snapshot(&room_id).await
    } else {
        None
    };

    let user_id = token(USER_ID_LEN);
    let joined = {
        let mut reg = registry.write().await;
        match reg.get_room_mut(&room_id) {
            None => None,
            Some(room) => {
                if let Some(content) = snapshot.as_deref() {
                    if room.replica().version() == 0 && !content.is_empty() {
                        room.replica_mut().load_snapshot(content);
                        log::info!("seeded room {room_id} from persisted snapshot");
                    }
                }
                let color = pick_color(room.user_count()).to_string();
                let user = User::new(user_id.clone(), username.clone(), color.clone());
                room.add_user(user.clone());
                let init =
                    ServerMessage::init(user_id.clone(), color, room.replica().state(), room.users());
                Some((init, user))
            }
        }
    };
    let Some((init, user)) = joined else {
        let _ = ws_tx.send(room_not_found()).await;
        return Ok(());
    };

    // Writer task: everything outbound flows through one channel so a slow
    // or dead socket never blocks a broadcast.
    let (tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // Init goes out before the connection is visible to broadcasts.
    if let Ok(text) = serde_json::to_string(&init) {
        let _ = tx.send(Message::text(text));
    }
    let conn_id = hub.connect(&room_id, &user_id, tx).await;
    bridge.subscribe(&room_id).await;

    let joined_msg = ServerMessage::user_joined(user);
    hub.broadcast(&room_id, &joined_msg, Some(conn_id)).await;
    bridge.publish(&room_id, &joined_msg).await;
    log::info!("user {user_id} ({username}) joined room {room_id}");

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                handle_client_message(&text, &registry, &hub, &bridge, &room_id, &user_id, conn_id)
                    .await;
            }
            Ok(Message::Ping(_)) => {} // transport-level, answered by tungstenite
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                log::debug!("websocket error for user {user_id} in room {room_id}: {e}");
                break;
            }
        }
    }

    // Cleanup: hub and registry released together from this one task, so no
    // orphaned entries survive the disconnect.
    hub.disconnect(conn_id).await;
    let removed = registry.write().await.remove_user(&room_id, &user_id);
    if let Some(user) = removed {
        let left = ServerMessage::user_left(&user.user_id, &user.username);
        hub.broadcast(&room_id, &left, None).await;
        bridge.publish(&room_id, &left).await;
        log::info!("user {user_id} left room {room_id}");
    }

    if hub.connection_count(&room_id).await == 0 {
        bridge.unsubscribe(&room_id).await;
        let content = registry
            .read()
            .await
            .get_room(&room_id)
            .map(|room| room.replica().content().to_string());
        if let Some(content) = content {
            bridge.persist_snapshot(&room_id, &content).await;
        }
    }

    Ok(())
}

/// Handle one inbound client message. Malformed messages are logged and
/// ignored; they never close the connection.
async fn handle_client_message(
    text: &str,
    registry: &Arc<RwLock<SessionRegistry>>,
    hub: &Arc<ConnectionHub>,
    bridge: &Arc<ClusterBridge>,
    room_id: &str,
    user_id: &str,
    conn_id: ConnectionId,
) {
    let parsed: ClientMessage = match serde_json::from_str(text) {
        Ok(parsed) => parsed,
        Err(e) => {
            log::debug!("ignoring malformed message from user {user_id}: {e}");
            return;
        }
    };

    match parsed {
        ClientMessage::Operation { mut operation } => {
            // The submitter's identity comes from the connection, never
            // from the payload.
            operation.client_id = user_id.to_string();

            let applied = {
                let mut reg = registry.write().await;
                let Some(room) = reg.get_room_mut(room_id) else {
                    return;
                };
                match room.replica_mut().apply_operation(operation) {
                    ApplyOutcome::Applied(op) => {
                        Some((op, room.replica().content().to_string()))
                    }
                    ApplyOutcome::Rejected(reason) => {
                        log::debug!("operation from user {user_id} rejected: {reason}");
                        None
                    }
                }
            };

            if let Some((op, content)) = applied {
                let message = ServerMessage::operation(op, user_id);
                hub.broadcast(room_id, &message, Some(conn_id)).await;
                bridge.publish(room_id, &message).await;
                bridge.persist_snapshot(room_id, &content).await;
            }
        }

        ClientMessage::Cursor {
            position,
            selection_start,
            selection_end,
        } => {
            let updated = registry.write().await.update_cursor(
                room_id,
                user_id,
                position,
                selection_start,
                selection_end,
            );
            if updated {
                let message =
                    ServerMessage::cursor(user_id, position, selection_start, selection_end);
                hub.broadcast(room_id, &message, Some(conn_id)).await;
                bridge.publish(room_id, &message).await;
            }
        }

        ClientMessage::Ping => {
            hub.send_to(conn_id, &ServerMessage::pong()).await;
        }
    }
}

/// Apply one event relayed from another instance: operations go through the
/// local replica (local transform), presence reconstructs registry state;
/// everything is then fanned out to local connections.
async fn dispatch_relay(
    registry: &Arc<RwLock<SessionRegistry>>,
    hub: &Arc<ConnectionHub>,
    event: RelayEvent,
) {
    let RelayEvent { room_id, message } = event;
    match message {
        ServerMessage::Operation {
            operation, user_id, ..
        } => {
            let applied = {
                let mut reg = registry.write().await;
                let Some(room) = reg.get_room_mut(&room_id) else {
                    return;
                };
                match room.replica_mut().apply_operation(operation) {
                    ApplyOutcome::Applied(op) => Some(op),
                    ApplyOutcome::Rejected(reason) => {
                        log::debug!("relayed operation for room {room_id} rejected: {reason}");
                        None
                    }
                }
            };
            if let Some(op) = applied {
                hub.broadcast(&room_id, &ServerMessage::operation(op, &user_id), None)
                    .await;
            }
        }

        ServerMessage::Cursor {
            user_id,
            position,
            selection_start,
            selection_end,
            ..
        } => {
            registry.write().await.update_cursor(
                &room_id,
                &user_id,
                position,
                selection_start,
                selection_end,
            );
            hub.broadcast(
                &room_id,
                &ServerMessage::cursor(&user_id, position, selection_start, selection_end),
                None,
            )
            .await;
        }

        ServerMessage::UserJoined { user, .. } => {
            registry.write().await.add_user(&room_id, user.clone());
            hub.broadcast(&room_id, &ServerMessage::user_joined(user), None)
                .await;
        }

        ServerMessage::UserLeft {
            user_id, username, ..
        } => {
            registry.write().await.remove_user(&room_id, &user_id);
            hub.broadcast(&room_id, &ServerMessage::user_left(&user_id, &username), None)
                .await;
        }

        // Never relayed; nothing to do if one shows up.
        ServerMessage::Init { .. } | ServerMessage::Pong => {}
    }
}

fn room_not_found() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Library(ROOM_NOT_FOUND_CLOSE_CODE),
        reason: "Room not found".into(),
    }))
}

/// Extract the room id from a `/ws/{room_id}` request path.
fn parse_room_path(path: &str) -> Option<&str> {
    let room_id = path.strip_prefix("/ws/")?.trim_end_matches('/');
    if room_id.is_empty() || room_id.contains('/') {
        None
    } else {
        Some(room_id)
    }
}

/// Pull a single value out of a raw query string.
fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then_some(v)
    })
}

fn pick_color(index: usize) -> &'static str {
    USER_COLORS[index % USER_COLORS.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_room_path() {
        assert_eq!(parse_room_path("/ws/abc123"), Some("abc123"));
        assert_eq!(parse_room_path("/ws/abc123/"), Some("abc123"));
        assert_eq!(parse_room_path("/ws/"), None);
        assert_eq!(parse_room_path("/ws/a/b"), None);
        assert_eq!(parse_room_path("/other/abc"), None);
        assert_eq!(parse_room_path("/"), None);
    }

    #[test]
    fn test_query_param() {
        assert_eq!(query_param("username=Alice", "username"), Some("Alice"));
        assert_eq!(
            query_param("a=1&username=Bob&b=2", "username"),
            Some("Bob")
        );
        assert_eq!(query_param("a=1&b=2", "username"), None);
        assert_eq!(query_param("username", "username"), None);
    }

    #[test]
    fn test_pick_color_cycles() {
        assert_eq!(pick_color(0), USER_COLORS[0]);
        assert_eq!(pick_color(11), USER_COLORS[11]);
        assert_eq!(pick_color(12), USER_COLORS[0]);
        assert_eq!(pick_color(25), USER_COLORS[1]);
    }

    #[test]
    fn test_server_construction() {
        let server = CollabServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:8000");
    }

    #[tokio::test]
    async fn test_registry_is_shared() {
        let server = CollabServer::with_defaults();
        let room_id = server.registry().write().await.create_room("rust");
        assert!(server.registry().read().await.room_exists(&room_id));
    }
}
