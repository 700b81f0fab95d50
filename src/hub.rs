//! Per-process connection multiplexing and fan-out.
//!
//! Each live WebSocket gets an opaque [`ConnectionId`] at registration and a
//! dedicated outbound channel consumed by its writer task. Broadcast is
//! "deliver to all reachable, drop the unreachable": a connection whose
//! channel is gone is removed from the hub and delivery to the rest
//! continues.
//!
//! Both maps (id → entry, room → ids) are mutated only under one write lock,
//! so there is no observable state with a connection registered in just one
//! of them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::ServerMessage;

/// Opaque handle for one live connection.
pub type ConnectionId = u64;

/// Outbound channel feeding a connection's writer task.
pub type OutboundSender = mpsc::UnboundedSender<Message>;

struct ConnectionEntry {
    room_id: String,
    user_id: String,
    tx: OutboundSender,
}

#[derive(Default)]
struct HubInner {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
}

/// Per-process transport hub.
pub struct ConnectionHub {
    next_id: AtomicU64,
    inner: RwLock<HubInner>,
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            inner: RwLock::new(HubInner::default()),
        }
    }

    /// Register a connection under a room and user, returning its id.
    pub async fn connect(&self, room_id: &str, user_id: &str, tx: OutboundSender) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.write().await;
        inner.connections.insert(
            id,
            ConnectionEntry {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
                tx,
            },
        );
        inner.rooms.entry(room_id.to_string()).or_default().insert(id);
        log::debug!("connection {id} registered (user {user_id}, room {room_id})");
        id
    }

    /// Remove a connection from both maps. Safe to call repeatedly; returns
    /// the released `(room_id, user_id)` the first time, `None` after.
    pub async fn disconnect(&self, id: ConnectionId) -> Option<(String, String)> {
        let mut inner = self.inner.write().await;
        let entry = inner.connections.remove(&id)?;
        if let Some(ids) = inner.rooms.get_mut(&entry.room_id) {
            ids.remove(&id);
            if ids.is_empty() {
                inner.rooms.remove(&entry.room_id);
            }
        }
        log::debug!(
            "connection {id} released (user {}, room {})",
            entry.user_id,
            entry.room_id
        );
        Some((entry.room_id, entry.user_id))
    }

    /// Deliver a message to every live connection in `room_id` except
    /// `exclude`. Returns the number of connections reached; unreachable
    /// connections are dropped from the hub.
    pub async fn broadcast(
        &self,
        room_id: &str,
        message: &ServerMessage,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                log::error!("failed to encode broadcast for room {room_id}: {e}");
                return 0;
            }
        };

        let mut delivered = 0;
        let mut unreachable = Vec::new();
        {
            let inner = self.inner.read().await;
            let Some(ids) = inner.rooms.get(room_id) else {
                return 0;
            };
            for &id in ids {
                if Some(id) == exclude {
                    continue;
                }
                let Some(entry) = inner.connections.get(&id) else {
                    continue;
                };
                if entry.tx.send(Message::text(text.clone())).is_ok() {
                    delivered += 1;
                } else {
                    unreachable.push(id);
                }
            }
        }

        for id in unreachable {
            if let Some((room, user)) = self.disconnect(id).await {
                log::warn!("dropping unreachable connection {id} (user {user}, room {room})");
            }
        }
        delivered
    }

    /// Send a message to a single connection.
    pub async fn send_to(&self, id: ConnectionId, message: &ServerMessage) -> bool {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                log::error!("failed to encode message for connection {id}: {e}");
                return false;
            }
        };
        let reachable = {
            let inner = self.inner.read().await;
            match inner.connections.get(&id) {
                Some(entry) => entry.tx.send(Message::text(text)).is_ok(),
                None => return false,
            }
        };
        if !reachable {
            self.disconnect(id).await;
        }
        reachable
    }

    /// Number of live connections registered under a room.
    pub async fn connection_count(&self, room_id: &str) -> usize {
        self.inner
            .read()
            .await
            .rooms
            .get(room_id)
            .map(|ids| ids.len())
            .unwrap_or(0)
    }

    /// Look up the `(room_id, user_id)` a connection is registered under.
    pub async fn peer(&self, id: ConnectionId) -> Option<(String, String)> {
        let inner = self.inner.read().await;
        inner
            .connections
            .get(&id)
            .map(|e| (e.room_id.clone(), e.user_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn channel() -> (OutboundSender, mpsc::UnboundedReceiver<Message>) {
        mpsc::unbounded_channel()
    }

    fn parse(msg: Message) -> Value {
        serde_json::from_str(msg.to_text().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_connect_registers_both_maps() {
        let hub = ConnectionHub::new();
        let (tx, _rx) = channel();

        let id = hub.connect("room1", "u1", tx).await;
        assert_eq!(hub.connection_count("room1").await, 1);
        assert_eq!(
            hub.peer(id).await,
            Some(("room1".to_string(), "u1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_disconnect_is_atomic_and_repeatable() {
        let hub = ConnectionHub::new();
        let (tx, _rx) = channel();
        let id = hub.connect("room1", "u1", tx).await;

        assert_eq!(
            hub.disconnect(id).await,
            Some(("room1".to_string(), "u1".to_string()))
        );
        assert_eq!(hub.connection_count("room1").await, 0);
        assert!(hub.peer(id).await.is_none());

        // Second disconnect is a no-op
        assert!(hub.disconnect(id).await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let hub = ConnectionHub::new();
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();
        let (tx_c, mut rx_c) = channel();

        let id_a = hub.connect("room1", "a", tx_a).await;
        hub.connect("room1", "b", tx_b).await;
        hub.connect("room1", "c", tx_c).await;

        let delivered = hub
            .broadcast("room1", &ServerMessage::pong(), Some(id_a))
            .await;
        assert_eq!(delivered, 2);

        assert_eq!(parse(rx_b.recv().await.unwrap())["type"], "pong");
        assert_eq!(parse(rx_c.recv().await.unwrap())["type"], "pong");
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_to_excluded_only_connection_delivers_nothing() {
        let hub = ConnectionHub::new();
        let (tx, mut rx) = channel();
        let id = hub.connect("room1", "a", tx).await;

        let delivered = hub.broadcast("room1", &ServerMessage::pong(), Some(id)).await;
        assert_eq!(delivered, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_room_isolation() {
        let hub = ConnectionHub::new();
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();
        hub.connect("room1", "a", tx_a).await;
        hub.connect("room2", "b", tx_b).await;

        let delivered = hub.broadcast("room1", &ServerMessage::pong(), None).await;
        assert_eq!(delivered, 1);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unreachable_connection_dropped_broadcast_continues() {
        let hub = ConnectionHub::new();
        let (tx_dead, rx_dead) = channel();
        let (tx_live, mut rx_live) = channel();

        hub.connect("room1", "dead", tx_dead).await;
        hub.connect("room1", "live", tx_live).await;
        drop(rx_dead); // writer task gone: sends will fail

        let delivered = hub.broadcast("room1", &ServerMessage::pong(), None).await;
        assert_eq!(delivered, 1);
        assert!(rx_live.try_recv().is_ok());

        // The dead connection was removed as an implicit disconnect
        assert_eq!(hub.connection_count("room1").await, 1);
    }

    #[tokio::test]
    async fn test_send_to() {
        let hub = ConnectionHub::new();
        let (tx, mut rx) = channel();
        let id = hub.connect("room1", "a", tx).await;

        assert!(hub.send_to(id, &ServerMessage::pong()).await);
        assert_eq!(parse(rx.recv().await.unwrap())["type"], "pong");

        assert!(!hub.send_to(9999, &ServerMessage::pong()).await);
    }

    #[tokio::test]
    async fn test_send_to_unreachable_disconnects() {
        let hub = ConnectionHub::new();
        let (tx, rx) = channel();
        let id = hub.connect("room1", "a", tx).await;
        drop(rx);

        assert!(!hub.send_to(id, &ServerMessage::pong()).await);
        assert!(hub.peer(id).await.is_none());
    }
}
