//! Cross-instance relay over a shared Redis pub/sub broker.
//!
//! One channel per room (`room:{room_id}`). Published envelopes carry the
//! publishing instance's id so the listen task can drop its own echoes —
//! Redis delivers a publish back to the publisher's pattern subscription.
//!
//! ```text
//! instance A: apply → hub.broadcast → bridge.publish ─┐
//!                                                     ▼
//!                                              room:{id} channel
//!                                                     │
//! instance B: listen task ── RelayEvent ── dispatcher → apply → broadcast
//! ```
//!
//! The bridge is best-effort: if the broker is unreachable the system keeps
//! running in single-process mode (every method here degrades to a logged
//! no-op), and cross-instance ordering is whatever the broker delivers.
//! Document snapshots are kept under `document:{room_id}` with a 24h TTL to
//! seed rooms a process has not served yet.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// Snapshot expiry, independent of the operation log.
pub const SNAPSHOT_TTL_SECS: u64 = 86_400;

const CHANNEL_PREFIX: &str = "room:";
const SNAPSHOT_PREFIX: &str = "document:";

/// Broker channel for a room, named deterministically from its id.
pub fn room_channel(room_id: &str) -> String {
    format!("{CHANNEL_PREFIX}{room_id}")
}

fn snapshot_key(room_id: &str) -> String {
    format!("{SNAPSHOT_PREFIX}{room_id}")
}

fn room_from_channel(channel: &str) -> Option<&str> {
    channel.strip_prefix(CHANNEL_PREFIX)
}

/// Wire envelope for relayed events: the message itself plus the origin
/// instance id used for echo suppression.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    origin: Uuid,
    #[serde(flatten)]
    message: ServerMessage,
}

/// A remote event decoded by the listen task, handed to the server's relay
/// dispatcher.
#[derive(Debug, Clone)]
pub struct RelayEvent {
    pub room_id: String,
    pub message: ServerMessage,
}

/// Broker errors surfaced to the caller. Only `connect` returns these;
/// everything after degrades in place.
#[derive(Debug)]
pub enum BridgeError {
    Broker(String),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broker(e) => write!(f, "broker error: {e}"),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<redis::RedisError> for BridgeError {
    fn from(e: redis::RedisError) -> Self {
        Self::Broker(e.to_string())
    }
}

/// Relays operation/presence events between instances and persists document
/// snapshots.
pub struct ClusterBridge {
    instance_id: Uuid,
    conn: RwLock<Option<MultiplexedConnection>>,
    subscriptions: Arc<RwLock<HashSet<String>>>,
    event_tx: mpsc::UnboundedSender<RelayEvent>,
}

impl ClusterBridge {
    /// Create a disconnected bridge and the receiver for relayed events.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RelayEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                instance_id: Uuid::new_v4(),
                conn: RwLock::new(None),
                subscriptions: Arc::new(RwLock::new(HashSet::new())),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.read().await.is_some()
    }

    /// Connect to the broker and start the listen task.
    ///
    /// A single pattern subscription on `room:*` covers every room; per-room
    /// interest is tracked locally (see [`Self::subscribe`]). On failure the
    /// bridge stays degraded and may be retried later.
    pub async fn connect(&self, url: &str) -> Result<(), BridgeError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.psubscribe(format!("{CHANNEL_PREFIX}*")).await?;
        *self.conn.write().await = Some(conn);

        let subscriptions = self.subscriptions.clone();
        let event_tx = self.event_tx.clone();
        let instance_id = self.instance_id;
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let Some(room_id) = room_from_channel(&channel) else {
                    continue;
                };
                if !subscriptions.read().await.contains(room_id) {
                    continue;
                }
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::warn!("unreadable relay payload on {channel}: {e}");
                        continue;
                    }
                };
                if let Some(message) = decode_envelope(&payload, instance_id) {
                    let event = RelayEvent {
                        room_id: room_id.to_string(),
                        message,
                    };
                    if event_tx.send(event).is_err() {
                        break; // dispatcher gone, nothing left to feed
                    }
                }
            }
            log::warn!("broker subscription stream ended; cross-instance relay inactive");
        });

        log::info!("connected to broker at {url} (instance {instance_id})");
        Ok(())
    }

    /// Register interest in a room's channel.
    pub async fn subscribe(&self, room_id: &str) {
        self.subscriptions.write().await.insert(room_id.to_string());
        log::debug!("subscribed to {}", room_channel(room_id));
    }

    /// Drop interest in a room's channel.
    pub async fn unsubscribe(&self, room_id: &str) {
        self.subscriptions.write().await.remove(room_id);
        log::debug!("unsubscribed from {}", room_channel(room_id));
    }

    pub async fn is_subscribed(&self, room_id: &str) -> bool {
        self.subscriptions.read().await.contains(room_id)
    }

    /// Publish an event to the room's channel. Fire-and-forget: failures are
    /// logged, never propagated.
    pub async fn publish(&self, room_id: &str, message: &ServerMessage) {
        let Some(mut conn) = self.command_connection().await else {
            return;
        };
        let envelope = Envelope {
            origin: self.instance_id,
            message: message.clone(),
        };
        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("failed to encode relay envelope for room {room_id}: {e}");
                return;
            }
        };
        if let Err(e) = conn.publish::<_, _, ()>(room_channel(room_id), payload).await {
            log::error!("publish to room {room_id} failed: {e}");
        }
    }

    /// Write-through snapshot of the room's current text.
    pub async fn persist_snapshot(&self, room_id: &str, content: &str) {
        let Some(mut conn) = self.command_connection().await else {
            return;
        };
        if let Err(e) = conn
            .set_ex::<_, _, ()>(snapshot_key(room_id), content, SNAPSHOT_TTL_SECS)
            .await
        {
            log::error!("failed to persist snapshot for room {room_id}: {e}");
        }
    }

    /// Load the persisted snapshot for a room, if any.
    pub async fn load_snapshot(&self, room_id: &str) -> Option<String> {
        let mut conn = self.command_connection().await?;
        match conn.get::<_, Option<String>>(snapshot_key(room_id)).await {
            Ok(content) => content,
            Err(e) => {
                log::error!("failed to load snapshot for room {room_id}: {e}");
                None
            }
        }
    }

    async fn command_connection(&self) -> Option<MultiplexedConnection> {
        self.conn.read().await.clone()
    }
}

/// Decode a relayed envelope, dropping our own echoes and anything that
/// fails to parse.
fn decode_envelope(payload: &str, local: Uuid) -> Option<ServerMessage> {
    match serde_json::from_str::<Envelope>(payload) {
        Ok(envelope) if envelope.origin == local => None,
        Ok(envelope) => Some(envelope.message),
        Err(e) => {
            log::warn!("dropping undecodable relay message: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Operation;

    #[test]
    fn test_channel_and_key_naming() {
        assert_eq!(room_channel("abc123"), "room:abc123");
        assert_eq!(snapshot_key("abc123"), "document:abc123");
        assert_eq!(room_from_channel("room:abc123"), Some("abc123"));
        assert_eq!(room_from_channel("other:abc123"), None);
    }

    #[test]
    fn test_envelope_roundtrip_keeps_message_shape() {
        let origin = Uuid::new_v4();
        let envelope = Envelope {
            origin,
            message: ServerMessage::operation(Operation::insert("u1", 0, "hi"), "u1"),
        };
        let payload = serde_json::to_string(&envelope).unwrap();

        // Flattened: the envelope looks like the message plus `origin`
        let json: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(json["type"], "operation");
        assert_eq!(json["origin"], origin.to_string());

        let message = decode_envelope(&payload, Uuid::new_v4()).unwrap();
        assert_eq!(message, envelope.message);
    }

    #[test]
    fn test_own_echo_is_dropped() {
        let local = Uuid::new_v4();
        let envelope = Envelope {
            origin: local,
            message: ServerMessage::pong(),
        };
        let payload = serde_json::to_string(&envelope).unwrap();
        assert!(decode_envelope(&payload, local).is_none());
    }

    #[test]
    fn test_garbage_payload_is_dropped() {
        assert!(decode_envelope("not json", Uuid::new_v4()).is_none());
        assert!(decode_envelope(r#"{"type":"nope"}"#, Uuid::new_v4()).is_none());
    }

    #[tokio::test]
    async fn test_degraded_mode_is_a_no_op() {
        let (bridge, mut rx) = ClusterBridge::new();
        assert!(!bridge.is_connected().await);

        // None of these should error or block without a broker
        bridge.publish("room1", &ServerMessage::pong()).await;
        bridge.persist_snapshot("room1", "content").await;
        assert!(bridge.load_snapshot("room1").await.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscription_interest_tracking() {
        let (bridge, _rx) = ClusterBridge::new();
        assert!(!bridge.is_subscribed("room1").await);

        bridge.subscribe("room1").await;
        assert!(bridge.is_subscribed("room1").await);

        bridge.unsubscribe("room1").await;
        assert!(!bridge.is_subscribed("room1").await);
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_bridge_degraded() {
        let (bridge, _rx) = ClusterBridge::new();
        let result = bridge.connect("redis://127.0.0.1:1/0").await;
        assert!(result.is_err());
        assert!(!bridge.is_connected().await);
    }
}
