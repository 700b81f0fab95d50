//! # coedit — real-time collaborative text editing server
//!
//! Multiple clients edit a shared document over WebSocket, seeing each
//! other's edits and cursors in near real time. Multiple server instances
//! serving the same room converge through a shared Redis pub/sub broker.
//!
//! ## Architecture
//!
//! ```text
//! Client A ──┐
//!             ├── Room (room_id) ── DocumentReplica (OT) ── ConnectionHub
//! Client B ──┘            │                                     │ fan-out
//!                         │                              ┌──────┴──────┐
//!                  SessionRegistry                       ▼             ▼
//!                   (users, cursors)                 Client A      Client B
//!                         │
//!                   ClusterBridge ◄──── room:{id} channel ────► other instances
//!                         │
//!                   document:{id} snapshot (24h TTL)
//! ```
//!
//! Inbound edit → `DocumentReplica::apply_operation` → local broadcast →
//! bridge publish → remote apply → remote broadcast. Presence (cursors,
//! join/leave) bypasses the replica and flows through hub and bridge only.
//!
//! ## Modules
//!
//! - [`document`] — position-shift operational transform engine
//! - [`session`] — room lifecycle and user presence
//! - [`hub`] — per-process WebSocket fan-out
//! - [`bridge`] — cross-instance relay and snapshot cache
//! - [`protocol`] — JSON wire messages
//! - [`server`] — WebSocket accept loop and per-connection tasks
//!
//! Reference: Kleppmann, Chapter 5 — Replication

pub mod bridge;
pub mod config;
pub mod document;
pub mod hub;
pub mod protocol;
pub mod server;
pub mod session;

pub use bridge::{BridgeError, ClusterBridge, RelayEvent};
pub use config::ServerConfig;
pub use document::{
    ApplyOutcome, DocumentReplica, DocumentState, Operation, OperationKind, RejectReason,
};
pub use hub::{ConnectionHub, ConnectionId};
pub use protocol::{ClientMessage, ServerMessage};
pub use server::{CollabServer, ROOM_NOT_FOUND_CLOSE_CODE};
pub use session::{DeleteRoomError, Room, RoomSummary, SessionRegistry, User};

/// Wall-clock time as fractional seconds since the UNIX epoch.
///
/// All timestamps on the wire (operations, presence, broadcasts) use this
/// representation.
pub(crate) fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
