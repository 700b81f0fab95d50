//! JSON wire protocol for the real-time channel and the broker relay.
//!
//! Every message is a JSON object tagged by `type`, fields camelCase:
//!
//! ```text
//! client → server   {"type":"operation","operation":{...}}
//!                   {"type":"cursor","position":5,"selectionStart":1,...}
//!                   {"type":"ping"}
//!
//! server → client   {"type":"init","userId":..,"document":{...},"users":[...]}
//!                   {"type":"operation","operation":{...},"userId":..,"timestamp":..}
//!                   {"type":"cursor",...}  {"type":"user_joined",...}
//!                   {"type":"user_left",...}  {"type":"pong"}
//! ```
//!
//! The same [`ServerMessage`] shapes travel through the broker, wrapped in a
//! relay envelope (see [`crate::bridge`]). Outbound timestamps are
//! server-assigned at construction time.

use serde::{Deserialize, Serialize};

use crate::document::{DocumentState, Operation};
use crate::session::User;

/// Messages received from a client over its WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Operation {
        operation: Operation,
    },
    Cursor {
        position: i64,
        #[serde(default)]
        selection_start: Option<i64>,
        #[serde(default)]
        selection_end: Option<i64>,
    },
    Ping,
}

/// Messages sent to clients (and relayed between instances).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Sent once, immediately after a connection is accepted.
    Init {
        user_id: String,
        color: String,
        document: DocumentState,
        users: Vec<User>,
    },
    Operation {
        operation: Operation,
        user_id: String,
        timestamp: f64,
    },
    Cursor {
        user_id: String,
        position: i64,
        selection_start: Option<i64>,
        selection_end: Option<i64>,
        timestamp: f64,
    },
    UserJoined {
        user: User,
        timestamp: f64,
    },
    UserLeft {
        user_id: String,
        username: String,
        timestamp: f64,
    },
    Pong,
}

impl ServerMessage {
    pub fn init(
        user_id: impl Into<String>,
        color: impl Into<String>,
        document: DocumentState,
        users: Vec<User>,
    ) -> Self {
        Self::Init {
            user_id: user_id.into(),
            color: color.into(),
            document,
            users,
        }
    }

    pub fn operation(operation: Operation, user_id: impl Into<String>) -> Self {
        Self::Operation {
            operation,
            user_id: user_id.into(),
            timestamp: crate::now_secs(),
        }
    }

    pub fn cursor(
        user_id: impl Into<String>,
        position: i64,
        selection_start: Option<i64>,
        selection_end: Option<i64>,
    ) -> Self {
        Self::Cursor {
            user_id: user_id.into(),
            position,
            selection_start,
            selection_end,
            timestamp: crate::now_secs(),
        }
    }

    pub fn user_joined(user: User) -> Self {
        Self::UserJoined {
            user,
            timestamp: crate::now_secs(),
        }
    }

    pub fn user_left(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self::UserLeft {
            user_id: user_id.into(),
            username: username.into(),
            timestamp: crate::now_secs(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong
    }
}
