//! Room lifecycle and per-room user presence.
//!
//! The [`SessionRegistry`] maps room ids to [`Room`]s; each room owns its
//! users (cursor/selection state) and one [`DocumentReplica`]. The registry
//! is a plain synchronous structure — the server wraps it in one
//! `tokio::sync::RwLock`, which is what makes transform-then-apply atomic
//! per room on a multi-threaded runtime.

use std::collections::HashMap;
use std::fmt;

use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};

use crate::document::DocumentReplica;

/// Users inactive for longer than this are excluded from presence display
/// and no longer block room eviction.
pub const PRESENCE_WINDOW_SECS: f64 = 300.0;

const ROOM_ID_LEN: usize = 10;

/// A participant in a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: String,
    pub username: String,
    pub color: String,
    #[serde(default)]
    pub cursor_position: i64,
    #[serde(default)]
    pub selection_start: Option<i64>,
    #[serde(default)]
    pub selection_end: Option<i64>,
    #[serde(default = "crate::now_secs")]
    pub last_active: f64,
}

impl User {
    pub fn new(
        user_id: impl Into<String>,
        username: impl Into<String>,
        color: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            color: color.into(),
            cursor_position: 0,
            selection_start: None,
            selection_end: None,
            last_active: crate::now_secs(),
        }
    }
}

/// One collaborative editing session: a document plus its participants.
#[derive(Debug, Clone)]
pub struct Room {
    room_id: String,
    created_at: f64,
    language: String,
    users: HashMap<String, User>,
    replica: DocumentReplica,
}

impl Room {
    fn new(room_id: String, language: impl Into<String>) -> Self {
        let replica = DocumentReplica::new(room_id.clone());
        Self {
            room_id,
            created_at: crate::now_secs(),
            language: language.into(),
            users: HashMap::new(),
            replica,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn created_at(&self) -> f64 {
        self.created_at
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn replica(&self) -> &DocumentReplica {
        &self.replica
    }

    pub fn replica_mut(&mut self) -> &mut DocumentReplica {
        &mut self.replica
    }

    pub fn add_user(&mut self, user: User) {
        self.users.insert(user.user_id.clone(), user);
    }

    pub fn remove_user(&mut self, user_id: &str) -> Option<User> {
        self.users.remove(user_id)
    }

    pub fn get_user(&self, user_id: &str) -> Option<&User> {
        self.users.get(user_id)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// All users, for `init` messages.
    pub fn users(&self) -> Vec<User> {
        self.users.values().cloned().collect()
    }

    /// Update a user's cursor and selection, bumping `last_active`.
    /// Returns false if the user is not in the room.
    pub fn update_user_cursor(
        &mut self,
        user_id: &str,
        position: i64,
        selection_start: Option<i64>,
        selection_end: Option<i64>,
    ) -> bool {
        match self.users.get_mut(user_id) {
            Some(user) => {
                user.cursor_position = position;
                user.selection_start = selection_start;
                user.selection_end = selection_end;
                user.last_active = crate::now_secs();
                true
            }
            None => false,
        }
    }

    /// Users active within [`PRESENCE_WINDOW_SECS`].
    pub fn active_users(&self) -> Vec<User> {
        let now = crate::now_secs();
        self.users
            .values()
            .filter(|u| now - u.last_active < PRESENCE_WINDOW_SECS)
            .cloned()
            .collect()
    }

    fn summary(&self) -> RoomSummary {
        RoomSummary {
            room_id: self.room_id.clone(),
            user_count: self.users.len(),
            active_user_count: self.active_users().len(),
            created_at: self.created_at,
            language: self.language.clone(),
        }
    }
}

/// Listing entry for the room-management boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub room_id: String,
    pub user_count: usize,
    pub active_user_count: usize,
    pub created_at: f64,
    pub language: String,
}

/// Why a room could not be deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteRoomError {
    NotFound,
    /// Active users remain; deleting now would discard a live document.
    ActiveUsers,
}

impl fmt::Display for DeleteRoomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "room not found"),
            Self::ActiveUsers => write!(f, "room has active users"),
        }
    }
}

impl std::error::Error for DeleteRoomError {}

/// Maps room ids to rooms; owns their in-memory lifetime.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    rooms: HashMap<String, Room>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a room with a fresh unique id and return the id.
    pub fn create_room(&mut self, language: &str) -> String {
        loop {
            let room_id = token(ROOM_ID_LEN);
            if !self.rooms.contains_key(&room_id) {
                self.rooms
                    .insert(room_id.clone(), Room::new(room_id.clone(), language));
                log::info!("room {room_id} created (language {language})");
                return room_id;
            }
        }
    }

    pub fn get_room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn get_room_mut(&mut self, room_id: &str) -> Option<&mut Room> {
        self.rooms.get_mut(room_id)
    }

    pub fn room_exists(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Delete a room, refusing while active users remain.
    ///
    /// On success the replica is closed first so queued operations observe
    /// the rejection rather than a missing room.
    pub fn delete_room(&mut self, room_id: &str) -> Result<(), DeleteRoomError> {
        let room = self.rooms.get(room_id).ok_or(DeleteRoomError::NotFound)?;
        if !room.active_users().is_empty() {
            return Err(DeleteRoomError::ActiveUsers);
        }
        if let Some(mut room) = self.rooms.remove(room_id) {
            room.replica_mut().close();
        }
        log::info!("room {room_id} deleted");
        Ok(())
    }

    pub fn add_user(&mut self, room_id: &str, user: User) -> bool {
        match self.rooms.get_mut(room_id) {
            Some(room) => {
                room.add_user(user);
                true
            }
            None => false,
        }
    }

    pub fn remove_user(&mut self, room_id: &str, user_id: &str) -> Option<User> {
        self.rooms.get_mut(room_id)?.remove_user(user_id)
    }

    pub fn update_cursor(
        &mut self,
        room_id: &str,
        user_id: &str,
        position: i64,
        selection_start: Option<i64>,
        selection_end: Option<i64>,
    ) -> bool {
        match self.rooms.get_mut(room_id) {
            Some(room) => room.update_user_cursor(user_id, position, selection_start, selection_end),
            None => false,
        }
    }

    pub fn active_users(&self, room_id: &str) -> Vec<User> {
        self.rooms
            .get(room_id)
            .map(|r| r.active_users())
            .unwrap_or_default()
    }

    /// Drop rooms older than `max_age_hours` with no active users.
    /// Returns the number of rooms removed.
    pub fn cleanup_inactive_rooms(&mut self, max_age_hours: u64) -> usize {
        let cutoff = crate::now_secs() - (max_age_hours * 3600) as f64;
        let stale: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, room)| room.created_at < cutoff && room.active_users().is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        for room_id in &stale {
            self.rooms.remove(room_id);
            log::info!("room {room_id} removed (inactive)");
        }
        stale.len()
    }

    pub fn room_summaries(&self) -> Vec<RoomSummary> {
        self.rooms.values().map(|r| r.summary()).collect()
    }
}

/// URL-safe alphanumeric token for room and user ids.
pub(crate) fn token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
