//! Per-room presence: which sockets are in which project, and who they are.
//!
//! Membership is tracked per socket so one user with two tabs appears as two
//! members internally, but the roster shown to clients is deduplicated by
//! user with the earliest join winning.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::auth::Identity;

/// One socket's presence in one room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub socket_id: String,
    pub user_id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub joined_at: u64,
}

impl PresenceEntry {
    pub fn new(socket_id: impl Into<String>, identity: &Identity, joined_at: u64) -> Self {
        Self {
            socket_id: socket_id.into(),
            user_id: identity.user_id.clone(),
            username: identity.username.clone(),
            avatar: identity.avatar.clone(),
            joined_at,
        }
    }
}

#[derive(Default)]
struct PresenceState {
    /// room → socket → entry
    rooms: HashMap<String, HashMap<String, PresenceEntry>>,
    /// socket → rooms
    memberships: HashMap<String, BTreeSet<String>>,
}

/// Registry of room members on this instance.
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    state: Arc<RwLock<PresenceState>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a socket to a room. Returns false if it was already a member.
    pub async fn join(&self, room: &str, entry: PresenceEntry) -> bool {
        let mut state = self.state.write().await;
        let socket_id = entry.socket_id.clone();
        let members = state.rooms.entry(room.to_string()).or_default();
        if members.contains_key(&socket_id) {
            return false;
        }
        members.insert(socket_id.clone(), entry);
        state
            .memberships
            .entry(socket_id)
            .or_default()
            .insert(room.to_string());
        true
    }

    /// Remove a socket from a room, dropping the room when it empties.
    pub async fn leave(&self, room: &str, socket_id: &str) -> Option<PresenceEntry> {
        let mut state = self.state.write().await;
        let removed = state.rooms.get_mut(room)?.remove(socket_id);
        if state.rooms.get(room).is_some_and(HashMap::is_empty) {
            state.rooms.remove(room);
        }
        if let Some(rooms) = state.memberships.get_mut(socket_id) {
            rooms.remove(room);
            if rooms.is_empty() {
                state.memberships.remove(socket_id);
            }
        }
        removed
    }

    /// Remove a socket from every room it joined.
    pub async fn remove_connection(&self, socket_id: &str) -> Vec<(String, PresenceEntry)> {
        let mut state = self.state.write().await;
        let Some(rooms) = state.memberships.remove(socket_id) else {
            return Vec::new();
        };
        let mut removed = Vec::with_capacity(rooms.len());
        for room in rooms {
            let Some(members) = state.rooms.get_mut(&room) else {
                continue;
            };
            if let Some(entry) = members.remove(socket_id) {
                removed.push((room.clone(), entry));
            }
            if members.is_empty() {
                state.rooms.remove(&room);
            }
        }
        removed
    }

    /// Distinct users in a room, earliest join per user, ordered by join
    /// time then socket ID. `exclude_socket` drops the requester's own entry.
    pub async fn roster(&self, room: &str, exclude_socket: Option<&str>) -> Vec<PresenceEntry> {
        let state = self.state.read().await;
        let Some(members) = state.rooms.get(room) else {
            return Vec::new();
        };
        let excluded_user = exclude_socket
            .and_then(|s| members.get(s))
            .map(|e| e.user_id.as_str());

        let mut by_user: HashMap<&str, &PresenceEntry> = HashMap::new();
        for entry in members.values() {
            if Some(entry.user_id.as_str()) == excluded_user {
                continue;
            }
            by_user
                .entry(entry.user_id.as_str())
                .and_modify(|current| {
                    if (entry.joined_at, &entry.socket_id) < (current.joined_at, &current.socket_id) {
                        *current = entry;
                    }
                })
                .or_insert(entry);
        }

        let mut roster: Vec<PresenceEntry> = by_user.into_values().cloned().collect();
        roster.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.socket_id.cmp(&b.socket_id))
        });
        roster
    }

    pub async fn rooms_of(&self, socket_id: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .memberships
            .get(socket_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_member(&self, room: &str, socket_id: &str) -> bool {
        self.state
            .read()
            .await
            .rooms
            .get(room)
            .is_some_and(|m| m.contains_key(socket_id))
    }

    /// Sockets (not users) in a room.
    pub async fn member_count(&self, room: &str) -> usize {
        self.state.read().await.rooms.get(room).map_or(0, HashMap::len)
    }

    pub async fn room_count(&self) -> usize {
        self.state.read().await.rooms.len()
    }
}
