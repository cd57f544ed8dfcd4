//! Room registry for the relay server.
//!
//! Tracks which connections are members of which room. A room exists only
//! while it has members: it is created by the first join and removed when
//! the last member leaves or disconnects. A connection belongs to at most
//! one room; joining another room moves it.
//!
//! Room entries are ephemeral, lost on relay restart like the connection map.

use std::collections::{BTreeSet, HashMap};

use tokio::sync::RwLock;

/// A room a connection was removed from, with the members still in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    /// The room that lost a member.
    pub room_id: String,
    /// Members remaining after the removal, sorted.
    pub remaining: Vec<String>,
}

/// Result of [`RoomRegistry::join`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Other members of the joined room, sorted, excluding the joiner.
    pub peers: Vec<String>,
    /// The room the joiner was implicitly removed from, if it was elsewhere.
    pub previous: Option<Departure>,
}

#[derive(Debug, Default)]
struct Rooms {
    members: HashMap<String, BTreeSet<String>>,
    room_of: HashMap<String, String>,
}

impl Rooms {
    /// Removes `conn_id` from `room_id`, dropping the room once empty.
    fn remove(&mut self, room_id: &str, conn_id: &str) -> Option<Vec<String>> {
        let set = self.members.get_mut(room_id)?;
        if !set.remove(conn_id) {
            return None;
        }
        let remaining: Vec<String> = set.iter().cloned().collect();
        if set.is_empty() {
            self.members.remove(room_id);
        }
        Some(remaining)
    }
}

/// In-memory room membership table.
///
/// Every operation takes one write or read lock over the whole table, so
/// each call is atomic with respect to the others.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    inner: RwLock<Rooms>,
}

impl RoomRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `conn_id` to `room_id`, creating the room if needed.
    ///
    /// Joining the room the connection is already in is a no-op that returns
    /// the current member list. Joining a different room first removes the
    /// connection from its previous room.
    pub async fn join(&self, room_id: &str, conn_id: &str) -> JoinOutcome {
        let mut rooms = self.inner.write().await;

        let previous = match rooms.room_of.get(conn_id).cloned() {
            Some(current) if current != room_id => {
                rooms.room_of.remove(conn_id);
                rooms
                    .remove(&current, conn_id)
                    .map(|remaining| Departure {
                        room_id: current,
                        remaining,
                    })
            }
            _ => None,
        };

        let set = rooms.members.entry(room_id.to_string()).or_default();
        set.insert(conn_id.to_string());
        let peers = set.iter().filter(|m| *m != conn_id).cloned().collect();
        rooms
            .room_of
            .insert(conn_id.to_string(), room_id.to_string());
        drop(rooms);

        JoinOutcome { peers, previous }
    }

    /// Removes `conn_id` from `room_id`.
    ///
    /// Returns the remaining members if a removal happened, `None` if the
    /// room does not exist or the connection was not a member.
    pub async fn leave(&self, room_id: &str, conn_id: &str) -> Option<Vec<String>> {
        let mut rooms = self.inner.write().await;
        let remaining = rooms.remove(room_id, conn_id)?;
        rooms.room_of.remove(conn_id);
        Some(remaining)
    }

    /// Removes `conn_id` from every room it belongs to.
    pub async fn drop_connection(&self, conn_id: &str) -> Vec<Departure> {
        let mut rooms = self.inner.write().await;
        let Some(room_id) = rooms.room_of.remove(conn_id) else {
            return Vec::new();
        };
        rooms
            .remove(&room_id, conn_id)
            .map(|remaining| Departure { room_id, remaining })
            .into_iter()
            .collect()
    }

    /// Returns the sorted members of a room (empty if the room is absent).
    pub async fn members(&self, room_id: &str) -> Vec<String> {
        let rooms = self.inner.read().await;
        rooms
            .members
            .get(room_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the room a connection is currently in.
    pub async fn room_of(&self, conn_id: &str) -> Option<String> {
        self.inner.read().await.room_of.get(conn_id).cloned()
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.inner.read().await.members.len()
    }
}
