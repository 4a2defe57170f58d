//! Presence registry for Huddle.
//!
//! The registry is the single source of truth for "who is in a room right
//! now". Rooms exist only while they have at least one member entry; the
//! last removal deletes the room.

use huddle_protocol::Peer;
use huddle_transport::ConnectionId;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A room identifier.
pub type RoomId = String;

/// An application-level client identifier.
pub type ClientId = String;

/// Identifies one member entry: a client within a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberKey {
    pub room_id: RoomId,
    pub client_id: ClientId,
}

impl MemberKey {
    /// Create a new member key.
    #[must_use]
    pub fn new(room_id: impl Into<RoomId>, client_id: impl Into<ClientId>) -> Self {
        Self {
            room_id: room_id.into(),
            client_id: client_id.into(),
        }
    }
}

impl fmt::Display for MemberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.room_id, self.client_id)
    }
}

/// Presence state for a single client in a room.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    /// Connection currently attached to the client.
    pub connection_id: ConnectionId,
    /// Whether a live connection is attached.
    pub connected: bool,
    /// When the entry was created.
    pub joined_at: Instant,
    /// Last join, heartbeat or disconnect.
    pub last_seen: Instant,
}

impl Member {
    fn new(connection_id: ConnectionId, now: Instant) -> Self {
        Self {
            connection_id,
            connected: true,
            joined_at: now,
            last_seen: now,
        }
    }

    /// Check whether this member is disconnected and has been silent for
    /// longer than `threshold`.
    #[must_use]
    pub fn is_stale(&self, threshold: Duration, now: Instant) -> bool {
        !self.connected && now.saturating_duration_since(self.last_seen) > threshold
    }

    fn as_peer(&self, client_id: &str) -> Peer {
        Peer::new(client_id, self.connection_id.as_str())
    }
}

/// Result of [`Registry::join`].
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// Other connected members of the room, sorted by client id.
    pub peers: Vec<Peer>,
    /// The entry as it was before the join, if the client was already known.
    pub previous: Option<Member>,
}

impl JoinOutcome {
    /// Whether the join reattached an existing entry.
    #[must_use]
    pub fn is_rejoin(&self) -> bool {
        self.previous.is_some()
    }
}

/// Room -> client -> member map.
#[derive(Debug, Default)]
pub struct Registry {
    rooms: HashMap<RoomId, HashMap<ClientId, Member>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rooms with at least one member.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Total number of member entries across all rooms.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.rooms.values().map(HashMap::len).sum()
    }

    /// Number of member entries with a live connection.
    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.rooms
            .values()
            .flat_map(HashMap::values)
            .filter(|m| m.connected)
            .count()
    }

    /// Check if a room exists.
    #[must_use]
    pub fn contains_room(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Number of member entries in a room.
    #[must_use]
    pub fn room_size(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map(HashMap::len).unwrap_or(0)
    }

    /// All room ids.
    #[must_use]
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.keys().cloned().collect()
    }

    /// Create or reattach the member entry for `(room_id, client_id)`.
    ///
    /// The room is created if absent. An existing entry is updated in
    /// place: its connection is replaced and it is marked connected.
    pub fn join(
        &mut self,
        room_id: &str,
        client_id: &str,
        connection_id: &ConnectionId,
        now: Instant,
    ) -> JoinOutcome {
        let members = self.rooms.entry(room_id.to_string()).or_insert_with(|| {
            debug!(room = %room_id, "Creating room");
            HashMap::new()
        });

        let previous = match members.get_mut(client_id) {
            Some(member) => {
                let before = member.clone();
                member.connection_id = connection_id.clone();
                member.connected = true;
                member.last_seen = now;
                Some(before)
            }
            None => {
                members.insert(client_id.to_string(), Member::new(connection_id.clone(), now));
                None
            }
        };

        debug!(
            room = %room_id,
            client = %client_id,
            connection = %connection_id,
            rejoin = previous.is_some(),
            "Member joined"
        );

        JoinOutcome {
            peers: self.connected_peers(room_id, client_id),
            previous,
        }
    }

    /// Mark a member as disconnected without removing it.
    ///
    /// Returns `false` if the member does not exist.
    pub fn leave_mark(&mut self, room_id: &str, client_id: &str, now: Instant) -> bool {
        match self.member_mut(room_id, client_id) {
            Some(member) => {
                member.connected = false;
                member.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Remove a member, deleting the room if it becomes empty.
    ///
    /// Removing an absent member is a no-op returning `None`.
    pub fn remove(&mut self, room_id: &str, client_id: &str) -> Option<Member> {
        let members = self.rooms.get_mut(room_id)?;
        let removed = members.remove(client_id);

        if removed.is_some() {
            debug!(room = %room_id, client = %client_id, "Member removed");
        }

        if members.is_empty() {
            self.rooms.remove(room_id);
            debug!(room = %room_id, "Deleted empty room");
        }

        removed
    }

    /// Look up a member entry.
    #[must_use]
    pub fn lookup(&self, room_id: &str, client_id: &str) -> Option<&Member> {
        self.rooms.get(room_id)?.get(client_id)
    }

    /// Refresh a member's last seen timestamp.
    ///
    /// Returns `false` if the member does not exist.
    pub fn touch(&mut self, room_id: &str, client_id: &str, now: Instant) -> bool {
        match self.member_mut(room_id, client_id) {
            Some(member) => {
                member.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Connected members of a room other than `exclude_client_id`, sorted
    /// by client id.
    #[must_use]
    pub fn connected_peers(&self, room_id: &str, exclude_client_id: &str) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .rooms
            .get(room_id)
            .map(|members| {
                members
                    .iter()
                    .filter(|(client_id, member)| {
                        member.connected && client_id.as_str() != exclude_client_id
                    })
                    .map(|(client_id, member)| member.as_peer(client_id))
                    .collect()
            })
            .unwrap_or_default();

        peers.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        peers
    }

    /// Keys of disconnected members silent for longer than `threshold`.
    #[must_use]
    pub fn stale_members(&self, threshold: Duration, now: Instant) -> Vec<MemberKey> {
        self.rooms
            .iter()
            .flat_map(|(room_id, members)| {
                members
                    .iter()
                    .filter(move |(_, member)| member.is_stale(threshold, now))
                    .map(move |(client_id, _)| MemberKey::new(room_id.as_str(), client_id.as_str()))
            })
            .collect()
    }

    /// Delete rooms that have no members left.
    ///
    /// Returns the number of rooms deleted.
    pub fn prune_empty_rooms(&mut self) -> usize {
        let before = self.rooms.len();
        self.rooms.retain(|_, members| !members.is_empty());
        before - self.rooms.len()
    }

    fn member_mut(&mut self, room_id: &str, client_id: &str) -> Option<&mut Member> {
        self.rooms.get_mut(room_id)?.get_mut(client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::new(id)
    }

    #[test]
    fn test_join_creates_room_and_member() {
        let mut registry = Registry::new();
        let now = Instant::now();

        let outcome = registry.join("r", "alice", &conn("c1"), now);

        assert!(outcome.peers.is_empty());
        assert!(!outcome.is_rejoin());
        assert!(registry.contains_room("r"));

        let member = registry.lookup("r", "alice").unwrap();
        assert!(member.connected);
        assert_eq!(member.connection_id, conn("c1"));
    }

    #[test]
    fn test_join_returns_other_connected_members() {
        let mut registry = Registry::new();
        let now = Instant::now();

        registry.join("r", "bob", &conn("c2"), now);
        registry.join("r", "carol", &conn("c3"), now);
        registry.leave_mark("r", "carol", now);

        let outcome = registry.join("r", "alice", &conn("c1"), now);
        assert_eq!(outcome.peers, vec![Peer::new("bob", "c2")]);
    }

    #[test]
    fn test_rejoin_updates_same_entry() {
        let mut registry = Registry::new();
        let now = Instant::now();

        registry.join("r", "alice", &conn("c1"), now);
        registry.leave_mark("r", "alice", now);
        let outcome = registry.join("r", "alice", &conn("c2"), now);

        assert!(outcome.is_rejoin());
        assert_eq!(outcome.previous.unwrap().connection_id, conn("c1"));
        assert_eq!(registry.room_size("r"), 1);

        let member = registry.lookup("r", "alice").unwrap();
        assert!(member.connected);
        assert_eq!(member.connection_id, conn("c2"));
    }

    #[test]
    fn test_leave_mark_keeps_entry() {
        let mut registry = Registry::new();
        let now = Instant::now();
        registry.join("r", "alice", &conn("c1"), now);

        assert!(registry.leave_mark("r", "alice", now));
        assert!(registry.leave_mark("r", "alice", now));
        assert!(!registry.lookup("r", "alice").unwrap().connected);
        assert_eq!(registry.connected_count(), 0);
        assert_eq!(registry.member_count(), 1);

        assert!(!registry.leave_mark("r", "ghost", now));
    }

    #[test]
    fn test_remove_is_idempotent_and_deletes_room() {
        let mut registry = Registry::new();
        let now = Instant::now();
        registry.join("r", "alice", &conn("c1"), now);
        registry.join("r", "bob", &conn("c2"), now);

        assert!(registry.remove("r", "alice").is_some());
        assert!(registry.contains_room("r"));
        assert!(registry.remove("r", "alice").is_none());

        assert!(registry.remove("r", "bob").is_some());
        assert!(!registry.contains_room("r"));
        assert!(registry.remove("r", "bob").is_none());
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn test_stale_members_only_disconnected() {
        let mut registry = Registry::new();
        let start = Instant::now();
        registry.join("r", "alice", &conn("c1"), start);
        registry.join("r", "bob", &conn("c2"), start);
        registry.leave_mark("r", "alice", start);

        let threshold = Duration::from_secs(300);
        assert!(registry.stale_members(threshold, start).is_empty());

        let later = start + Duration::from_secs(301);
        assert_eq!(
            registry.stale_members(threshold, later),
            vec![MemberKey::new("r", "alice")]
        );
    }

    #[test]
    fn test_touch_refreshes_last_seen() {
        let mut registry = Registry::new();
        let start = Instant::now();
        registry.join("r", "alice", &conn("c1"), start);

        let later = start + Duration::from_secs(5);
        assert!(registry.touch("r", "alice", later));
        assert_eq!(registry.lookup("r", "alice").unwrap().last_seen, later);
        assert!(!registry.touch("r", "ghost", later));
    }

    #[test]
    fn test_member_key_display() {
        assert_eq!(MemberKey::new("room", "client").to_string(), "room:client");
    }
}
