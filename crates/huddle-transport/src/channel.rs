//! In-process transport backed by per-connection queues.
//!
//! Each registered connection owns an unbounded mpsc queue; the socket task
//! drains it and writes frames. Room groups are plain connection sets, so a
//! multicast is one queue push per member.

use crate::traits::{ConnectionId, Transport, TransportError};
use dashmap::{DashMap, DashSet};
use huddle_protocol::ServerEvent;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Receiving half handed to a connection's writer.
pub type Outbound = mpsc::UnboundedReceiver<Arc<ServerEvent>>;

/// Queue-based [`Transport`] implementation.
#[derive(Debug, Default)]
pub struct ChannelTransport {
    /// Outbound queues indexed by connection.
    connections: DashMap<ConnectionId, mpsc::UnboundedSender<Arc<ServerEvent>>>,
    /// Room groups (room -> set of connections).
    groups: DashMap<String, DashSet<ConnectionId>>,
    /// Reverse index (connection -> set of rooms).
    memberships: DashMap<ConnectionId, DashSet<String>>,
}

impl ChannelTransport {
    /// Create an empty transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and return the queue its events arrive on.
    ///
    /// Registering an id twice replaces the previous queue.
    pub fn register(&self, connection: ConnectionId) -> Outbound {
        let (tx, rx) = mpsc::unbounded_channel();
        debug!(connection = %connection, "Connection registered");
        self.connections.insert(connection, tx);
        rx
    }

    /// Drop a connection and detach it from every group.
    pub fn unregister(&self, connection: &ConnectionId) {
        self.connections.remove(connection);

        if let Some((_, rooms)) = self.memberships.remove(connection) {
            for room in rooms.iter() {
                self.detach(room.as_str(), connection);
            }
        }

        debug!(connection = %connection, "Connection unregistered");
    }

    /// Number of connections currently in a room group.
    #[must_use]
    pub fn group_size(&self, room: &str) -> usize {
        self.groups.get(room).map(|g| g.len()).unwrap_or(0)
    }

    /// Check whether a connection is in a room group.
    #[must_use]
    pub fn in_group(&self, room: &str, connection: &ConnectionId) -> bool {
        self.groups
            .get(room)
            .map(|g| g.contains(connection))
            .unwrap_or(false)
    }

    /// Number of non-empty room groups.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    fn detach(&self, room: &str, connection: &ConnectionId) {
        if let Some(group) = self.groups.get(room) {
            group.remove(connection);
        }
        self.groups.remove_if(room, |_, group| group.is_empty());
    }
}

impl Transport for ChannelTransport {
    fn send(&self, to: &ConnectionId, event: ServerEvent) -> Result<(), TransportError> {
        let sender = self
            .connections
            .get(to)
            .ok_or_else(|| TransportError::UnknownConnection(to.clone()))?;

        sender
            .send(Arc::new(event))
            .map_err(|_| TransportError::ConnectionClosed(to.clone()))
    }

    fn broadcast(&self, room: &str, event: ServerEvent, except: Option<&ConnectionId>) -> usize {
        let Some(group) = self.groups.get(room) else {
            trace!(room = %room, "Broadcast to empty group");
            return 0;
        };

        let event = Arc::new(event);
        let mut delivered = 0;

        for member in group.iter() {
            if except == Some(member.key()) {
                continue;
            }
            if let Some(sender) = self.connections.get(member.key()) {
                if sender.send(Arc::clone(&event)).is_ok() {
                    delivered += 1;
                }
            }
        }

        trace!(room = %room, event = event.name(), recipients = delivered, "Broadcast");
        delivered
    }

    fn join_group(&self, room: &str, connection: &ConnectionId) {
        self.groups
            .entry(room.to_string())
            .or_default()
            .insert(connection.clone());
        self.memberships
            .entry(connection.clone())
            .or_default()
            .insert(room.to_string());
        debug!(room = %room, connection = %connection, "Joined group");
    }

    fn leave_group(&self, room: &str, connection: &ConnectionId) {
        if let Some(rooms) = self.memberships.get(connection) {
            rooms.remove(room);
        }
        self.detach(room, connection);
        debug!(room = %room, connection = %connection, "Left group");
    }

    fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
