//! Transport abstraction traits for Huddle.
//!
//! The hub never touches sockets directly. It emits events through a
//! [`Transport`], which owns connection identity, per-room multicast groups
//! and point-to-point delivery.

use huddle_protocol::ServerEvent;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}{:04x}", timestamp, counter & 0xffff))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No connection is registered under this id.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// The connection's outbound queue has been closed.
    #[error("Connection closed: {0}")]
    ConnectionClosed(ConnectionId),
}

/// Delivery primitives the hub relies on.
///
/// Every method is non-blocking: events are queued for the connection's
/// writer and the call returns immediately.
pub trait Transport: Send + Sync {
    /// Deliver an event to a single connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown or already closed.
    fn send(&self, to: &ConnectionId, event: ServerEvent) -> Result<(), TransportError>;

    /// Deliver an event to every connection in a room group, optionally
    /// skipping one connection.
    ///
    /// Returns the number of connections the event was queued for.
    fn broadcast(&self, room: &str, event: ServerEvent, except: Option<&ConnectionId>) -> usize;

    /// Add a connection to a room group.
    fn join_group(&self, room: &str, connection: &ConnectionId);

    /// Remove a connection from a room group.
    fn leave_group(&self, room: &str, connection: &ConnectionId);

    /// Number of live connections.
    fn connection_count(&self) -> usize;
}
