//! Event types for the Huddle protocol.
//!
//! Every frame on the wire is a single event, tagged by its `type` field.
//! Clients send [`ClientEvent`]s; the hub answers with [`ServerEvent`]s.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, as carried in event timestamps.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A room member as advertised to other members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    /// Application-level client id.
    pub client_id: String,
    /// Transport connection currently attached to the client.
    pub connection_id: String,
}

impl Peer {
    /// Create a new peer descriptor.
    #[must_use]
    pub fn new(client_id: impl Into<String>, connection_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            connection_id: connection_id.into(),
        }
    }
}

/// Events sent from a client to the hub.
///
/// The optional `id` is the caller's acknowledgment channel. When it is
/// present the hub answers with exactly one [`ServerEvent::Ack`] carrying
/// the same id.
///
/// Missing payload fields decode as empty values, so the hub rejects them
/// through that acknowledgment instead of dropping the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Join (or rejoin) a room under a logical client id.
    #[serde(rename = "join-room", rename_all = "camelCase")]
    JoinRoom {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        #[serde(default)]
        room_id: String,
        #[serde(default)]
        client_id: String,
    },

    /// Broadcast a chat message to the caller's room.
    #[serde(rename = "send-message", rename_all = "camelCase")]
    SendMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        #[serde(default)]
        message: String,
    },

    /// Relay an opaque signaling payload to another member of the room.
    #[serde(rename = "signal", rename_all = "camelCase")]
    Signal {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        #[serde(default)]
        to_client_id: String,
        #[serde(default)]
        data: Value,
    },

    /// Keepalive; refreshes the caller's presence.
    #[serde(rename = "heartbeat")]
    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },
}

impl ClientEvent {
    /// The acknowledgment id supplied by the caller, if any.
    #[must_use]
    pub fn ack_id(&self) -> Option<u64> {
        match self {
            ClientEvent::JoinRoom { id, .. }
            | ClientEvent::SendMessage { id, .. }
            | ClientEvent::Signal { id, .. }
            | ClientEvent::Heartbeat { id } => *id,
        }
    }

    /// The wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom { .. } => "join-room",
            ClientEvent::SendMessage { .. } => "send-message",
            ClientEvent::Signal { .. } => "signal",
            ClientEvent::Heartbeat { .. } => "heartbeat",
        }
    }

    /// Create a join-room event.
    #[must_use]
    pub fn join_room(id: Option<u64>, room_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        ClientEvent::JoinRoom {
            id,
            room_id: room_id.into(),
            client_id: client_id.into(),
        }
    }

    /// Create a send-message event.
    #[must_use]
    pub fn send_message(id: Option<u64>, message: impl Into<String>) -> Self {
        ClientEvent::SendMessage {
            id,
            message: message.into(),
        }
    }

    /// Create a signal event.
    #[must_use]
    pub fn signal(id: Option<u64>, to_client_id: impl Into<String>, data: Value) -> Self {
        ClientEvent::Signal {
            id,
            to_client_id: to_client_id.into(),
            data,
        }
    }

    /// Create a heartbeat event.
    #[must_use]
    pub fn heartbeat(id: Option<u64>) -> Self {
        ClientEvent::Heartbeat { id }
    }
}

/// Events sent from the hub to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Sent once when a connection is established.
    #[serde(rename = "connected", rename_all = "camelCase")]
    Connected { connection_id: String, timestamp: u64 },

    /// Another client joined (or rejoined) the room.
    #[serde(rename = "user-joined", rename_all = "camelCase")]
    UserJoined {
        client_id: String,
        connection_id: String,
        timestamp: u64,
    },

    /// A chat message accepted for the room.
    #[serde(rename = "receive-message", rename_all = "camelCase")]
    ReceiveMessage {
        id: String,
        message: String,
        client_id: String,
        room_id: String,
        timestamp: u64,
    },

    /// A signaling payload relayed from another member.
    #[serde(rename = "signal", rename_all = "camelCase")]
    Signal { from_client_id: String, data: Value },

    /// A client left the room for good.
    #[serde(rename = "user-left", rename_all = "camelCase")]
    UserLeft {
        client_id: String,
        reason: String,
        timestamp: u64,
    },

    /// Acknowledgment of a client event that carried an id.
    #[serde(rename = "ack")]
    Ack {
        id: u64,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        members: Option<Vec<Peer>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ServerEvent {
    /// The wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::UserJoined { .. } => "user-joined",
            ServerEvent::ReceiveMessage { .. } => "receive-message",
            ServerEvent::Signal { .. } => "signal",
            ServerEvent::UserLeft { .. } => "user-left",
            ServerEvent::Ack { .. } => "ack",
        }
    }

    /// Create a connected event stamped with the current time.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>) -> Self {
        ServerEvent::Connected {
            connection_id: connection_id.into(),
            timestamp: now_millis(),
        }
    }

    /// Create a user-joined event stamped with the current time.
    #[must_use]
    pub fn user_joined(client_id: impl Into<String>, connection_id: impl Into<String>) -> Self {
        ServerEvent::UserJoined {
            client_id: client_id.into(),
            connection_id: connection_id.into(),
            timestamp: now_millis(),
        }
    }

    /// Create a user-left event stamped with the current time.
    #[must_use]
    pub fn user_left(client_id: impl Into<String>, reason: impl Into<String>) -> Self {
        ServerEvent::UserLeft {
            client_id: client_id.into(),
            reason: reason.into(),
            timestamp: now_millis(),
        }
    }

    /// Create a signal relay event.
    #[must_use]
    pub fn signal(from_client_id: impl Into<String>, data: Value) -> Self {
        ServerEvent::Signal {
            from_client_id: from_client_id.into(),
            data,
        }
    }

    /// Create a bare successful acknowledgment.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        ServerEvent::Ack {
            id,
            success: true,
            error: None,
            members: None,
            timestamp: None,
        }
    }

    /// Create a successful acknowledgment listing room members.
    #[must_use]
    pub fn ack_members(id: u64, members: Vec<Peer>) -> Self {
        ServerEvent::Ack {
            id,
            success: true,
            error: None,
            members: Some(members),
            timestamp: None,
        }
    }

    /// Create a successful acknowledgment carrying a timestamp.
    #[must_use]
    pub fn ack_timestamp(id: u64, timestamp: u64) -> Self {
        ServerEvent::Ack {
            id,
            success: true,
            error: None,
            members: None,
            timestamp: Some(timestamp),
        }
    }

    /// Create a failed acknowledgment.
    #[must_use]
    pub fn ack_error(id: u64, error: impl Into<String>) -> Self {
        ServerEvent::Ack {
            id,
            success: false,
            error: Some(error.into()),
            members: None,
            timestamp: None,
        }
    }
}

/// Just the `id` of an inbound frame, for answering frames that are not a
/// valid [`ClientEvent`].
#[derive(Debug, Default, Deserialize)]
pub struct RequestId {
    #[serde(default)]
    pub id: Option<u64>,
}
