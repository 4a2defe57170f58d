//! Per-connection session context.
//!
//! A [`Session`] remembers which member entry a connection is bound to so a
//! disconnect can be resolved to its room. It is a hint only; the registry
//! stays authoritative and every handler re-checks the binding against it.

use crate::registry::MemberKey;
use huddle_transport::ConnectionId;
use std::fmt;

/// Why a connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The underlying transport closed without a close handshake.
    TransportClose,
    /// The client stopped answering keepalives.
    PingTimeout,
    /// The transport reported an error.
    TransportError,
    /// The client closed the connection deliberately.
    ClientClose,
    /// The server closed the connection.
    ServerClose,
    /// Any other label.
    Other(String),
}

impl DisconnectReason {
    /// Parse a disconnect label.
    #[must_use]
    pub fn parse(label: &str) -> Self {
        match label {
            "transport close" => DisconnectReason::TransportClose,
            "ping timeout" => DisconnectReason::PingTimeout,
            "transport error" => DisconnectReason::TransportError,
            "client namespace disconnect" | "client close" => DisconnectReason::ClientClose,
            "server namespace disconnect" | "server close" | "server shutting down" => {
                DisconnectReason::ServerClose
            }
            other => DisconnectReason::Other(other.to_string()),
        }
    }

    /// The label for this reason.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            DisconnectReason::TransportClose => "transport close",
            DisconnectReason::PingTimeout => "ping timeout",
            DisconnectReason::TransportError => "transport error",
            DisconnectReason::ClientClose => "client namespace disconnect",
            DisconnectReason::ServerClose => "server namespace disconnect",
            DisconnectReason::Other(label) => label,
        }
    }

    /// Whether this is a network-level drop that is likely to heal on its own.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DisconnectReason::TransportClose | DisconnectReason::PingTimeout
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for DisconnectReason {
    fn from(label: &str) -> Self {
        Self::parse(label)
    }
}

/// Session context for one live connection.
#[derive(Debug, Clone)]
pub struct Session {
    connection_id: ConnectionId,
    binding: Option<MemberKey>,
}

impl Session {
    /// Create an unbound session.
    #[must_use]
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            binding: None,
        }
    }

    /// The connection this session belongs to.
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// The member entry this connection is bound to, if any.
    #[must_use]
    pub fn binding(&self) -> Option<&MemberKey> {
        self.binding.as_ref()
    }

    /// Check whether the session is bound.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    pub(crate) fn bind(&mut self, key: MemberKey) {
        self.binding = Some(key);
    }

    pub(crate) fn unbind(&mut self) -> Option<MemberKey> {
        self.binding.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_labels_roundtrip() {
        for reason in [
            DisconnectReason::TransportClose,
            DisconnectReason::PingTimeout,
            DisconnectReason::TransportError,
            DisconnectReason::ClientClose,
            DisconnectReason::ServerClose,
            DisconnectReason::Other("kicked".into()),
        ] {
            assert_eq!(DisconnectReason::parse(reason.as_str()), reason);
        }
    }

    #[test]
    fn test_only_network_drops_are_transient() {
        assert!(DisconnectReason::TransportClose.is_transient());
        assert!(DisconnectReason::PingTimeout.is_transient());
        assert!(!DisconnectReason::TransportError.is_transient());
        assert!(!DisconnectReason::ClientClose.is_transient());
        assert!(!DisconnectReason::ServerClose.is_transient());
        assert!(!DisconnectReason::from("io error").is_transient());
    }

    #[test]
    fn test_session_binding() {
        let mut session = Session::new(ConnectionId::new("c1"));
        assert!(!session.is_bound());

        session.bind(MemberKey::new("r", "alice"));
        assert_eq!(session.binding(), Some(&MemberKey::new("r", "alice")));

        assert_eq!(session.unbind(), Some(MemberKey::new("r", "alice")));
        assert!(session.unbind().is_none());
    }
}
