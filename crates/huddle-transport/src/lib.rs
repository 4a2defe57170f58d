//! # huddle-transport
//!
//! Transport collaborator for the Huddle presence hub.
//!
//! The hub only needs three delivery primitives: point-to-point send to a
//! connection, multicast to a room group, and group membership changes.
//! They are described by the [`Transport`] trait so the hub stays
//! independent of the socket layer.
//!
//! ```rust
//! use huddle_protocol::ServerEvent;
//! use huddle_transport::{ChannelTransport, ConnectionId, Transport};
//!
//! let transport = ChannelTransport::new();
//! let conn = ConnectionId::generate();
//! let mut outbound = transport.register(conn.clone());
//!
//! transport.join_group("lobby", &conn);
//! transport.broadcast("lobby", ServerEvent::user_left("bob", "timeout"), None);
//! assert!(outbound.try_recv().is_ok());
//! ```

pub mod channel;
pub mod traits;

pub use channel::{ChannelTransport, Outbound};
pub use traits::{ConnectionId, Transport, TransportError};
