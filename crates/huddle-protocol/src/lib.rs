//! # huddle-protocol
//!
//! Wire protocol definitions for the Huddle presence and relay hub.
//!
//! ## Events
//!
//! - `join-room` / `user-joined` / `user-left` - Room presence
//! - `send-message` / `receive-message` - Room chat
//! - `signal` - Opaque point-to-point signaling relay
//! - `heartbeat` / `ack` - Keepalive and acknowledgments
//!
//! ## Example
//!
//! ```rust
//! use huddle_protocol::{codec, ClientEvent};
//!
//! let event = ClientEvent::join_room(Some(1), "lobby", "alice");
//!
//! let encoded = codec::encode(&event).unwrap();
//! let decoded: ClientEvent = codec::decode(&encoded).unwrap();
//! assert_eq!(event, decoded);
//! ```

pub mod codec;
pub mod events;

pub use codec::{decode, encode, ProtocolError, RejectedEvent, WireFormat};
pub use events::{now_millis, ClientEvent, Peer, RequestId, ServerEvent};
