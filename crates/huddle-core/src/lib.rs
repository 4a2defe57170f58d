//! # huddle-core
//!
//! Presence tracking and relay logic for the Huddle hub.
//!
//! This crate provides:
//!
//! - **Registry** - Which clients are in which room, and whether they are online
//! - **Scheduler** - Keyed, cancellable reconnection grace timers
//! - **Relay** - Event handlers for join, chat, signaling and heartbeat
//! - **Sweeper** - Periodic removal of long-silent disconnected members
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│    Relay    │────▶│  Transport  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                       │         │
//!                       ▼         ▼
//!              ┌────────────┐ ┌────────────┐
//!              │  Registry  │ │ Scheduler  │
//!              └────────────┘ └────────────┘
//! ```
//!
//! A dropped client keeps its place in the room for a grace period. If it
//! rejoins in time, the room sees a single `user-joined` and never a
//! `user-left`.

pub mod lifecycle;
pub mod message;
pub mod registry;
pub mod relay;
pub mod scheduler;
pub mod session;
pub mod sweeper;

pub use lifecycle::Lifecycle;
pub use message::generate_message_id;
pub use registry::{ClientId, JoinOutcome, Member, MemberKey, Registry, RoomId};
pub use relay::{validate_id, Relay, RelayConfig, RelayError, RelayStats, Reply};
pub use scheduler::{GraceScheduler, TimerToken};
pub use session::{DisconnectReason, Session};
pub use sweeper::spawn_sweeper;
