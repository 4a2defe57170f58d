//! Relay dispatcher for Huddle.
//!
//! The [`Relay`] owns the presence registry and the grace scheduler behind
//! one mutex. Every handler, timer callback and sweep runs its whole
//! check-then-act sequence under that lock, and emits its events before
//! releasing it, so per-room delivery order matches acceptance order.

use crate::message::generate_message_id;
use crate::registry::{Member, MemberKey, Registry};
use crate::scheduler::{GraceScheduler, TimerToken};
use crate::session::{DisconnectReason, Session};
use huddle_protocol::{now_millis, ClientEvent, Peer, ServerEvent};
use huddle_transport::{ConnectionId, Transport, TransportError};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// `user-left` reason for an expired grace window.
pub const LEFT_TIMEOUT: &str = "timeout";
/// `user-left` reason for a sweeper removal.
pub const LEFT_STALE: &str = "stale";
/// `user-left` reason for a connection switching to another room.
pub const LEFT_SWITCHED: &str = "left";

/// Relay errors.
///
/// The Display text is what the caller sees in a failed acknowledgment,
/// except for transport failures which are reported generically.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A required field was missing or blank.
    #[error("{0} is required")]
    MissingField(&'static str),

    /// A field failed validation.
    #[error("invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },

    /// The message was empty after trimming.
    #[error("message cannot be empty")]
    EmptyMessage,

    /// The message exceeds the configured length.
    #[error("message exceeds {0} characters")]
    MessageTooLong(usize),

    /// The caller is not bound to a room.
    #[error("not in a room")]
    NotInRoom,

    /// Signal target unknown or not connected.
    #[error("target client {0} not found or offline")]
    TargetUnavailable(String),

    /// The hub is shutting down.
    #[error("server is shutting down")]
    ShuttingDown,

    /// Delivery failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl RelayError {
    /// Whether this is an unexpected failure rather than a caller error.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(self, RelayError::Transport(_))
    }

    /// Text to put in the failed acknowledgment.
    #[must_use]
    pub fn ack_message(&self) -> String {
        if self.is_internal() {
            "internal error".to_string()
        } else {
            self.to_string()
        }
    }
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Grace window after a network-level drop.
    pub transient_grace: Duration,
    /// Grace window after any other disconnect.
    pub default_grace: Duration,
    /// Period of the stale sweep.
    pub sweep_interval: Duration,
    /// Silence after which a disconnected member is swept.
    pub stale_after: Duration,
    /// Maximum chat message length in characters.
    pub max_message_len: usize,
    /// Maximum room/client id length in bytes.
    pub max_id_len: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            transient_grace: Duration::from_secs(30),
            default_grace: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(300),
            max_message_len: 10_000,
            max_id_len: 256,
        }
    }
}

impl RelayConfig {
    /// Grace window for a disconnect reason.
    #[must_use]
    pub fn grace_for(&self, reason: &DisconnectReason) -> Duration {
        if reason.is_transient() {
            self.transient_grace
        } else {
            self.default_grace
        }
    }
}

/// Validate a room or client id.
///
/// # Errors
///
/// Returns an error if the id is blank, too long, or contains control
/// characters.
pub fn validate_id(field: &'static str, value: &str, max_len: usize) -> Result<(), RelayError> {
    if value.trim().is_empty() {
        return Err(RelayError::MissingField(field));
    }
    if value.len() > max_len {
        return Err(RelayError::InvalidField {
            field,
            reason: "too long",
        });
    }
    if value.chars().any(char::is_control) {
        return Err(RelayError::InvalidField {
            field,
            reason: "contains control characters",
        });
    }
    Ok(())
}

/// Successful handler outcomes.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Joined a room; lists the other connected members.
    Joined { members: Vec<Peer> },
    /// Message accepted and broadcast.
    MessageSent { id: String },
    /// Signal delivered to the target.
    Signaled,
    /// Heartbeat acknowledged.
    Heartbeat { timestamp: u64 },
}

impl Reply {
    /// Convert into the acknowledgment for request `id`.
    #[must_use]
    pub fn into_ack(self, id: u64) -> ServerEvent {
        match self {
            Reply::Joined { members } => ServerEvent::ack_members(id, members),
            Reply::MessageSent { .. } | Reply::Signaled => ServerEvent::ack(id),
            Reply::Heartbeat { timestamp } => ServerEvent::ack_timestamp(id, timestamp),
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Number of rooms.
    pub room_count: usize,
    /// Number of member entries.
    pub member_count: usize,
    /// Number of connected member entries.
    pub connected_count: usize,
    /// Number of pending grace timers.
    pub pending_timers: usize,
}

struct RelayState {
    registry: Registry,
    timers: GraceScheduler<MemberKey>,
    closing: bool,
}

struct RelayInner {
    state: Mutex<RelayState>,
    transport: Arc<dyn Transport>,
    config: RelayConfig,
}

/// The presence and relay hub.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

impl Relay {
    /// Create a relay emitting through `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: RelayConfig) -> Self {
        info!("Creating relay with config: {:?}", config);
        Self {
            inner: Arc::new(RelayInner {
                state: Mutex::new(RelayState {
                    registry: Registry::new(),
                    timers: GraceScheduler::new(),
                    closing: false,
                }),
                transport,
                config,
            }),
        }
    }

    /// The relay configuration.
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Route an inbound event to its handler.
    ///
    /// Returns the acknowledgment to send back, if the event asked for one.
    pub fn dispatch(&self, session: &mut Session, event: ClientEvent) -> Option<ServerEvent> {
        let ack_id = event.ack_id();
        let name = event.name();

        let result = match event {
            ClientEvent::JoinRoom {
                room_id, client_id, ..
            } => self.join_room(session, &room_id, &client_id),
            ClientEvent::SendMessage { message, .. } => self.send_message(session, &message),
            ClientEvent::Signal {
                to_client_id, data, ..
            } => self.signal(session, &to_client_id, data),
            ClientEvent::Heartbeat { .. } => self.heartbeat(session),
        };

        match &result {
            Ok(_) => trace!(connection = %session.connection_id(), event = name, "Handled"),
            Err(e) if e.is_internal() => {
                error!(connection = %session.connection_id(), event = name, error = %e, "Handler failed");
            }
            Err(e) => {
                debug!(connection = %session.connection_id(), event = name, error = %e, "Request rejected");
            }
        }

        ack_id.map(|id| match result {
            Ok(reply) => reply.into_ack(id),
            Err(e) => ServerEvent::ack_error(id, e.ack_message()),
        })
    }

    /// Join `room_id` as `client_id`.
    ///
    /// Cancels any pending removal for the member, reattaches or creates
    /// its entry, and announces it to the rest of the room. A connection
    /// previously bound elsewhere leaves its old room first.
    ///
    /// # Errors
    ///
    /// Returns an error if either id is invalid or the relay is closing.
    pub fn join_room(
        &self,
        session: &mut Session,
        room_id: &str,
        client_id: &str,
    ) -> Result<Reply, RelayError> {
        let max = self.inner.config.max_id_len;
        validate_id("roomId", room_id, max)?;
        validate_id("clientId", client_id, max)?;

        let key = MemberKey::new(room_id, client_id);
        let conn = session.connection_id().clone();
        let transport = &self.inner.transport;

        let mut state = self.inner.state.lock();
        if state.closing {
            return Err(RelayError::ShuttingDown);
        }

        if let Some(previous) = session.binding().filter(|bound| **bound != key).cloned() {
            self.detach(&mut state, &previous, &conn);
            session.unbind();
        }

        let cancelled = state.timers.cancel(&key);
        let outcome = state
            .registry
            .join(room_id, client_id, &conn, Instant::now());

        if let Some(previous) = &outcome.previous {
            if previous.connection_id != conn {
                transport.leave_group(room_id, &previous.connection_id);
            }
        }

        transport.join_group(room_id, &conn);
        session.bind(key);

        transport.broadcast(
            room_id,
            ServerEvent::user_joined(client_id, conn.as_str()),
            Some(&conn),
        );

        info!(
            room = %room_id,
            client = %client_id,
            connection = %conn,
            reconnect = cancelled,
            peers = outcome.peers.len(),
            "Client joined room"
        );

        Ok(Reply::Joined {
            members: outcome.peers,
        })
    }

    /// Broadcast a chat message to every member of the caller's room,
    /// including the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if the caller is not in a room or the message is
    /// empty or too long.
    pub fn send_message(&self, session: &Session, message: &str) -> Result<Reply, RelayError> {
        let state = self.inner.state.lock();
        let key = bound_member(&state, session)?;

        let text = message.trim();
        if text.is_empty() {
            return Err(RelayError::EmptyMessage);
        }
        let max = self.inner.config.max_message_len;
        if text.chars().count() > max {
            return Err(RelayError::MessageTooLong(max));
        }

        let id = generate_message_id();
        let recipients = self.inner.transport.broadcast(
            &key.room_id,
            ServerEvent::ReceiveMessage {
                id: id.clone(),
                message: text.to_string(),
                client_id: key.client_id.clone(),
                room_id: key.room_id.clone(),
                timestamp: now_millis(),
            },
            None,
        );

        debug!(room = %key.room_id, client = %key.client_id, id = %id, recipients, "Message broadcast");
        Ok(Reply::MessageSent { id })
    }

    /// Relay an opaque signaling payload to another connected member of
    /// the caller's room.
    ///
    /// # Errors
    ///
    /// Returns an error if the caller is not in a room, the target is blank,
    /// unknown or offline, or delivery fails.
    pub fn signal(
        &self,
        session: &Session,
        to_client_id: &str,
        data: Value,
    ) -> Result<Reply, RelayError> {
        let state = self.inner.state.lock();
        let from = bound_member(&state, session)?;
        if to_client_id.trim().is_empty() {
            return Err(RelayError::MissingField("toClientId"));
        }

        let target = state
            .registry
            .lookup(&from.room_id, to_client_id)
            .filter(|member| member.connected)
            .map(|member| member.connection_id.clone())
            .ok_or_else(|| RelayError::TargetUnavailable(to_client_id.to_string()))?;

        self.inner
            .transport
            .send(&target, ServerEvent::signal(from.client_id.as_str(), data))?;

        trace!(room = %from.room_id, from = %from.client_id, to = %to_client_id, "Signal relayed");
        Ok(Reply::Signaled)
    }

    /// Refresh the caller's presence. Unbound callers are acknowledged too.
    ///
    /// # Errors
    ///
    /// Never fails; the `Result` keeps handler signatures uniform.
    pub fn heartbeat(&self, session: &Session) -> Result<Reply, RelayError> {
        let mut state = self.inner.state.lock();
        if let Ok(key) = bound_member(&state, session) {
            state
                .registry
                .touch(&key.room_id, &key.client_id, Instant::now());
        }
        Ok(Reply::Heartbeat {
            timestamp: now_millis(),
        })
    }

    /// Handle a connection going away.
    ///
    /// The bound member is marked disconnected and a grace timer is armed;
    /// if the client does not rejoin before it fires, the member is removed
    /// and the room is told it left. Unbound sessions are ignored, as are
    /// sessions whose member has since been taken over by another
    /// connection.
    pub fn disconnect(&self, session: &mut Session, reason: &DisconnectReason) {
        let Some(key) = session.unbind() else {
            trace!(connection = %session.connection_id(), "Unbound connection closed");
            return;
        };
        let conn = session.connection_id();

        let mut state = self.inner.state.lock();
        self.inner.transport.leave_group(&key.room_id, conn);

        let owned = state
            .registry
            .lookup(&key.room_id, &key.client_id)
            .map(|member| &member.connection_id == conn)
            .unwrap_or(false);
        if !owned {
            debug!(member = %key, connection = %conn, "Disconnect of superseded connection ignored");
            return;
        }

        state
            .registry
            .leave_mark(&key.room_id, &key.client_id, Instant::now());

        if state.closing {
            debug!(member = %key, reason = %reason, "Client disconnected during shutdown");
            return;
        }

        let delay = self.inner.config.grace_for(reason);
        let relay = self.clone();
        let timer_key = key.clone();
        state.timers.arm(key.clone(), delay, move |token| async move {
            relay.expire_grace(&timer_key, token);
        });

        info!(
            room = %key.room_id,
            client = %key.client_id,
            reason = %reason,
            grace_secs = delay.as_secs(),
            "Client disconnected, grace period started"
        );
    }

    /// Remove disconnected members that have been silent longer than the
    /// stale threshold, then drop any empty rooms.
    ///
    /// Returns the number of members removed.
    pub fn sweep_stale(&self) -> usize {
        self.sweep_stale_at(Instant::now())
    }

    /// [`sweep_stale`](Self::sweep_stale) against an explicit clock reading.
    pub fn sweep_stale_at(&self, now: Instant) -> usize {
        let mut state = self.inner.state.lock();
        let stale = state
            .registry
            .stale_members(self.inner.config.stale_after, now);

        for key in &stale {
            state.timers.cancel(key);
            state.registry.remove(&key.room_id, &key.client_id);
            self.inner.transport.broadcast(
                &key.room_id,
                ServerEvent::user_left(key.client_id.as_str(), LEFT_STALE),
                None,
            );
            warn!(room = %key.room_id, client = %key.client_id, "Swept stale member");
        }

        let pruned = state.registry.prune_empty_rooms();
        if pruned > 0 {
            debug!(rooms = pruned, "Pruned empty rooms");
        }

        stale.len()
    }

    /// Stop arming new timers and cancel every pending one.
    ///
    /// Returns the number of timers cancelled.
    pub fn begin_shutdown(&self) -> usize {
        let mut state = self.inner.state.lock();
        state.closing = true;
        state.timers.cancel_all()
    }

    /// Whether [`begin_shutdown`](Self::begin_shutdown) has been called.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.inner.state.lock().closing
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> RelayStats {
        let state = self.inner.state.lock();
        RelayStats {
            room_count: state.registry.room_count(),
            member_count: state.registry.member_count(),
            connected_count: state.registry.connected_count(),
            pending_timers: state.timers.len(),
        }
    }

    /// Snapshot of a member entry.
    #[must_use]
    pub fn member(&self, room_id: &str, client_id: &str) -> Option<Member> {
        self.inner
            .state
            .lock()
            .registry
            .lookup(room_id, client_id)
            .cloned()
    }

    /// Check if a room exists.
    #[must_use]
    pub fn room_exists(&self, room_id: &str) -> bool {
        self.inner.state.lock().registry.contains_room(room_id)
    }

    /// Check if a grace timer is pending for a member.
    #[must_use]
    pub fn has_pending_removal(&self, room_id: &str, client_id: &str) -> bool {
        self.inner
            .state
            .lock()
            .timers
            .is_armed(&MemberKey::new(room_id, client_id))
    }

    /// Live connections according to the transport.
    #[must_use]
    pub fn live_connections(&self) -> usize {
        self.inner.transport.connection_count()
    }

    fn expire_grace(&self, key: &MemberKey, token: TimerToken) {
        let mut state = self.inner.state.lock();
        if !state.timers.complete(key, token) {
            return;
        }

        let disconnected = state
            .registry
            .lookup(&key.room_id, &key.client_id)
            .map(|member| !member.connected)
            .unwrap_or(false);
        if !disconnected {
            return;
        }

        state.registry.remove(&key.room_id, &key.client_id);
        self.inner.transport.broadcast(
            &key.room_id,
            ServerEvent::user_left(key.client_id.as_str(), LEFT_TIMEOUT),
            None,
        );

        info!(
            room = %key.room_id,
            client = %key.client_id,
            room_deleted = !state.registry.contains_room(&key.room_id),
            "Grace period expired, member removed"
        );
    }

    /// Drop a connection's membership in a room it is leaving for another.
    fn detach(&self, state: &mut RelayState, key: &MemberKey, conn: &ConnectionId) {
        self.inner.transport.leave_group(&key.room_id, conn);

        let owned = state
            .registry
            .lookup(&key.room_id, &key.client_id)
            .map(|member| &member.connection_id == conn)
            .unwrap_or(false);
        if !owned {
            return;
        }

        state.timers.cancel(key);
        state.registry.remove(&key.room_id, &key.client_id);
        self.inner.transport.broadcast(
            &key.room_id,
            ServerEvent::user_left(key.client_id.as_str(), LEFT_SWITCHED),
            None,
        );
        debug!(member = %key, connection = %conn, "Connection switched rooms");
    }
}

/// The caller's member key, if its binding still matches the registry.
fn bound_member<'a>(state: &RelayState, session: &'a Session) -> Result<&'a MemberKey, RelayError> {
    let key = session.binding().ok_or(RelayError::NotInRoom)?;
    match state.registry.lookup(&key.room_id, &key.client_id) {
        Some(member) if member.connected && &member.connection_id == session.connection_id() => {
            Ok(key)
        }
        _ => Err(RelayError::NotInRoom),
    }
}
