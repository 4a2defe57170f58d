//! Startup and shutdown of the relay's background work.

use crate::relay::Relay;
use crate::sweeper::spawn_sweeper;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Owns the background tasks of a running [`Relay`].
pub struct Lifecycle {
    relay: Relay,
    token: CancellationToken,
    sweeper: JoinHandle<()>,
}

impl Lifecycle {
    /// Start the stale sweeper for `relay`.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn start(relay: Relay) -> Self {
        let token = CancellationToken::new();
        let interval = relay.config().sweep_interval;
        let sweeper = spawn_sweeper(relay.clone(), interval, token.child_token());

        info!(sweep_interval_secs = interval.as_secs(), "Relay started");

        Self {
            relay,
            token,
            sweeper,
        }
    }

    /// The managed relay.
    #[must_use]
    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Token cancelled when shutdown begins. Connection tasks watch a child
    /// of it to close their sockets.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Stop the sweeper, cancel pending grace timers and refuse new joins.
    ///
    /// Member entries are left in place; nothing is announced for them.
    pub async fn shutdown(self) {
        let cancelled = self.relay.begin_shutdown();
        self.token.cancel();

        if let Err(e) = self.sweeper.await {
            warn!(error = %e, "Stale sweeper ended abnormally");
        }

        info!(cancelled_timers = cancelled, "Relay shut down");
    }
}
