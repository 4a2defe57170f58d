//! Periodic stale-member sweep.

use crate::relay::Relay;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Spawn a task that calls [`Relay::sweep_stale`] every `interval` until
/// `token` is cancelled.
///
/// The first sweep runs one full interval after spawning.
pub fn spawn_sweeper(
    relay: Relay,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        debug!(interval_secs = interval.as_secs(), "Stale sweeper started");

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = relay.sweep_stale();
                    if removed > 0 {
                        info!(removed, "Stale sweep removed members");
                    }
                }
            }
        }

        debug!("Stale sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayConfig;
    use huddle_transport::ChannelTransport;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_on_cancel() {
        let relay = Relay::new(Arc::new(ChannelTransport::new()), RelayConfig::default());
        let token = CancellationToken::new();
        let handle = spawn_sweeper(relay, Duration::from_secs(60), token.clone());

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert!(!handle.is_finished());

        token.cancel();
        handle.await.unwrap();
    }
}
