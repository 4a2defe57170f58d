//! # Huddle Server
//!
//! Presence and signaling hub for small realtime rooms.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! huddle
//!
//! # Run with environment variables
//! PORT=8080 HUDDLE_HOST=127.0.0.1 huddle
//! ```
//!
//! A `huddle.toml` in the working directory, `/etc/huddle/` or
//! `~/.config/huddle/` is picked up automatically.

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Log filter used when `RUST_LOG` is unset. Targets are crate paths; the
/// binary itself logs under `huddle`.
const DEFAULT_LOG_FILTER: &str = "huddle=debug,huddle_core=debug,huddle_transport=info";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting Huddle server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_filter_covers_relay() {
        assert!(tracing_subscriber::EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
        let targets: Vec<&str> = DEFAULT_LOG_FILTER
            .split(',')
            .filter_map(|directive| directive.split('=').next())
            .collect();
        assert_eq!(targets, ["huddle", "huddle_core", "huddle_transport"]);
    }
}
