//! Relay controller.
//!
//! Run with: cargo run -p relay-controller
//!
//! Listens on `REMOTE_CHANNEL_PORT` (default 9000) and every few seconds
//! asks the endpoint `REMOTE_CHANNEL_SESSION` (default `default`) to echo
//! and to report its uptime. Requests made while the endpoint is away are
//! delivered once it reconnects.

use std::{sync::Arc, time::Duration};

use remote_channel_core::{ChannelConfig, protocol::DEFAULT_SESSION_ID};
use remote_channel_session::Controller;
use serde_json::{Value, json};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let port: u16 = match std::env::var("REMOTE_CHANNEL_PORT") {
        Ok(port) => port.parse()?,
        Err(_) => 9000,
    };
    let endpoint =
        std::env::var("REMOTE_CHANNEL_SESSION").unwrap_or_else(|_| DEFAULT_SESSION_ID.to_owned());

    let controller = Arc::new(Controller::listen(port, ChannelConfig::default()).await?);
    tracing::info!(url = %controller.url(), %endpoint, "Waiting for endpoint");

    let rounds = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            for round in 1u64.. {
                ticker.tick().await;
                match controller.invoke(&endpoint, "echo", json!({"round": round})).await {
                    Ok(reply) => tracing::info!(%reply, "echo"),
                    Err(e) => tracing::warn!("echo failed: {e}"),
                }
                match controller.invoke(&endpoint, "uptime", Value::Null).await {
                    Ok(reply) => tracing::info!(%reply, "uptime"),
                    Err(e) => tracing::warn!("uptime failed: {e}"),
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    rounds.abort();
    controller.close();
    Ok(())
}
