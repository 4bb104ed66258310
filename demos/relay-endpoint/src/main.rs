//! Relay endpoint.
//!
//! Run with: cargo run -p relay-endpoint
//!
//! Connects to `REMOTE_CHANNEL_ADDR` (default `127.0.0.1:9000`) as
//! `REMOTE_CHANNEL_SESSION` (default `default`) and serves a few
//! instructions, reconnecting whenever the link drops.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use remote_channel_core::{
    ChannelConfig, LivenessConfig, RemoteError, protocol::DEFAULT_SESSION_ID,
};
use remote_channel_session::{Dispatcher, EndpointAgent, InstructionHandler};
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Reports how long this endpoint has been running.
struct Uptime {
    started: Instant,
}

#[async_trait]
impl InstructionHandler for Uptime {
    async fn handle(&self, _args: Value) -> Result<Value, RemoteError> {
        Ok(json!({ "secs": self.started.elapsed().as_secs() }))
    }
}

async fn sum(args: Value) -> Result<Value, RemoteError> {
    let numbers = args
        .as_array()
        .ok_or_else(|| RemoteError::new("sum expects an array of numbers"))?;
    let mut total = 0.0;
    for number in numbers {
        total += number
            .as_f64()
            .ok_or_else(|| RemoteError::new("sum expects numbers").with_detail(number.clone()))?;
    }
    Ok(json!(total))
}

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

    let address =
        std::env::var("REMOTE_CHANNEL_ADDR").unwrap_or_else(|_| "127.0.0.1:9000".to_owned());
    let session_id =
        std::env::var("REMOTE_CHANNEL_SESSION").unwrap_or_else(|_| DEFAULT_SESSION_ID.to_owned());

    let mut dispatcher = Dispatcher::new();
    dispatcher
        .register_fn("echo", |args| async move { Ok(args) })
        .register_fn("sum", sum)
        .register(
            "uptime",
            Uptime {
                started: Instant::now(),
            },
        );
    tracing::info!(instructions = ?dispatcher.instructions(), "Instruction table ready");

    let liveness = LivenessConfig::new(Duration::from_secs(60), Duration::from_secs(58))?;
    let agent = Arc::new(
        EndpointAgent::new(dispatcher).with_config(ChannelConfig::default().with_liveness(liveness)),
    );

    let running = tokio::spawn({
        let agent = Arc::clone(&agent);
        async move { agent.run(&address, &session_id).await }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    agent.shutdown();
    running.await??;
    Ok(())
}
