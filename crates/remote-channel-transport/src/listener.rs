//! Accepts WebSocket connections and turns each into a bus.

use std::net::SocketAddr;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use remote_channel_core::{ChannelConfig, Handshake, Role, protocol::DEFAULT_SESSION_ID};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tower_http::trace::TraceLayer;

use crate::{bus::Bus, transport::Transport};

/// Listener errors.
#[derive(Debug, Error)]
pub enum ListenError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone)]
struct ListenerState {
    identity: Handshake,
    config: ChannelConfig,
    accepted: mpsc::UnboundedSender<Bus>,
}

/// A bound WebSocket server handing out one [`Bus`] per connection.
///
/// Handshakes are left to each bus. Dropping the listener stops accepting.
pub struct Listener {
    local_addr: SocketAddr,
    incoming: mpsc::UnboundedReceiver<Bus>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Listener {
    /// Listen on every interface at `port` (0 picks a free one) as the
    /// default controller.
    ///
    /// # Errors
    /// Returns error if the port cannot be bound.
    pub async fn listen(port: u16) -> Result<Self, ListenError> {
        Self::bind(
            SocketAddr::from(([0, 0, 0, 0], port)),
            Handshake::new(Role::Controller, DEFAULT_SESSION_ID),
            ChannelConfig::default(),
        )
        .await
    }

    /// Listen on `addr`; accepted buses answer handshakes with `identity`.
    ///
    /// # Errors
    /// Returns error if the address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        identity: Handshake,
        config: ChannelConfig,
    ) -> Result<Self, ListenError> {
        let bind_err = move |source| ListenError::Bind { addr, source };
        let tcp = tokio::net::TcpListener::bind(addr).await.map_err(bind_err)?;
        let local_addr = tcp.local_addr().map_err(bind_err)?;

        let (accepted, incoming) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let app = Router::new()
            .route("/", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(ListenerState {
                identity,
                config,
                accepted,
            });

        tokio::spawn(async move {
            let server = axum::serve(tcp, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                tracing::error!("Listener failed: {e}");
            }
        });

        tracing::info!(%local_addr, "Listening for connections");
        Ok(Self {
            local_addr,
            incoming,
            shutdown: Some(shutdown_tx),
        })
    }

    /// The concrete bound address.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://host:port/` for the bound address.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}/", self.local_addr)
    }

    /// Next accepted connection, still handshaking.
    ///
    /// Returns `None` once the listener is closed and drained.
    pub async fn accept(&mut self) -> Option<Bus> {
        self.incoming.recv().await
    }

    /// Stop accepting. Buses already handed out are left alone. Idempotent.
    pub fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
            self.incoming.close();
            tracing::info!(local_addr = %self.local_addr, "Listener closed");
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ListenerState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let bus = Bus::accept(Transport::from_axum(socket), state.identity, state.config);
        if state.accepted.send(bus.clone()).is_err() {
            tracing::debug!("Listener gone; dropping connection");
            bus.close();
        }
    })
}
