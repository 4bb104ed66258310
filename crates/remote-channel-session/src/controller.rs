//! Controller side: accepts endpoints and routes instructions to them.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use remote_channel_core::{
    ChannelConfig, ChannelError, ConnectionError, Handshake, Role,
    protocol::{DEFAULT_SESSION_ID, ENDPOINT_PORT_CHANNEL},
};
use remote_channel_transport::{Bus, ListenError, Listener};
use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::registry::EndpointRegistry;

type Connections = Arc<Mutex<HashMap<Uuid, Bus>>>;

/// Listens for endpoints and registers each one under its session id.
pub struct Controller {
    registry: EndpointRegistry,
    local_addr: SocketAddr,
    connections: Connections,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Controller {
    /// Listen on every interface at `port` (0 picks a free one).
    ///
    /// # Errors
    /// Returns error if the port cannot be bound.
    pub async fn listen(port: u16, config: ChannelConfig) -> Result<Self, ListenError> {
        Self::bind(SocketAddr::from(([0, 0, 0, 0], port)), DEFAULT_SESSION_ID, config).await
    }

    /// Listen on `addr`, answering handshakes as controller `session_id`.
    ///
    /// # Errors
    /// Returns error if the address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        session_id: &str,
        config: ChannelConfig,
    ) -> Result<Self, ListenError> {
        let mut listener =
            Listener::bind(addr, Handshake::new(Role::Controller, session_id), config).await?;
        let local_addr = listener.local_addr();
        let registry = EndpointRegistry::new(config);
        let connections = Connections::default();

        let accept_task = tokio::spawn({
            let registry = registry.clone();
            let connections = Arc::clone(&connections);
            async move {
                while let Some(bus) = listener.accept().await {
                    tokio::spawn(track_endpoint(
                        bus,
                        registry.clone(),
                        Arc::clone(&connections),
                    ));
                }
            }
        });

        Ok(Self {
            registry,
            local_addr,
            connections,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    /// Registry holding every endpoint seen so far.
    #[must_use]
    pub const fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://host:port/` for the bound address.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}/", self.local_addr)
    }

    /// Number of live endpoint connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    /// Ask `endpoint_id` to run `instruction`. Waits for the endpoint if it
    /// is not connected yet.
    ///
    /// # Errors
    /// Same as [`EndpointRegistry::send`].
    pub async fn invoke(
        &self,
        endpoint_id: &str,
        instruction: &str,
        args: Value,
    ) -> Result<Value, ChannelError> {
        self.registry.invoke(endpoint_id, instruction, args).await
    }

    /// Send a raw payload to `endpoint_id`.
    ///
    /// # Errors
    /// Same as [`EndpointRegistry::send`].
    pub async fn send(&self, endpoint_id: &str, payload: Value) -> Result<Value, ChannelError> {
        self.registry.send(endpoint_id, payload).await
    }

    /// Wait until `endpoint_id` is connected.
    ///
    /// # Errors
    /// Returns [`ConnectionError::Unreachable`] if the endpoint is forgotten
    /// while waiting.
    pub async fn wait_for_endpoint(&self, endpoint_id: &str) -> Result<(), ConnectionError> {
        self.registry.get_transport(endpoint_id).await.map(drop)
    }

    /// Stop accepting and close every endpoint connection. Idempotent.
    ///
    /// Pending requests stay in the registry.
    pub fn close(&self) {
        let task = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return;
        };
        task.abort();

        let buses: Vec<Bus> = lock(&self.connections).drain().map(|(_, bus)| bus).collect();
        for bus in &buses {
            bus.close();
        }
        tracing::info!(local_addr = %self.local_addr, closed = buses.len(), "Controller closed");
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock(connections: &Connections) -> MutexGuard<'_, HashMap<Uuid, Bus>> {
    connections.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn track_endpoint(bus: Bus, registry: EndpointRegistry, connections: Connections) {
    let connection_id = Uuid::new_v4();
    let peer = match bus.connected().await {
        Ok(peer) => peer,
        Err(e) => {
            tracing::debug!(%connection_id, "Connection ended before handshake: {e}");
            return;
        }
    };

    lock(&connections).insert(connection_id, bus.clone());
    if let Err(e) = registry.register(peer.session_id.clone(), bus.open_port(ENDPOINT_PORT_CHANNEL)) {
        tracing::warn!(%connection_id, "Refusing endpoint: {e}");
        lock(&connections).remove(&connection_id);
        bus.close();
        return;
    }
    tracing::info!(%connection_id, endpoint = %peer.session_id, "Endpoint connected");

    let state = bus.closed().await;
    lock(&connections).remove(&connection_id);
    tracing::info!(%connection_id, endpoint = %peer.session_id, ?state, "Endpoint connection ended");
}
