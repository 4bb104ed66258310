//! Endpoint side of the instruction contract.
//!
//! A [`Dispatcher`] maps instruction names to handlers and answers the
//! invocations arriving on a port. [`EndpointAgent`] dials a controller,
//! serves the dispatcher over the connection and dials again whenever the
//! connection ends.

use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use futures::FutureExt;
use remote_channel_core::{
    ChannelConfig, ConnectionError, ErrorEnvelope, ErrorKind, Handshake, Invocation, PortFrame,
    ReconnectConfig, RemoteError, Role, protocol::ENDPOINT_PORT_CHANNEL,
};
use remote_channel_transport::{Bus, Port, Transport};
use serde_json::Value;
use tokio::sync::watch;

/// Runs one named instruction.
#[async_trait]
pub trait InstructionHandler: Send + Sync {
    /// Execute with the invocation's arguments.
    async fn handle(&self, args: Value) -> Result<Value, RemoteError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> InstructionHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
{
    async fn handle(&self, args: Value) -> Result<Value, RemoteError> {
        (self.0)(args).await
    }
}

/// Static table from instruction name to handler.
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn InstructionHandler>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `instruction`, replacing any previous one.
    pub fn register(
        &mut self,
        instruction: impl Into<String>,
        handler: impl InstructionHandler + 'static,
    ) -> &mut Self {
        self.handlers.insert(instruction.into(), Arc::new(handler));
        self
    }

    /// Register an async closure under `instruction`.
    pub fn register_fn<F, Fut>(&mut self, instruction: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        self.register(instruction, FnHandler(handler))
    }

    /// Registered instruction names, sorted.
    #[must_use]
    pub fn instructions(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run one invocation.
    ///
    /// # Errors
    /// Returns the handler's failure, or a [`RemoteError`] for an unknown
    /// instruction or a panicking handler.
    pub async fn dispatch(&self, invocation: Invocation) -> Result<Value, RemoteError> {
        let Some(handler) = self.handlers.get(&invocation.instruction) else {
            return Err(RemoteError::new(format!(
                "unknown instruction: {}",
                invocation.instruction
            )));
        };
        tracing::debug!(instruction = %invocation.instruction, "Running instruction");
        AssertUnwindSafe(handler.handle(invocation.args))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(RemoteError::new(format!(
                    "instruction {} panicked",
                    invocation.instruction
                )))
            })
    }

    /// Response frame for an inbound request frame.
    ///
    /// Returns `None` for frames that are not requests.
    pub async fn answer(&self, frame: PortFrame) -> Option<PortFrame> {
        let (id, message) = match frame {
            PortFrame::Message { id, message } => (id, message),
            PortFrame::Failure { id, .. } => {
                tracing::warn!(request_id = id, "Ignoring failure frame sent to an endpoint");
                return None;
            }
        };
        let outcome = match serde_json::from_value::<Invocation>(message) {
            Ok(invocation) => self.dispatch(invocation).await.map_err(ErrorEnvelope::from),
            Err(e) => Err(ErrorEnvelope::new(
                ErrorKind::Protocol,
                format!("malformed invocation: {e}"),
            )),
        };
        Some(PortFrame::outcome(id, outcome))
    }

    /// Answer every request arriving on `port` until it disconnects.
    ///
    /// Requests run concurrently; responses go back as they complete.
    pub async fn serve(self: Arc<Self>, port: Port) {
        let (sender, mut inbound) = port.split();
        while let Some(frame) = inbound.recv().await {
            let dispatcher = Arc::clone(&self);
            let sender = sender.clone();
            tokio::spawn(async move {
                let Some(response) = dispatcher.answer(frame).await else {
                    return;
                };
                let id = response.id();
                if let Err(e) = sender.send(response) {
                    tracing::debug!(request_id = id, "Port gone before response: {e}");
                }
            });
        }
        tracing::debug!("Port disconnected; dispatcher idle");
    }
}

/// Dials a controller and serves a [`Dispatcher`] over the connection.
pub struct EndpointAgent {
    dispatcher: Arc<Dispatcher>,
    config: ChannelConfig,
    reconnect: ReconnectConfig,
    current: Mutex<Option<Bus>>,
    shutdown: watch::Sender<bool>,
}

impl EndpointAgent {
    #[must_use]
    pub fn new(dispatcher: Dispatcher) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            dispatcher: Arc::new(dispatcher),
            config: ChannelConfig::default(),
            reconnect: ReconnectConfig::default(),
            current: Mutex::new(None),
            shutdown,
        }
    }

    #[must_use]
    pub const fn with_config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub const fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    fn current(&self) -> MutexGuard<'_, Option<Bus>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dial `address` once as endpoint `session_id` and start serving.
    ///
    /// # Errors
    /// Returns a connection error if the dial or handshake fails.
    pub async fn connect(&self, address: &str, session_id: &str) -> Result<Bus, ConnectionError> {
        let limit = self.config.handshake_timeout;
        let transport = tokio::time::timeout(limit, Transport::connect(address))
            .await
            .map_err(|_| ConnectionError::HandshakeTimeout(limit))??;
        self.attach(transport, session_id).await
    }

    /// Handshake over an open transport and start serving.
    ///
    /// The port is subscribed before the handshake goes out, so requests
    /// the controller replays right after answering are not missed.
    ///
    /// # Errors
    /// Returns a connection error if the handshake fails.
    pub async fn attach(
        &self,
        transport: Transport,
        session_id: &str,
    ) -> Result<Bus, ConnectionError> {
        let bus = Bus::dial(
            transport,
            Handshake::new(Role::Endpoint, session_id),
            self.config,
        );
        let port = Port::over_bus(&bus, ENDPOINT_PORT_CHANNEL);
        bus.handshake().await?;

        tokio::spawn(Arc::clone(&self.dispatcher).serve(port));
        if let Some(previous) = self.current().replace(bus.clone()) {
            previous.close();
        }
        tracing::info!(%session_id, "Serving instructions");
        Ok(bus)
    }

    /// Keep endpoint `session_id` connected to `address`.
    ///
    /// Dials again with exponential backoff whenever the connection ends
    /// or a dial fails. Returns after [`shutdown`](Self::shutdown).
    ///
    /// # Errors
    /// Returns the last error once `max_attempts` consecutive dials failed.
    pub async fn run(&self, address: &str, session_id: &str) -> Result<(), ConnectionError> {
        let mut shutdown = self.shutdown.subscribe();
        let mut delay = self.reconnect.initial_delay;
        let mut failures = 0u32;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.connect(address, session_id).await {
                Ok(bus) => {
                    failures = 0;
                    delay = self.reconnect.initial_delay;
                    tokio::select! {
                        state = bus.closed() => {
                            tracing::info!(?state, %address, "Connection ended; reconnecting");
                        }
                        () = stopped(&mut shutdown) => {
                            bus.close();
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(%address, attempt = failures, "Connect failed: {e}");
                    if self.reconnect.max_attempts.is_some_and(|max| failures >= max) {
                        return Err(e);
                    }
                }
            }

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = stopped(&mut shutdown) => return Ok(()),
            }
            delay = self.reconnect.next_delay(delay);
        }
    }

    /// Close the current connection, if any. [`run`](Self::run) dials again.
    pub fn disconnect(&self) -> bool {
        let Some(bus) = self.current().take() else {
            return false;
        };
        bus.close();
        true
    }

    /// Stop [`run`](Self::run) and close the current connection.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.disconnect();
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
