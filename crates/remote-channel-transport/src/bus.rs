//! Multiplexed request/response and publish/subscribe over one transport.
//!
//! Every bus starts `Connecting`. The dialing side sends a handshake request
//! on the `initialConnection` channel; the accepting side answers it with its
//! own identity. Until that exchange completes nothing is dispatched to
//! subscribers and `send`/`ping` are refused. The first of `close`, a
//! transport fault, a missed liveness probe or the peer hanging up moves the
//! bus to a terminal state, emits exactly one lifecycle event and rejects
//! every request the bus itself still owns.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::{FutureExt, StreamExt, future::BoxFuture};
use remote_channel_core::{
    ChannelConfig, ChannelError, ConnectionError, ErrorEnvelope, ErrorKind, Handshake,
    RemoteError, RequestId, RequestTracker, WireFrame,
    protocol::{INITIAL_CONNECTION_CHANNEL, PING_CHANNEL, PONG_CHANNEL, is_reserved_channel},
};
use serde_json::Value;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};

use crate::{
    port::Port,
    transport::{FrameSender, FrameStream, Transport},
};

/// Future returned by a subscriber.
pub type HandlerFuture = BoxFuture<'static, Result<Value, RemoteError>>;

type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;
type InlineHandler = Arc<dyn Fn(Value) + Send + Sync>;

#[derive(Clone)]
enum Subscriber {
    /// Spawned per frame; its outcome answers requests.
    Task(Handler),
    /// Called on the reader task, in frame order.
    Inline(InlineHandler),
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Transport attached, handshake not yet observed.
    Connecting,
    /// Handshake observed; traffic flows.
    Connected,
    /// Closed gracefully, locally or by the peer.
    Closed,
    /// Failed: transport fault, handshake failure or missed liveness probe.
    Errored,
}

impl ConnectionState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Errored)
    }
}

/// Lifecycle notifications. Each fires at most once per bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Handshake complete; carries the peer's identity.
    Connection(Handshake),
    /// Graceful close.
    Close,
    /// Transport fault or missed liveness probe.
    Error(ConnectionError),
}

/// Handle returned by [`Bus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Shared {
    state: ConnectionState,
    peer: Option<Handshake>,
    terminal_error: Option<ConnectionError>,
    handshake_id: Option<RequestId>,
    outstanding: HashSet<RequestId>,
    subscribers: HashMap<String, Vec<(SubscriptionId, Subscriber)>>,
    next_subscription: u64,
    tasks: Vec<JoinHandle<()>>,
}

struct BusInner {
    identity: Handshake,
    config: ChannelConfig,
    tracker: RequestTracker,
    sender: FrameSender,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<LifecycleEvent>,
}

/// One connection's request/response and event bus.
///
/// Cloning yields another handle onto the same connection.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Dial `address` and complete the handshake.
    ///
    /// # Errors
    /// Returns a transport error if the link cannot be opened, or a
    /// handshake error if the peer never answers or refuses.
    #[cfg(feature = "websocket")]
    pub async fn connect(
        address: &str,
        identity: Handshake,
        config: ChannelConfig,
    ) -> Result<Self, ConnectionError> {
        let transport = tokio::time::timeout(config.handshake_timeout, Transport::connect(address))
            .await
            .map_err(|_| ConnectionError::HandshakeTimeout(config.handshake_timeout))??;
        Self::connect_with(transport, identity, config).await
    }

    /// Complete the dialing side of the handshake over an open transport.
    ///
    /// # Errors
    /// Returns a handshake error if the peer never answers or refuses.
    pub async fn connect_with(
        transport: Transport,
        identity: Handshake,
        config: ChannelConfig,
    ) -> Result<Self, ConnectionError> {
        let bus = Self::dial(transport, identity, config);
        bus.handshake().await?;
        Ok(bus)
    }

    /// Attach the dialing side to an open transport without handshaking.
    ///
    /// Subscribe first, then call [`Bus::handshake`].
    #[must_use]
    pub fn dial(transport: Transport, identity: Handshake, config: ChannelConfig) -> Self {
        Self::start(transport, identity, config, RequestTracker::new())
    }

    /// Attach the accepting side to an open transport.
    ///
    /// Returns at once in `Connecting`; the peer's handshake moves it on.
    /// Await [`Bus::connected`] to wait for that.
    #[must_use]
    pub fn accept(transport: Transport, identity: Handshake, config: ChannelConfig) -> Self {
        let bus = Self::start(transport, identity, config, RequestTracker::new());
        let watchdog = bus.clone();
        let handle = tokio::spawn(async move {
            let limit = watchdog.inner.config.handshake_timeout;
            if tokio::time::timeout(limit, watchdog.connected()).await.is_err() {
                tracing::warn!(?limit, "Peer handshake not observed");
                watchdog.fail(ConnectionError::HandshakeTimeout(limit));
            }
        });
        bus.track_task(handle);
        bus
    }

    fn start(
        transport: Transport,
        identity: Handshake,
        config: ChannelConfig,
        tracker: RequestTracker,
    ) -> Self {
        let (sender, inbound) = transport.into_parts();
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let (events, _) = broadcast::channel(16);

        let bus = Self {
            inner: Arc::new(BusInner {
                identity,
                config,
                tracker,
                sender,
                shared: Mutex::new(Shared {
                    state: ConnectionState::Connecting,
                    peer: None,
                    terminal_error: None,
                    handshake_id: None,
                    outstanding: HashSet::new(),
                    subscribers: HashMap::new(),
                    next_subscription: 0,
                    tasks: Vec::new(),
                }),
                state_tx,
                events,
            }),
        };

        let reader = bus.clone();
        let handle = tokio::spawn(async move { reader.read_loop(inbound).await });
        bus.track_task(handle);
        bus
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.inner.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track_task(&self, handle: JoinHandle<()>) {
        let mut shared = self.shared();
        if shared.state.is_terminal() {
            handle.abort();
        } else {
            shared.tasks.retain(|task| !task.is_finished());
            shared.tasks.push(handle);
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared().state
    }

    /// Receiver observing every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Receiver for lifecycle events emitted from now on.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events.subscribe()
    }

    /// This side's handshake identity.
    #[must_use]
    pub fn identity(&self) -> &Handshake {
        &self.inner.identity
    }

    /// The peer's handshake, once observed.
    #[must_use]
    pub fn peer(&self) -> Option<Handshake> {
        self.shared().peer.clone()
    }

    /// Error that ended the connection, if it failed.
    #[must_use]
    pub fn terminal_error(&self) -> Option<ConnectionError> {
        self.shared().terminal_error.clone()
    }

    /// Wait until the handshake completes or the connection ends.
    ///
    /// # Errors
    /// Returns the error that ended the connection before it was established.
    pub async fn connected(&self) -> Result<Handshake, ConnectionError> {
        let mut rx = self.watch_state();
        let state = rx
            .wait_for(|state| *state != ConnectionState::Connecting)
            .await
            .map(|state| *state)
            .unwrap_or(ConnectionState::Closed);

        let shared = self.shared();
        match (state, &shared.peer) {
            (ConnectionState::Connected, Some(peer)) => Ok(peer.clone()),
            _ => Err(shared
                .terminal_error
                .clone()
                .unwrap_or(ConnectionError::Closed)),
        }
    }

    /// Wait until the connection ends and return its terminal state.
    pub async fn closed(&self) -> ConnectionState {
        let mut rx = self.watch_state();
        rx.wait_for(|state| state.is_terminal())
            .await
            .map_or(ConnectionState::Closed, |state| *state)
    }

    /// Register `handler` for every inbound frame on `channel`.
    ///
    /// Each frame runs the handler on its own task, so completion order is
    /// not frame order; use [`Bus::subscribe_inline`] when order matters.
    /// When the frame carries a request id, each handler's outcome is sent
    /// back as a response.
    pub fn subscribe<F, Fut>(&self, channel: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
    {
        let channel = channel.into();
        if is_reserved_channel(&channel) {
            tracing::warn!(%channel, "Subscribing to a reserved channel; the bus handles it itself");
        }
        let handler: Handler = Arc::new(move |payload: Value| -> HandlerFuture { handler(payload).boxed() });
        self.add_subscriber(channel, Subscriber::Task(handler))
    }

    /// Register `handler` to be called on the reader task for every frame
    /// on `channel`, in the order frames arrive.
    ///
    /// The handler must not block. It never answers: a request reaching
    /// only inline handlers gets a null result.
    pub fn subscribe_inline<F>(&self, channel: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let channel = channel.into();
        if is_reserved_channel(&channel) {
            tracing::warn!(%channel, "Subscribing to a reserved channel; the bus handles it itself");
        }
        self.add_subscriber(channel, Subscriber::Inline(Arc::new(handler)))
    }

    fn add_subscriber(&self, channel: String, subscriber: Subscriber) -> SubscriptionId {
        let mut shared = self.shared();
        shared.next_subscription += 1;
        let id = SubscriptionId(shared.next_subscription);
        shared
            .subscribers
            .entry(channel)
            .or_default()
            .push((id, subscriber));
        id
    }

    /// Remove a handler. Returns false if it was not registered on `channel`.
    pub fn unsubscribe(&self, channel: &str, subscription: SubscriptionId) -> bool {
        let mut shared = self.shared();
        let Some(handlers) = shared.subscribers.get_mut(channel) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(id, _)| *id != subscription);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            shared.subscribers.remove(channel);
        }
        removed
    }

    /// Send a request on `channel` and wait for the matching response.
    ///
    /// Honours the configured request timeout.
    ///
    /// # Errors
    /// Returns the peer's failure, a timeout, or a connection error when the
    /// bus is not connected or ends before the response arrives.
    pub async fn send(&self, channel: &str, payload: Value) -> Result<Value, ChannelError> {
        self.request(channel, payload, self.inner.config.request_timeout)
            .await
    }

    /// Publish an event nobody answers.
    ///
    /// # Errors
    /// Returns a connection error when the bus is not connected.
    pub fn publish(&self, channel: &str, payload: Value) -> Result<(), ConnectionError> {
        self.ensure_connected()?;
        self.transmit(&WireFrame::publish(channel, payload))
    }

    /// Send a liveness probe and wait for its pong.
    ///
    /// No timeout is applied here; see [`crate::liveness`].
    ///
    /// # Errors
    /// Returns a connection error when the bus is not connected or ends
    /// before the pong arrives.
    pub async fn ping(&self) -> Result<(), ChannelError> {
        self.request(PING_CHANNEL, Value::Null, None).await.map(drop)
    }

    /// Open a port-frame link on `channel`. See [`Port::over_bus`].
    #[must_use]
    pub fn open_port(&self, channel: &str) -> Port {
        Port::over_bus(self, channel)
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        if self.terminate(ConnectionState::Closed, None) {
            tracing::info!(session_id = %self.inner.identity.session_id, "Connection closed");
        }
    }

    /// Fail the connection with `error`. Only the first terminal
    /// transition has any effect.
    pub fn fail(&self, error: ConnectionError) {
        if self.terminate(ConnectionState::Errored, Some(error.clone())) {
            tracing::warn!(
                session_id = %self.inner.identity.session_id,
                %error,
                "Connection failed"
            );
        }
    }

    fn ensure_connected(&self) -> Result<(), ConnectionError> {
        let shared = self.shared();
        match shared.state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closed | ConnectionState::Errored => Err(shared
                .terminal_error
                .clone()
                .unwrap_or(ConnectionError::Closed)),
            ConnectionState::Connecting => {
                Err(ConnectionError::NotConnected)
            }
        }
    }

    async fn request(
        &self,
        channel: &str,
        payload: Value,
        timeout: Option<std::time::Duration>,
    ) -> Result<Value, ChannelError> {
        let (id, pending) = {
            let mut shared = self.shared();
            match shared.state {
                ConnectionState::Connected => {}
                ConnectionState::Closed | ConnectionState::Errored => {
                    return Err(shared
                        .terminal_error
                        .clone()
                        .unwrap_or(ConnectionError::Closed)
                        .into());
                }
                ConnectionState::Connecting => {
                    return Err(ConnectionError::NotConnected.into());
                }
            }
            let (id, pending) = self.inner.tracker.allocate();
            shared.outstanding.insert(id);
            (id, pending)
        };

        if let Err(e) = self.transmit(&WireFrame::request(id, channel, payload)) {
            self.shared().outstanding.remove(&id);
            self.inner.tracker.cancel(id);
            return Err(e.into());
        }

        let outcome = pending.with_timeout(timeout).await;
        self.shared().outstanding.remove(&id);
        outcome
    }

    fn transmit(&self, frame: &WireFrame) -> Result<(), ConnectionError> {
        let text = frame
            .encode()
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        tracing::debug!(frame = %text, "Sending frame");
        self.inner.sender.send_text(text)
    }

    fn respond(&self, id: RequestId, outcome: Result<Value, ErrorEnvelope>) {
        if self.state().is_terminal() {
            tracing::debug!(request_id = id, "Dropping response on a finished connection");
            return;
        }
        if let Err(e) = self.transmit(&WireFrame::response(id, outcome)) {
            tracing::debug!(request_id = id, "Failed to send response: {e}");
        }
    }

    /// Send this side's handshake and wait for the peer's answer.
    ///
    /// The reader task validates the answer and establishes the connection
    /// before anything queued behind it is read, so subscriptions made
    /// before this call see every frame the peer sends afterwards.
    ///
    /// # Errors
    /// Returns a handshake error if the peer never answers or refuses.
    pub async fn handshake(&self) -> Result<Handshake, ConnectionError> {
        let claimed = {
            let mut shared = self.shared();
            if shared.handshake_id.is_some() || shared.state != ConnectionState::Connecting {
                None
            } else {
                let (id, pending) = self.inner.tracker.allocate();
                shared.handshake_id = Some(id);
                shared.outstanding.insert(id);
                Some((id, pending))
            }
        };
        let Some((id, pending)) = claimed else {
            return self.connected().await;
        };

        let payload = serde_json::to_value(&self.inner.identity)
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        if let Err(e) = self.transmit(&WireFrame::request(id, INITIAL_CONNECTION_CHANNEL, payload))
        {
            self.fail(e.clone());
            return Err(e);
        }

        let limit = self.inner.config.handshake_timeout;
        match pending.with_timeout(Some(limit)).await {
            Ok(_) => self.connected().await,
            Err(ChannelError::Timeout(_)) => {
                let err = ConnectionError::HandshakeTimeout(limit);
                self.fail(err.clone());
                Err(err)
            }
            Err(other) => {
                let err = match other {
                    ChannelError::Connection(err) => err,
                    other => ConnectionError::HandshakeRejected(other.to_string()),
                };
                self.fail(err.clone());
                Err(self.terminal_error().unwrap_or(err))
            }
        }
    }

    /// Judge the peer's answer to our handshake. Runs on the reader task.
    fn complete_handshake(&self, id: RequestId, outcome: Result<Value, ChannelError>) {
        let verdict = outcome
            .map_err(|e| match e {
                ChannelError::Connection(err) => err,
                other => ConnectionError::HandshakeRejected(other.to_string()),
            })
            .and_then(|reply| {
                serde_json::from_value::<Handshake>(reply)
                    .map_err(|e| ConnectionError::HandshakeRejected(e.to_string()))
            })
            .and_then(|peer| {
                if peer.role == self.inner.identity.role {
                    Err(ConnectionError::HandshakeRejected(format!(
                        "peer has the same role ({})",
                        peer.role
                    )))
                } else {
                    Ok(peer)
                }
            });

        match verdict {
            Ok(peer) => {
                self.establish(peer);
                self.shared().outstanding.remove(&id);
                self.inner.tracker.fulfill(id, Value::Null);
            }
            Err(err) => self.fail(err),
        }
    }

    /// `Connecting` -> `Connected`. Returns false if the bus already ended.
    fn establish(&self, peer: Handshake) -> bool {
        {
            let mut shared = self.shared();
            if shared.state != ConnectionState::Connecting {
                return shared.state == ConnectionState::Connected;
            }
            shared.state = ConnectionState::Connected;
            shared.peer = Some(peer.clone());
        }
        self.inner.state_tx.send_replace(ConnectionState::Connected);
        tracing::info!(
            session_id = %self.inner.identity.session_id,
            peer_role = %peer.role,
            peer_session = %peer.session_id,
            "Connection established"
        );
        let _ = self.inner.events.send(LifecycleEvent::Connection(peer));

        let liveness = self.inner.config.liveness;
        if liveness.enabled {
            self.track_task(crate::liveness::spawn_monitor(self.clone(), liveness));
        }
        true
    }

    /// Move to a terminal state. Returns false if already terminal.
    fn terminate(&self, state: ConnectionState, error: Option<ConnectionError>) -> bool {
        let (outstanding, subscribers, tasks) = {
            let mut shared = self.shared();
            if shared.state.is_terminal() {
                return false;
            }
            shared.state = state;
            shared.terminal_error.clone_from(&error);
            (
                std::mem::take(&mut shared.outstanding),
                std::mem::take(&mut shared.subscribers),
                std::mem::take(&mut shared.tasks),
            )
        };

        self.inner.state_tx.send_replace(state);
        self.inner.sender.close();

        let reason = error.clone().unwrap_or(ConnectionError::Closed);
        self.inner
            .tracker
            .fail_all(outstanding, &ChannelError::Connection(reason));
        drop(subscribers);

        let event = error.map_or(LifecycleEvent::Close, LifecycleEvent::Error);
        let _ = self.inner.events.send(event);

        for task in tasks {
            task.abort();
        }
        true
    }

    async fn read_loop(self, mut inbound: FrameStream) {
        while let Some(item) = inbound.next().await {
            match item {
                Ok(text) => self.handle_text(&text),
                Err(e) => {
                    tracing::error!("Transport error: {e}");
                    self.fail(e);
                    return;
                }
            }
            if self.state().is_terminal() {
                return;
            }
        }
        tracing::debug!("Peer hung up");
        self.close();
    }

    fn handle_text(&self, text: &str) {
        let frame = match WireFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropping malformed frame: {e}");
                return;
            }
        };
        tracing::debug!(?frame, "Received frame");

        match frame {
            WireFrame::Success { id, result } => self.handle_response(id, Ok(result)),
            WireFrame::Failure { id, error } => self.handle_response(id, Err(error.into_error())),
            WireFrame::Request {
                id,
                channel,
                payload,
            } => self.handle_request(id, &channel, payload),
        }
    }

    fn handle_response(&self, id: RequestId, outcome: Result<Value, ChannelError>) {
        {
            let mut shared = self.shared();
            if shared.state == ConnectionState::Connecting {
                if shared.handshake_id == Some(id) {
                    drop(shared);
                    self.complete_handshake(id, outcome);
                } else {
                    tracing::warn!(request_id = id, "Dropping response received before handshake");
                }
                return;
            }
            shared.outstanding.remove(&id);
        }
        self.inner.tracker.settle(id, outcome);
    }

    fn handle_request(&self, id: Option<RequestId>, channel: &str, payload: Value) {
        if channel == INITIAL_CONNECTION_CHANNEL {
            self.handle_handshake(id, payload);
            return;
        }
        if self.state() != ConnectionState::Connected {
            tracing::warn!(%channel, "Dropping frame received before handshake");
            return;
        }

        match channel {
            PING_CHANNEL => match id {
                Some(id) => {
                    if let Err(e) = self.transmit(&WireFrame::request(id, PONG_CHANNEL, Value::Null)) {
                        tracing::debug!(request_id = id, "Failed to answer ping: {e}");
                    }
                }
                None => tracing::warn!("Dropping ping without id"),
            },
            PONG_CHANNEL => match id {
                Some(id) => self.handle_response(id, Ok(payload)),
                None => tracing::warn!("Dropping pong without id"),
            },
            _ => self.dispatch(id, channel, payload),
        }
    }

    fn handle_handshake(&self, id: Option<RequestId>, payload: Value) {
        let peer = match serde_json::from_value::<Handshake>(payload) {
            Ok(peer) => peer,
            Err(e) => {
                tracing::warn!("Malformed handshake: {e}");
                if let Some(id) = id {
                    self.respond(
                        id,
                        Err(ErrorEnvelope::new(ErrorKind::Protocol, e.to_string())),
                    );
                }
                self.fail(ConnectionError::HandshakeRejected(e.to_string()));
                return;
            }
        };

        if peer.role == self.inner.identity.role {
            let err = ConnectionError::HandshakeRejected(format!(
                "peer has the same role ({})",
                peer.role
            ));
            if let Some(id) = id {
                self.respond(id, Err(ErrorEnvelope::new(ErrorKind::Connection, err.to_string())));
            }
            self.fail(err);
            return;
        }

        match self.state() {
            ConnectionState::Connecting => {
                if !self.establish(peer) {
                    return;
                }
            }
            ConnectionState::Connected => {
                tracing::debug!("Repeated handshake from peer");
            }
            _ => return,
        }

        if let Some(id) = id {
            match serde_json::to_value(&self.inner.identity) {
                Ok(identity) => self.respond(id, Ok(identity)),
                Err(e) => tracing::error!("Failed to encode handshake: {e}"),
            }
        }
    }

    fn dispatch(&self, id: Option<RequestId>, channel: &str, payload: Value) {
        let subscribers: Vec<Subscriber> = self
            .shared()
            .subscribers
            .get(channel)
            .map(|subscribers| subscribers.iter().map(|(_, s)| s.clone()).collect())
            .unwrap_or_default();

        if subscribers.is_empty() {
            tracing::warn!(%channel, "No subscriber for channel");
            if let Some(id) = id {
                self.respond(
                    id,
                    Err(ErrorEnvelope::new(
                        ErrorKind::Protocol,
                        format!("no subscriber for channel {channel}"),
                    )),
                );
            }
            return;
        }

        let mut answering = false;
        for subscriber in subscribers {
            let handler = match subscriber {
                Subscriber::Inline(handler) => {
                    let payload = payload.clone();
                    if std::panic::catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
                        tracing::error!(%channel, "Inline handler panicked");
                    }
                    continue;
                }
                Subscriber::Task(handler) => handler,
            };
            answering = true;
            let bus = self.clone();
            let payload = payload.clone();
            let channel = channel.to_owned();
            tokio::spawn(async move {
                let outcome = AssertUnwindSafe(async move { handler(payload).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(RemoteError::new("handler panicked")));
                match (id, outcome) {
                    (Some(id), outcome) => bus.respond(id, outcome.map_err(ErrorEnvelope::from)),
                    (None, Err(e)) => tracing::warn!(%channel, "Event handler failed: {e}"),
                    (None, Ok(_)) => {}
                }
            });
        }

        if let (Some(id), false) = (id, answering) {
            self.respond(id, Ok(Value::Null));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use remote_channel_core::Role;
    use serde_json::json;
    use tokio_test::{assert_pending, assert_ready, task};

    use super::*;

    async fn connected_pair() -> (Bus, Bus) {
        let (a, b) = Transport::pair();
        let controller = Bus::accept(
            a,
            Handshake::new(Role::Controller, "ctl"),
            ChannelConfig::default(),
        );
        let endpoint = Bus::connect_with(
            b,
            Handshake::new(Role::Endpoint, "s1"),
            ChannelConfig::default(),
        )
        .await
        .unwrap();
        controller.connected().await.unwrap();
        (controller, endpoint)
    }

    #[tokio::test]
    async fn test_handshake_exchanges_identities() {
        let (controller, endpoint) = connected_pair().await;
        assert_eq!(controller.state(), ConnectionState::Connected);
        assert_eq!(endpoint.state(), ConnectionState::Connected);
        assert_eq!(controller.peer().unwrap().session_id, "s1");
        assert_eq!(endpoint.peer().unwrap().role, Role::Controller);
    }

    #[tokio::test]
    async fn test_request_response() {
        let (controller, endpoint) = connected_pair().await;
        endpoint.subscribe("echo", |payload| async move { Ok(payload) });

        let result = controller.send("echo", json!("x")).await.unwrap();
        assert_eq!(result, json!("x"));
    }

    #[tokio::test]
    async fn test_remote_failure_keeps_connection() {
        let (controller, endpoint) = connected_pair().await;
        endpoint.subscribe("explode", |_| async { Err(RemoteError::new("kaboom")) });

        let err = controller.send("explode", Value::Null).await.unwrap_err();
        assert!(err.is_remote());
        assert_eq!(controller.state(), ConnectionState::Connected);
        assert_eq!(endpoint.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_panicking_handler_reports_remote_error() {
        let (controller, endpoint) = connected_pair().await;
        endpoint.subscribe("panic", |_| async { panic!("handler bug") });

        let err = controller.send("panic", Value::Null).await.unwrap_err();
        assert!(err.is_remote());
    }

    #[tokio::test]
    async fn test_missing_subscriber_is_protocol_error() {
        let (controller, _endpoint) = connected_pair().await;
        let err = controller.send("nobody", Value::Null).await.unwrap_err();
        assert!(matches!(err, ChannelError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let (controller, endpoint) = connected_pair().await;
        let id = endpoint.subscribe("echo", |payload| async move { Ok(payload) });
        assert!(endpoint.unsubscribe("echo", id));
        assert!(!endpoint.unsubscribe("echo", id));

        let err = controller.send("echo", Value::Null).await.unwrap_err();
        assert!(matches!(err, ChannelError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_events_fan_out() {
        let (controller, endpoint) = connected_pair().await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for name in ["first", "second"] {
            let tx = tx.clone();
            endpoint.subscribe("status", move |payload| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((name, payload));
                    Ok(Value::Null)
                }
            });
        }

        controller.publish("status", json!("connected")).unwrap();

        let mut seen = vec![rx.recv().await.unwrap().0, rx.recv().await.unwrap().0];
        seen.sort_unstable();
        assert_eq!(seen, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let (controller, endpoint) = connected_pair().await;
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
        endpoint.subscribe("slow", move |payload| {
            let release_rx = Arc::clone(&release_rx);
            async move {
                if let Some(rx) = release_rx.lock().await.take() {
                    let _ = rx.await;
                }
                Ok(payload)
            }
        });
        endpoint.subscribe("fast", |payload| async move { Ok(payload) });

        let slow = tokio::spawn({
            let controller = controller.clone();
            async move { controller.send("slow", json!("a")).await }
        });
        tokio::task::yield_now().await;
        let fast = controller.send("fast", json!("b")).await.unwrap();
        assert_eq!(fast, json!("b"));

        release_tx.send(()).unwrap();
        assert_eq!(slow.await.unwrap().unwrap(), json!("a"));
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (controller, endpoint) = connected_pair().await;
        controller.ping().await.unwrap();
        endpoint.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_emits_once() {
        let (controller, endpoint) = connected_pair().await;
        let mut events = endpoint.events();

        endpoint.close();
        endpoint.close();
        endpoint.fail(ConnectionError::LivenessTimeout);

        assert_eq!(events.recv().await.unwrap(), LifecycleEvent::Close);
        assert!(events.try_recv().is_err());
        assert_eq!(endpoint.state(), ConnectionState::Closed);

        let err = endpoint.send("echo", Value::Null).await.unwrap_err();
        assert_eq!(err, ChannelError::Connection(ConnectionError::Closed));
        assert!(endpoint.ping().await.is_err());

        let mut state = controller.watch_state();
        state.wait_for(|s| s.is_terminal()).await.unwrap();
        assert_eq!(controller.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_rejects_outstanding_requests() {
        let (controller, endpoint) = connected_pair().await;
        endpoint.subscribe("never", |_| futures::future::pending());

        let request = tokio::spawn({
            let controller = controller.clone();
            async move { controller.send("never", Value::Null).await }
        });
        tokio::task::yield_now().await;
        controller.close();

        let err = request.await.unwrap().unwrap_err();
        assert!(err.is_connection());
    }

    #[tokio::test]
    async fn test_transport_drop_closes_peer() {
        let (a, b) = Transport::pair();
        let controller = Bus::accept(
            a,
            Handshake::new(Role::Controller, "ctl"),
            ChannelConfig::default(),
        );
        drop(b);
        let err = controller.connected().await.unwrap_err();
        assert_eq!(err, ConnectionError::Closed);
        assert_eq!(controller.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_send_before_handshake_refused() {
        let (a, _b) = Transport::pair();
        let controller = Bus::accept(
            a,
            Handshake::new(Role::Controller, "ctl"),
            ChannelConfig::default(),
        );
        let err = controller.send("echo", Value::Null).await.unwrap_err();
        assert_eq!(err, ChannelError::Connection(ConnectionError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let (a, _b) = Transport::pair();
        let config = ChannelConfig::default().with_handshake_timeout(Duration::from_secs(1));
        let err = Bus::connect_with(a, Handshake::new(Role::Endpoint, "s1"), config)
            .await
            .err()
            .unwrap();
        assert_eq!(err, ConnectionError::HandshakeTimeout(Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_handshake_timeout() {
        let (a, _b) = Transport::pair();
        let config = ChannelConfig::default().with_handshake_timeout(Duration::from_secs(1));
        let controller = Bus::accept(a, Handshake::new(Role::Controller, "ctl"), config);
        let err = controller.connected().await.unwrap_err();
        assert_eq!(err, ConnectionError::HandshakeTimeout(Duration::from_secs(1)));
        assert_eq!(controller.state(), ConnectionState::Errored);
    }

    #[tokio::test]
    async fn test_same_role_rejected() {
        let (a, b) = Transport::pair();
        let _other = Bus::accept(
            a,
            Handshake::new(Role::Endpoint, "x"),
            ChannelConfig::default(),
        );
        let err = Bus::connect_with(
            b,
            Handshake::new(Role::Endpoint, "s1"),
            ChannelConfig::default(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, ConnectionError::Peer(_) | ConnectionError::HandshakeRejected(_)));
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_kill_bus() {
        let (a, b) = Transport::pair();
        let controller = Bus::accept(
            a,
            Handshake::new(Role::Controller, "ctl"),
            ChannelConfig::default(),
        );
        let (raw_tx, _raw_rx) = b.into_parts();
        raw_tx.send_text("{not json".into()).unwrap();
        raw_tx
            .send_text(r#"{"id":77,"result":"stray"}"#.into())
            .unwrap();
        raw_tx
            .send_text(
                r#"{"id":1,"channel":"initialConnection","payload":{"role":"endpoint","sessionId":"s9"}}"#
                    .into(),
            )
            .unwrap();

        let peer = controller.connected().await.unwrap();
        assert_eq!(peer.session_id, "s9");
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout() {
        let (a, b) = Transport::pair();
        let config = ChannelConfig::default().with_request_timeout(Duration::from_secs(2));
        let controller = Bus::accept(a, Handshake::new(Role::Controller, "ctl"), config);
        let endpoint = Bus::connect_with(
            b,
            Handshake::new(Role::Endpoint, "s1"),
            ChannelConfig::default(),
        )
        .await
        .unwrap();
        controller.connected().await.unwrap();
        endpoint.subscribe("never", |_| futures::future::pending());

        let err = controller.send("never", Value::Null).await.unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)));
        assert_eq!(controller.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_connected_waits_for_peer_handshake() {
        let (a, b) = Transport::pair();
        let controller = Bus::accept(
            a,
            Handshake::new(Role::Controller, "ctl"),
            ChannelConfig::default(),
        );
        let mut waiting = task::spawn(controller.connected());
        assert_pending!(waiting.poll());

        let _endpoint = Bus::connect_with(
            b,
            Handshake::new(Role::Endpoint, "s1"),
            ChannelConfig::default(),
        )
        .await
        .unwrap();

        assert!(waiting.is_woken());
        assert_eq!(assert_ready!(waiting.poll()).unwrap().session_id, "s1");
    }

    #[tokio::test]
    async fn test_bare_error_string_rejects_request() {
        let (a, b) = Transport::pair();
        let controller = Bus::accept(
            a,
            Handshake::new(Role::Controller, "ctl"),
            ChannelConfig::default(),
        );
        let (raw_tx, mut raw_rx) = b.into_parts();
        raw_tx
            .send_text(
                r#"{"id":1,"channel":"initialConnection","payload":{"role":"endpoint","sessionId":"raw"}}"#
                    .into(),
            )
            .unwrap();
        controller.connected().await.unwrap();
        raw_rx.next().await.unwrap().unwrap();

        let request = tokio::spawn({
            let controller = controller.clone();
            async move { controller.send("work", Value::Null).await }
        });
        let sent = WireFrame::decode(&raw_rx.next().await.unwrap().unwrap()).unwrap();
        let id = sent.id().unwrap();
        raw_tx
            .send_text(format!(r#"{{"id":{id},"bogus":true}}"#))
            .unwrap();
        raw_tx
            .send_text(format!(r#"{{"id":{id},"error":"boom"}}"#))
            .unwrap();

        let err = request.await.unwrap().unwrap_err();
        assert!(matches!(err, ChannelError::Protocol(ref message) if message.contains("boom")));
        assert_eq!(controller.state(), ConnectionState::Connected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_inline_subscribers_see_frames_in_order() {
        let (controller, endpoint) = connected_pair().await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        endpoint.subscribe_inline("stream", move |payload| {
            let _ = tx.send(payload);
        });

        for n in 1..=200 {
            controller.publish("stream", json!(n)).unwrap();
        }
        let mut seen = Vec::new();
        for _ in 1..=200 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(seen, (1..=200).map(|n| json!(n)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_inline_only_request_gets_null() {
        let (controller, endpoint) = connected_pair().await;
        endpoint.subscribe_inline("note", |_| {});
        assert_eq!(controller.send("note", json!(1)).await.unwrap(), Value::Null);
    }
}
