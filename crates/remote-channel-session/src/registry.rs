//! Endpoint registry.
//!
//! Maps a logical endpoint id to the port it is currently reachable on and
//! keeps every request that has not been answered yet. Ports come and go as
//! endpoints reconnect; pending requests stay and are replayed, in
//! submission order and under their original ids, each time a new port is
//! registered. A request goes out at most once per registered port.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use remote_channel_core::{
    ChannelConfig, ChannelError, ConnectionError, Invocation, PortFrame, RequestId, RequestTracker,
};
use remote_channel_transport::{Port, PortSender};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Misuse of the registry itself, as opposed to a failed request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("endpoint id must not be empty")]
    EmptyEndpointId,
    #[error("endpoint {0} is not known")]
    UnknownEndpoint(String),
}

impl From<RegistryError> for ChannelError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownEndpoint(id) => Self::Connection(ConnectionError::Unreachable(id)),
            RegistryError::EmptyEndpointId => {
                Self::Protocol(RegistryError::EmptyEndpointId.to_string())
            }
        }
    }
}

struct Attached {
    sender: PortSender,
    generation: u64,
}

struct PendingRequest {
    id: RequestId,
    frame: PortFrame,
    sent_on: Option<u64>,
}

#[derive(Default)]
struct EndpointSlot {
    current: Option<Attached>,
    /// Submission order.
    pending: Vec<PendingRequest>,
    waiters: Vec<oneshot::Sender<PortSender>>,
}

#[derive(Default)]
struct RegistryState {
    endpoints: HashMap<String, EndpointSlot>,
    generations: u64,
}

struct RegistryInner {
    tracker: RequestTracker,
    config: ChannelConfig,
    state: Mutex<RegistryState>,
}

/// Routes requests to endpoints and survives their reconnects.
///
/// Cloning yields another handle onto the same registry.
#[derive(Clone)]
pub struct EndpointRegistry {
    inner: Arc<RegistryInner>,
}

impl EndpointRegistry {
    /// Create a registry with its own tracker.
    #[must_use]
    pub fn new(config: ChannelConfig) -> Self {
        Self::with_tracker(RequestTracker::new(), config)
    }

    /// Create a registry allocating ids from `tracker`.
    #[must_use]
    pub fn with_tracker(tracker: RequestTracker, config: ChannelConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                tracker,
                config,
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `port` the current link to `endpoint_id`.
    ///
    /// Wakes everyone waiting in [`get_transport`](Self::get_transport),
    /// replays the pending requests and starts reading responses. When the
    /// port ends, the mapping is dropped unless a newer port replaced it.
    ///
    /// # Errors
    /// Returns [`RegistryError::EmptyEndpointId`] for an empty id; the port
    /// is dropped.
    pub fn register(&self, endpoint_id: impl Into<String>, port: Port) -> Result<(), RegistryError> {
        let endpoint_id = endpoint_id.into();
        if endpoint_id.is_empty() {
            return Err(RegistryError::EmptyEndpointId);
        }
        let (sender, inbound) = port.split();

        let generation = {
            let mut state = self.state();
            state.generations += 1;
            let generation = state.generations;
            let slot = state.endpoints.entry(endpoint_id.clone()).or_default();

            for waiter in slot.waiters.drain(..) {
                let _ = waiter.send(sender.clone());
            }

            let attached = Attached {
                sender: sender.clone(),
                generation,
            };
            for entry in &mut slot.pending {
                deliver(&attached, entry);
            }
            tracing::info!(
                endpoint = %endpoint_id,
                generation,
                replayed = slot.pending.len(),
                "Endpoint registered"
            );
            slot.current = Some(attached);
            generation
        };

        let registry = self.clone();
        tokio::spawn(async move { registry.read_port(endpoint_id, generation, inbound).await });
        Ok(())
    }

    /// The current port to `endpoint_id`, waiting for one if necessary.
    ///
    /// Every caller waiting at the time of a registration gets that port.
    ///
    /// # Errors
    /// Returns [`ConnectionError::Unreachable`] if the endpoint is forgotten
    /// while waiting.
    pub async fn get_transport(&self, endpoint_id: &str) -> Result<PortSender, ConnectionError> {
        let rx = {
            let mut state = self.state();
            let slot = state.endpoints.entry(endpoint_id.to_owned()).or_default();
            if let Some(attached) = &slot.current {
                return Ok(attached.sender.clone());
            }
            let (tx, rx) = oneshot::channel();
            slot.waiters.push(tx);
            rx
        };
        rx.await
            .map_err(|_| ConnectionError::Unreachable(endpoint_id.to_owned()))
    }

    /// Send `payload` to `endpoint_id` and wait for its response.
    ///
    /// The request stays pending across disconnects and is replayed on the
    /// next registration, so an unreachable endpoint simply delays it.
    ///
    /// # Errors
    /// Returns the endpoint's failure, a timeout when a request timeout is
    /// configured, or [`ConnectionError::Unreachable`] if the endpoint is
    /// forgotten.
    pub async fn send(&self, endpoint_id: &str, payload: Value) -> Result<Value, ChannelError> {
        let (id, pending) = self.inner.tracker.allocate();
        {
            let mut state = self.state();
            let slot = state.endpoints.entry(endpoint_id.to_owned()).or_default();
            let mut entry = PendingRequest {
                id,
                frame: PortFrame::message(id, payload),
                sent_on: None,
            };
            match &slot.current {
                Some(attached) => deliver(attached, &mut entry),
                None => tracing::debug!(
                    endpoint = %endpoint_id,
                    request_id = id,
                    "Endpoint unreachable; request queued"
                ),
            }
            slot.pending.push(entry);
        }

        let _guard = PendingGuard {
            registry: self,
            endpoint_id,
            id,
        };
        pending.with_timeout(self.inner.config.request_timeout).await
    }

    /// Ask `endpoint_id` to run `instruction` with `args`.
    ///
    /// # Errors
    /// Same as [`send`](Self::send).
    pub async fn invoke(
        &self,
        endpoint_id: &str,
        instruction: &str,
        args: Value,
    ) -> Result<Value, ChannelError> {
        let payload = serde_json::to_value(Invocation::new(instruction, args))?;
        self.send(endpoint_id, payload).await
    }

    /// Drop `endpoint_id` entirely and return how many requests it had
    /// pending.
    ///
    /// Its pending requests and waiters fail with
    /// [`ConnectionError::Unreachable`].
    ///
    /// # Errors
    /// Returns [`RegistryError::UnknownEndpoint`] if it was never seen.
    pub fn forget(&self, endpoint_id: &str) -> Result<usize, RegistryError> {
        let Some(slot) = self.state().endpoints.remove(endpoint_id) else {
            return Err(RegistryError::UnknownEndpoint(endpoint_id.to_owned()));
        };
        let error = ChannelError::Connection(ConnectionError::Unreachable(endpoint_id.to_owned()));
        self.inner
            .tracker
            .fail_all(slot.pending.iter().map(|entry| entry.id), &error);
        tracing::info!(
            endpoint = %endpoint_id,
            failed = slot.pending.len(),
            "Endpoint forgotten"
        );
        Ok(slot.pending.len())
    }

    /// Requests to `endpoint_id` still waiting for a response.
    #[must_use]
    pub fn pending_count(&self, endpoint_id: &str) -> usize {
        self.state()
            .endpoints
            .get(endpoint_id)
            .map_or(0, |slot| slot.pending.len())
    }

    #[must_use]
    pub fn is_connected(&self, endpoint_id: &str) -> bool {
        self.state()
            .endpoints
            .get(endpoint_id)
            .is_some_and(|slot| slot.current.is_some())
    }

    /// Every endpoint id seen so far, connected or not, sorted.
    #[must_use]
    pub fn endpoints(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state().endpoints.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    async fn read_port(
        self,
        endpoint_id: String,
        generation: u64,
        mut inbound: mpsc::UnboundedReceiver<PortFrame>,
    ) {
        while let Some(frame) = inbound.recv().await {
            self.handle_response(&endpoint_id, frame);
        }
        self.disconnect(&endpoint_id, generation);
    }

    /// Settle `frame` only if its id is pending for this endpoint.
    fn handle_response(&self, endpoint_id: &str, frame: PortFrame) {
        let (id, outcome) = frame.into_outcome();
        let owned = self
            .state()
            .endpoints
            .get_mut(endpoint_id)
            .is_some_and(|slot| {
                let before = slot.pending.len();
                slot.pending.retain(|entry| entry.id != id);
                slot.pending.len() != before
            });
        if !owned {
            tracing::warn!(
                endpoint = %endpoint_id,
                request_id = id,
                "Dropping response for a request this endpoint does not hold"
            );
            return;
        }
        self.inner.tracker.settle(id, outcome);
    }

    fn disconnect(&self, endpoint_id: &str, generation: u64) {
        let mut state = self.state();
        let Some(slot) = state.endpoints.get_mut(endpoint_id) else {
            return;
        };
        if slot
            .current
            .as_ref()
            .is_some_and(|attached| attached.generation == generation)
        {
            slot.current = None;
            tracing::info!(
                endpoint = %endpoint_id,
                pending = slot.pending.len(),
                "Endpoint disconnected"
            );
        } else {
            tracing::debug!(endpoint = %endpoint_id, generation, "Superseded port ended");
        }
    }

    fn remove_pending(&self, endpoint_id: &str, id: RequestId) {
        if let Some(slot) = self.state().endpoints.get_mut(endpoint_id) {
            slot.pending.retain(|entry| entry.id != id);
        }
    }
}

/// Transmit `entry` on `attached` unless it already went out there.
fn deliver(attached: &Attached, entry: &mut PendingRequest) {
    if entry.sent_on == Some(attached.generation) {
        return;
    }
    match attached.sender.send(entry.frame.clone()) {
        Ok(()) => entry.sent_on = Some(attached.generation),
        Err(e) => tracing::debug!(request_id = entry.id, "Port gone; request stays pending: {e}"),
    }
}

/// Clears a request's bookkeeping however its caller stops waiting.
struct PendingGuard<'a> {
    registry: &'a EndpointRegistry,
    endpoint_id: &'a str,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.registry.remove_pending(self.endpoint_id, self.id);
        self.registry.inner.tracker.cancel(self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use remote_channel_core::{ErrorEnvelope, ErrorKind};
    use serde_json::json;
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio_test::{assert_pending, assert_ready, task};

    use super::*;

    fn registry() -> EndpointRegistry {
        EndpointRegistry::new(ChannelConfig::default())
    }

    async fn wait_disconnected(registry: &EndpointRegistry, endpoint_id: &str) {
        while registry.is_connected(endpoint_id) {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_send_to_registered_endpoint() {
        let registry = registry();
        let (near, mut far) = Port::pair();
        registry.register("e1", near).unwrap();

        let request = tokio::spawn({
            let registry = registry.clone();
            async move { registry.send("e1", json!({"x": 1})).await }
        });

        let frame = far.recv().await.unwrap();
        assert_eq!(frame, PortFrame::message(1, json!({"x": 1})));
        far.send(PortFrame::message(1, json!("ok"))).unwrap();

        assert_eq!(request.await.unwrap().unwrap(), json!("ok"));
        assert_eq!(registry.pending_count("e1"), 0);
    }

    #[tokio::test]
    async fn test_waiters_share_one_registration() {
        let registry = registry();
        let first = tokio::spawn({
            let registry = registry.clone();
            async move { registry.get_transport("e1").await }
        });
        let second = tokio::spawn({
            let registry = registry.clone();
            async move { registry.get_transport("e1").await }
        });
        tokio::task::yield_now().await;

        let (near, _far) = Port::pair();
        let expected = near.sender().clone();
        registry.register("e1", near).unwrap();

        assert!(first.await.unwrap().unwrap().same_link(&expected));
        assert!(second.await.unwrap().unwrap().same_link(&expected));
        assert!(registry.get_transport("e1").await.unwrap().same_link(&expected));
    }

    #[tokio::test]
    async fn test_request_while_unreachable_delivered_once() {
        let registry = registry();
        let request = tokio::spawn({
            let registry = registry.clone();
            async move { registry.send("e1", json!("queued")).await }
        });
        while registry.pending_count("e1") == 0 {
            tokio::task::yield_now().await;
        }

        let (near, far) = Port::pair();
        registry.register("e1", near).unwrap();
        let (far_tx, mut far_rx) = far.split();

        let frame = far_rx.recv().await.unwrap();
        assert_eq!(frame.id(), 1);
        tokio::task::yield_now().await;
        assert!(matches!(far_rx.try_recv(), Err(TryRecvError::Empty)));

        far_tx.send(PortFrame::message(1, json!("done"))).unwrap();
        assert_eq!(request.await.unwrap().unwrap(), json!("done"));
    }

    #[tokio::test]
    async fn test_pending_request_replayed_on_reconnect() {
        let registry = registry();
        let (near, mut far) = Port::pair();
        registry.register("e1", near).unwrap();

        let request = tokio::spawn({
            let registry = registry.clone();
            async move { registry.invoke("e1", "echo", json!("x")).await }
        });
        let first = far.recv().await.unwrap();
        drop(far);
        wait_disconnected(&registry, "e1").await;
        assert_eq!(registry.pending_count("e1"), 1);

        let (near, mut far) = Port::pair();
        registry.register("e1", near).unwrap();
        let replayed = far.recv().await.unwrap();
        assert_eq!(replayed, first);

        far.send(PortFrame::message(replayed.id(), json!("x"))).unwrap();
        assert_eq!(request.await.unwrap().unwrap(), json!("x"));
    }

    #[tokio::test]
    async fn test_replay_keeps_submission_order() {
        let registry = registry();
        let mut requests = Vec::new();
        for n in 0..3 {
            let sender = registry.clone();
            requests.push(tokio::spawn(async move { sender.send("e1", json!(n)).await }));
            while registry.pending_count("e1") <= n {
                tokio::task::yield_now().await;
            }
        }

        let (near, mut far) = Port::pair();
        registry.register("e1", near).unwrap();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(far.recv().await.unwrap().id());
        }
        assert_eq!(ids, vec![1, 2, 3]);

        for id in ids.into_iter().rev() {
            far.send(PortFrame::message(id, json!(id))).unwrap();
        }
        for (n, request) in requests.into_iter().enumerate() {
            assert_eq!(request.await.unwrap().unwrap(), json!(n + 1));
        }
    }

    #[tokio::test]
    async fn test_superseded_port_does_not_unregister() {
        let registry = registry();
        let (old_near, old_far) = Port::pair();
        registry.register("e1", old_near).unwrap();
        let (new_near, mut new_far) = Port::pair();
        registry.register("e1", new_near).unwrap();

        drop(old_far);
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(registry.is_connected("e1"));

        let request = tokio::spawn({
            let registry = registry.clone();
            async move { registry.send("e1", json!("hi")).await }
        });
        let frame = new_far.recv().await.unwrap();
        new_far.send(PortFrame::message(frame.id(), json!("hello"))).unwrap();
        assert_eq!(request.await.unwrap().unwrap(), json!("hello"));
    }

    #[tokio::test]
    async fn test_error_response_is_typed() {
        let registry = registry();
        let (near, mut far) = Port::pair();
        registry.register("e1", near).unwrap();

        let request = tokio::spawn({
            let registry = registry.clone();
            async move { registry.invoke("e1", "explode", Value::Null).await }
        });
        let frame = far.recv().await.unwrap();
        far.send(PortFrame::outcome(
            frame.id(),
            Err(ErrorEnvelope::new(ErrorKind::RemoteExecution, "kaboom")),
        ))
        .unwrap();

        let err = request.await.unwrap().unwrap_err();
        assert!(err.is_remote());
        assert_eq!(err.kind(), ErrorKind::RemoteExecution);
        assert!(registry.is_connected("e1"));
    }

    #[tokio::test]
    async fn test_forget_fails_pending_and_waiters() {
        let registry = registry();
        let mut request = task::spawn(registry.send("e1", Value::Null));
        let mut waiter = task::spawn(registry.get_transport("e1"));
        assert_pending!(request.poll());
        assert_pending!(waiter.poll());

        assert_eq!(registry.forget("e1"), Ok(1));
        assert_eq!(
            registry.forget("e1"),
            Err(RegistryError::UnknownEndpoint("e1".into()))
        );

        assert_eq!(
            assert_ready!(request.poll()).unwrap_err(),
            ChannelError::Connection(ConnectionError::Unreachable("e1".into()))
        );
        assert_eq!(
            assert_ready!(waiter.poll()).unwrap_err(),
            ConnectionError::Unreachable("e1".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_clears_pending() {
        let registry =
            EndpointRegistry::new(ChannelConfig::default().with_request_timeout(Duration::from_secs(5)));
        let err = registry.send("e1", Value::Null).await.unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(1)));
        assert_eq!(registry.pending_count("e1"), 0);
    }

    #[tokio::test]
    async fn test_abandoned_request_clears_pending() {
        let registry = registry();
        let request = tokio::spawn({
            let registry = registry.clone();
            async move { registry.send("e1", Value::Null).await }
        });
        while registry.pending_count("e1") == 0 {
            tokio::task::yield_now().await;
        }
        request.abort();
        let _ = request.await;
        assert_eq!(registry.pending_count("e1"), 0);
    }

    #[tokio::test]
    async fn test_ids_unique_across_endpoints() {
        let tracker = RequestTracker::new();
        let registry = EndpointRegistry::with_tracker(tracker.clone(), ChannelConfig::default());
        let (a_near, mut a_far) = Port::pair();
        let (b_near, mut b_far) = Port::pair();
        registry.register("a", a_near).unwrap();
        registry.register("b", b_near).unwrap();

        for endpoint in ["a", "b", "a"] {
            let registry = registry.clone();
            tokio::spawn(async move { registry.send(endpoint, Value::Null).await });
        }
        let mut ids = vec![
            a_far.recv().await.unwrap().id(),
            a_far.recv().await.unwrap().id(),
            b_far.recv().await.unwrap().id(),
        ];
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert_eq!(tracker.last_allocated(), 3);
        assert_eq!(registry.endpoints(), vec!["a".to_owned(), "b".to_owned()]);
    }

    #[tokio::test]
    async fn test_response_on_another_endpoint_is_dropped() {
        let registry = registry();
        let (a_near, mut a_far) = Port::pair();
        let (b_near, b_far) = Port::pair();
        registry.register("a", a_near).unwrap();
        registry.register("b", b_near).unwrap();

        let mut request = task::spawn(registry.send("a", json!("for a")));
        assert_pending!(request.poll());
        let frame = a_far.recv().await.unwrap();

        b_far
            .send(PortFrame::message(frame.id(), json!("answered by b")))
            .unwrap();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_pending!(request.poll());
        assert_eq!(registry.pending_count("a"), 1);

        a_far
            .send(PortFrame::message(frame.id(), json!("answered by a")))
            .unwrap();
        while !request.is_woken() {
            tokio::task::yield_now().await;
        }
        assert_eq!(assert_ready!(request.poll()).unwrap(), json!("answered by a"));
    }

    #[tokio::test]
    async fn test_empty_endpoint_id_rejected() {
        let registry = registry();
        let (near, _far) = Port::pair();
        assert_eq!(registry.register("", near), Err(RegistryError::EmptyEndpointId));
        assert!(registry.endpoints().is_empty());
    }
}
