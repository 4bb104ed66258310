//! Request id allocation and response correlation.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
    time::Duration,
};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::{error::ChannelError, protocol::RequestId};

type Waiter = oneshot::Sender<Result<Value, ChannelError>>;

#[derive(Default)]
struct TrackerState {
    last_id: RequestId,
    waiters: HashMap<RequestId, Waiter>,
}

/// Owns the id space and the id -> waiter map.
///
/// Cloning yields another handle onto the same tracker. Ids are never
/// reused, even after their request settles.
#[derive(Clone, Default)]
pub struct RequestTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl RequestTracker {
    /// Create an empty tracker. The first allocated id is 1.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh id and register its waiter.
    #[must_use]
    pub fn allocate(&self) -> (RequestId, PendingResponse) {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state();
        state.last_id += 1;
        let id = state.last_id;
        state.waiters.insert(id, tx);
        drop(state);

        let pending = PendingResponse {
            id,
            rx,
            tracker: self.clone(),
        };
        (id, pending)
    }

    /// Resolve the waiter for `id`.
    ///
    /// Returns false, and logs a protocol anomaly, if nobody waits on `id`.
    pub fn fulfill(&self, id: RequestId, result: Value) -> bool {
        self.settle(id, Ok(result))
    }

    /// Reject the waiter for `id`.
    ///
    /// Returns false, and logs a protocol anomaly, if nobody waits on `id`.
    pub fn fail(&self, id: RequestId, error: ChannelError) -> bool {
        self.settle(id, Err(error))
    }

    /// Settle `id` with either outcome.
    pub fn settle(&self, id: RequestId, outcome: Result<Value, ChannelError>) -> bool {
        let waiter = self.state().waiters.remove(&id);
        let Some(waiter) = waiter else {
            tracing::warn!(request_id = id, "Protocol anomaly: no waiter for response");
            return false;
        };
        if waiter.send(outcome).is_err() {
            tracing::debug!(request_id = id, "Response arrived after caller went away");
        }
        true
    }

    /// Reject every id in `ids` that is still waiting.
    pub fn fail_all(&self, ids: impl IntoIterator<Item = RequestId>, error: &ChannelError) {
        let waiters: Vec<(RequestId, Waiter)> = {
            let mut state = self.state();
            ids.into_iter()
                .filter_map(|id| state.waiters.remove(&id).map(|w| (id, w)))
                .collect()
        };
        for (id, waiter) in waiters {
            if waiter.send(Err(error.clone())).is_err() {
                tracing::debug!(request_id = id, "Failure arrived after caller went away");
            }
        }
    }

    /// Drop the waiter for `id` without settling it.
    ///
    /// The caller's [`PendingResponse`] then completes with
    /// [`ChannelError::Cancelled`].
    pub fn cancel(&self, id: RequestId) -> bool {
        self.state().waiters.remove(&id).is_some()
    }

    /// Whether `id` is still waiting.
    #[must_use]
    pub fn contains(&self, id: RequestId) -> bool {
        self.state().waiters.contains_key(&id)
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state().waiters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest id handed out so far (0 before the first allocation).
    #[must_use]
    pub fn last_allocated(&self) -> RequestId {
        self.state().last_id
    }
}

/// Future completing when the response for one request is observed.
#[must_use = "a pending response does nothing unless awaited"]
pub struct PendingResponse {
    id: RequestId,
    rx: oneshot::Receiver<Result<Value, ChannelError>>,
    tracker: RequestTracker,
}

impl PendingResponse {
    #[must_use]
    pub const fn id(&self) -> RequestId {
        self.id
    }

    /// Wait for the response, giving up after `timeout` if one is set.
    ///
    /// On expiry the tracker entry is cancelled so a late response is
    /// reported as an anomaly instead of resolving nobody.
    ///
    /// # Errors
    /// Returns the remote failure, or [`ChannelError::Timeout`] on expiry.
    pub async fn with_timeout(mut self, timeout: Option<Duration>) -> Result<Value, ChannelError> {
        let Some(limit) = timeout else {
            return self.await;
        };
        match tokio::time::timeout(limit, &mut self).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.tracker.cancel(self.id);
                Err(ChannelError::Timeout(self.id))
            }
        }
    }
}

impl Future for PendingResponse {
    type Output = Result<Value, ChannelError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.id;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ChannelError::Cancelled(id))))
    }
}
