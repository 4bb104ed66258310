//! Per-endpoint links carrying port frames.
//!
//! A port is what the endpoint registry talks to. It is either an in-memory
//! pair between two contexts of one process, or a channel riding a bus.

use remote_channel_core::{ConnectionError, PortFrame};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::bus::Bus;

/// Write half of a [`Port`].
#[derive(Debug, Clone)]
pub struct PortSender {
    tx: mpsc::UnboundedSender<PortFrame>,
}

impl PortSender {
    /// Queue a frame for the other side.
    ///
    /// # Errors
    /// Returns error if the other side is gone.
    pub fn send(&self, frame: PortFrame) -> Result<(), ConnectionError> {
        self.tx.send(frame).map_err(|_| ConnectionError::Closed)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether both senders feed the same link.
    #[must_use]
    pub fn same_link(&self, other: &Self) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// One bidirectional port-frame link. Disconnection shows up as the
/// inbound side returning `None`.
#[derive(Debug)]
pub struct Port {
    sender: PortSender,
    inbound: mpsc::UnboundedReceiver<PortFrame>,
}

impl Port {
    /// Two in-memory ports wired to each other.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                sender: PortSender { tx: a_tx },
                inbound: b_rx,
            },
            Self {
                sender: PortSender { tx: b_tx },
                inbound: a_rx,
            },
        )
    }

    /// Ride `channel` of `bus`.
    ///
    /// Frames travel as unanswered events and arrive in the order they were
    /// sent. The bus may still be connecting; outbound frames wait for the
    /// handshake. The port disconnects when the bus reaches a terminal state.
    #[must_use]
    pub fn over_bus(bus: &Bus, channel: &str) -> Self {
        let (local, remote) = Self::pair();
        let (remote_sender, mut outbound) = remote.split();

        let inbound_channel = channel.to_owned();
        let subscription = bus.subscribe_inline(channel, move |payload: Value| {
            match serde_json::from_value::<PortFrame>(payload) {
                Ok(frame) => {
                    if remote_sender.send(frame).is_err() {
                        tracing::debug!(channel = %inbound_channel, "Port dropped; discarding frame");
                    }
                }
                Err(e) => {
                    tracing::warn!(channel = %inbound_channel, "Dropping malformed port frame: {e}");
                }
            }
        });

        let bus = bus.clone();
        let channel = channel.to_owned();
        tokio::spawn(async move {
            if let Err(e) = bus.connected().await {
                tracing::debug!(%channel, "Port never came up: {e}");
                bus.unsubscribe(&channel, subscription);
                return;
            }
            loop {
                tokio::select! {
                    frame = outbound.recv() => {
                        let Some(frame) = frame else { break };
                        let payload = match serde_json::to_value(&frame) {
                            Ok(payload) => payload,
                            Err(e) => {
                                tracing::error!("Failed to encode port frame: {e}");
                                continue;
                            }
                        };
                        if let Err(e) = bus.publish(&channel, payload) {
                            tracing::debug!(%channel, "Port transport gone: {e}");
                            break;
                        }
                    }
                    _ = bus.closed() => break,
                }
            }
            bus.unsubscribe(&channel, subscription);
        });

        local
    }

    #[must_use]
    pub const fn sender(&self) -> &PortSender {
        &self.sender
    }

    /// Queue a frame for the other side.
    ///
    /// # Errors
    /// Returns error if the other side is gone.
    pub fn send(&self, frame: PortFrame) -> Result<(), ConnectionError> {
        self.sender.send(frame)
    }

    /// Next inbound frame; `None` once the link is gone.
    pub async fn recv(&mut self) -> Option<PortFrame> {
        self.inbound.recv().await
    }

    #[must_use]
    pub fn split(self) -> (PortSender, mpsc::UnboundedReceiver<PortFrame>) {
        (self.sender, self.inbound)
    }
}
