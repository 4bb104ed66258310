//! One physical bidirectional link carrying text frames.

use futures::{StreamExt, future, stream::BoxStream};
use remote_channel_core::ConnectionError;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Item queued for the writer side of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outgoing {
    Text(String),
    Close,
}

/// Inbound frames; ends when the peer closes, yields an error on a fault.
pub type FrameStream = BoxStream<'static, Result<String, ConnectionError>>;

/// Write half of a [`Transport`].
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl FrameSender {
    pub(crate) const fn new(tx: mpsc::UnboundedSender<Outgoing>) -> Self {
        Self { tx }
    }

    /// Queue a text frame.
    ///
    /// # Errors
    /// Returns error if the writer has shut down.
    pub fn send_text(&self, text: String) -> Result<(), ConnectionError> {
        self.tx
            .send(Outgoing::Text(text))
            .map_err(|_| ConnectionError::Closed)
    }

    /// Ask the writer to close the link once queued frames are flushed.
    pub fn close(&self) {
        let _ = self.tx.send(Outgoing::Close);
    }

    /// Whether the writer is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A connected link: a frame sender plus the inbound frame stream.
///
/// Owned by whoever created it; a bus takes it over entirely.
pub struct Transport {
    sender: FrameSender,
    inbound: FrameStream,
}

impl Transport {
    /// Assemble a transport from its halves.
    #[must_use]
    pub fn new(sender: FrameSender, inbound: FrameStream) -> Self {
        Self { sender, inbound }
    }

    /// Two in-memory transports wired to each other.
    ///
    /// Dropping or closing one side ends the other side's inbound stream.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = Self::new(FrameSender::new(a_tx), memory_stream(b_rx));
        let b = Self::new(FrameSender::new(b_tx), memory_stream(a_rx));
        (a, b)
    }

    #[must_use]
    pub fn into_parts(self) -> (FrameSender, FrameStream) {
        (self.sender, self.inbound)
    }
}

fn memory_stream(rx: mpsc::UnboundedReceiver<Outgoing>) -> FrameStream {
    UnboundedReceiverStream::new(rx)
        .take_while(|item| future::ready(*item != Outgoing::Close))
        .filter_map(|item| {
            future::ready(match item {
                Outgoing::Text(text) => Some(Ok(text)),
                Outgoing::Close => None,
            })
        })
        .boxed()
}
