//! WebSocket-backed transports.
//!
//! The listener side comes from an axum upgrade, the dialing side from
//! `tokio-tungstenite`. Both are reduced to the same [`Transport`].

use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use remote_channel_core::ConnectionError;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_tungstenite::{WebSocketStream, tungstenite::Message as TungsteniteMessage};

use crate::transport::{FrameSender, FrameStream, Outgoing, Transport};

enum Incoming {
    Text(String),
    Skip,
    Close,
    Failed(String),
}

fn inbound_stream<S, M, E>(stream: S, classify: fn(M) -> Incoming) -> FrameStream
where
    S: Stream<Item = Result<M, E>> + Send + 'static,
    M: 'static,
    E: std::fmt::Display + 'static,
{
    stream
        .map(move |item| match item {
            Ok(msg) => classify(msg),
            Err(e) => Incoming::Failed(e.to_string()),
        })
        .take_while(|item| future::ready(!matches!(item, Incoming::Close)))
        .filter_map(|item| {
            future::ready(match item {
                Incoming::Text(text) => Some(Ok(text)),
                Incoming::Failed(e) => Some(Err(ConnectionError::Transport(e))),
                Incoming::Skip | Incoming::Close => None,
            })
        })
        .boxed()
}

fn spawn_writer<K, M, E>(mut sink: K, to_message: fn(Outgoing) -> M) -> FrameSender
where
    K: Sink<M, Error = E> + Unpin + Send + 'static,
    M: Send + 'static,
    E: std::fmt::Display,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();

    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            let closing = item == Outgoing::Close;
            if let Err(e) = sink.send(to_message(item)).await {
                tracing::debug!("WebSocket write failed: {e}");
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    FrameSender::new(tx)
}

fn classify_axum(msg: AxumMessage) -> Incoming {
    match msg {
        AxumMessage::Text(text) => Incoming::Text(text.as_str().to_owned()),
        AxumMessage::Binary(data) => match String::from_utf8(data.to_vec()) {
            Ok(text) => Incoming::Text(text),
            Err(_) => Incoming::Skip,
        },
        AxumMessage::Close(_) => Incoming::Close,
        AxumMessage::Ping(_) | AxumMessage::Pong(_) => Incoming::Skip,
    }
}

fn to_axum(item: Outgoing) -> AxumMessage {
    match item {
        Outgoing::Text(text) => AxumMessage::Text(text.into()),
        Outgoing::Close => AxumMessage::Close(None),
    }
}

fn classify_tungstenite(msg: TungsteniteMessage) -> Incoming {
    match msg {
        TungsteniteMessage::Text(text) => Incoming::Text(text.as_str().to_owned()),
        TungsteniteMessage::Binary(data) => match String::from_utf8(data.to_vec()) {
            Ok(text) => Incoming::Text(text),
            Err(_) => Incoming::Skip,
        },
        TungsteniteMessage::Close(_) => Incoming::Close,
        TungsteniteMessage::Ping(_) | TungsteniteMessage::Pong(_) | TungsteniteMessage::Frame(_) => {
            Incoming::Skip
        }
    }
}

fn to_tungstenite(item: Outgoing) -> TungsteniteMessage {
    match item {
        Outgoing::Text(text) => TungsteniteMessage::Text(text.into()),
        Outgoing::Close => TungsteniteMessage::Close(None),
    }
}

impl Transport {
    /// Wrap a socket accepted through an axum upgrade.
    #[must_use]
    pub fn from_axum(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self::new(
            spawn_writer(sink, to_axum),
            inbound_stream(stream, classify_axum),
        )
    }

    /// Wrap a client-side `tokio-tungstenite` stream.
    #[must_use]
    pub fn from_tungstenite<S>(socket: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = socket.split();
        Self::new(
            spawn_writer(sink, to_tungstenite),
            inbound_stream(stream, classify_tungstenite),
        )
    }

    /// Dial a WebSocket listener.
    ///
    /// `address` may be a full `ws://` / `wss://` URL or a bare `host:port`.
    ///
    /// # Errors
    /// Returns a transport error if the connection or upgrade fails.
    pub async fn connect(address: &str) -> Result<Self, ConnectionError> {
        let url = normalize_url(address);
        let (socket, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        tracing::debug!(%url, "WebSocket connected");
        Ok(Self::from_tungstenite(socket))
    }
}

/// Turn `host:port` into `ws://host:port/`; full URLs pass through.
#[must_use]
pub fn normalize_url(address: &str) -> String {
    if address.contains("://") {
        address.to_owned()
    } else {
        format!("ws://{}/", address.trim_end_matches('/'))
    }
}
