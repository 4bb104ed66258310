//! Failure taxonomy and the envelope that carries failures across a link.
//!
//! Both frame layers use [`ErrorEnvelope`]: wire frames embed it as an
//! object, port frames embed its JSON text. Decoding always goes through
//! [`ErrorEnvelope::into_error`], so the two layers cannot drift apart.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::protocol::RequestId;

/// Discriminator carried in every [`ErrorEnvelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The peer ran the instruction and it failed.
    #[serde(rename = "RemoteExecutionError")]
    RemoteExecution,
    /// The peer could not reach, or lost, whatever it needed.
    #[serde(rename = "ConnectionError")]
    Connection,
    /// A frame was malformed or could not be routed.
    #[serde(rename = "ProtocolError")]
    Protocol,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RemoteExecution => "RemoteExecutionError",
            Self::Connection => "ConnectionError",
            Self::Protocol => "ProtocolError",
        };
        f.write_str(name)
    }
}

/// Serialized failure attached to a response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Failure class.
    pub kind: ErrorKind,
    /// Human readable message.
    pub message: String,
    /// Optional structured detail supplied by the failing side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl ErrorEnvelope {
    /// Create an envelope without detail.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    /// Attach structured detail.
    #[must_use]
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Reconstruct the typed failure this envelope describes.
    #[must_use]
    pub fn into_error(self) -> ChannelError {
        match self.kind {
            ErrorKind::RemoteExecution => ChannelError::Remote(RemoteError {
                message: self.message,
                detail: self.detail,
            }),
            ErrorKind::Connection => ChannelError::Connection(ConnectionError::Peer(self.message)),
            ErrorKind::Protocol => ChannelError::Protocol(self.message),
        }
    }

    /// Encode for the `error` field of a port frame.
    #[must_use]
    pub fn to_port_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.message.clone())
    }

    /// Decode the `error` field of a port frame.
    ///
    /// Text that is not an envelope still reports a failed execution, so it
    /// becomes a remote execution error carrying the raw text.
    #[must_use]
    pub fn from_port_string(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|_| Self::new(ErrorKind::RemoteExecution, raw))
    }
}

impl From<&ChannelError> for ErrorEnvelope {
    fn from(err: &ChannelError) -> Self {
        match err {
            ChannelError::Remote(remote) => Self::from(remote.clone()),
            other => Self::new(other.kind(), other.to_string()),
        }
    }
}

impl From<RemoteError> for ErrorEnvelope {
    fn from(err: RemoteError) -> Self {
        Self {
            kind: ErrorKind::RemoteExecution,
            message: err.message,
            detail: err.detail,
        }
    }
}

/// Failure raised by an instruction the peer received and ran.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("remote execution failed: {message}")]
pub struct RemoteError {
    /// Message reported by the peer.
    pub message: String,
    /// Structured detail reported by the peer.
    pub detail: Option<Value>,
}

impl RemoteError {
    /// Create a remote error from a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    /// Create a remote error from anything displayable.
    #[must_use]
    pub fn from_display(err: impl fmt::Display) -> Self {
        Self::new(err.to_string())
    }

    /// Attach structured detail.
    #[must_use]
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Failure to establish, keep, or get a timely answer over a link.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("handshake not observed within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("liveness probe unanswered")]
    LivenessTimeout,
    #[error("connection not established")]
    NotConnected,
    #[error("connection closed")]
    Closed,
    #[error("endpoint {0} is unreachable")]
    Unreachable(String),
    #[error("peer reported connection failure: {0}")]
    Peer(String),
}

/// Every failure a caller of the channel can observe.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("request {0} timed out")]
    Timeout(RequestId),
    #[error("request {0} was cancelled")]
    Cancelled(RequestId),
}

impl ChannelError {
    /// Envelope discriminator for this failure.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Remote(_) => ErrorKind::RemoteExecution,
            Self::Connection(_) | Self::Timeout(_) | Self::Cancelled(_) => ErrorKind::Connection,
            Self::Protocol(_) => ErrorKind::Protocol,
        }
    }

    /// Whether the peer ran the instruction and it failed.
    #[must_use]
    pub const fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// Whether the failure concerns the link rather than the instruction.
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(self.kind(), ErrorKind::Connection)
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
