//! Frame schemas for both link layers.
//!
//! Wire frames travel over a raw connection driven by the channel bus.
//! Port frames travel over a per-endpoint link owned by the registry.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, de};
use serde_json::{Map, Value};

use crate::error::{ChannelError, ErrorEnvelope, ErrorKind};

/// Request identifier, unique and strictly increasing per tracker.
pub type RequestId = u64;

/// Reserved channel carrying the handshake.
pub const INITIAL_CONNECTION_CHANNEL: &str = "initialConnection";
/// Reserved channel for liveness probes.
pub const PING_CHANNEL: &str = "ping";
/// Reserved channel for liveness answers.
pub const PONG_CHANNEL: &str = "pong";
/// Channel used by the controller to ride port frames over a bus.
pub const ENDPOINT_PORT_CHANNEL: &str = "endpointPort";

/// Session id used when none is given.
pub const DEFAULT_SESSION_ID: &str = "default";

/// Whether a channel name is reserved by the bus itself.
#[must_use]
pub fn is_reserved_channel(channel: &str) -> bool {
    matches!(
        channel,
        INITIAL_CONNECTION_CHANNEL | PING_CHANNEL | PONG_CHANNEL
    )
}

/// Side of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Issues instructions.
    Controller,
    /// Executes instructions.
    Endpoint,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Controller => f.write_str("controller"),
            Self::Endpoint => f.write_str("endpoint"),
        }
    }
}

/// Handshake payload exchanged on [`INITIAL_CONNECTION_CHANNEL`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub role: Role,
    pub session_id: String,
}

impl Handshake {
    #[must_use]
    pub fn new(role: Role, session_id: impl Into<String>) -> Self {
        Self {
            role,
            session_id: session_id.into(),
        }
    }
}

/// Frame exchanged over a raw connection.
///
/// Decoding is keyed on field names: `channel` marks a request, `result` a
/// success and `error` a failure. A frame matching none of these shapes, or
/// carrying fields outside its shape, is rejected.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum WireFrame {
    /// Request or published event. Events carry no id and get no answer.
    Request {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<RequestId>,
        channel: String,
        payload: Value,
    },
    /// Response carrying a failure.
    Failure { id: RequestId, error: ErrorEnvelope },
    /// Response carrying a result.
    Success { id: RequestId, result: Value },
}

type Fields = Map<String, Value>;

fn take_id(fields: &mut Fields) -> Result<Option<RequestId>, String> {
    match fields.remove("id") {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| format!("invalid id {value}")),
    }
}

fn reject_leftovers(fields: &Fields) -> Result<(), String> {
    fields
        .keys()
        .next()
        .map_or(Ok(()), |key| Err(format!("unexpected field `{key}`")))
}

/// An `error` that is not an envelope still fails the request, as a
/// protocol error naming what arrived.
fn wire_envelope(raw: Value) -> ErrorEnvelope {
    match serde_json::from_value::<ErrorEnvelope>(raw.clone()) {
        Ok(envelope) => envelope,
        Err(e) => ErrorEnvelope::new(
            ErrorKind::Protocol,
            format!("undecodable error envelope {raw}: {e}"),
        ),
    }
}

impl TryFrom<Fields> for WireFrame {
    type Error = String;

    fn try_from(mut fields: Fields) -> Result<Self, Self::Error> {
        let id = take_id(&mut fields)?;
        let frame = if let Some(channel) = fields.remove("channel") {
            let Value::String(channel) = channel else {
                return Err(format!("channel must be a string, got {channel}"));
            };
            let payload = fields.remove("payload").unwrap_or(Value::Null);
            Self::Request {
                id,
                channel,
                payload,
            }
        } else {
            let id = id.ok_or("response without id")?;
            match (fields.remove("result"), fields.remove("error")) {
                (Some(result), None) => Self::Success { id, result },
                (None, Some(error)) => Self::Failure {
                    id,
                    error: wire_envelope(error),
                },
                (Some(_), Some(_)) => {
                    return Err(format!("response {id} carries both result and error"));
                }
                (None, None) => {
                    return Err(format!("frame {id} has no channel, result or error"));
                }
            }
        };
        reject_leftovers(&fields)?;
        Ok(frame)
    }
}

impl<'de> Deserialize<'de> for WireFrame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Self::try_from(Fields::deserialize(deserializer)?).map_err(de::Error::custom)
    }
}

impl WireFrame {
    /// Request expecting a response.
    #[must_use]
    pub fn request(id: RequestId, channel: impl Into<String>, payload: Value) -> Self {
        Self::Request {
            id: Some(id),
            channel: channel.into(),
            payload,
        }
    }

    /// Event nobody answers.
    #[must_use]
    pub fn publish(channel: impl Into<String>, payload: Value) -> Self {
        Self::Request {
            id: None,
            channel: channel.into(),
            payload,
        }
    }

    /// Response for `id`.
    #[must_use]
    pub fn response(id: RequestId, outcome: Result<Value, ErrorEnvelope>) -> Self {
        match outcome {
            Ok(result) => Self::Success { id, result },
            Err(error) => Self::Failure { id, error },
        }
    }

    /// Encode as JSON text.
    ///
    /// # Errors
    /// Returns a protocol error if the payload cannot be serialized.
    pub fn encode(&self) -> Result<String, ChannelError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from JSON text.
    ///
    /// # Errors
    /// Returns a protocol error for malformed frames.
    pub fn decode(text: &str) -> Result<Self, ChannelError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Request id, if any.
    #[must_use]
    pub const fn id(&self) -> Option<RequestId> {
        match self {
            Self::Request { id, .. } => *id,
            Self::Failure { id, .. } | Self::Success { id, .. } => Some(*id),
        }
    }
}

/// Frame exchanged between the registry and one endpoint link.
///
/// Exactly one of `message` and `error` must be present.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PortFrame {
    /// Response carrying a serialized [`ErrorEnvelope`].
    Failure { id: RequestId, error: String },
    /// Request payload, or successful response payload.
    Message { id: RequestId, message: Value },
}

impl TryFrom<Fields> for PortFrame {
    type Error = String;

    fn try_from(mut fields: Fields) -> Result<Self, Self::Error> {
        let id = take_id(&mut fields)?.ok_or("port frame without id")?;
        let frame = match (fields.remove("message"), fields.remove("error")) {
            (Some(message), None) => Self::Message { id, message },
            (None, Some(Value::String(error))) => Self::Failure { id, error },
            (None, Some(error)) => Self::Failure {
                id,
                error: error.to_string(),
            },
            (Some(_), Some(_)) => {
                return Err(format!("port frame {id} carries both message and error"));
            }
            (None, None) => return Err(format!("port frame {id} has no message or error")),
        };
        reject_leftovers(&fields)?;
        Ok(frame)
    }
}

impl<'de> Deserialize<'de> for PortFrame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Self::try_from(Fields::deserialize(deserializer)?).map_err(de::Error::custom)
    }
}

impl PortFrame {
    /// Request or success frame.
    #[must_use]
    pub const fn message(id: RequestId, message: Value) -> Self {
        Self::Message { id, message }
    }

    /// Response frame for an execution outcome.
    #[must_use]
    pub fn outcome(id: RequestId, outcome: Result<Value, ErrorEnvelope>) -> Self {
        match outcome {
            Ok(message) => Self::Message { id, message },
            Err(envelope) => Self::Failure {
                id,
                error: envelope.to_port_string(),
            },
        }
    }

    #[must_use]
    pub const fn id(&self) -> RequestId {
        match self {
            Self::Failure { id, .. } | Self::Message { id, .. } => *id,
        }
    }

    /// Split a response into its id and reconstructed outcome.
    #[must_use]
    pub fn into_outcome(self) -> (RequestId, Result<Value, ChannelError>) {
        match self {
            Self::Message { id, message } => (id, Ok(message)),
            Self::Failure { id, error } => {
                (id, Err(ErrorEnvelope::from_port_string(&error).into_error()))
            }
        }
    }
}

/// Instruction addressed to an endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub instruction: String,
    #[serde(default)]
    pub args: Value,
}

impl Invocation {
    #[must_use]
    pub fn new(instruction: impl Into<String>, args: Value) -> Self {
        Self {
            instruction: instruction.into(),
            args,
        }
    }
}
