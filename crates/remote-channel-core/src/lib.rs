//! Core building blocks for remote execution channels.
//!
//! This crate provides:
//! - `ErrorEnvelope` - Failure marshaling shared by both frame layers
//! - `WireFrame` / `PortFrame` - Frame schemas
//! - `RequestTracker` - Id allocation and response correlation
//! - `ChannelConfig` - Timeouts, liveness and reconnection settings

pub mod config;
pub mod error;
pub mod protocol;
pub mod tracker;

pub use config::{ChannelConfig, ConfigError, LivenessConfig, ReconnectConfig};
pub use error::{ChannelError, ConnectionError, ErrorEnvelope, ErrorKind, RemoteError};
pub use protocol::{Handshake, Invocation, PortFrame, RequestId, Role, WireFrame};
pub use tracker::{PendingResponse, RequestTracker};
