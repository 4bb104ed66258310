//! Connection layer for remote execution channels.
//!
//! This crate provides:
//! - `Transport` - One bidirectional text-frame link (in-memory or WebSocket)
//! - `Bus` - Handshake, request/response and publish/subscribe over a link
//! - `Port` - Per-endpoint port-frame links, standalone or riding a bus
//! - `Listener` - WebSocket server accepting buses (feature: websocket)

pub mod bus;
pub mod liveness;
pub mod port;
pub mod transport;

#[cfg(feature = "websocket")]
pub mod listener;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use bus::{Bus, ConnectionState, HandlerFuture, LifecycleEvent, SubscriptionId};
#[cfg(feature = "websocket")]
pub use listener::{ListenError, Listener};
pub use port::{Port, PortSender};
pub use transport::{FrameSender, FrameStream, Transport};
