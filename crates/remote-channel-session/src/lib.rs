//! Endpoint routing for remote execution channels.
//!
//! This crate provides:
//! - `EndpointRegistry` - Route requests to endpoints, replaying across reconnects
//! - `Dispatcher` / `EndpointAgent` - Run instructions on the endpoint side
//! - `Controller` - Accept endpoints and register them by session id

pub mod agent;
pub mod controller;
pub mod registry;

pub use agent::{Dispatcher, EndpointAgent, InstructionHandler};
pub use controller::Controller;
pub use registry::{EndpointRegistry, RegistryError};
