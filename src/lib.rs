//! Trojan-over-WebSocket to TCP gateway
//!
//! Architecture:
//! - `core/`: handshake codec, inbound sequence, outbound connector, relay
//! - `transport/`: TLS termination and stream helpers
//! - `handler`: HTTP entry (upgrade, `/link`, 404)
//! - `server_runner`: listener and accept loop

pub mod config;
pub mod core;
pub mod error;
pub mod handler;
pub mod logger;
pub mod server_runner;
pub mod transport;
pub mod utils;

pub use crate::core::Gateway;
pub use error::{GatewayError, Result};
