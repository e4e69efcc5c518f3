//! Core gateway module
//!
//! This module contains the protocol bridge:
//! - Handshake parsing (Trojan) and early data decoding
//! - WebSocket inbound sequence and safe close
//! - Outbound connection with fallback relay
//! - Session driver and bidirectional relay

pub mod early_data;
pub mod hooks;
mod inbound;
mod outbound;
mod protocol;
mod relay;
mod server;
mod ws;

pub use hooks::{Dialer, TcpDialer};
pub use inbound::InboundStream;
pub use outbound::{Connection, OutboundConnector};
pub use protocol::{Address, HeaderCodec, TrojanCmd, TrojanRequest};
pub use relay::{run_session, Session, SessionState, TransferSummary};
pub use server::{Gateway, GatewayBuilder};
pub use ws::{SocketState, WsSink};
