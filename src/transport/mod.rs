//! Transport layer
//!
//! Accepted sockets are either plain TCP or TLS-terminated TCP. The HTTP
//! entry reads the request head itself and replays it to the WebSocket
//! handshake through [`PrefixedStream`].

mod prefixed;
mod tls;

pub use prefixed::PrefixedStream;
pub use tls::TlsTransportListener;

use std::net::SocketAddr;

/// Transport type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// Plain TCP
    Tcp,
    /// TCP + TLS
    Tls,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportType::Tcp => write!(f, "tcp"),
            TransportType::Tls => write!(f, "tls"),
        }
    }
}

/// Connection metadata
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    /// Client peer address
    pub peer_addr: SocketAddr,
    /// Transport type
    pub transport_type: TransportType,
}

impl ConnectionMeta {
    /// Scheme the client used, for logs
    pub fn scheme(&self) -> &'static str {
        match self.transport_type {
            TransportType::Tcp => "ws",
            TransportType::Tls => "wss",
        }
    }
}
