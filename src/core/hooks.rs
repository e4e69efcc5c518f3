//! Hook traits for extensibility
//!
//! The outbound connector reaches the network through [`Dialer`], so a custom
//! dialer can be injected into the gateway (tests use one to record attempts).

use async_trait::async_trait;
use std::io;
use tokio::net::TcpStream;

/// Opens outbound TCP connections
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `host:port`. `host` is a domain name or an IP literal
    /// (IPv6 without brackets).
    async fn dial(&self, host: &str, port: u16) -> io::Result<TcpStream>;
}

/// Dials with the system resolver
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        TcpStream::connect((host, port)).await
    }
}
