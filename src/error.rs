use std::io;
use thiserror::Error;

/// Gateway error type
///
/// Handshake and transport variants are local to one session. Only `Config`
/// is fatal, and only at startup.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Bad or missing credential, relay address or option
    #[error("Configuration error: {0}")]
    Config(String),

    /// Handshake shorter than the password field
    #[error("Invalid data: {0}")]
    InvalidData(&'static str),

    /// Password field does not match the configured digest
    #[error("Invalid password")]
    InvalidPassword,

    /// Truncated or malformed request header
    #[error("Invalid request: {0}")]
    InvalidRequest(&'static str),

    /// Command other than CONNECT
    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    /// Address type tag other than IPv4, domain or IPv6
    #[error("Invalid address type: {0}")]
    InvalidAddressType(u8),

    /// Direct and fallback connection attempts both failed
    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// I/O failure on either leg after the session was established
    #[error("Transport error: {0}")]
    Transport(String),

    /// Listener and HTTP surface I/O
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl GatewayError {
    /// Wrap an I/O failure on an established leg
    pub fn transport(err: impl std::fmt::Display) -> Self {
        GatewayError::Transport(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, GatewayError>;
