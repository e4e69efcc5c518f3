//! Configuration module for the gateway
//!
//! CLI arguments with environment variable support. Everything is validated
//! once at startup into an immutable [`GatewayConfig`] that the codec and the
//! connector read from for the lifetime of the process.

use clap::Parser;
use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::utils;

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '500ms', '5s', '2m' or plain seconds",
            s
        )
    })
}

/// CLI arguments for the gateway
///
/// Supports environment variables with TROJAN_WS_ prefix
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Trojan over WebSocket to TCP gateway")]
#[command(rename_all = "snake_case")]
pub struct CliArgs {
    /// Listen address
    #[arg(long, env = "TROJAN_WS_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Listen port
    #[arg(long, env = "TROJAN_WS_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Expected password as a 56 character SHA224 hex digest
    #[arg(long, env = "TROJAN_WS_PASSWORD_HASH")]
    pub password_hash: Option<String>,

    /// Plain password, hashed at startup (also enables GET /link)
    #[arg(long, env = "TROJAN_WS_PASSWORD")]
    pub password: Option<String>,

    /// Fallback relay: "host", "host:port" or "[v6]:port"
    #[arg(long, env = "TROJAN_WS_FALLBACK")]
    pub fallback: Option<String>,

    /// WebSocket path, "/" accepts any path
    #[arg(long, env = "TROJAN_WS_WS_PATH", default_value = "/")]
    pub ws_path: String,

    /// Port advertised in the GET /link descriptor
    #[arg(long, env = "TROJAN_WS_LINK_PORT", default_value_t = 443)]
    pub link_port: u16,

    /// TLS certificate file path (plain TCP when unset)
    #[arg(long, env = "TROJAN_WS_CERT_FILE")]
    pub cert_file: Option<PathBuf>,

    /// TLS private key file path
    #[arg(long, env = "TROJAN_WS_KEY_FILE")]
    pub key_file: Option<PathBuf>,

    /// Log mode: trace, debug, info, warn, error (default: info)
    #[arg(long, env = "TROJAN_WS_LOG_MODE", default_value = "info")]
    pub log_mode: String,

    // ==================== Performance Tuning ====================
    /// TCP connect timeout for each outbound attempt (default: 5s)
    #[arg(long, env = "TROJAN_WS_TCP_CONNECT_TIMEOUT", default_value = "5s", value_parser = parse_duration, help_heading = "Performance")]
    pub tcp_connect_timeout: Duration,

    /// Time to wait for the first response byte before trying the fallback (default: 2s)
    #[arg(long, env = "TROJAN_WS_OBSERVE_WINDOW", default_value = "2s", value_parser = parse_duration, help_heading = "Performance")]
    pub observe_window: Duration,

    /// Timeout for reading the HTTP request head (default: 10s)
    #[arg(long, env = "TROJAN_WS_REQUEST_TIMEOUT", default_value = "10s", value_parser = parse_duration, help_heading = "Performance")]
    pub request_timeout: Duration,

    /// TLS handshake timeout (default: 10s)
    #[arg(long, env = "TROJAN_WS_TLS_HANDSHAKE_TIMEOUT", default_value = "10s", value_parser = parse_duration, help_heading = "Performance")]
    pub tls_handshake_timeout: Duration,

    /// Buffer size for data transfer in bytes (default: 32KB)
    #[arg(long, env = "TROJAN_WS_BUFFER_SIZE", default_value_t = 32 * 1024, help_heading = "Performance")]
    pub buffer_size: usize,

    /// TCP listen backlog for pending connections (default: 1024)
    #[arg(
        long,
        env = "TROJAN_WS_TCP_BACKLOG",
        default_value_t = 1024,
        help_heading = "Performance"
    )]
    pub tcp_backlog: i32,

    /// Enable TCP_NODELAY for lower latency (default: true)
    #[arg(
        long,
        env = "TROJAN_WS_TCP_NODELAY",
        default_value_t = true,
        help_heading = "Performance"
    )]
    pub tcp_nodelay: bool,

    /// Maximum concurrent connections, 0 = unlimited (default: 0)
    #[arg(
        long,
        env = "TROJAN_WS_MAX_CONNECTIONS",
        default_value_t = 0,
        help_heading = "Performance"
    )]
    pub max_connections: usize,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Configured credential: 56 lowercase hex characters
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PasswordHash([u8; 56]);

impl PasswordHash {
    /// Length of the hex digest on the wire
    pub const LEN: usize = 56;

    /// Validate a SHA224 hex digest, any case
    pub fn parse(digest: &str) -> Result<Self> {
        let digest = digest.trim();
        if digest.len() != Self::LEN {
            return Err(GatewayError::Config(format!(
                "password hash must be {} hex characters, got {}",
                Self::LEN,
                digest.len()
            )));
        }
        if !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(GatewayError::Config(
                "password hash must only contain hex characters".to_string(),
            ));
        }
        let mut bytes = [0u8; 56];
        bytes.copy_from_slice(digest.to_ascii_lowercase().as_bytes());
        Ok(Self(bytes))
    }

    /// Derive the digest from a plain password
    pub fn from_password(password: &str) -> Self {
        Self(utils::password_to_hex(password))
    }

    /// Compare against the password field of a handshake
    pub fn matches(&self, candidate: &[u8]) -> bool {
        candidate.len() == Self::LEN && candidate.eq_ignore_ascii_case(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 56] {
        &self.0
    }
}

impl std::fmt::Debug for PasswordHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PasswordHash(..)")
    }
}

/// Fallback relay endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackRelay {
    /// Host name or IP literal (IPv6 without brackets)
    pub host: String,
    /// Explicit port; the destination port is used when absent
    pub port: Option<u16>,
}

impl FallbackRelay {
    /// Parse "host", "host:port", "[v6]:port", "[v6]" or a bare IPv6 literal
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(GatewayError::Config(
                "fallback relay address is empty".to_string(),
            ));
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| {
                GatewayError::Config(format!("fallback relay '{}': unclosed '['", s))
            })?;
            host.parse::<Ipv6Addr>().map_err(|_| {
                GatewayError::Config(format!("fallback relay '{}': invalid IPv6 address", s))
            })?;
            let port = match tail {
                "" => None,
                t => Some(parse_relay_port(s, t.strip_prefix(':').unwrap_or(t))?),
            };
            return Ok(Self {
                host: host.to_string(),
                port,
            });
        }

        if s.parse::<Ipv6Addr>().is_ok() {
            return Ok(Self {
                host: s.to_string(),
                port: None,
            });
        }

        match s.rsplit_once(':') {
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(GatewayError::Config(format!(
                        "fallback relay '{}': missing host",
                        s
                    )));
                }
                Ok(Self {
                    host: host.to_string(),
                    port: Some(parse_relay_port(s, port)?),
                })
            }
            None => Ok(Self {
                host: s.to_string(),
                port: None,
            }),
        }
    }

    /// Port to dial for a given destination port
    pub fn port_for(&self, destination_port: u16) -> u16 {
        self.port.unwrap_or(destination_port)
    }
}

fn parse_relay_port(raw: &str, port: &str) -> Result<u16> {
    match port.parse::<u16>() {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(GatewayError::Config(format!(
            "fallback relay '{}': invalid port '{}'",
            raw, port
        ))),
    }
}

impl std::fmt::Display for FallbackRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bracket = self.host.contains(':');
        match (bracket, self.port) {
            (true, Some(p)) => write!(f, "[{}]:{}", self.host, p),
            (true, None) => write!(f, "[{}]", self.host),
            (false, Some(p)) => write!(f, "{}:{}", self.host, p),
            (false, None) => write!(f, "{}", self.host),
        }
    }
}

/// Connection performance configuration
#[derive(Debug, Clone, Copy)]
pub struct ConnConfig {
    /// TCP connect timeout, per attempt
    pub connect_timeout: Duration,
    /// Wait for the first response byte on the direct leg
    pub observe_window: Duration,
    /// HTTP request head timeout
    pub request_timeout: Duration,
    /// TLS handshake timeout
    pub tls_handshake_timeout: Duration,
    /// Buffer size for data transfer
    pub buffer_size: usize,
    /// TCP listen backlog
    pub tcp_backlog: i32,
    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,
    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            observe_window: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
            tls_handshake_timeout: Duration::from_secs(10),
            buffer_size: 32 * 1024,
            tcp_backlog: 1024,
            tcp_nodelay: true,
            max_connections: 0,
        }
    }
}

impl ConnConfig {
    /// Create from CLI args
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            connect_timeout: cli.tcp_connect_timeout,
            observe_window: cli.observe_window,
            request_timeout: cli.request_timeout,
            tls_handshake_timeout: cli.tls_handshake_timeout,
            buffer_size: cli.buffer_size,
            tcp_backlog: cli.tcp_backlog,
            tcp_nodelay: cli.tcp_nodelay,
            max_connections: cli.max_connections,
        }
    }
}

/// Process-wide configuration, immutable after startup
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Host address to bind
    pub host: String,
    /// Port number
    pub port: u16,
    /// Expected password digest
    pub password_hash: PasswordHash,
    /// Plain password, only kept for the /link descriptor
    pub password: Option<String>,
    /// Fallback relay for unreachable or silent destinations
    pub fallback: FallbackRelay,
    /// WebSocket path ("/" accepts any)
    pub ws_path: String,
    /// Port advertised in the /link descriptor
    pub link_port: u16,
    /// TLS certificate file path
    pub cert: Option<PathBuf>,
    /// TLS private key file path
    pub key: Option<PathBuf>,
    /// Connection tuning
    pub conn: ConnConfig,
}

impl GatewayConfig {
    /// Validate CLI arguments and build the configuration
    pub fn from_cli(cli: &CliArgs) -> Result<Self> {
        let password_hash = match (cli.password_hash.as_deref(), cli.password.as_deref()) {
            (Some(digest), Some(password)) => {
                let parsed = PasswordHash::parse(digest)?;
                if parsed != PasswordHash::from_password(password) {
                    return Err(GatewayError::Config(
                        "password and password_hash do not agree".to_string(),
                    ));
                }
                parsed
            }
            (Some(digest), None) => PasswordHash::parse(digest)?,
            (None, Some(password)) if !password.is_empty() => {
                PasswordHash::from_password(password)
            }
            _ => {
                return Err(GatewayError::Config(
                    "one of password_hash or password is required".to_string(),
                ))
            }
        };

        let fallback = match cli.fallback.as_deref() {
            Some(raw) => FallbackRelay::parse(raw)?,
            None => {
                return Err(GatewayError::Config(
                    "fallback relay address is required (--fallback)".to_string(),
                ))
            }
        };

        if !cli.ws_path.starts_with('/') {
            return Err(GatewayError::Config(format!(
                "ws_path must start with '/': {}",
                cli.ws_path
            )));
        }

        match (&cli.cert_file, &cli.key_file) {
            (Some(cert), Some(key)) => {
                if !cert.exists() {
                    return Err(GatewayError::Config(format!(
                        "TLS certificate file not found: {}",
                        cert.display()
                    )));
                }
                if !key.exists() {
                    return Err(GatewayError::Config(format!(
                        "TLS private key file not found: {}",
                        key.display()
                    )));
                }
            }
            (None, None) => {}
            _ => {
                return Err(GatewayError::Config(
                    "cert_file and key_file must be set together".to_string(),
                ))
            }
        }

        if cli.buffer_size == 0 {
            return Err(GatewayError::Config(
                "buffer_size must be greater than 0".to_string(),
            ));
        }
        if cli.tcp_connect_timeout.is_zero() {
            return Err(GatewayError::Config(
                "tcp_connect_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            host: cli.host.clone(),
            port: cli.port,
            password_hash,
            password: cli.password.clone().filter(|p| !p.is_empty()),
            fallback,
            ws_path: cli.ws_path.clone(),
            link_port: cli.link_port,
            cert: cli.cert_file.clone(),
            key: cli.key_file.clone(),
            conn: ConnConfig::from_cli(cli),
        })
    }

    /// Whether TLS termination is configured
    pub fn has_tls(&self) -> bool {
        self.cert.is_some() && self.key.is_some()
    }
}
