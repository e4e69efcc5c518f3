//! Trojan handshake parsing
//!
//! The first WebSocket message carries the Trojan request:
//! - 56-byte password (SHA224 hex encoded)
//! - CRLF
//! - Command (1 byte: CONNECT=1)
//! - Address type (1 byte) + address
//! - Port (2 bytes, big-endian)
//! - Payload: every byte after the port, forwarded untouched

use bytes::Bytes;
use std::net::Ipv4Addr;

use crate::config::PasswordHash;
use crate::error::{GatewayError, Result};

/// Address type constants
const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

/// Offset of the command byte (password + CRLF)
const CMD_OFFSET: usize = PasswordHash::LEN + 2;

/// Bytes required after the CRLF: cmd + atyp + shortest address + port
const MIN_REQUEST_LEN: usize = 6;

/// Trojan command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrojanCmd {
    /// TCP connect
    Connect = 1,
}

impl TryFrom<u8> for TrojanCmd {
    type Error = GatewayError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(TrojanCmd::Connect),
            other => Err(GatewayError::UnsupportedCommand(other)),
        }
    }
}

/// Destination address, tagged by the wire address type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address
    IPv4([u8; 4]),
    /// Domain name
    Domain(String),
    /// IPv6 address
    IPv6([u8; 16]),
}

impl Address {
    /// Decode address from buffer starting at the type byte
    ///
    /// Returns the address and the number of bytes consumed, type byte included.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let atyp = *buf
            .first()
            .ok_or(GatewayError::InvalidRequest("missing address type"))?;
        let body = &buf[1..];
        match atyp {
            ATYP_IPV4 => {
                let ip: [u8; 4] = body
                    .get(..4)
                    .and_then(|s| s.try_into().ok())
                    .ok_or(GatewayError::InvalidRequest("truncated IPv4 address"))?;
                Ok((Address::IPv4(ip), 1 + 4))
            }
            ATYP_DOMAIN => {
                let len = *body
                    .first()
                    .ok_or(GatewayError::InvalidRequest("missing domain length"))?
                    as usize;
                if len == 0 {
                    return Err(GatewayError::InvalidRequest("empty domain"));
                }
                let raw = body
                    .get(1..1 + len)
                    .ok_or(GatewayError::InvalidRequest("truncated domain"))?;
                let domain = std::str::from_utf8(raw)
                    .map_err(|_| GatewayError::InvalidRequest("invalid domain encoding"))?;
                Ok((Address::Domain(domain.to_string()), 1 + 1 + len))
            }
            ATYP_IPV6 => {
                let ip: [u8; 16] = body
                    .get(..16)
                    .and_then(|s| s.try_into().ok())
                    .ok_or(GatewayError::InvalidRequest("truncated IPv6 address"))?;
                Ok((Address::IPv6(ip), 1 + 16))
            }
            other => Err(GatewayError::InvalidAddressType(other)),
        }
    }

    /// Encode address to buffer, type byte included
    /// Returns the number of bytes written
    pub fn encode(&self, buf: &mut Vec<u8>) -> usize {
        let start_len = buf.len();
        match self {
            Address::IPv4(ip) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(ip);
            }
            Address::Domain(domain) => {
                buf.push(ATYP_DOMAIN);
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
            }
            Address::IPv6(ip) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(ip);
            }
        }
        buf.len() - start_len
    }

    /// Host string: dotted IPv4, the domain, or eight uncompressed IPv6 hex groups
    pub fn host(&self) -> String {
        match self {
            Address::IPv4(ip) => Ipv4Addr::from(*ip).to_string(),
            Address::Domain(domain) => domain.clone(),
            Address::IPv6(ip) => ip
                .chunks_exact(2)
                .map(|g| format!("{:x}", u16::from_be_bytes([g[0], g[1]])))
                .collect::<Vec<_>>()
                .join(":"),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.host())
    }
}

/// Decoded Trojan CONNECT request
#[derive(Debug)]
pub struct TrojanRequest {
    /// Command type
    pub cmd: TrojanCmd,
    /// Destination address
    pub addr: Address,
    /// Destination port
    pub port: u16,
    /// First payload to forward (zero-copy slice of the handshake buffer)
    pub payload: Bytes,
}

impl TrojanRequest {
    /// `host:port` form for logging, with IPv6 in brackets
    pub fn target(&self) -> String {
        match self.addr {
            Address::IPv6(_) => format!("[{}]:{}", self.addr, self.port),
            _ => format!("{}:{}", self.addr, self.port),
        }
    }

    /// Encode the request; the payload follows the port directly
    pub fn encode(&self, password: &PasswordHash) -> Bytes {
        let mut buf = Vec::with_capacity(CMD_OFFSET + 24 + self.payload.len());
        buf.extend_from_slice(password.as_bytes());
        buf.extend_from_slice(b"\r\n");
        buf.push(self.cmd as u8);
        self.addr.encode(&mut buf);
        buf.extend_from_slice(&self.port.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Bytes::from(buf)
    }
}

/// Handshake decoder bound to the configured credential
#[derive(Debug, Clone)]
pub struct HeaderCodec {
    password: PasswordHash,
}

impl HeaderCodec {
    pub fn new(password: PasswordHash) -> Self {
        Self { password }
    }

    /// Decode the handshake carried by the first inbound chunk
    pub fn parse(&self, buf: Bytes) -> Result<TrojanRequest> {
        if buf.len() < PasswordHash::LEN {
            return Err(GatewayError::InvalidData("handshake shorter than password"));
        }
        if !self.password.matches(&buf[..PasswordHash::LEN]) {
            return Err(GatewayError::InvalidPassword);
        }

        // Bytes 56..58 are the CRLF after the password; not checked
        if buf.len() < CMD_OFFSET + MIN_REQUEST_LEN {
            return Err(GatewayError::InvalidRequest("request header too short"));
        }

        let cmd = TrojanCmd::try_from(buf[CMD_OFFSET])?;
        let (addr, addr_len) = Address::decode(&buf[CMD_OFFSET + 1..])?;

        let port_pos = CMD_OFFSET + 1 + addr_len;
        let port = buf
            .get(port_pos..port_pos + 2)
            .map(|p| u16::from_be_bytes([p[0], p[1]]))
            .ok_or(GatewayError::InvalidRequest("truncated port"))?;

        Ok(TrojanRequest {
            cmd,
            addr,
            port,
            payload: buf.slice(port_pos + 2..),
        })
    }
}
