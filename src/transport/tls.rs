//! TLS termination
//!
//! Loads the PEM certificate chain and private key once at startup.

use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

use crate::error::{GatewayError, Result};

/// TLS listener helper
pub struct TlsTransportListener;

impl TlsTransportListener {
    /// Build an acceptor from certificate and key files
    pub fn acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
        Ok(TlsAcceptor::from(Self::load_tls_config(cert_path, key_path)?))
    }

    /// Create TLS config from certificate and key files
    pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
        let cert_file = File::open(cert_path).map_err(|e| {
            GatewayError::Config(format!("cannot open {}: {}", cert_path.display(), e))
        })?;
        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .filter_map(|r| r.ok())
            .collect();
        if certs.is_empty() {
            return Err(GatewayError::Config(format!(
                "no certificates found in {}",
                cert_path.display()
            )));
        }

        let key_file = File::open(key_path).map_err(|e| {
            GatewayError::Config(format!("cannot open {}: {}", key_path.display(), e))
        })?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
            .map_err(|e| GatewayError::Config(format!("{}: {}", key_path.display(), e)))?
            .ok_or_else(|| {
                GatewayError::Config(format!("no private key found in {}", key_path.display()))
            })?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| GatewayError::Config(format!("invalid certificate or key: {}", e)))?;

        // WebSocket upgrades are HTTP/1.1 only
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        if let Ok(ticketer) = rustls::crypto::ring::Ticketer::new() {
            config.ticketer = ticketer;
        }

        Ok(Arc::new(config))
    }
}
