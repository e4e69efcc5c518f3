//! Gateway wiring
//!
//! The Gateway holds everything sessions share: the validated configuration,
//! the handshake codec and the outbound connector. It is built once at startup
//! and handed to every connection behind an `Arc`.

use std::sync::Arc;

use super::hooks::Dialer;
use super::outbound::OutboundConnector;
use super::protocol::HeaderCodec;
use crate::config::{ConnConfig, GatewayConfig};

/// Process-wide gateway state, immutable after construction
pub struct Gateway {
    config: Arc<GatewayConfig>,
    codec: HeaderCodec,
    connector: OutboundConnector,
}

impl Gateway {
    /// Create a new gateway builder
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn conn_config(&self) -> &ConnConfig {
        &self.config.conn
    }

    pub fn codec(&self) -> &HeaderCodec {
        &self.codec
    }

    pub fn connector(&self) -> &OutboundConnector {
        &self.connector
    }
}

/// Builder for constructing a Gateway
pub struct GatewayBuilder {
    config: GatewayConfig,
    dialer: Option<Arc<dyn Dialer>>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            dialer: None,
        }
    }

    /// Set the outbound dialer (system resolver by default)
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn build(self) -> Gateway {
        let codec = HeaderCodec::new(self.config.password_hash);
        let mut connector = OutboundConnector::new(self.config.fallback.clone(), &self.config.conn);
        if let Some(dialer) = self.dialer {
            connector = connector.with_dialer(dialer);
        }

        Gateway {
            config: Arc::new(self.config),
            codec,
            connector,
        }
    }
}
