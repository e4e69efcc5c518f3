//! Outbound TCP connection with fallback relay
//!
//! The destination is dialed directly first. If that attempt fails, or the
//! destination does not answer the first payload within the observation
//! window, the same payload is replayed once through the fallback relay.

use bytes::Bytes;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use super::hooks::{Dialer, TcpDialer};
use super::protocol::Address;
use crate::config::{ConnConfig, FallbackRelay};
use crate::error::{GatewayError, Result};
use crate::logger::log;

/// Why a single attempt was abandoned
#[derive(Debug, Error)]
enum AttemptError {
    #[error("connect failed: {0}")]
    Connect(io::Error),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("write failed: {0}")]
    Write(io::Error),
    #[error("closed before responding")]
    ClosedEarly,
    #[error("failed before responding: {0}")]
    Peer(io::Error),
    #[error("no response within {0:?}")]
    Silent(Duration),
}

/// Established outbound leg
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    /// Whether the fallback relay carries the session
    pub via_fallback: bool,
}

/// Direct-then-fallback connector, shared by all sessions
pub struct OutboundConnector {
    dialer: Arc<dyn Dialer>,
    fallback: FallbackRelay,
    connect_timeout: Duration,
    observe_window: Duration,
    tcp_nodelay: bool,
}

impl OutboundConnector {
    pub fn new(fallback: FallbackRelay, conn: &ConnConfig) -> Self {
        Self {
            dialer: Arc::new(TcpDialer),
            fallback,
            connect_timeout: conn.connect_timeout,
            observe_window: conn.observe_window,
            tcp_nodelay: conn.tcp_nodelay,
        }
    }

    /// Replace the dialer used for both attempts
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn fallback(&self) -> &FallbackRelay {
        &self.fallback
    }

    /// Connect to `addr:port` and write `payload`
    ///
    /// At most two attempts are made: direct, then the fallback relay.
    pub async fn connect(&self, addr: &Address, port: u16, payload: &Bytes) -> Result<Connection> {
        let host = addr.host();

        let direct_err = match self.attempt(&host, port, payload, true).await {
            Ok(stream) => {
                log::debug!(host = %host, port = port, "Connected to destination (direct)");
                return Ok(Connection {
                    stream,
                    via_fallback: false,
                });
            }
            Err(e) => e,
        };

        let relay_port = self.fallback.port_for(port);
        log::debug!(
            host = %host,
            port = port,
            reason = %direct_err,
            relay = %self.fallback.host,
            relay_port = relay_port,
            "Direct attempt abandoned, retrying via fallback relay"
        );

        match self
            .attempt(&self.fallback.host, relay_port, payload, false)
            .await
        {
            Ok(stream) => {
                log::debug!(host = %host, port = port, "Connected to destination (fallback)");
                Ok(Connection {
                    stream,
                    via_fallback: true,
                })
            }
            Err(relay_err) => Err(GatewayError::UpstreamUnreachable(format!(
                "{}:{}: direct {}; fallback {}",
                host, port, direct_err, relay_err
            ))),
        }
    }

    async fn attempt(
        &self,
        host: &str,
        port: u16,
        payload: &Bytes,
        observe: bool,
    ) -> std::result::Result<TcpStream, AttemptError> {
        let mut stream = match tokio::time::timeout(
            self.connect_timeout,
            self.dialer.dial(host, port),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(AttemptError::Connect(e)),
            Err(_) => return Err(AttemptError::ConnectTimeout(self.connect_timeout)),
        };

        if self.tcp_nodelay {
            let _ = stream.set_nodelay(true);
        }

        if !payload.is_empty() {
            stream
                .write_all(payload)
                .await
                .map_err(AttemptError::Write)?;
            // Nothing was sent, so there is nothing to wait for
            if observe {
                self.observe(&stream).await?;
            }
        }

        Ok(stream)
    }

    /// Wait for the first response byte without consuming it
    async fn observe(&self, stream: &TcpStream) -> std::result::Result<(), AttemptError> {
        let mut probe = [0u8; 1];
        match tokio::time::timeout(self.observe_window, stream.peek(&mut probe)).await {
            Ok(Ok(0)) => Err(AttemptError::ClosedEarly),
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(AttemptError::Peer(e)),
            Err(_) => Err(AttemptError::Silent(self.observe_window)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// How the recording dialer treats a host
    #[derive(Clone, Copy)]
    enum Route {
        To(SocketAddr),
        Refuse,
        Hang,
    }

    /// Dialer that maps host names to local listeners and records attempts
    #[derive(Default)]
    struct RecordingDialer {
        routes: HashMap<String, Route>,
        attempts: Mutex<Vec<(String, u16)>>,
    }

    impl RecordingDialer {
        fn route(mut self, host: &str, route: Route) -> Self {
            self.routes.insert(host.to_string(), route);
            self
        }

        fn attempts(&self) -> Vec<(String, u16)> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Dialer for RecordingDialer {
        async fn dial(&self, host: &str, port: u16) -> io::Result<TcpStream> {
            self.attempts.lock().unwrap().push((host.to_string(), port));
            match self.routes.get(host).copied().unwrap_or(Route::Refuse) {
                Route::To(addr) => TcpStream::connect(addr).await,
                Route::Refuse => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")),
                Route::Hang => std::future::pending().await,
            }
        }
    }

    fn conn_config() -> ConnConfig {
        ConnConfig {
            connect_timeout: Duration::from_millis(200),
            observe_window: Duration::from_millis(200),
            ..ConnConfig::default()
        }
    }

    fn connector(fallback: &str, dialer: Arc<RecordingDialer>) -> OutboundConnector {
        OutboundConnector::new(FallbackRelay::parse(fallback).unwrap(), &conn_config())
            .with_dialer(dialer)
    }

    /// Accepts one connection, reads the payload and replies with `reply`
    async fn replying_server(
        reply: &'static [u8],
    ) -> (SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            buf.truncate(n);
            if !reply.is_empty() {
                stream.write_all(reply).await.unwrap();
            }
            // Keep the socket open until the client hangs up
            let mut rest = [0u8; 16];
            let _ = stream.read(&mut rest).await;
            buf
        });
        (addr, handle)
    }

    /// Accepts one connection and hangs up without a word
    async fn closing_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await;
        });
        addr
    }

    /// Accepts one connection and never answers
    async fn silent_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });
        addr
    }

    fn domain(name: &str) -> Address {
        Address::Domain(name.to_string())
    }

    #[tokio::test]
    async fn test_direct_success_keeps_response_unread() {
        let (dest, server) = replying_server(b"pong").await;
        let dialer = Arc::new(RecordingDialer::default().route("dest.test", Route::To(dest)));
        let connector = connector("relay.test", dialer.clone());

        let mut conn = connector
            .connect(&domain("dest.test"), 443, &Bytes::from_static(b"ping"))
            .await
            .unwrap();
        assert!(!conn.via_fallback);
        assert_eq!(dialer.attempts(), vec![("dest.test".to_string(), 443)]);

        let mut reply = [0u8; 4];
        conn.stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");

        drop(conn);
        assert_eq!(server.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_refused_direct_retries_fallback_once_with_same_port_and_payload() {
        let (relay, server) = replying_server(b"ok").await;
        let dialer = Arc::new(
            RecordingDialer::default()
                .route("blocked.test", Route::Refuse)
                .route("relay.test", Route::To(relay)),
        );
        let connector = connector("relay.test", dialer.clone());

        let conn = connector
            .connect(&domain("blocked.test"), 8443, &Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert!(conn.via_fallback);
        assert_eq!(
            dialer.attempts(),
            vec![
                ("blocked.test".to_string(), 8443),
                ("relay.test".to_string(), 8443)
            ]
        );

        drop(conn);
        assert_eq!(server.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_both_attempts_failing_is_upstream_unreachable() {
        let dialer = Arc::new(RecordingDialer::default());
        let connector = connector("relay.test", dialer.clone());

        let result = connector
            .connect(&domain("blocked.test"), 80, &Bytes::from_static(b"x"))
            .await;
        assert!(matches!(result, Err(GatewayError::UpstreamUnreachable(_))));
        assert_eq!(dialer.attempts().len(), 2);
    }

    #[tokio::test]
    async fn test_connect_timeout_falls_back() {
        let (relay, _server) = replying_server(b"ok").await;
        let dialer = Arc::new(
            RecordingDialer::default()
                .route("slow.test", Route::Hang)
                .route("relay.test", Route::To(relay)),
        );
        let connector = connector("relay.test", dialer.clone());

        let conn = connector
            .connect(&domain("slow.test"), 80, &Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(conn.via_fallback);
    }

    #[tokio::test]
    async fn test_silent_destination_falls_back() {
        let silent = silent_server().await;
        let (relay, server) = replying_server(b"ok").await;
        let dialer = Arc::new(
            RecordingDialer::default()
                .route("silent.test", Route::To(silent))
                .route("relay.test", Route::To(relay)),
        );
        let connector = connector("relay.test", dialer.clone());

        let conn = connector
            .connect(&domain("silent.test"), 80, &Bytes::from_static(b"GET /"))
            .await
            .unwrap();
        assert!(conn.via_fallback);

        drop(conn);
        assert_eq!(server.await.unwrap(), b"GET /");
    }

    #[tokio::test]
    async fn test_early_close_falls_back() {
        let closing = closing_server().await;
        let (relay, _server) = replying_server(b"ok").await;
        let dialer = Arc::new(
            RecordingDialer::default()
                .route("closing.test", Route::To(closing))
                .route("relay.test", Route::To(relay)),
        );
        let connector = connector("relay.test", dialer.clone());

        let conn = connector
            .connect(&domain("closing.test"), 80, &Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(conn.via_fallback);
    }

    #[tokio::test]
    async fn test_empty_payload_accepts_silent_destination() {
        let silent = silent_server().await;
        let dialer = Arc::new(RecordingDialer::default().route("silent.test", Route::To(silent)));
        let connector = connector("relay.test", dialer.clone());

        let conn = connector
            .connect(&domain("silent.test"), 22, &Bytes::new())
            .await
            .unwrap();
        assert!(!conn.via_fallback);
        assert_eq!(dialer.attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_fallback_with_explicit_port() {
        let (relay, _server) = replying_server(b"ok").await;
        let dialer = Arc::new(RecordingDialer::default().route("relay.test", Route::To(relay)));
        let connector = connector("relay.test:8443", dialer.clone());

        let conn = connector
            .connect(&domain("blocked.test"), 443, &Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(conn.via_fallback);
        assert_eq!(dialer.attempts()[1], ("relay.test".to_string(), 8443));
    }

    #[tokio::test]
    async fn test_tcp_dialer_with_ip_address() {
        let (dest, _server) = replying_server(b"ok").await;
        let connector =
            OutboundConnector::new(FallbackRelay::parse("127.0.0.1").unwrap(), &conn_config());

        let conn = connector
            .connect(&Address::IPv4([127, 0, 0, 1]), dest.port(), &Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(!conn.via_fallback);
    }
}
