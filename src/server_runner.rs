//! Server startup and accept loop
//!
//! This module binds the listener, terminates TLS when configured and hands
//! each connection to the HTTP entry in [`crate::handler`].

use crate::config::GatewayConfig;
use crate::core::Gateway;
use crate::handler::process_connection;
use crate::logger::log;
use crate::transport::{ConnectionMeta, TlsTransportListener, TransportType};

use anyhow::{anyhow, Result};
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

/// TCP keepalive interval; dead peers are detected in ~45s (3 probes)
const TCP_KEEPALIVE_SECS: u64 = 15;

/// Bind the listening socket with SO_REUSEADDR and the configured backlog
pub fn bind_listener(config: &GatewayConfig) -> Result<TcpListener> {
    let addr = format!("{}:{}", config.host, config.port);
    let socket_addr: SocketAddr = addr
        .parse()
        .map_err(|e| anyhow!("invalid listen address {}: {}", addr, e))?;

    let socket = socket2::Socket::new(
        match socket_addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&socket_addr.into())?;
    socket.listen(config.conn.tcp_backlog)?;

    Ok(TcpListener::from_std(socket.into())?)
}

/// Bind and serve until `shutdown` is cancelled
pub async fn run_server(gateway: Arc<Gateway>, shutdown: CancellationToken) -> Result<()> {
    let listener = bind_listener(gateway.config())?;
    serve(gateway, listener, shutdown).await
}

/// Accept loop on an already bound listener
pub async fn serve(
    gateway: Arc<Gateway>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    let config = gateway.config();
    let conn = *gateway.conn_config();

    // Connection limiter: 0 = unlimited
    let conn_limiter = if conn.max_connections > 0 {
        Some(Arc::new(Semaphore::new(conn.max_connections)))
    } else {
        None
    };

    let tls_acceptor = match (&config.cert, &config.key) {
        (Some(cert), Some(key)) => Some(TlsTransportListener::acceptor(cert, key)?),
        _ => None,
    };
    let transport_type = if tls_acceptor.is_some() {
        TransportType::Tls
    } else {
        TransportType::Tcp
    };

    log::info!(
        address = %listener.local_addr()?,
        transport = %transport_type,
        ws_path = %config.ws_path,
        fallback = %config.fallback,
        max_connections = conn.max_connections,
        link = config.password.is_some(),
        "Gateway started"
    );

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => {
                log::info!("Shutdown requested, no longer accepting connections");
                break;
            }
            accepted = listener.accept() => accepted,
        };

        let (stream, peer_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                log::error!(error = %e, "Failed to accept connection");
                continue;
            }
        };
        log::connection(&peer_addr.to_string(), "new");

        // Acquire connection permit (backpressure when at limit)
        let permit = match conn_limiter {
            Some(ref limiter) => {
                let acquired = tokio::select! {
                    _ = shutdown.cancelled() => {
                        log::info!("Shutdown requested while waiting for a connection slot");
                        break;
                    }
                    acquired = Arc::clone(limiter).acquire_owned() => acquired,
                };
                match acquired {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                }
            }
            None => None,
        };

        let gateway = Arc::clone(&gateway);
        let tls_acceptor = tls_acceptor.clone();
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            // Hold permit for the lifetime of this connection
            let _permit = permit;
            let peer = peer_addr.to_string();
            let _closed = scopeguard::guard((), |_| log::connection(&peer, "closed"));

            let meta = ConnectionMeta {
                peer_addr,
                transport_type,
            };
            if let Err(e) = handle_stream(gateway, stream, tls_acceptor, meta, shutdown).await {
                log::debug!(peer = %peer_addr, error = %e, "Connection error");
            }
        });
    }

    Ok(())
}

async fn handle_stream(
    gateway: Arc<Gateway>,
    stream: TcpStream,
    tls_acceptor: Option<TlsAcceptor>,
    meta: ConnectionMeta,
    shutdown: CancellationToken,
) -> Result<()> {
    let conn = gateway.conn_config();
    if conn.tcp_nodelay {
        let _ = stream.set_nodelay(true);
    }
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(TCP_KEEPALIVE_SECS))
        .with_interval(Duration::from_secs(TCP_KEEPALIVE_SECS));
    let _ = SockRef::from(&stream).set_tcp_keepalive(&keepalive);

    match tls_acceptor {
        Some(acceptor) => {
            let tls_stream =
                match tokio::time::timeout(conn.tls_handshake_timeout, acceptor.accept(stream))
                    .await
                {
                    Ok(Ok(tls_stream)) => tls_stream,
                    Ok(Err(e)) => return Err(anyhow!("TLS handshake failed: {}", e)),
                    Err(_) => return Err(anyhow!("TLS handshake timeout")),
                };
            log::debug!(peer = %meta.peer_addr, "TLS handshake successful");
            process_connection(gateway, tls_stream, meta, shutdown).await?;
        }
        None => process_connection(gateway, stream, meta, shutdown).await?,
    }
    Ok(())
}
