//! Trojan-over-WebSocket to TCP gateway

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use trojan_ws_gateway::config::{CliArgs, GatewayConfig};
use trojan_ws_gateway::logger::{self, log};
use trojan_ws_gateway::{server_runner, Gateway};

#[tokio::main]
async fn main() -> Result<()> {
    // Install ring as the default crypto provider for rustls
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    let cli = CliArgs::parse_args();
    logger::init_logger(&cli.log_mode);

    let config = GatewayConfig::from_cli(&cli)?;
    log::info!(
        host = %config.host,
        port = config.port,
        tls = config.has_tls(),
        "Starting Trojan WebSocket gateway"
    );

    let gateway = Arc::new(Gateway::builder(config).build());

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal_token.cancel();
    });

    server_runner::run_server(gateway, shutdown).await?;
    // Sessions are cancelled with the listener; let them close their sockets
    tokio::time::sleep(Duration::from_millis(500)).await;
    log::info!("Gateway stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigint, mut sigterm) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        _ => {
            log::warn!("Failed to install signal handlers, falling back to Ctrl-C");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => log::info!("SIGINT received, shutting down..."),
        _ = sigterm.recv() => log::info!("SIGTERM received, shutting down..."),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    log::info!("Shutdown signal received...");
}
