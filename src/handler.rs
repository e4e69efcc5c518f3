//! Connection handling logic
//!
//! Every accepted connection starts as HTTP. The request head is read and
//! classified: WebSocket upgrades become sessions, `GET /link` returns the
//! client descriptor, anything else gets a 404.

use bytes::BytesMut;
use futures_util::StreamExt;
use http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::core::{early_data, run_session, Gateway, InboundStream, WsSink};
use crate::error::{GatewayError, Result};
use crate::logger::log;
use crate::transport::{ConnectionMeta, PrefixedStream};
use crate::utils;

/// Initial buffer size for reading the HTTP request head
const INITIAL_BUFFER_SIZE: usize = 2048;

/// Largest request head accepted
const MAX_HEAD_SIZE: usize = 8192;

const HTTP_HEADER_END: &[u8] = b"\r\n\r\n";

/// Path of the client descriptor endpoint
pub const LINK_PATH: &str = "/link";

/// Parsed HTTP request head, only the parts the gateway looks at
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Path without query string
    pub path: String,
    pub host: Option<String>,
    upgrade_websocket: bool,
    connection_upgrade: bool,
    has_ws_key: bool,
}

impl RequestHead {
    /// Parse the bytes up to and including the blank line
    pub fn parse(head: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(head)
            .map_err(|_| GatewayError::InvalidRequest("HTTP head is not UTF-8"))?;
        let mut lines = text.split("\r\n");
        let request_line = lines
            .next()
            .ok_or(GatewayError::InvalidRequest("missing request line"))?;

        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or("");
        let target = parts.next().unwrap_or("");
        let version = parts.next().unwrap_or("");
        if method.is_empty() || target.is_empty() || !version.starts_with("HTTP/") {
            return Err(GatewayError::InvalidRequest("malformed request line"));
        }

        let mut head = RequestHead {
            method: method.to_string(),
            path: target.split('?').next().unwrap_or("").to_string(),
            ..Default::default()
        };

        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                "upgrade" => {
                    head.upgrade_websocket |= value.to_ascii_lowercase().contains("websocket");
                }
                "connection" => {
                    head.connection_upgrade |= value.to_ascii_lowercase().contains("upgrade");
                }
                "sec-websocket-key" => head.has_ws_key |= !value.is_empty(),
                "host" => head.host = Some(value.to_string()),
                _ => {}
            }
        }

        Ok(head)
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.method == "GET" && self.upgrade_websocket && self.connection_upgrade && self.has_ws_key
    }
}

/// What to do with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Upgrade,
    Link,
    NotFound,
}

/// Route a request head against the configuration
pub fn classify(head: &RequestHead, config: &GatewayConfig) -> Route {
    if head.is_websocket_upgrade() {
        if path_matches(&config.ws_path, &head.path) {
            return Route::Upgrade;
        }
        log::debug!(path = %head.path, expected = %config.ws_path, "WebSocket path mismatch");
        return Route::NotFound;
    }
    if head.method == "GET" && head.path == LINK_PATH && config.password.is_some() {
        return Route::Link;
    }
    Route::NotFound
}

/// "/" accepts any path
fn path_matches(ws_path: &str, path: &str) -> bool {
    ws_path == "/" || path == ws_path
}

/// Client descriptor served on `GET /link`
pub fn link_descriptor(password: &str, host: &str, port: u16) -> String {
    format!(
        "trojan://{}@{}:{}/?type=ws&host={}&security=tls#{}",
        password, host, port, host, host
    )
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HTTP_HEADER_END.len())
        .position(|w| w == HTTP_HEADER_END)
        .map(|idx| idx + HTTP_HEADER_END.len())
}

/// Read until the end of the request head. Bytes past it stay in `buf`.
async fn read_request_head<S>(stream: &mut S, buf: &mut BytesMut) -> Result<RequestHead>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(end) = find_header_end(buf) {
            return RequestHead::parse(&buf[..end]);
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(GatewayError::InvalidRequest("HTTP head too large"));
        }
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(GatewayError::transport(
                "connection closed before request head",
            ));
        }
    }
}

async fn write_response<S>(
    stream: &mut S,
    status: &str,
    content_type: &str,
    body: &str,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Serve one accepted connection
pub async fn process_connection<S>(
    gateway: Arc<Gateway>,
    mut stream: S,
    meta: ConnectionMeta,
    shutdown: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let peer = meta.peer_addr.to_string();
    let mut buf = BytesMut::with_capacity(INITIAL_BUFFER_SIZE);

    let head = match tokio::time::timeout(
        gateway.conn_config().request_timeout,
        read_request_head(&mut stream, &mut buf),
    )
    .await
    {
        Ok(Ok(head)) => head,
        Ok(Err(e @ GatewayError::InvalidRequest(_))) => {
            let _ = write_response(
                &mut stream,
                "500 Internal Server Error",
                "text/plain",
                "Internal Server Error",
            )
            .await;
            return Err(e);
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(GatewayError::transport("request head timeout")),
    };

    match classify(&head, gateway.config()) {
        Route::Upgrade => {
            log::debug!(peer = %peer, path = %head.path, scheme = meta.scheme(), "WebSocket upgrade");
            let stream = PrefixedStream::new(buf.freeze(), stream);
            serve_websocket(gateway, stream, peer, shutdown).await
        }
        Route::Link => {
            let host = head
                .host
                .as_deref()
                .map(utils::host_without_port)
                .unwrap_or(gateway.config().host.as_str());
            let password = gateway.config().password.as_deref().unwrap_or_default();
            let body = link_descriptor(password, host, gateway.config().link_port);
            write_response(&mut stream, "200 OK", "text/plain; charset=utf-8", &body).await
        }
        Route::NotFound => {
            log::debug!(peer = %peer, method = %head.method, path = %head.path, "Not found");
            write_response(&mut stream, "404 Not Found", "text/plain", "Not Found").await
        }
    }
}

/// First entry of a `sec-websocket-protocol` list, `None` when empty
fn first_subprotocol(value: &str) -> Option<&str> {
    value
        .split(',')
        .next()
        .map(str::trim)
        .filter(|p| !p.is_empty())
}

/// WebSocket settings for one session
///
/// The write buffer follows the relay buffer size. Message and frame limits
/// stay at tungstenite's defaults (64 MiB and 16 MiB).
fn ws_config(buffer_size: usize) -> WebSocketConfig {
    let write_buffer = buffer_size.min(usize::MAX / 4);
    WebSocketConfig::default()
        .write_buffer_size(write_buffer)
        .max_write_buffer_size(write_buffer.saturating_mul(2).saturating_add(64))
}

/// Complete the upgrade and run the session
async fn serve_websocket<S>(
    gateway: Arc<Gateway>,
    stream: S,
    peer: String,
    shutdown: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws_config = ws_config(gateway.conn_config().buffer_size);

    let mut offered: Option<String> = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        |req: &Request, mut response: Response| {
            let first = req
                .headers()
                .get(SEC_WEBSOCKET_PROTOCOL)
                .and_then(|value| value.to_str().ok())
                .and_then(first_subprotocol);
            if let Some(protocol) = first {
                // Strict clients fail the handshake unless one offered
                // subprotocol is echoed
                if let Ok(value) = HeaderValue::from_str(protocol) {
                    response
                        .headers_mut()
                        .insert(SEC_WEBSOCKET_PROTOCOL, value);
                }
                offered = Some(protocol.to_string());
            }
            Ok::<_, ErrorResponse>(response)
        },
        Some(ws_config),
    )
    .await
    .map_err(|e| GatewayError::transport(format!("websocket handshake failed: {}", e)))?;

    let early_data = early_data::decode(offered.as_deref());
    let (sink, events) = ws_stream.split();
    let ws = WsSink::new(sink);
    let token = shutdown.child_token();
    let inbound = InboundStream::spawn(events, ws.clone(), early_data, &token);

    run_session(&gateway, inbound, ws, &token, &peer)
        .await
        .map(|_| ())
}
