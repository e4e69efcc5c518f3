//! Session driver and bidirectional relay
//!
//! One session pairs a WebSocket with at most one outbound TCP connection.
//! The first inbound chunk is the handshake; after the outbound leg is up,
//! bytes are pumped both ways with one chunk in flight per direction.

use bytes::Bytes;
use futures_util::Sink;
use std::fmt::Display;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::inbound::InboundStream;
use super::server::Gateway;
use super::ws::{SocketState, WsSink};
use crate::error::{GatewayError, Result};
use crate::logger::log;

/// Session lifecycle, strictly forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    AwaitingHandshake,
    Connecting,
    Bridging,
    Closed,
}

/// Per-session state tag
///
/// Only the phase lives here. The destination, port and first payload are
/// the parsed `TrojanRequest`, and the outbound connection is the
/// `Connection` from the connector. Both are locals of [`run_session`] that
/// are created on entry to `Connecting` and `Bridging` and dropped at
/// `Closed`, so no phase can observe a connection that does not exist yet.
#[derive(Debug)]
pub struct Session {
    state: SessionState,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::AwaitingHandshake,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`. Returns false, leaving the state untouched, when
    /// `next` is not ahead of the current state.
    pub fn advance(&mut self, next: SessionState) -> bool {
        if next <= self.state {
            return false;
        }
        self.state = next;
        true
    }
}

/// Bytes moved by one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    /// Client to destination, first payload included
    pub up: u64,
    /// Destination to client
    pub down: u64,
}

/// Drive one session from handshake to teardown
///
/// The WebSocket is closed on every path out of this function. Errors are
/// session-local and already logged.
pub async fn run_session<Si>(
    gateway: &Gateway,
    mut inbound: InboundStream<Si>,
    ws: WsSink<Si>,
    token: &CancellationToken,
    peer: &str,
) -> Result<TransferSummary>
where
    Si: Sink<Message> + Unpin + Send + 'static,
    Si::Error: Display,
{
    let mut session = Session::new();

    let first = match inbound.next().await {
        Some(Ok(chunk)) => chunk,
        Some(Err(e)) => {
            log::debug!(peer = peer, error = %e, "WebSocket failed before handshake");
            inbound.cancel().await;
            session.advance(SessionState::Closed);
            return Err(e);
        }
        None => {
            log::debug!(peer = peer, "WebSocket closed before handshake");
            inbound.cancel().await;
            session.advance(SessionState::Closed);
            return Ok(TransferSummary::default());
        }
    };

    let request = match gateway.codec().parse(first) {
        Ok(request) => request,
        Err(e) => {
            if matches!(e, GatewayError::InvalidPassword) {
                log::authentication(peer, false);
            }
            log::debug!(peer = peer, error = %e, "Handshake rejected");
            inbound.cancel().await;
            session.advance(SessionState::Closed);
            return Err(e);
        }
    };
    log::authentication(peer, true);

    let target = request.target();
    session.advance(SessionState::Connecting);

    let conn = match gateway
        .connector()
        .connect(&request.addr, request.port, &request.payload)
        .await
    {
        Ok(conn) => conn,
        Err(e) => {
            log::debug!(peer = peer, target = %target, error = %e, "Outbound connection failed");
            inbound.cancel().await;
            session.advance(SessionState::Closed);
            return Err(e);
        }
    };

    session.advance(SessionState::Bridging);
    let buffer_size = gateway.conn_config().buffer_size;
    let (mut summary, result) = pump(conn.stream, inbound, &ws, token, buffer_size).await;
    summary.up += request.payload.len() as u64;
    session.advance(SessionState::Closed);

    log::session(peer, &target, summary.up, summary.down, conn.via_fallback);
    match result {
        Ok(()) => Ok(summary),
        Err(e) => {
            log::debug!(peer = peer, target = %target, error = %e, "Relay error");
            Err(e)
        }
    }
}

/// Pump bytes both ways until both directions are done
///
/// Client end of stream half-closes the TCP leg, and once the WebSocket is
/// no longer open it also cancels the session. TCP end of stream or any
/// error closes the WebSocket and cancels the session.
async fn pump<Si>(
    stream: TcpStream,
    mut inbound: InboundStream<Si>,
    ws: &WsSink<Si>,
    token: &CancellationToken,
    buffer_size: usize,
) -> (TransferSummary, Result<()>)
where
    Si: Sink<Message> + Unpin + Send + 'static,
    Si::Error: Display,
{
    let (mut reader, mut writer) = stream.into_split();

    let upload = async {
        let mut up = 0u64;
        let result = loop {
            let chunk = match inbound.next().await {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            };
            let written = tokio::select! {
                _ = token.cancelled() => break Ok(()),
                r = writer.write_all(&chunk) => r,
            };
            if let Err(e) = written {
                break Err(GatewayError::transport(e));
            }
            up += chunk.len() as u64;
        };

        match result {
            Ok(()) => {
                let _ = writer.shutdown().await;
                // A closed WebSocket cannot carry anything the destination
                // still has to say
                if ws.state() != SocketState::Open {
                    token.cancel();
                }
            }
            Err(_) => token.cancel(),
        }
        (up, result)
    };

    let download = async {
        let mut down = 0u64;
        let mut buf = vec![0u8; buffer_size];
        let result = loop {
            let n = tokio::select! {
                _ = token.cancelled() => break Ok(()),
                r = reader.read(&mut buf) => match r {
                    Ok(0) => break Ok(()),
                    Ok(n) => n,
                    Err(e) => break Err(GatewayError::transport(e)),
                },
            };
            let sent = tokio::select! {
                _ = token.cancelled() => break Ok(()),
                r = ws.send(Bytes::copy_from_slice(&buf[..n])) => r,
            };
            if let Err(e) = sent {
                // The client already closed; nothing left to deliver to
                if ws.state() != SocketState::Open {
                    break Ok(());
                }
                break Err(e);
            }
            down += n as u64;
        };

        ws.safe_close().await;
        token.cancel();
        (down, result)
    };

    let ((up, up_result), (down, down_result)) = tokio::join!(upload, download);
    (TransferSummary { up, down }, up_result.and(down_result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PasswordHash;
    use crate::core::protocol::{Address, TrojanCmd, TrojanRequest};
    use crate::core::server::tests::{test_config, PASSWORD};
    use crate::core::ws::tests::RecordingSink;
    use futures_util::Stream;
    use std::net::SocketAddr;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll, Waker};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    type ClientEvents = Pin<Box<dyn Stream<Item = std::result::Result<Message, String>> + Send>>;

    /// Client side of a fake WebSocket: messages sent on the channel arrive
    /// at the gateway in order
    fn client_channel() -> (mpsc::UnboundedSender<Message>, ClientEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|m| (Ok::<_, String>(m), rx))
        });
        (tx, Box::pin(events))
    }

    fn handshake(dest: SocketAddr, payload: &'static [u8]) -> Message {
        let ip = match dest {
            SocketAddr::V4(v4) => v4.ip().octets(),
            SocketAddr::V6(_) => unreachable!("tests bind IPv4"),
        };
        let request = TrojanRequest {
            cmd: TrojanCmd::Connect,
            addr: Address::IPv4(ip),
            port: dest.port(),
            payload: Bytes::from_static(payload),
        };
        Message::Binary(request.encode(&PasswordHash::from_password(PASSWORD)))
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (mut r, mut w) = stream.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });
        addr
    }

    async fn dead_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    async fn wait_for_messages(sent: &Arc<Mutex<Vec<Message>>>, n: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while sent.lock().unwrap().len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("messages did not arrive");
    }

    fn gateway() -> Arc<Gateway> {
        Arc::new(Gateway::builder(test_config("127.0.0.1")).build())
    }

    #[test]
    fn test_session_state_is_forward_only() {
        let mut session = Session::new();
        assert_eq!(session.state(), SessionState::AwaitingHandshake);
        assert!(session.advance(SessionState::Connecting));
        assert!(!session.advance(SessionState::AwaitingHandshake));
        assert!(!session.advance(SessionState::Connecting));
        assert!(session.advance(SessionState::Bridging));
        assert!(session.advance(SessionState::Closed));
        assert!(!session.advance(SessionState::Bridging));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_echo_session() {
        let dest = echo_server().await;
        let gateway = gateway();
        let sink = RecordingSink::default();
        let ws = WsSink::new(sink.clone());
        let token = CancellationToken::new();
        let (client, events) = client_channel();
        let inbound = InboundStream::spawn(events, ws.clone(), None, &token);

        client.send(handshake(dest, b"hello")).unwrap();
        let task = tokio::spawn(async move {
            run_session(&gateway, inbound, ws, &token, "127.0.0.1:50000").await
        });

        wait_for_messages(&sink.sent, 1).await;
        client
            .send(Message::Binary(Bytes::from_static(b"world")))
            .unwrap();
        wait_for_messages(&sink.sent, 2).await;
        client.send(Message::Close(None)).unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(summary, TransferSummary { up: 10, down: 10 });

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent[0], Message::Binary(Bytes::from_static(b"hello")));
        assert_eq!(sent[1], Message::Binary(Bytes::from_static(b"world")));
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_client_close_ends_session_with_quiet_destination() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest = listener.local_addr().unwrap();
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"hi").await.unwrap();
            // Drain until the gateway drops the connection, never close first
            let mut buf = [0u8; 64];
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
            let _ = closed_tx.send(());
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let gateway = gateway();
        let sink = RecordingSink::default();
        let ws = WsSink::new(sink.clone());
        let token = CancellationToken::new();
        let (client, events) = client_channel();
        let inbound = InboundStream::spawn(events, ws.clone(), None, &token);

        client.send(handshake(dest, b"")).unwrap();
        let task = tokio::spawn(async move {
            run_session(&gateway, inbound, ws, &token, "peer").await
        });

        wait_for_messages(&sink.sent, 1).await;
        client.send(Message::Close(None)).unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("session outlived the client close")
            .unwrap()
            .unwrap();
        assert_eq!(summary, TransferSummary { up: 0, down: 2 });
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);

        tokio::time::timeout(Duration::from_secs(2), closed_rx)
            .await
            .expect("destination connection left open")
            .unwrap();
    }

    #[tokio::test]
    async fn test_bad_password_closes_without_outbound() {
        let gateway = gateway();
        let sink = RecordingSink::default();
        let ws = WsSink::new(sink.clone());
        let token = CancellationToken::new();
        let (client, events) = client_channel();
        let inbound = InboundStream::spawn(events, ws.clone(), None, &token);

        let mut bogus = vec![b'0'; 56];
        bogus.extend_from_slice(b"\r\n\x01\x01\x7f\x00\x00\x01\x00\x50");
        client.send(Message::Binary(Bytes::from(bogus))).unwrap();

        let result = run_session(&gateway, inbound, ws, &token, "peer").await;
        assert!(matches!(result, Err(GatewayError::InvalidPassword)));
        assert!(sink.sent.lock().unwrap().is_empty());
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreachable_upstream_sends_nothing() {
        let dest = dead_port().await;
        let gateway = gateway();
        let sink = RecordingSink::default();
        let ws = WsSink::new(sink.clone());
        let token = CancellationToken::new();
        let (client, events) = client_channel();
        let inbound = InboundStream::spawn(events, ws.clone(), None, &token);

        client.send(handshake(dest, b"payload")).unwrap();

        let result = run_session(&gateway, inbound, ws, &token, "peer").await;
        assert!(matches!(result, Err(GatewayError::UpstreamUnreachable(_))));
        assert!(sink.sent.lock().unwrap().is_empty());
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_client_closing_before_handshake() {
        let gateway = gateway();
        let sink = RecordingSink::default();
        let ws = WsSink::new(sink.clone());
        let token = CancellationToken::new();
        let (client, events) = client_channel();
        let inbound = InboundStream::spawn(events, ws.clone(), None, &token);

        client.send(Message::Close(None)).unwrap();

        let summary = run_session(&gateway, inbound, ws, &token, "peer")
            .await
            .unwrap();
        assert_eq!(summary, TransferSummary::default());
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
    }

    /// Sink whose flush stays pending until released
    #[derive(Clone, Default)]
    struct GatedSink {
        sent: Arc<Mutex<Vec<Message>>>,
        open: Arc<AtomicBool>,
        waker: Arc<Mutex<Option<Waker>>>,
    }

    impl GatedSink {
        fn release(&self) {
            self.open.store(true, Ordering::SeqCst);
            if let Some(waker) = self.waker.lock().unwrap().take() {
                waker.wake();
            }
        }
    }

    impl Sink<Message> for GatedSink {
        type Error = String;

        fn poll_ready(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::result::Result<(), String>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> std::result::Result<(), String> {
            self.sent.lock().unwrap().push(item);
            Ok(())
        }

        fn poll_flush(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::result::Result<(), String>> {
            if self.open.load(Ordering::SeqCst) {
                return Poll::Ready(Ok(()));
            }
            *self.waker.lock().unwrap() = Some(cx.waker().clone());
            if self.open.load(Ordering::SeqCst) {
                Poll::Ready(Ok(()))
            } else {
                Poll::Pending
            }
        }

        fn poll_close(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::result::Result<(), String>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_download_waits_for_websocket_flush() {
        const CHUNK: usize = 4096;
        const CHUNKS: usize = 16;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            for _ in 0..CHUNKS {
                stream.write_all(&[7u8; CHUNK]).await.unwrap();
            }
        });

        let gateway = gateway();
        let sink = GatedSink::default();
        let ws = WsSink::new(sink.clone());
        let token = CancellationToken::new();
        let (client, events) = client_channel();
        let inbound = InboundStream::spawn(events, ws.clone(), None, &token);

        client.send(handshake(dest, b"")).unwrap();
        let task = tokio::spawn(async move {
            run_session(&gateway, inbound, ws, &token, "peer").await
        });

        wait_for_messages(&sink.sent, 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        // First message is still being flushed, nothing else was read ahead
        assert_eq!(sink.sent.lock().unwrap().len(), 1);

        sink.release();
        let summary = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(summary.down, (CHUNK * CHUNKS) as u64);

        let delivered: usize = sink
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.len())
            .sum();
        assert_eq!(delivered, CHUNK * CHUNKS);
        drop(client);
    }
}
