//! WebSocket write half and safe close
//!
//! The write half is shared by the inbound reader (which must close the socket
//! when the peer does) and the bridge (which writes destination data). A small
//! state tag makes closing idempotent no matter which side gets there first.

use bytes::Bytes;
use futures_util::{Sink, SinkExt};
use std::fmt::Display;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{GatewayError, Result};
use crate::logger::log;

/// WebSocket ready states tracked by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketState {
    /// Data may flow
    Open = 0,
    /// Peer sent a close frame, our reply is pending
    Closing = 1,
    /// Close already performed
    Closed = 2,
}

impl SocketState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SocketState::Open,
            1 => SocketState::Closing,
            _ => SocketState::Closed,
        }
    }
}

struct Inner<Si> {
    sink: Mutex<Si>,
    state: AtomicU8,
}

/// Shared WebSocket write half
pub struct WsSink<Si> {
    inner: Arc<Inner<Si>>,
}

impl<Si> Clone for WsSink<Si> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Si> WsSink<Si>
where
    Si: Sink<Message> + Unpin + Send,
    Si::Error: Display,
{
    pub fn new(sink: Si) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink: Mutex::new(sink),
                state: AtomicU8::new(SocketState::Open as u8),
            }),
        }
    }

    pub fn state(&self) -> SocketState {
        SocketState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Record that the peer started the close handshake
    pub fn mark_closing(&self) {
        let _ = self.inner.state.compare_exchange(
            SocketState::Open as u8,
            SocketState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Send one binary message and wait until it is flushed
    ///
    /// Holding the caller until the flush completes is what bounds the
    /// destination-to-client direction to a single in-flight chunk.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        if self.state() != SocketState::Open {
            return Err(GatewayError::Transport("websocket is not open".to_string()));
        }
        let mut sink = self.inner.sink.lock().await;
        sink.send(Message::Binary(data))
            .await
            .map_err(|e| GatewayError::transport(e))
    }

    /// Close the socket if it is open or closing. Never fails.
    ///
    /// Only the first call reaches the underlying sink.
    pub async fn safe_close(&self) {
        let prev = self
            .inner
            .state
            .swap(SocketState::Closed as u8, Ordering::AcqRel);
        if SocketState::from_u8(prev) == SocketState::Closed {
            return;
        }
        let mut sink = self.inner.sink.lock().await;
        if let Err(e) = sink.close().await {
            log::debug!(error = %e, "WebSocket close failed");
        }
    }
}
