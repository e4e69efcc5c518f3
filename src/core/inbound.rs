//! WebSocket events as an ordered chunk sequence
//!
//! A reader task owns the WebSocket read half and pushes data chunks into a
//! bounded channel. The consumer pulls them with [`InboundStream::next`], so a
//! slow destination eventually stops the reader instead of growing a queue.

use bytes::Bytes;
use futures_util::{Sink, Stream, StreamExt};
use std::fmt::Display;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::ws::WsSink;
use crate::error::{GatewayError, Result};
use crate::logger::log;

/// Chunks buffered between the reader task and the consumer
const QUEUE_DEPTH: usize = 8;

/// Client-to-destination chunk sequence of one session
pub struct InboundStream<Si> {
    rx: mpsc::Receiver<Result<Bytes>>,
    early_data: Option<Bytes>,
    ws: WsSink<Si>,
    token: CancellationToken,
    cancelled: bool,
}

impl<Si> InboundStream<Si>
where
    Si: Sink<Message> + Unpin + Send + 'static,
    Si::Error: Display,
{
    /// Start reading `stream`. `early_data` is yielded before any message.
    ///
    /// The reader stops when `session` is cancelled, when the stream is
    /// cancelled or dropped, and after a close or error event.
    pub fn spawn<St, E>(
        stream: St,
        ws: WsSink<Si>,
        early_data: Option<Bytes>,
        session: &CancellationToken,
    ) -> Self
    where
        St: Stream<Item = std::result::Result<Message, E>> + Unpin + Send + 'static,
        E: Display + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let token = session.child_token();
        tokio::spawn(read_loop(stream, ws.clone(), tx, token.clone()));

        Self {
            rx,
            early_data,
            ws,
            token,
            cancelled: false,
        }
    }

    /// Next chunk in arrival order
    ///
    /// `None` means the client closed the socket or the sequence was
    /// cancelled. After an error the sequence ends.
    pub async fn next(&mut self) -> Option<Result<Bytes>> {
        if self.cancelled {
            return None;
        }
        if let Some(data) = self.early_data.take() {
            return Some(Ok(data));
        }

        tokio::select! {
            biased;
            _ = self.token.cancelled() => {
                self.cancel().await;
                None
            }
            item = self.rx.recv() => item,
        }
    }

    /// Stop consuming: queued chunks are dropped and the socket is closed
    pub async fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        self.token.cancel();
        self.early_data = None;
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
        self.ws.safe_close().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

impl<Si> Drop for InboundStream<Si> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn read_loop<St, E, Si>(
    mut stream: St,
    ws: WsSink<Si>,
    tx: mpsc::Sender<Result<Bytes>>,
    token: CancellationToken,
) where
    St: Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: Display,
    Si: Sink<Message> + Unpin + Send,
    Si::Error: Display,
{
    loop {
        let item = tokio::select! {
            _ = token.cancelled() => return,
            item = stream.next() => item,
        };

        let data = match item {
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Text(text))) => Bytes::copy_from_slice(text.as_bytes()),
            Some(Ok(Message::Close(frame))) => {
                log::debug!(frame = ?frame, "WebSocket close received");
                ws.mark_closing();
                ws.safe_close().await;
                return;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                log::debug!(error = %e, "WebSocket read failed");
                let _ = tx.send(Err(GatewayError::transport(e))).await;
                return;
            }
            None => {
                ws.safe_close().await;
                return;
            }
        };

        tokio::select! {
            _ = token.cancelled() => return,
            sent = tx.send(Ok(data)) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}
