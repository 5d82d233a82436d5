//! Transport seam: message-oriented feed sessions.
//!
//! The engine only ever sees text frames and terminal events through
//! these traits; `WsTransport` is the production WebSocket binding and
//! tests script their own.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Connection-level failure. Recoverable by policy: the engine answers
/// every one of these with a reconnect cycle, never a process exit.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
}

/// What a live session yields next.
#[derive(Debug)]
pub enum SessionEvent {
    /// One text frame.
    Message(String),
    /// Peer closed the stream.
    Closed,
    /// Transport failed mid-stream.
    Failed(TransportError),
}

/// Dials feed sessions.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn FeedSession>, TransportError>;
}

/// One live connection. `next_event` must be cancel-safe; the engine
/// polls it inside `select!`.
#[async_trait]
pub trait FeedSession: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;
    async fn next_event(&mut self) -> SessionEvent;
    async fn close(&mut self);
}

/// tokio-tungstenite binding.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsTransport;

#[async_trait]
impl FeedTransport for WsTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn FeedSession>, TransportError> {
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!(status = %response.status(), "websocket handshake complete");
        Ok(Box::new(WsSession { stream }))
    }
}

struct WsSession {
    stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

#[async_trait]
impl FeedSession for WsSession {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn next_event(&mut self) -> SessionEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return SessionEvent::Message(text),
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = self.stream.send(Message::Pong(data)).await {
                        return SessionEvent::Failed(TransportError::Send(e.to_string()));
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "close frame received");
                    return SessionEvent::Closed;
                }
                // Binary, pong, and raw frames carry nothing for this feed.
                Some(Ok(_)) => {}
                Some(Err(e)) => return SessionEvent::Failed(TransportError::Receive(e.to_string())),
                None => return SessionEvent::Closed,
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
