use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::Utf8Bytes;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use crate::error::VoiceError;

/// Default timeout for the websocket opening handshake
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// One inbound item from a voice socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketFrame {
    Text(String),
    /// Close frame with its code, if the peer sent one.
    Close(Option<u16>),
}

/// A connected voice websocket. Owned by exactly one connection loop.
#[async_trait]
pub trait VoiceSocket: Send {
    async fn send_text(&mut self, text: String) -> Result<(), VoiceError>;

    /// Next text or close frame. `None` once the stream ended without a close frame.
    async fn next_frame(&mut self) -> Option<SocketFrame>;

    /// Send a close frame. Best effort.
    async fn close(&mut self, code: u16);
}

/// Opens voice sockets.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, url: &str) -> Result<Box<dyn VoiceSocket>, VoiceError>;
}

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// `tokio-tungstenite` backed voice socket
pub struct WsSocket {
    stream: RawWs,
}

#[async_trait]
impl VoiceSocket for WsSocket {
    async fn send_text(&mut self, text: String) -> Result<(), VoiceError> {
        trace!("--> Sending voice frame: {} bytes", text.len());
        self.stream
            .send(Message::text(text))
            .await
            .map_err(|e| VoiceError::Transport(format!("WebSocket send error: {}", e)))
    }

    async fn next_frame(&mut self) -> Option<SocketFrame> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(SocketFrame::Text(text.as_str().to_owned())),
                Ok(Message::Close(frame)) => {
                    return Some(SocketFrame::Close(frame.map(|f| u16::from(f.code))));
                }
                // Pings are answered by tungstenite; binary frames are not used by this gateway
                Ok(_) => {}
                Err(e) => {
                    warn!("Voice socket read error: {}", e);
                    return None;
                }
            }
        }

        None
    }

    async fn close(&mut self, code: u16) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Utf8Bytes::from_static(""),
        };

        if let Err(e) = self.stream.close(Some(frame)).await {
            debug!("Voice socket close error: {}", e);
        }
    }
}

/// Dials voice endpoints over TLS websockets
#[derive(Debug, Clone)]
pub struct WsDialer {
    connect_timeout: Duration,
}

impl WsDialer {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for WsDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, url: &str) -> Result<Box<dyn VoiceSocket>, VoiceError> {
        debug!("Dialing voice gateway {}", url);

        let (stream, _response) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| VoiceError::Transport("Operation timed out".to_string()))?
            .map_err(|e| VoiceError::Transport(format!("WebSocket connect failed: {}", e)))?;

        debug!("Voice gateway connected: {}", url);

        Ok(Box::new(WsSocket { stream }))
    }
}
