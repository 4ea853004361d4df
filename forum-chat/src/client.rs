//! WebSocket chat client.
//!
//! Thin wrapper over `tokio-tungstenite` for tests and tooling: connect
//! with identity parameters, send text or structured frames, read back
//! broadcast messages.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::identity::ConnectParams;
use crate::protocol::{ChatMessage, InboundFrame, ProtocolError};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("No message within {0:?}")]
    Timeout(Duration),
    #[error("Connection closed by server")]
    Closed,
}

pub struct ChatClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl ChatClient {
    /// Connect to a full `ws://` URL.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (stream, _response) = tokio_tungstenite::connect_async(url).await?;
        log::debug!("Connected to {url}");
        Ok(Self { stream })
    }

    /// Connect to `base` (e.g. `ws://127.0.0.1:8081/ws`) with identity parameters.
    pub async fn connect_with(base: &str, params: &ConnectParams) -> Result<Self, ClientError> {
        Self::connect(&Self::url(base, params)).await
    }

    pub fn url(base: &str, params: &ConnectParams) -> String {
        let query = params.to_query();
        if query.is_empty() {
            base.to_string()
        } else {
            format!("{base}?{query}")
        }
    }

    /// Send raw text; the server treats non-JSON text as message content.
    pub async fn send_text(&mut self, text: &str) -> Result<(), ClientError> {
        self.stream.send(Message::Text(text.to_owned().into())).await?;
        Ok(())
    }

    /// Send a structured frame.
    pub async fn send_frame(&mut self, frame: &InboundFrame) -> Result<(), ClientError> {
        let bytes = frame.encode()?;
        self.stream.send(Message::Binary(bytes.into())).await?;
        Ok(())
    }

    /// Next chat message, skipping control frames.
    pub async fn next_message(&mut self, wait: Duration) -> Result<ChatMessage, ClientError> {
        let read = async {
            while let Some(frame) = self.stream.next().await {
                match frame? {
                    Message::Text(text) => return Ok(ChatMessage::decode(text.as_bytes())?),
                    Message::Binary(bytes) => return Ok(ChatMessage::decode(&bytes)?),
                    Message::Close(_) => return Err(ClientError::Closed),
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                }
            }
            Err(ClientError::Closed)
        };

        tokio::time::timeout(wait, read)
            .await
            .map_err(|_| ClientError::Timeout(wait))?
    }

    /// Read every message that arrives within `wait` of the previous one.
    pub async fn drain(&mut self, wait: Duration) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.next_message(wait).await {
            messages.push(message);
        }
        messages
    }

    /// Send a close frame and wait for the server to finish the handshake.
    pub async fn close(mut self) -> Result<(), ClientError> {
        match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
