//! Client side of the relay protocol.
//!
//! - [`Subscriber`]: connect, authenticate, then wait for pushes
//! - [`publish`]: one-shot delivery with the shared secret

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{Frame, Identifier, ProtocolError, Reply, Status};

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection closed by server")]
    Closed,

    #[error("Unexpected reply from server: {0:?}")]
    Unexpected(Reply),
}

/// An authenticated subscriber connection.
pub struct Subscriber {
    stream: Stream,
}

impl Subscriber {
    /// Connect to `url` and authenticate with `token`.
    pub async fn connect(url: &str, token: impl Into<Value>) -> Result<Self, ClientError> {
        let (mut stream, _) = tokio_tungstenite::connect_async(url).await?;
        send_frame(&mut stream, &Frame::authenticate(token)).await?;

        match read_reply(&mut stream).await? {
            Some(reply) if reply == Reply::authenticated() => Ok(Self { stream }),
            Some(reply) => Err(ClientError::Unexpected(reply)),
            None => Err(ClientError::Closed),
        }
    }

    /// Re-authenticate on the open connection, switching identifier.
    pub async fn reauthenticate(&mut self, token: impl Into<Value>) -> Result<(), ClientError> {
        send_frame(&mut self.stream, &Frame::authenticate(token)).await?;
        match read_reply(&mut self.stream).await? {
            Some(reply) if reply == Reply::authenticated() => Ok(()),
            Some(reply) => Err(ClientError::Unexpected(reply)),
            None => Err(ClientError::Closed),
        }
    }

    /// Wait for the next push and return its payload.
    ///
    /// `None` once the server has closed the connection.
    pub async fn next_push(&mut self) -> Result<Option<Value>, ClientError> {
        loop {
            match read_reply(&mut self.stream).await? {
                Some(reply) if reply.status == Status::Ok.code() => return Ok(Some(reply.payload)),
                Some(reply) => {
                    log::debug!("Ignoring non-push reply: {reply:?}");
                }
                None => return Ok(None),
            }
        }
    }

    /// Send a raw text frame (for protocol-level experiments).
    pub async fn send_raw(&mut self, text: &str) -> Result<(), ClientError> {
        self.stream.send(Message::text(text)).await?;
        Ok(())
    }

    /// Read the next reply of any status.
    pub async fn next_reply(&mut self) -> Result<Option<Reply>, ClientError> {
        read_reply(&mut self.stream).await
    }

    pub async fn close(mut self) -> Result<(), ClientError> {
        self.stream.close(None).await?;
        Ok(())
    }
}

/// Ask the relay to push `payload` to `identifiers`.
///
/// Returns the server's reply: `201 payload pushed` on success, `401` on a
/// secret mismatch. The server closes the connection either way.
pub async fn publish(
    url: &str,
    secret_token: &str,
    payload: Value,
    identifiers: &[Identifier],
) -> Result<Reply, ClientError> {
    let (mut stream, _) = tokio_tungstenite::connect_async(url).await?;
    send_frame(&mut stream, &Frame::deliver(secret_token, payload, identifiers)).await?;
    let reply = read_reply(&mut stream).await?.ok_or(ClientError::Closed)?;
    // Drain until the server's close frame so the handshake completes.
    while let Some(Ok(msg)) = stream.next().await {
        if msg.is_close() {
            break;
        }
    }
    Ok(reply)
}

async fn send_frame(stream: &mut Stream, frame: &Value) -> Result<(), ClientError> {
    stream.send(Message::text(frame.to_string())).await?;
    Ok(())
}

/// Next reply frame, skipping control frames. `None` on close.
async fn read_reply(stream: &mut Stream) -> Result<Option<Reply>, ClientError> {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => return Ok(Some(Reply::decode(text.as_str())?)),
            Ok(Message::Binary(data)) => {
                let text = std::str::from_utf8(&data)
                    .map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
                return Ok(Some(Reply::decode(text)?));
            }
            Ok(Message::Close(_)) => return Ok(None),
            Ok(_) => continue,
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(None)
}
