//! WebSocket relay server.
//!
//! ```text
//! Subscriber A ──┐                                   ┌── writer A ◄──┐
//! Subscriber B ──┼── accept ── Session ── Hub ───────┼── writer B ◄──┼── DeliveryEngine
//! Publisher  P ──┘               │         │         └── writer P    │
//!                                │         └── ConnectionRegistry ───┘
//!                                └── IdentityResolver
//! ```
//!
//! Each connection runs a reader loop feeding its [`Session`] and a writer
//! task that owns the WebSocket sink. Everything sent to a connection,
//! including pushes from other connections' deliveries, goes through the
//! writer's channel.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::auth::{Authenticator, IdentityResolver};
use crate::protocol::Reply;
use crate::registry::ConnectionHandle;
use crate::session::{Hub, Session};

/// How long a server-initiated close waits for queued frames to flush.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub host: String,
    /// Port to listen on (0 = OS-assigned)
    pub port: u16,
    /// Shared secret publishers must present, compared exactly
    pub secret_token: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9292,
            secret_token: String::new(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub protocol_errors: u64,
    pub deliveries: u64,
    pub pushes_sent: u64,
    pub pushes_failed: u64,
    pub registered_identifiers: usize,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_received: AtomicU64,
    protocol_errors: AtomicU64,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    hub: Arc<Hub>,
    stats: Arc<AtomicServerStats>,
}

impl RelayServer {
    /// Create a server. Until an authenticator is attached every
    /// `authenticate` frame is rejected.
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(Hub::new(IdentityResolver::default(), config.secret_token.clone()));
        Self {
            config,
            hub,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Attach the authentication method used for `authenticate` frames.
    pub fn with_authenticator<A: Authenticator + 'static>(mut self, method: A) -> Self {
        let resolver = IdentityResolver::new(Arc::new(method));
        self.hub = Arc::new(Hub::new(resolver, self.config.secret_token.clone()));
        self
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    ///
    /// Connections already accepted keep running on their own tasks.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        log::info!("Relay server listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Relay server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            log::error!("Failed to accept connection: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let hub = self.hub.clone();
                    let stats = self.stats.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, hub, stats).await {
                            log::warn!("Connection error from {addr}: {e}");
                        }
                    });
                }
            }
        }
    }

    /// Handle a single WebSocket connection from handshake to close.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<Hub>,
        stats: Arc<AtomicServerStats>,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (ws_sender, mut ws_receiver) = ws_stream.split();

        let (connection, rx) = ConnectionHandle::channel();
        let mut writer = tokio::spawn(writer_task(ws_sender, rx));
        let mut session = Session::new(hub, connection.clone());

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("WebSocket connection {} established from {addr}", session.id());

        let mut closed_by_server = false;
        while let Some(msg) = ws_receiver.next().await {
            let outcome = match msg {
                Ok(Message::Text(text)) => session.handle_text(text.as_str()).await,
                Ok(Message::Binary(data)) => session.handle_bytes(&data).await,
                Ok(Message::Close(_)) => {
                    log::info!("Connection {} closed by {addr}", session.id());
                    break;
                }
                // tungstenite answers pings on its own.
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("WebSocket error from {addr}: {e}");
                    break;
                }
            };

            stats.frames_received.fetch_add(1, Ordering::Relaxed);
            if let Some(reply) = &outcome.reply {
                if reply.status >= 400 {
                    stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                }
                send_reply(&connection, reply);
            }
            if outcome.close {
                let _ = connection.send(Message::Close(None));
                closed_by_server = true;
                break;
            }
        }

        session.finish().await;
        drop(connection);
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);

        if closed_by_server {
            if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
                log::debug!("Writer for {addr} did not flush within {CLOSE_GRACE:?}");
                writer.abort();
            }
        } else {
            writer.abort();
        }
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let delivery = self.hub.delivery().stats();
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            protocol_errors: self.stats.protocol_errors.load(Ordering::Relaxed),
            deliveries: delivery.deliveries,
            pushes_sent: delivery.pushes_sent,
            pushes_failed: delivery.pushes_failed,
            registered_identifiers: self.hub.registry().identifier_count().await,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Shared state handed to every session.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }
}

fn send_reply(connection: &ConnectionHandle, reply: &Reply) {
    match reply.encode() {
        Ok(text) => {
            let _ = connection.send(Message::text(text));
        }
        Err(e) => log::error!("Failed to encode reply for {}: {e}", connection.id()),
    }
}

/// Drain the connection's channel into the WebSocket sink.
///
/// Stops after writing a close frame or when the sink fails.
async fn writer_task(
    mut ws_sender: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::Receiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = ws_sender.send(msg).await {
            log::debug!("WebSocket send failed: {e}");
            break;
        }
        if closing {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9292);
        assert!(config.secret_token.is_empty());
        assert_eq!(config.bind_addr(), "127.0.0.1:9292");
    }

    #[test]
    fn test_server_custom_config() {
        let config = ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            secret_token: "S".to_string(),
        };
        let server = RelayServer::new(config);
        assert_eq!(server.config().bind_addr(), "0.0.0.0:8080");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.stats().await, ServerStats::default());
    }

    #[tokio::test]
    async fn test_default_server_rejects_authentication() {
        let server = RelayServer::with_defaults();
        let (conn, _rx) = ConnectionHandle::channel();
        let mut session = Session::new(server.hub().clone(), conn);
        let outcome = session
            .handle_text(r#"{"action":"authenticate","payload":"tok1"}"#)
            .await;
        assert_eq!(outcome.reply, Some(Reply::authentication_failure()));
    }

    #[tokio::test]
    async fn test_with_authenticator_is_used() {
        let server = RelayServer::with_defaults()
            .with_authenticator(|token: &Value| token.as_str().map(|t| format!("user-{t}")));
        let (conn, _rx) = ConnectionHandle::channel();
        let mut session = Session::new(server.hub().clone(), conn);
        session
            .handle_text(&json!({"action": "authenticate", "payload": "9"}).to_string())
            .await;
        assert_eq!(server.stats().await.registered_identifiers, 1);
        assert_eq!(server.hub().registry().lookup("user-9").await.len(), 1);
    }

    #[tokio::test]
    async fn test_run_until_stops_on_shutdown() {
        let config = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        let server = RelayServer::new(config);
        let result = server.run_until(async {}).await;
        assert!(result.is_ok());
    }
}
