//! WebSocket server. One task per connection; all shared state lives in the
//! [`CollaborationManager`].
//!
//! ```text
//! TcpListener ── accept ──► handle_connection (task per client)
//!                             │  first text frame: {userId, sessionId, deviceId}
//!                             ▼
//!                           manager.connect(identity, mpsc::Sender)
//!                             │
//!                             ▼  select! {
//!                             │    inbound frame → manager.handle_frame()
//!                             │    outbound msg  → ws.send(Text(json))
//!                             │    heartbeat     → ws.send(Ping)
//!                             │  }
//!                             ▼
//!                           manager.disconnect()   (inline, before the task ends)
//! ```

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::config::{ServerConfig, SyncConfig};
use crate::error::SyncError;
use crate::manager::CollaborationManager;
use crate::protocol::{decode_handshake, OutboundMessage, ProtocolError};
use crate::storage::{RocksBackend, RocksConfig};
use crate::store::VersionedDataStore;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    manager: Arc<CollaborationManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    /// Build the manager from `config`, opening RocksDB when
    /// `server.storage_path` is set.
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        let store = match &config.server.storage_path {
            Some(path) => {
                let backend = RocksBackend::open(RocksConfig::new(path))?;
                log::info!("Persisting versions to {}", path.display());
                VersionedDataStore::with_backend(config.store.clone(), Arc::new(backend))
            }
            None => VersionedDataStore::new(config.store.clone()),
        };
        let server_config = config.server.clone();
        let manager = CollaborationManager::with_store(config, Arc::new(store));
        Ok(Self::with_manager(server_config, Arc::new(manager)))
    }

    /// Serve an existing manager.
    pub fn with_manager(config: ServerConfig, manager: Arc<CollaborationManager>) -> Self {
        Self {
            config,
            manager,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn manager(&self) -> Arc<CollaborationManager> {
        self.manager.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collaboration server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            if self.config.max_connections > 0 {
                let mut s = self.stats.write().await;
                if s.active_connections as usize >= self.config.max_connections {
                    s.rejected_connections += 1;
                    log::warn!("Rejecting {addr}: {} connections open", s.active_connections);
                    continue;
                }
            }

            let manager = self.manager.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, manager, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        manager: Arc<CollaborationManager>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // The first frame must identify the session.
        let handshake = tokio::time::timeout(
            Duration::from_secs(config.handshake_timeout_secs),
            ws_receiver.next(),
        )
        .await;
        let identity = match handshake {
            Ok(Some(Ok(Message::Text(text)))) => decode_handshake(text.as_str()),
            Ok(Some(Ok(_))) => Err(ProtocolError::HandshakeRequired),
            Ok(Some(Err(e))) => {
                stats.write().await.active_connections -= 1;
                return Err(e.into());
            }
            Ok(None) => Err(ProtocolError::ConnectionClosed),
            Err(_) => Err(ProtocolError::Timeout),
        };
        let identity = match identity {
            Ok(identity) => identity,
            Err(e) => {
                log::warn!("Handshake from {addr} failed: {e}");
                let reply = OutboundMessage::error("handshake", e.to_string());
                if let Ok(text) = reply.encode() {
                    let _ = ws_sender.send(Message::Text(text.into())).await;
                }
                let _ = ws_sender.send(Message::Close(None)).await;
                stats.write().await.active_connections -= 1;
                return Ok(());
            }
        };

        let user = identity.user_id.clone();
        let buffer = manager.config().bus.connection_buffer.max(1);
        let (tx, mut rx) = mpsc::channel::<Arc<OutboundMessage>>(buffer);
        let conn = manager.connect(identity, Arc::new(tx)).await;

        let ack = OutboundMessage::ack(
            None,
            json!({ "kind": "handshake", "connectionId": conn.0, "userId": user }),
        );
        if let Err(e) = manager.bus().send_to_connection(conn, ack).await {
            log::warn!("Handshake ack to {conn} not delivered: {e}");
        }

        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs.max(1)));
        heartbeat.tick().await;

        let result: Result<(), BoxError> = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            manager.bus().touch(conn).await;
                            manager.handle_frame(conn, text.as_str()).await;
                        }
                        Some(Ok(Message::Binary(_))) => {
                            let reply = OutboundMessage::error("validation", "binary frames are not supported");
                            let _ = manager.bus().send_to_connection(conn, reply).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            manager.bus().touch(conn).await;
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            manager.bus().touch(conn).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break Ok(());
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break Err(e.into());
                        }
                        _ => {}
                    }
                }
                outbound = rx.recv() => {
                    match outbound {
                        Some(message) => match message.encode() {
                            Ok(text) => {
                                if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                                    break Err(e.into());
                                }
                            }
                            Err(e) => log::error!("Dropping unencodable message {}: {e}", message.message_id),
                        },
                        // The bus dropped our sink: a newer connection took over the session.
                        None => {
                            log::info!("{conn} superseded, closing {addr}");
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break Ok(());
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = ws_sender.send(Message::Ping(Vec::new().into())).await {
                        break Err(e.into());
                    }
                }
            }
        };

        // Cleanup runs before the task ends so no stale subscription survives it.
        manager.disconnect(conn).await;
        stats.write().await.active_connections -= 1;
        result
    }
}
