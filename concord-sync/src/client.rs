//! WebSocket client for the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect) with the session handshake
//! - Typed sends of [`InboundEvent`]s and a receiver of [`OutboundMessage`]s
//! - An offline queue for events sent while disconnected, replayed on connect

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::ids::{ConflictId, EntityKey, SessionIdentity, VersionId, WorkspaceId};
use crate::offline::OfflineQueue;
use crate::protocol::{EventKind, InboundEvent, MessageKind, OutboundMessage, ProtocolError};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// How long `connect` waits for the server to acknowledge the handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct CollabClient {
    identity: SessionIdentity,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    /// Server-assigned connection handle, known after the handshake.
    connection_id: Option<u64>,
    offline_queue: Arc<Mutex<OfflineQueue<InboundEvent>>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,
    incoming_tx: mpsc::Sender<OutboundMessage>,
    incoming_rx: Option<mpsc::Receiver<OutboundMessage>>,
}

impl CollabClient {
    pub fn new(identity: SessionIdentity, server_url: impl Into<String>) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::channel(1024);
        Self {
            identity,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            connection_id: None,
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            incoming_tx,
            incoming_rx: Some(incoming_rx),
        }
    }

    /// Take the message receiver (can only be called once).
    pub fn take_message_rx(&mut self) -> Option<mpsc::Receiver<OutboundMessage>> {
        self.incoming_rx.take()
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn connection_id(&self) -> Option<u64> {
        self.connection_id
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn queued(&self) -> usize {
        self.offline_queue.lock().await.len()
    }

    /// Connect, send the handshake and wait for the server to acknowledge
    /// it. Messages the server flushes before the acknowledgement (queued
    /// while this user was offline) are forwarded to the receiver in order.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let handshake = serde_json::to_string(&self.identity)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        ws_writer
            .send(Message::Text(handshake.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        let connection_id = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            while let Some(frame) = ws_reader.next().await {
                let Ok(Message::Text(text)) = frame else {
                    continue;
                };
                let message = OutboundMessage::decode(text.as_str())?;
                match message.message_kind {
                    MessageKind::Ack if message.payload["kind"] == "handshake" => {
                        return Ok(message.payload["connectionId"].as_u64().unwrap_or_default());
                    }
                    MessageKind::Error if message.payload["code"] == "handshake" => {
                        let reason = message.payload["message"].as_str().unwrap_or_default();
                        return Err(ProtocolError::Invalid(reason.to_string()));
                    }
                    _ => {
                        let _ = self.incoming_tx.send(message).await;
                    }
                }
            }
            Err(ProtocolError::ConnectionClosed)
        })
        .await
        .map_err(|_| ProtocolError::Timeout)?;
        let connection_id = match connection_id {
            Ok(id) => id,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e);
            }
        };
        self.connection_id = Some(connection_id);

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if ws_writer.send(message).await.is_err() || closing {
                    break;
                }
            }
        });
        self.outgoing_tx = Some(out_tx);

        // Reader task: decode frames into the message channel
        let incoming_tx = self.incoming_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match OutboundMessage::decode(text.as_str()) {
                        Ok(message) => {
                            if incoming_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Undecodable server message: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            *state.write().await = ConnectionState::Disconnected;
        });

        *self.state.write().await = ConnectionState::Connected;
        log::info!("{} connected as conn#{connection_id}", self.identity.user_id);

        // Replay offline queue
        let queued = self.offline_queue.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued events", queued.len());
            for event in queued {
                self.send(event).await?;
            }
        }
        Ok(())
    }

    /// Send an event, or queue it while disconnected.
    pub async fn send(&self, event: InboundEvent) -> Result<(), ProtocolError> {
        let connected = *self.state.read().await == ConnectionState::Connected;
        match &self.outgoing_tx {
            Some(tx) if connected => {
                let text = event.encode()?;
                tx.send(Message::Text(text.into()))
                    .await
                    .map_err(|_| ProtocolError::ConnectionClosed)
            }
            _ => {
                self.offline_queue.lock().await.enqueue(event, None);
                Ok(())
            }
        }
    }

    /// Send a raw text frame, bypassing encoding. Useful for probing the
    /// server with malformed input.
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        let text: String = text.into();
        tx.send(Message::Text(text.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn join(&self, ws: WorkspaceId) -> Result<(), ProtocolError> {
        self.send(InboundEvent::new(EventKind::Join, Some(ws))).await
    }

    pub async fn leave(&self, ws: WorkspaceId) -> Result<(), ProtocolError> {
        self.send(InboundEvent::new(EventKind::Leave, Some(ws))).await
    }

    /// Write `data` to `entity`. `kind` must be create, update or edit.
    pub async fn write(
        &self,
        kind: EventKind,
        ws: WorkspaceId,
        entity: &EntityKey,
        data: Value,
        parent: Option<VersionId>,
    ) -> Result<(), ProtocolError> {
        let mut event = InboundEvent::new(kind, Some(ws))
            .with_resource(entity)
            .with_data(data);
        if let Some(parent) = parent {
            event = event.with_parent(parent);
        }
        self.send(event).await
    }

    pub async fn resolve_conflict(
        &self,
        ws: WorkspaceId,
        conflict: ConflictId,
        payload: Value,
    ) -> Result<(), ProtocolError> {
        let data = serde_json::json!({ "conflictId": conflict.0.to_string(), "payload": payload });
        self.send(InboundEvent::new(EventKind::ConflictResolved, Some(ws)).with_data(data))
            .await
    }

    /// Close the connection.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        self.connection_id = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }
}
