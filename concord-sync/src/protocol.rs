//! JSON wire protocol between connections and the collaboration core.
//!
//! Frames are WebSocket text messages holding camelCase JSON:
//! ```text
//! client → server   first frame   {userId, sessionId, deviceId}
//! client → server   afterwards    {kind, workspaceId, resourceType, resourceId, data, metadata}
//! server → client                 {messageId, messageKind, senderId, workspaceId, channel, payload, timestamp}
//! ```
//!
//! `messageKind` is `{"event": "<kind>"}` for relayed collaboration events,
//! or one of `"direct"`, `"ack"`, `"error"`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::ids::{EntityKey, SessionIdentity, UserId, VersionId, WorkspaceId};

/// Fixed set of collaboration event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Open,
    Close,
    Edit,
    Lock,
    Unlock,
    Join,
    Leave,
    Typing,
    Cursor,
    Create,
    Update,
    Delete,
    Comment,
    ConflictDetected,
    ConflictResolved,
    SyncStart,
    SyncComplete,
    PermissionChanged,
    Presence,
}

impl EventKind {
    pub const ALL: [EventKind; 19] = [
        EventKind::Open,
        EventKind::Close,
        EventKind::Edit,
        EventKind::Lock,
        EventKind::Unlock,
        EventKind::Join,
        EventKind::Leave,
        EventKind::Typing,
        EventKind::Cursor,
        EventKind::Create,
        EventKind::Update,
        EventKind::Delete,
        EventKind::Comment,
        EventKind::ConflictDetected,
        EventKind::ConflictResolved,
        EventKind::SyncStart,
        EventKind::SyncComplete,
        EventKind::PermissionChanged,
        EventKind::Presence,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Open => "open",
            EventKind::Close => "close",
            EventKind::Edit => "edit",
            EventKind::Lock => "lock",
            EventKind::Unlock => "unlock",
            EventKind::Join => "join",
            EventKind::Leave => "leave",
            EventKind::Typing => "typing",
            EventKind::Cursor => "cursor",
            EventKind::Create => "create",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
            EventKind::Comment => "comment",
            EventKind::ConflictDetected => "conflict_detected",
            EventKind::ConflictResolved => "conflict_resolved",
            EventKind::SyncStart => "sync_start",
            EventKind::SyncComplete => "sync_complete",
            EventKind::PermissionChanged => "permission_changed",
            EventKind::Presence => "presence",
        }
    }

    /// Kinds only the server may emit.
    pub fn is_server_only(&self) -> bool {
        matches!(self, EventKind::ConflictDetected | EventKind::PermissionChanged)
    }

    /// Kinds that write entity data through the versioned store.
    pub fn is_data_write(&self) -> bool {
        matches!(self, EventKind::Create | EventKind::Update | EventKind::Edit)
    }

    /// Kinds that must name a resource.
    pub fn requires_resource(&self) -> bool {
        self.is_data_write()
            || matches!(
                self,
                EventKind::Delete | EventKind::Lock | EventKind::Unlock | EventKind::Comment
            )
    }

    /// Kinds that may omit the workspace.
    pub fn workspace_optional(&self) -> bool {
        matches!(self, EventKind::Presence)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event flowing through the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationEvent {
    pub id: Uuid,
    pub kind: EventKind,
    pub actor: UserId,
    pub workspace_id: Option<WorkspaceId>,
    pub resource: Option<EntityKey>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl CollaborationEvent {
    pub fn new(kind: EventKind, actor: UserId, workspace_id: Option<WorkspaceId>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            actor,
            workspace_id,
            resource: None,
            payload: Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_resource(mut self, resource: EntityKey) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// An event as received from an authenticated channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    pub kind: EventKind,
    #[serde(default)]
    pub workspace_id: Option<WorkspaceId>,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub metadata: Value,
}

impl InboundEvent {
    pub fn new(kind: EventKind, workspace_id: Option<WorkspaceId>) -> Self {
        Self {
            kind,
            workspace_id,
            resource_type: None,
            resource_id: None,
            data: Value::Null,
            metadata: Value::Null,
        }
    }

    pub fn with_resource(mut self, entity: &EntityKey) -> Self {
        self.resource_type = Some(entity.resource_type.clone());
        self.resource_id = Some(entity.resource_id.clone());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_parent(mut self, parent: VersionId) -> Self {
        let mut metadata = match self.metadata {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        metadata.insert("parentVersion".into(), json!(parent.0.to_string()));
        self.metadata = Value::Object(metadata);
        self
    }

    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Structural checks that do not need any server state.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.kind.is_server_only() {
            return Err(ProtocolError::Invalid(format!(
                "'{}' events are emitted by the server only",
                self.kind
            )));
        }
        if self.workspace_id.is_none() && !self.kind.workspace_optional() {
            return Err(ProtocolError::Invalid(format!(
                "'{}' events require workspaceId",
                self.kind
            )));
        }
        if self.kind.requires_resource() && self.entity().is_none() {
            return Err(ProtocolError::Invalid(format!(
                "'{}' events require resourceType and resourceId",
                self.kind
            )));
        }
        for part in [&self.resource_type, &self.resource_id].into_iter().flatten() {
            if part.contains('\0') {
                return Err(ProtocolError::Invalid(
                    "resourceType and resourceId must not contain NUL".into(),
                ));
            }
        }
        if self.kind.is_data_write() && !self.data.is_object() {
            return Err(ProtocolError::Invalid(
                "data writes require an object in 'data'".into(),
            ));
        }
        self.parent_version()?;
        Ok(())
    }

    /// The addressed entity, if both halves are present and non-empty.
    pub fn entity(&self) -> Option<EntityKey> {
        match (&self.resource_type, &self.resource_id) {
            (Some(t), Some(id)) if !t.is_empty() && !id.is_empty() => {
                Some(EntityKey::new(t.clone(), id.clone()))
            }
            _ => None,
        }
    }

    /// `metadata.parentVersion`, parsed.
    pub fn parent_version(&self) -> Result<Option<VersionId>, ProtocolError> {
        match self.metadata.get("parentVersion") {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Uuid::parse_str(s)
                .map(|id| Some(VersionId(id)))
                .map_err(|_| ProtocolError::Invalid(format!("parentVersion '{s}' is not a UUID"))),
            Some(other) => Err(ProtocolError::Invalid(format!(
                "parentVersion must be a string, got {other}"
            ))),
        }
    }
}

/// Classifies an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Event(EventKind),
    Direct,
    Ack,
    Error,
}

/// A message delivered verbatim to connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub message_id: Uuid,
    pub message_kind: MessageKind,
    pub sender_id: Option<UserId>,
    pub workspace_id: Option<WorkspaceId>,
    pub channel: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl OutboundMessage {
    /// Wrap a collaboration event for fan-out.
    pub fn from_event(event: &CollaborationEvent) -> Self {
        let mut payload = match &event.payload {
            Value::Object(map) => map.clone(),
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".into(), other.clone());
                map
            }
        };
        payload.insert("eventId".into(), json!(event.id.to_string()));
        if let Some(resource) = &event.resource {
            payload.insert("resourceType".into(), json!(resource.resource_type));
            payload.insert("resourceId".into(), json!(resource.resource_id));
        }

        let channel = match event.workspace_id {
            Some(ws) => format!("workspace:{ws}"),
            None => format!("user:{}", event.actor),
        };
        Self {
            message_id: Uuid::new_v4(),
            message_kind: MessageKind::Event(event.kind),
            sender_id: Some(event.actor.clone()),
            workspace_id: event.workspace_id,
            channel,
            payload: Value::Object(payload),
            timestamp: event.timestamp,
        }
    }

    /// A user-to-user (or system-to-user) message.
    pub fn direct(sender: Option<UserId>, target: &UserId, payload: Value) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            message_kind: MessageKind::Direct,
            sender_id: sender,
            workspace_id: None,
            channel: format!("user:{target}"),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Acknowledgement returned to the originating connection only.
    pub fn ack(workspace_id: Option<WorkspaceId>, payload: Value) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            message_kind: MessageKind::Ack,
            sender_id: None,
            workspace_id,
            channel: "session".to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Error returned to the originating connection only.
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            message_kind: MessageKind::Error,
            sender_id: None,
            workspace_id: None,
            channel: "session".to_string(),
            payload: json!({ "code": code, "message": message.into() }),
            timestamp: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// The event kind, for event messages.
    pub fn event_kind(&self) -> Option<EventKind> {
        match self.message_kind {
            MessageKind::Event(kind) => Some(kind),
            _ => None,
        }
    }
}

/// Decode the first frame of a channel.
pub fn decode_handshake(text: &str) -> Result<SessionIdentity, ProtocolError> {
    let identity: SessionIdentity = serde_json::from_str(text)
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    if identity.user_id.as_str().is_empty() || identity.session_id.as_str().is_empty() {
        return Err(ProtocolError::Invalid(
            "handshake requires non-empty userId and sessionId".into(),
        ));
    }
    Ok(identity)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    Invalid(String),
    HandshakeRequired,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::Invalid(e) => write!(f, "Invalid event: {e}"),
            Self::HandshakeRequired => write!(f, "Handshake required"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
