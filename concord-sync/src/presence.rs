//! Per-user live status, fanned out through the event bus.
//!
//! ```text
//! update(presence, participating)
//!       │  stale (older last_seen) → ignored
//!       ▼
//! presences[user] = presence
//!       │
//!       ▼   presence.workspace_id set?  yes → that workspace only
//!       │                               no  → every participating workspace
//! EventBus::publish_to_workspaces()   (originating user excluded)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::bus::{DeliveryReport, EventBus};
use crate::ids::{EntityKey, UserId, WorkspaceId};
use crate::protocol::{CollaborationEvent, EventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
    DoNotDisturb,
}

/// Cursor location inside a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub field: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence {
    pub user_id: UserId,
    pub status: PresenceStatus,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<WorkspaceId>,
    #[serde(default)]
    pub resource: Option<EntityKey>,
    #[serde(default)]
    pub cursor: Option<CursorPosition>,
    #[serde(default = "Utc::now")]
    pub last_seen: DateTime<Utc>,
}

impl UserPresence {
    pub fn new(user_id: UserId, status: PresenceStatus) -> Self {
        Self {
            user_id,
            status,
            message: None,
            workspace_id: None,
            resource: None,
            cursor: None,
            last_seen: Utc::now(),
        }
    }

    pub fn offline(user_id: UserId) -> Self {
        Self::new(user_id, PresenceStatus::Offline)
    }

    pub fn in_workspace(mut self, ws: WorkspaceId) -> Self {
        self.workspace_id = Some(ws);
        self
    }

    pub fn on_resource(mut self, resource: EntityKey) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn with_cursor(mut self, x: f64, y: f64) -> Self {
        self.cursor = Some(CursorPosition { x, y, field: None });
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    fn to_event(&self) -> CollaborationEvent {
        let payload = serde_json::to_value(self).unwrap_or_default();
        let mut event =
            CollaborationEvent::new(EventKind::Presence, self.user_id.clone(), self.workspace_id)
                .with_payload(payload);
        if let Some(resource) = &self.resource {
            event = event.with_resource(resource.clone());
        }
        event
    }
}

pub struct PresenceTracker {
    presences: RwLock<HashMap<UserId, UserPresence>>,
    bus: Arc<EventBus>,
}

impl PresenceTracker {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            presences: RwLock::new(HashMap::new()),
            bus,
        }
    }

    /// Store and broadcast. `participating` lists the workspaces the user
    /// belongs to, used when the presence names no workspace.
    ///
    /// Returns `None` when the update is older than the stored one.
    pub async fn update(
        &self,
        presence: UserPresence,
        participating: &[WorkspaceId],
    ) -> Option<DeliveryReport> {
        {
            let mut presences = self.presences.write().await;
            if let Some(current) = presences.get(&presence.user_id) {
                if current.last_seen > presence.last_seen {
                    log::trace!("Ignoring stale presence for {}", presence.user_id);
                    return None;
                }
            }
            presences.insert(presence.user_id.clone(), presence.clone());
        }
        Some(self.broadcast(&presence, participating).await)
    }

    /// Forget a user and tell their workspaces they went offline. Users that
    /// never published a presence are removed silently.
    pub async fn remove(
        &self,
        user: &UserId,
        participating: &[WorkspaceId],
    ) -> Option<UserPresence> {
        let removed = self.presences.write().await.remove(user)?;
        let offline = UserPresence::offline(user.clone());
        let report = self.broadcast(&offline, participating).await;
        log::debug!("{user} offline, notified {} connections", report.delivered);
        Some(removed)
    }

    async fn broadcast(
        &self,
        presence: &UserPresence,
        participating: &[WorkspaceId],
    ) -> DeliveryReport {
        let targets: Vec<WorkspaceId> = match presence.workspace_id {
            Some(ws) => vec![ws],
            None => participating.to_vec(),
        };
        if targets.is_empty() {
            return DeliveryReport::default();
        }
        self.bus
            .publish_to_workspaces(presence.to_event(), &targets)
            .await
    }

    pub async fn get(&self, user: &UserId) -> Option<UserPresence> {
        self.presences.read().await.get(user).cloned()
    }

    /// Users not marked offline, optionally only those placed in `ws`.
    pub async fn online_users(&self, ws: Option<WorkspaceId>) -> Vec<UserPresence> {
        self.presences
            .read()
            .await
            .values()
            .filter(|p| p.status != PresenceStatus::Offline)
            .filter(|p| ws.is_none() || p.workspace_id == ws)
            .cloned()
            .collect()
    }

    /// Users whose last update is older than `timeout`.
    pub async fn idle_users(&self, timeout: Duration) -> Vec<UserId> {
        let cutoff = Utc::now() - chrono::Duration::from_std(timeout).unwrap_or_default();
        self.presences
            .read()
            .await
            .values()
            .filter(|p| p.last_seen < cutoff)
            .map(|p| p.user_id.clone())
            .collect()
    }
}
