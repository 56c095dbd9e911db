//! The collaboration manager: workspace lifecycle, inbound routing and the
//! sync pipeline.
//!
//! ```text
//! handle_frame(conn, text)
//!   └─ decode + validate ───────────────────► error to conn on failure
//!        ├─ join / leave           → membership + subscriptions
//!        ├─ create / update / edit → sync_data_version ──┐
//!        ├─ presence               → PresenceTracker      │
//!        ├─ conflict_resolved      → resolve_conflict     │
//!        └─ anything else          → relayed to workspace │
//!                                                         ▼
//!   lock_entity ── detect ─┬─ none ─────► store_version ─────────► update
//!                          └─ conflict ─► store_divergent
//!                                         ├─ auto ─► resolver ─ok─► update
//!                                         └─ otherwise ───────────► conflict_detected
//! ```
//!
//! The entity guard is always dropped before anything is published.

use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::bus::{DeliveryReport, EventBus, MessageSink, Unregistered};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::ids::{ConflictId, ConnectionId, EntityKey, SessionIdentity, UserId, VersionId, WorkspaceId};
use crate::presence::{CursorPosition, PresenceStatus, PresenceTracker, UserPresence};
use crate::protocol::{CollaborationEvent, EventKind, InboundEvent, OutboundMessage};
use crate::resolver::{ActorContext, ConflictResolver, ResolutionStrategy, Strategy};
use crate::store::{ConflictRecord, DataVersion, Payload, StoreError, VersionedDataStore};
use crate::workspace::{
    read_only, CreateWorkspace, ParticipantStatus, Permission, PermissionSet, Workspace,
    WorkspaceStatus,
};

/// Result of one data write.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// Written on top of the head.
    Accepted(DataVersion),
    /// Diverged and was reconciled on the spot; `version` is the new head.
    AutoResolved {
        version: DataVersion,
        conflict: ConflictRecord,
    },
    /// Diverged; `candidate` is stored off-head until someone resolves it.
    Pending {
        candidate: DataVersion,
        conflict: ConflictRecord,
    },
}

impl SyncOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            SyncOutcome::Accepted(_) => "accepted",
            SyncOutcome::AutoResolved { .. } => "auto_resolved",
            SyncOutcome::Pending { .. } => "pending",
        }
    }

    /// The version that became head, if any.
    pub fn head(&self) -> Option<&DataVersion> {
        match self {
            SyncOutcome::Accepted(version) | SyncOutcome::AutoResolved { version, .. } => {
                Some(version)
            }
            SyncOutcome::Pending { .. } => None,
        }
    }

    pub fn conflict(&self) -> Option<&ConflictRecord> {
        match self {
            SyncOutcome::Accepted(_) => None,
            SyncOutcome::AutoResolved { conflict, .. } | SyncOutcome::Pending { conflict, .. } => {
                Some(conflict)
            }
        }
    }

    fn ack_payload(&self) -> Value {
        let version = match self {
            SyncOutcome::Accepted(version) | SyncOutcome::AutoResolved { version, .. } => version,
            SyncOutcome::Pending { candidate, .. } => candidate,
        };
        json!({
            "status": self.status(),
            "versionId": version.id.0.to_string(),
            "version": version.version,
            "conflictId": self.conflict().map(|c| c.id.0.to_string()),
        })
    }
}

/// Broadcast shape of a stored version.
fn version_payload(version: &DataVersion) -> Value {
    json!({
        "versionId": version.id.0.to_string(),
        "version": version.version,
        "parentVersion": version.parent.map(|p| p.0.to_string()),
        "mergeParents": version.merge_parents.iter().map(|p| p.0.to_string()).collect::<Vec<_>>(),
        "author": version.author,
        "changedFields": version.changed_fields,
        "contentHash": version.content_hash,
        "data": version.payload,
    })
}

/// Client-supplied part of a presence update.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresenceUpdate {
    #[serde(default = "PresenceUpdate::online")]
    status: PresenceStatus,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    cursor: Option<CursorPosition>,
}

impl PresenceUpdate {
    fn online() -> PresenceStatus {
        PresenceStatus::Online
    }
}

fn workspace_of(event: &InboundEvent) -> Result<WorkspaceId, SyncError> {
    event
        .workspace_id
        .ok_or_else(|| SyncError::Validation(format!("'{}' events require workspaceId", event.kind)))
}

/// Orchestrates the store, resolver, bus and presence tracker.
pub struct CollaborationManager {
    config: SyncConfig,
    store: Arc<VersionedDataStore>,
    resolver: RwLock<ConflictResolver>,
    bus: Arc<EventBus>,
    presence: PresenceTracker,
    workspaces: RwLock<HashMap<WorkspaceId, Workspace>>,
    /// Open conflicts and the workspace they were raised in.
    pending: RwLock<HashMap<ConflictId, WorkspaceId>>,
}

impl CollaborationManager {
    /// In-memory store, default strategies.
    pub fn new(config: SyncConfig) -> Self {
        let store = Arc::new(VersionedDataStore::new(config.store.clone()));
        Self::with_store(config, store)
    }

    pub fn with_store(config: SyncConfig, store: Arc<VersionedDataStore>) -> Self {
        let bus = Arc::new(EventBus::new(config.bus.clone()));
        Self {
            presence: PresenceTracker::new(bus.clone()),
            resolver: RwLock::new(ConflictResolver::with_defaults()),
            workspaces: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            config,
            store,
            bus,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn store(&self) -> &Arc<VersionedDataStore> {
        &self.store
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Add or replace a resolution strategy.
    pub async fn register_strategy(&self, strategy: Arc<dyn ResolutionStrategy>) {
        self.resolver.write().await.register(strategy);
    }

    // ─── Connections ──────────────────────────────────────────────────

    /// Register a channel and subscribe it to every active workspace the
    /// user participates in.
    pub async fn connect(
        &self,
        identity: SessionIdentity,
        sink: Arc<dyn MessageSink>,
    ) -> ConnectionId {
        let user = identity.user_id.clone();
        let conn = self.bus.register_connection(identity, sink).await;
        let workspaces = self.participating(&user).await;
        for ws in &workspaces {
            self.bus.subscribe_to_workspace(conn, *ws).await;
        }
        log::info!("{user} connected on {conn} ({} workspaces)", workspaces.len());
        conn
    }

    /// Tear a channel down. When it was the user's last one, their
    /// presence is cleared and broadcast as offline.
    pub async fn disconnect(&self, conn: ConnectionId) -> Option<Unregistered> {
        let removed = self.bus.unregister_connection(conn).await?;
        let user = &removed.connection.identity.user_id;
        if !removed.user_still_connected {
            let participating = self.participating(user).await;
            self.presence.remove(user, &participating).await;
        }
        log::info!("{user} disconnected from {conn}");
        Some(removed)
    }

    // ─── Workspaces ───────────────────────────────────────────────────

    /// Create a workspace owned by `owner`. A requested id that is already
    /// taken is replaced with a fresh one.
    pub async fn create_workspace(&self, owner: &UserId, options: CreateWorkspace) -> Workspace {
        let mut workspace = Workspace::new(owner.clone(), options);
        {
            let mut workspaces = self.workspaces.write().await;
            if workspaces.contains_key(&workspace.id) {
                log::warn!("Workspace id {} already in use, minting a new one", workspace.id);
                workspace.id = WorkspaceId::new();
            }
            workspaces.insert(workspace.id, workspace.clone());
        }
        let id = workspace.id;
        self.bus.subscribe_user(owner, id).await;
        log::info!("Workspace {id} '{}' created by {owner}", workspace.name);
        workspace
    }

    pub async fn workspace(&self, ws: WorkspaceId) -> Option<Workspace> {
        self.workspaces.read().await.get(&ws).cloned()
    }

    /// Join `ws`. New participants get `permissions`, or read-only when
    /// none are given; existing participants keep theirs.
    pub async fn join_workspace(
        &self,
        ws: WorkspaceId,
        user: &UserId,
        permissions: Option<PermissionSet>,
    ) -> Result<PermissionSet, SyncError> {
        let granted = {
            let mut workspaces = self.workspaces.write().await;
            let workspace = workspaces
                .get_mut(&ws)
                .ok_or(SyncError::WorkspaceNotFound(ws))?;
            if !workspace.active {
                return Err(SyncError::WorkspaceInactive(ws));
            }
            match workspace.participants.get(user) {
                Some(existing) => existing.clone(),
                None if workspace.require_approval => {
                    return Err(SyncError::ApprovalRequired {
                        workspace: ws,
                        user: user.clone(),
                    });
                }
                None => {
                    let granted = permissions.unwrap_or_else(read_only);
                    workspace.participants.insert(user.clone(), granted.clone());
                    granted
                }
            }
        };

        self.bus.subscribe_user(user, ws).await;
        let event = CollaborationEvent::new(EventKind::Join, user.clone(), Some(ws))
            .with_payload(json!({ "userId": user, "permissions": granted }));
        self.bus.publish(event).await;
        log::info!("{user} joined workspace {ws}");
        Ok(granted)
    }

    pub async fn leave_workspace(&self, ws: WorkspaceId, user: &UserId) -> Result<(), SyncError> {
        {
            let mut workspaces = self.workspaces.write().await;
            let workspace = workspaces
                .get_mut(&ws)
                .ok_or(SyncError::WorkspaceNotFound(ws))?;
            if workspace.owner == *user {
                return Err(SyncError::OwnerCannotLeave(ws));
            }
            if workspace.participants.remove(user).is_none() {
                return Err(SyncError::NotParticipant {
                    workspace: ws,
                    user: user.clone(),
                });
            }
        }

        let event = CollaborationEvent::new(EventKind::Leave, user.clone(), Some(ws))
            .with_payload(json!({ "userId": user }));
        self.bus.publish(event).await;
        self.bus.unsubscribe_user(user, ws).await;
        log::info!("{user} left workspace {ws}");
        Ok(())
    }

    /// Pre-approve `user` (owner or admin only).
    pub async fn add_participant(
        &self,
        ws: WorkspaceId,
        by: &UserId,
        user: &UserId,
        permissions: PermissionSet,
    ) -> Result<(), SyncError> {
        let mut workspaces = self.workspaces.write().await;
        let workspace = Self::administered(&mut workspaces, ws, by)?;
        if workspace.owner == *user {
            return Err(SyncError::Validation("the owner's permissions are fixed".into()));
        }
        workspace.participants.insert(user.clone(), permissions);
        log::debug!("{by} added {user} to workspace {ws}");
        Ok(())
    }

    /// Replace a participant's permissions (owner or admin only).
    pub async fn set_permissions(
        &self,
        ws: WorkspaceId,
        by: &UserId,
        user: &UserId,
        permissions: PermissionSet,
    ) -> Result<(), SyncError> {
        {
            let mut workspaces = self.workspaces.write().await;
            let workspace = Self::administered(&mut workspaces, ws, by)?;
            if workspace.owner == *user {
                return Err(SyncError::Validation("the owner's permissions are fixed".into()));
            }
            let Some(current) = workspace.participants.get_mut(user) else {
                return Err(SyncError::NotParticipant {
                    workspace: ws,
                    user: user.clone(),
                });
            };
            *current = permissions.clone();
        }

        let event = CollaborationEvent::new(EventKind::PermissionChanged, by.clone(), Some(ws))
            .with_payload(json!({ "userId": user, "permissions": permissions }));
        self.bus.publish(event).await;
        Ok(())
    }

    /// Remove someone else from the workspace (owner or admin only).
    pub async fn remove_participant(
        &self,
        ws: WorkspaceId,
        by: &UserId,
        user: &UserId,
    ) -> Result<(), SyncError> {
        {
            let mut workspaces = self.workspaces.write().await;
            let workspace = Self::administered(&mut workspaces, ws, by)?;
            if workspace.owner == *user {
                return Err(SyncError::OwnerCannotLeave(ws));
            }
            if workspace.participants.remove(user).is_none() {
                return Err(SyncError::NotParticipant {
                    workspace: ws,
                    user: user.clone(),
                });
            }
        }

        let event = CollaborationEvent::new(EventKind::Leave, by.clone(), Some(ws))
            .with_payload(json!({ "userId": user, "removedBy": by }));
        self.bus.publish(event).await;
        self.bus.unsubscribe_user(user, ws).await;
        Ok(())
    }

    /// Active → Inactive. Owner only; not reversible.
    pub async fn deactivate_workspace(&self, ws: WorkspaceId, by: &UserId) -> Result<(), SyncError> {
        {
            let mut workspaces = self.workspaces.write().await;
            let workspace = workspaces
                .get_mut(&ws)
                .ok_or(SyncError::WorkspaceNotFound(ws))?;
            if workspace.owner != *by {
                return Err(SyncError::PermissionDenied {
                    workspace: ws,
                    user: by.clone(),
                    permission: Permission::Admin,
                });
            }
            workspace.active = false;
        }

        let event = CollaborationEvent::new(EventKind::PermissionChanged, by.clone(), Some(ws))
            .with_payload(json!({ "active": false }));
        self.bus.publish(event).await;
        log::info!("Workspace {ws} deactivated by {by}");
        Ok(())
    }

    fn administered<'a>(
        workspaces: &'a mut HashMap<WorkspaceId, Workspace>,
        ws: WorkspaceId,
        by: &UserId,
    ) -> Result<&'a mut Workspace, SyncError> {
        let workspace = workspaces
            .get_mut(&ws)
            .ok_or(SyncError::WorkspaceNotFound(ws))?;
        if !workspace.active {
            return Err(SyncError::WorkspaceInactive(ws));
        }
        if !workspace.has_permission(by, Permission::Admin) {
            return Err(SyncError::PermissionDenied {
                workspace: ws,
                user: by.clone(),
                permission: Permission::Admin,
            });
        }
        Ok(workspace)
    }

    /// Active workspace in which `user` holds `permission`.
    async fn authorize(
        &self,
        ws: WorkspaceId,
        user: &UserId,
        permission: Permission,
    ) -> Result<Workspace, SyncError> {
        let workspaces = self.workspaces.read().await;
        let workspace = workspaces.get(&ws).ok_or(SyncError::WorkspaceNotFound(ws))?;
        if !workspace.active {
            return Err(SyncError::WorkspaceInactive(ws));
        }
        if !workspace.is_participant(user) {
            return Err(SyncError::NotParticipant {
                workspace: ws,
                user: user.clone(),
            });
        }
        if !workspace.has_permission(user, permission) {
            return Err(SyncError::PermissionDenied {
                workspace: ws,
                user: user.clone(),
                permission,
            });
        }
        Ok(workspace.clone())
    }

    /// Active workspaces `user` participates in.
    async fn participating(&self, user: &UserId) -> Vec<WorkspaceId> {
        self.workspaces
            .read()
            .await
            .values()
            .filter(|w| w.active && w.is_participant(user))
            .map(|w| w.id)
            .collect()
    }

    pub async fn get_workspace_status(&self, ws: WorkspaceId) -> Result<WorkspaceStatus, SyncError> {
        let workspace = self.workspace(ws).await.ok_or(SyncError::WorkspaceNotFound(ws))?;

        let mut participants = Vec::with_capacity(workspace.participants.len());
        for (user, permissions) in &workspace.participants {
            participants.push(ParticipantStatus {
                user_id: user.clone(),
                permissions: permissions.clone(),
                online: self.bus.is_online(user).await,
            });
        }
        participants.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        let pending_conflicts = self
            .pending
            .read()
            .await
            .values()
            .filter(|w| **w == ws)
            .count();

        Ok(WorkspaceStatus {
            id: workspace.id,
            name: workspace.name,
            owner: workspace.owner,
            active: workspace.active,
            sync_mode: workspace.sync_mode,
            default_strategy: workspace.default_strategy,
            require_approval: workspace.require_approval,
            online_count: participants.iter().filter(|p| p.online).count(),
            participants,
            subscriber_count: self.bus.subscribers(ws).await.len(),
            pending_conflicts,
            created_at: workspace.created_at,
        })
    }

    // ─── Data ─────────────────────────────────────────────────────────

    /// Write `patch` on top of `parent` (or create the entity when `parent`
    /// is `None` and the entity is empty).
    pub async fn sync_data_version(
        &self,
        ws: WorkspaceId,
        entity: EntityKey,
        patch: Payload,
        actor: &UserId,
        parent: Option<VersionId>,
    ) -> Result<SyncOutcome, SyncError> {
        let workspace = self.authorize(ws, actor, Permission::Write).await?;

        let outcome = {
            let mut guard = self.store.lock_entity(&entity).await?;
            let candidate = match parent {
                Some(id) => {
                    let parent = guard.get(&id).ok_or_else(|| {
                        SyncError::Validation(format!("unknown parent version {id} for {entity}"))
                    })?;
                    DataVersion::child(parent, guard.next_version_number(), actor.clone(), &patch)
                }
                None if guard.latest().is_some() => {
                    return Err(SyncError::Validation(format!(
                        "{entity} already exists; parentVersion is required"
                    )));
                }
                None => DataVersion::root(entity.clone(), actor.clone(), patch),
            };

            match guard.detect_conflict(&candidate)? {
                None => {
                    guard.store_version(candidate.clone())?;
                    SyncOutcome::Accepted(candidate)
                }
                Some(record) => {
                    let mut record = record.raised_in(ws);
                    guard.store_divergent(candidate.clone())?;
                    guard.record_conflict(record.clone()).await?;

                    let mut resolved = None;
                    if record.auto_resolvable && workspace.auto_resolves() {
                        let strategy = workspace.default_strategy.clone();
                        let snapshot = guard.snapshot(record.id)?;
                        let ctx = ActorContext::new(actor.clone(), Some(ws));
                        let attempt = self.resolver.read().await.resolve(&strategy, &snapshot, &ctx);
                        match attempt {
                            Ok(version) => match guard
                                .resolve_conflict(
                                    record.id,
                                    version.clone(),
                                    strategy,
                                    actor.clone(),
                                    false,
                                )
                                .await
                            {
                                Ok(closed) => {
                                    resolved = Some(SyncOutcome::AutoResolved {
                                        version,
                                        conflict: closed,
                                    });
                                }
                                Err(e) => {
                                    log::warn!(
                                        "{entity}: storing resolution of conflict {} failed, left pending: {e}",
                                        record.id
                                    );
                                }
                            },
                            Err(e) => {
                                log::info!("{entity}: conflict {} left pending: {e}", record.id);
                            }
                        }
                    }

                    match resolved {
                        Some(outcome) => outcome,
                        None => {
                            record.mark_pending();
                            if let Err(e) = guard.record_conflict(record.clone()).await {
                                log::warn!("{entity}: conflict {} not marked pending: {e}", record.id);
                            }
                            SyncOutcome::Pending {
                                candidate,
                                conflict: record,
                            }
                        }
                    }
                }
            }
        };

        match &outcome {
            SyncOutcome::Accepted(version) => {
                let event = CollaborationEvent::new(EventKind::Update, actor.clone(), Some(ws))
                    .with_resource(entity)
                    .with_payload(version_payload(version));
                self.bus.publish(event).await;
            }
            SyncOutcome::AutoResolved { version, conflict } => {
                let mut payload = version_payload(version);
                payload["resolvedConflict"] = json!(conflict.id.0.to_string());
                payload["strategy"] = json!(conflict.strategy.as_ref().map(Strategy::name));
                let event = CollaborationEvent::new(EventKind::Update, actor.clone(), Some(ws))
                    .with_resource(entity)
                    .with_payload(payload);
                self.bus.publish(event).await;
                log::debug!("Conflict {} auto-resolved", conflict.id);
            }
            SyncOutcome::Pending { conflict, .. } => {
                self.pending.write().await.insert(conflict.id, ws);
                let event =
                    CollaborationEvent::new(EventKind::ConflictDetected, actor.clone(), Some(ws))
                        .with_resource(entity)
                        .with_payload(conflict.summary());
                self.bus.publish(event).await;
                log::info!(
                    "Conflict {} on {} pending ({} fields)",
                    conflict.id,
                    conflict.entity,
                    conflict.conflicting_fields.len()
                );
            }
        }
        Ok(outcome)
    }

    /// Resolve a pending conflict by hand. `patch` is applied over the
    /// current head; the divergent version becomes a merge parent.
    pub async fn resolve_conflict(
        &self,
        ws: WorkspaceId,
        conflict_id: ConflictId,
        actor: &UserId,
        patch: Payload,
    ) -> Result<DataVersion, SyncError> {
        self.authorize(ws, actor, Permission::Write).await?;
        let entity = self.store.conflict_entity(conflict_id).await?;
        let tracked = self.pending.read().await.get(&conflict_id).copied();

        let (version, closed) = {
            let mut guard = self.store.lock_entity(&entity).await?;
            let snapshot = guard.snapshot(conflict_id)?;
            // Only writers of the workspace the conflict was raised in may close it.
            if let Some(origin) = tracked.or(snapshot.record.workspace).filter(|o| *o != ws) {
                log::warn!("{actor} tried to resolve conflict {conflict_id} of {origin} through {ws}");
                return Err(SyncError::Validation(format!(
                    "conflict {conflict_id} was not raised in workspace {ws}"
                )));
            }
            if !snapshot.record.is_open() {
                return Err(StoreError::AlreadyResolved(conflict_id).into());
            }
            let head = guard.latest().cloned().unwrap_or(snapshot.local);
            let version =
                DataVersion::child(&head, guard.next_version_number(), actor.clone(), &patch)
                    .with_merge_parent(snapshot.remote.id);
            let closed = guard
                .resolve_conflict(conflict_id, version.clone(), Strategy::Manual, actor.clone(), true)
                .await?;
            (version, closed)
        };
        self.pending.write().await.remove(&conflict_id);

        let mut payload = closed.summary();
        payload["resolvedVersion"] = version_payload(&version);
        let event = CollaborationEvent::new(EventKind::ConflictResolved, actor.clone(), Some(ws))
            .with_resource(entity)
            .with_payload(payload);
        self.bus.publish(event).await;
        log::info!("Conflict {conflict_id} resolved by {actor}");
        Ok(version)
    }

    pub async fn latest(&self, entity: &EntityKey) -> Result<Option<DataVersion>, SyncError> {
        Ok(self.store.get_latest(entity).await?)
    }

    pub async fn history(&self, entity: &EntityKey) -> Result<Vec<DataVersion>, SyncError> {
        Ok(self.store.get_history(entity).await?)
    }

    /// Open conflicts raised in `ws`.
    pub async fn pending_conflicts(&self, ws: WorkspaceId) -> Result<Vec<ConflictRecord>, SyncError> {
        let ids: Vec<ConflictId> = self
            .pending
            .read()
            .await
            .iter()
            .filter(|(_, w)| **w == ws)
            .map(|(id, _)| *id)
            .collect();
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let record = self.store.get_conflict(id).await?;
            if record.is_open() {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.detected_at);
        Ok(records)
    }

    // ─── Presence ─────────────────────────────────────────────────────

    /// Publish `presence` for `user`. Returns `None` for stale updates.
    pub async fn update_presence(
        &self,
        user: &UserId,
        mut presence: UserPresence,
    ) -> Result<Option<DeliveryReport>, SyncError> {
        presence.user_id = user.clone();
        if let Some(ws) = presence.workspace_id {
            self.authorize(ws, user, Permission::Read).await?;
        }
        let participating = self.participating(user).await;
        Ok(self.presence.update(presence, &participating).await)
    }

    // ─── Inbound routing ──────────────────────────────────────────────

    /// Decode and route one text frame. Errors are reported to `conn` only.
    pub async fn handle_frame(&self, conn: ConnectionId, text: &str) {
        match InboundEvent::decode(text) {
            Ok(event) => self.handle_inbound(conn, event).await,
            Err(e) => {
                log::debug!("Undecodable frame on {conn}: {e}");
                self.reply_error(conn, &SyncError::Validation(e.to_string()))
                    .await;
            }
        }
    }

    pub async fn handle_inbound(&self, conn: ConnectionId, event: InboundEvent) {
        let kind = event.kind;
        match self.route(conn, event).await {
            Ok(Some(ack)) => {
                if let Err(e) = self.bus.send_to_connection(conn, ack).await {
                    log::debug!("Ack for {kind} on {conn} not delivered: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => {
                if e.is_fatal() {
                    log::error!("{kind} on {conn}: {e}");
                } else {
                    log::debug!("{kind} on {conn} rejected: {e}");
                }
                self.reply_error(conn, &e).await;
            }
        }
    }

    async fn reply_error(&self, conn: ConnectionId, error: &SyncError) {
        let message = OutboundMessage::error(error.category().as_str(), error.to_string());
        if let Err(e) = self.bus.send_to_connection(conn, message).await {
            log::debug!("Error reply to {conn} not delivered: {e}");
        }
    }

    async fn route(
        &self,
        conn: ConnectionId,
        event: InboundEvent,
    ) -> Result<Option<OutboundMessage>, SyncError> {
        let info = self
            .bus
            .connection(conn)
            .await
            .ok_or(SyncError::UnknownConnection(conn))?;
        let user = info.identity.user_id;
        event
            .validate()
            .map_err(|e| SyncError::Validation(e.to_string()))?;

        match event.kind {
            EventKind::Join => {
                let ws = workspace_of(&event)?;
                let permissions = self.join_workspace(ws, &user, None).await?;
                Ok(Some(OutboundMessage::ack(
                    Some(ws),
                    json!({ "kind": "join", "permissions": permissions }),
                )))
            }
            EventKind::Leave => {
                let ws = workspace_of(&event)?;
                self.leave_workspace(ws, &user).await?;
                Ok(Some(OutboundMessage::ack(Some(ws), json!({ "kind": "leave" }))))
            }
            kind if kind.is_data_write() => {
                let ws = workspace_of(&event)?;
                let entity = event
                    .entity()
                    .ok_or_else(|| SyncError::Validation("missing resource".into()))?;
                let parent = event
                    .parent_version()
                    .map_err(|e| SyncError::Validation(e.to_string()))?;
                let patch = match event.data {
                    Value::Object(map) => map,
                    _ => return Err(SyncError::Validation("data must be an object".into())),
                };
                let outcome = self.sync_data_version(ws, entity, patch, &user, parent).await?;
                let mut payload = outcome.ack_payload();
                payload["kind"] = json!(kind.as_str());
                Ok(Some(OutboundMessage::ack(Some(ws), payload)))
            }
            EventKind::Presence => {
                let resource = event.entity();
                let update = match event.data {
                    Value::Null => serde_json::from_value::<PresenceUpdate>(json!({})),
                    data => serde_json::from_value::<PresenceUpdate>(data),
                }
                .map_err(|e| SyncError::Validation(format!("invalid presence: {e}")))?;
                let presence = UserPresence {
                    user_id: user.clone(),
                    status: update.status,
                    message: update.message,
                    workspace_id: event.workspace_id,
                    resource,
                    cursor: update.cursor,
                    last_seen: chrono::Utc::now(),
                };
                self.update_presence(&user, presence).await?;
                Ok(None)
            }
            EventKind::ConflictResolved => {
                let ws = workspace_of(&event)?;
                let conflict_id = event
                    .data
                    .get("conflictId")
                    .and_then(Value::as_str)
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .map(ConflictId)
                    .ok_or_else(|| {
                        SyncError::Validation("conflict_resolved requires data.conflictId".into())
                    })?;
                let patch = match event.data.get("payload") {
                    None | Some(Value::Null) => Payload::new(),
                    Some(Value::Object(map)) => map.clone(),
                    Some(_) => {
                        return Err(SyncError::Validation("data.payload must be an object".into()))
                    }
                };
                let version = self.resolve_conflict(ws, conflict_id, &user, patch).await?;
                Ok(Some(OutboundMessage::ack(
                    Some(ws),
                    json!({
                        "kind": "conflict_resolved",
                        "conflictId": conflict_id.0.to_string(),
                        "versionId": version.id.0.to_string(),
                    }),
                )))
            }
            kind => {
                let ws = workspace_of(&event)?;
                let needed = if kind == EventKind::Comment {
                    Permission::Comment
                } else {
                    Permission::Read
                };
                self.authorize(ws, &user, needed).await?;
                let mut relayed =
                    CollaborationEvent::new(kind, user, Some(ws)).with_payload(event.data.clone());
                if let Some(entity) = event.entity() {
                    relayed = relayed.with_resource(entity);
                }
                self.bus.publish_excluding_actor(relayed).await;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;
    use crate::store::{ConflictStatus, PersistedEntity, VersionBackend};
    use crate::workspace::{full_access, SyncMode};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    type Rx = mpsc::Receiver<Arc<OutboundMessage>>;

    fn manager() -> CollaborationManager {
        CollaborationManager::new(SyncConfig::for_testing())
    }

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn task() -> EntityKey {
        EntityKey::new("task", "7")
    }

    async fn connect(mgr: &CollaborationManager, user: &str) -> (ConnectionId, Rx) {
        let (tx, rx) = mpsc::channel(64);
        let conn = mgr
            .connect(SessionIdentity::new(user, format!("{user}-session"), "laptop"), Arc::new(tx))
            .await;
        (conn, rx)
    }

    fn drain(rx: &mut Rx) -> Vec<Arc<OutboundMessage>> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn kinds(messages: &[Arc<OutboundMessage>]) -> Vec<EventKind> {
        messages.iter().filter_map(|m| m.event_kind()).collect()
    }

    /// Workspace owned by alice with bob as a writer.
    async fn shared_workspace(mgr: &CollaborationManager, options: CreateWorkspace) -> WorkspaceId {
        let alice = UserId::new("alice");
        let ws = mgr.create_workspace(&alice, options).await.id;
        mgr.add_participant(ws, &alice, &UserId::new("bob"), full_access())
            .await
            .unwrap();
        ws
    }

    async fn seed(mgr: &CollaborationManager, ws: WorkspaceId) -> DataVersion {
        let outcome = mgr
            .sync_data_version(
                ws,
                task(),
                payload(json!({"status": "open", "title": "Draft", "owner": "carol"})),
                &UserId::new("alice"),
                None,
            )
            .await
            .unwrap();
        outcome.head().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_owner_is_auto_subscribed() {
        let mgr = manager();
        let (conn, _rx) = connect(&mgr, "alice").await;
        let ws = mgr
            .create_workspace(&UserId::new("alice"), CreateWorkspace::named("Ops"))
            .await
            .id;
        assert_eq!(mgr.bus().subscribers(ws).await, vec![conn]);
    }

    #[tokio::test]
    async fn test_reconnect_resubscribes() {
        let mgr = manager();
        let ws = shared_workspace(&mgr, CreateWorkspace::default()).await;
        let (conn, _rx) = connect(&mgr, "bob").await;
        assert_eq!(mgr.bus().subscribers(ws).await, vec![conn]);
    }

    #[tokio::test]
    async fn test_join_requires_approval() {
        let mgr = manager();
        let alice = UserId::new("alice");
        let ws = mgr
            .create_workspace(&alice, CreateWorkspace::named("Finance").require_approval())
            .await
            .id;

        let err = mgr
            .join_workspace(ws, &UserId::new("mallory"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ApprovalRequired { .. }));
        assert!(!mgr.workspace(ws).await.unwrap().is_participant(&UserId::new("mallory")));

        mgr.add_participant(ws, &alice, &UserId::new("bob"), read_only())
            .await
            .unwrap();
        assert_eq!(
            mgr.join_workspace(ws, &UserId::new("bob"), None).await.unwrap(),
            read_only()
        );
    }

    #[tokio::test]
    async fn test_join_defaults_to_read_only_and_broadcasts() {
        let mgr = manager();
        let (_alice, mut alice_rx) = connect(&mgr, "alice").await;
        let ws = mgr
            .create_workspace(&UserId::new("alice"), CreateWorkspace::default())
            .await
            .id;
        let bob = UserId::new("bob");

        assert_eq!(mgr.join_workspace(ws, &bob, None).await.unwrap(), read_only());
        assert_eq!(kinds(&drain(&mut alice_rx)), vec![EventKind::Join]);

        let err = mgr
            .sync_data_version(ws, task(), Payload::new(), &bob, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::PermissionDenied { permission: Permission::Write, .. }
        ));
    }

    #[tokio::test]
    async fn test_inactive_workspace_rejects_join_and_writes() {
        let mgr = manager();
        let alice = UserId::new("alice");
        let ws = mgr.create_workspace(&alice, CreateWorkspace::default()).await.id;

        let err = mgr
            .deactivate_workspace(ws, &UserId::new("bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::PermissionDenied { .. }));

        mgr.deactivate_workspace(ws, &alice).await.unwrap();
        assert!(matches!(
            mgr.join_workspace(ws, &UserId::new("bob"), None).await,
            Err(SyncError::WorkspaceInactive(_))
        ));
        assert!(matches!(
            mgr.sync_data_version(ws, task(), Payload::new(), &alice, None).await,
            Err(SyncError::WorkspaceInactive(_))
        ));
    }

    #[tokio::test]
    async fn test_owner_cannot_leave_or_be_removed() {
        let mgr = manager();
        let ws = shared_workspace(&mgr, CreateWorkspace::default()).await;
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        assert!(matches!(
            mgr.leave_workspace(ws, &alice).await,
            Err(SyncError::OwnerCannotLeave(_))
        ));
        assert!(matches!(
            mgr.remove_participant(ws, &bob, &alice).await,
            Err(SyncError::OwnerCannotLeave(_))
        ));
        mgr.leave_workspace(ws, &bob).await.unwrap();
        assert!(matches!(
            mgr.leave_workspace(ws, &bob).await,
            Err(SyncError::NotParticipant { .. })
        ));
        assert!(mgr.workspace(ws).await.unwrap().is_participant(&alice));
    }

    #[tokio::test]
    async fn test_set_permissions_broadcasts() {
        let mgr = manager();
        let ws = shared_workspace(&mgr, CreateWorkspace::default()).await;
        let (_bob, mut bob_rx) = connect(&mgr, "bob").await;

        mgr.set_permissions(ws, &UserId::new("alice"), &UserId::new("bob"), read_only())
            .await
            .unwrap();
        let messages = drain(&mut bob_rx);
        assert_eq!(kinds(&messages), vec![EventKind::PermissionChanged]);
        assert_eq!(messages[0].payload["permissions"], json!(["read"]));

        let err = mgr
            .set_permissions(ws, &UserId::new("bob"), &UserId::new("alice"), read_only())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_edit_resolved_last_write_wins() {
        let mgr = manager();
        let ws = shared_workspace(&mgr, CreateWorkspace::default()).await;
        let (_alice, mut observer) = connect(&mgr, "alice").await;
        let v1 = seed(&mgr, ws).await;
        drain(&mut observer);

        let v2a = mgr
            .sync_data_version(
                ws,
                task(),
                payload(json!({"status": "approved"})),
                &UserId::new("alice"),
                Some(v1.id),
            )
            .await
            .unwrap();
        assert_eq!(v2a.status(), "accepted");
        tokio::time::sleep(Duration::from_millis(5)).await;

        let v2b = mgr
            .sync_data_version(
                ws,
                task(),
                payload(json!({"status": "rejected"})),
                &UserId::new("bob"),
                Some(v1.id),
            )
            .await
            .unwrap();
        let SyncOutcome::AutoResolved { version, conflict } = &v2b else {
            panic!("expected auto resolution, got {}", v2b.status());
        };
        assert_eq!(conflict.strategy, Some(Strategy::LastWriteWins));
        assert_eq!(version.field("status"), Some(&json!("rejected")));

        let latest = mgr.latest(&task()).await.unwrap().unwrap();
        assert_eq!(latest.id, version.id);
        assert_eq!(latest.field("title"), Some(&json!("Draft")));
        assert_eq!(mgr.history(&task()).await.unwrap().len(), 4);

        let messages = drain(&mut observer);
        assert_eq!(kinds(&messages), vec![EventKind::Update, EventKind::Update]);
        assert_eq!(messages[1].payload["data"]["status"], "rejected");
        assert!(mgr.pending_conflicts(ws).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manual_mode_leaves_conflict_pending_until_resolved() {
        let mgr = manager();
        let ws = shared_workspace(
            &mgr,
            CreateWorkspace::named("Legal").with_sync_mode(SyncMode::Manual),
        )
        .await;
        let (_obs, mut observer) = connect(&mgr, "alice").await;
        let v1 = seed(&mgr, ws).await;

        let v2a = mgr
            .sync_data_version(ws, task(), payload(json!({"status": "a"})), &UserId::new("alice"), Some(v1.id))
            .await
            .unwrap();
        let pending = mgr
            .sync_data_version(ws, task(), payload(json!({"status": "b"})), &UserId::new("bob"), Some(v1.id))
            .await
            .unwrap();
        let SyncOutcome::Pending { conflict, .. } = &pending else {
            panic!("expected pending, got {}", pending.status());
        };
        assert_eq!(mgr.latest(&task()).await.unwrap().unwrap().id, v2a.head().unwrap().id);

        let detected = drain(&mut observer)
            .into_iter()
            .find(|m| m.event_kind() == Some(EventKind::ConflictDetected))
            .unwrap();
        assert_eq!(detected.payload["conflictingFields"], json!(["status"]));
        assert_eq!(detected.payload["status"], "pending_manual_resolution");
        assert!(detected.payload.get("data").is_none());

        let status = mgr.get_workspace_status(ws).await.unwrap();
        assert_eq!(status.pending_conflicts, 1);

        let resolved = mgr
            .resolve_conflict(ws, conflict.id, &UserId::new("alice"), payload(json!({"status": "c"})))
            .await
            .unwrap();
        assert_eq!(resolved.parent, v2a.head().map(|v| v.id));
        assert_eq!(resolved.merge_parents.len(), 1);
        assert_eq!(mgr.latest(&task()).await.unwrap().unwrap().id, resolved.id);
        assert!(mgr.pending_conflicts(ws).await.unwrap().is_empty());
        assert_eq!(
            kinds(&drain(&mut observer)),
            vec![EventKind::ConflictResolved]
        );

        assert!(mgr
            .resolve_conflict(ws, conflict.id, &UserId::new("alice"), Payload::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_conflict_only_resolvable_from_its_workspace() {
        let mgr = manager();
        let w1 = shared_workspace(
            &mgr,
            CreateWorkspace::named("Legal").with_sync_mode(SyncMode::Manual),
        )
        .await;
        let mallory = UserId::new("mallory");
        let w2 = mgr.create_workspace(&mallory, CreateWorkspace::named("Mine")).await.id;
        let (_obs, mut observer) = connect(&mgr, "alice").await;

        let v1 = seed(&mgr, w1).await;
        let v2a = mgr
            .sync_data_version(w1, task(), payload(json!({"status": "a"})), &UserId::new("alice"), Some(v1.id))
            .await
            .unwrap();
        let pending = mgr
            .sync_data_version(w1, task(), payload(json!({"status": "b"})), &UserId::new("bob"), Some(v1.id))
            .await
            .unwrap();
        let conflict = pending.conflict().cloned().unwrap();
        assert_eq!(conflict.workspace, Some(w1));
        drain(&mut observer);

        let err = mgr
            .resolve_conflict(w2, conflict.id, &mallory, payload(json!({"status": "mallory"})))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert!(matches!(
            mgr.resolve_conflict(w1, conflict.id, &mallory, Payload::new()).await,
            Err(SyncError::NotParticipant { .. })
        ));

        // Untouched: head, pending list and w1's subscribers.
        let latest = mgr.latest(&task()).await.unwrap().unwrap();
        assert_eq!(latest.id, v2a.head().unwrap().id);
        assert_eq!(latest.field("status"), Some(&json!("a")));
        assert_eq!(mgr.pending_conflicts(w1).await.unwrap().len(), 1);
        assert!(drain(&mut observer).is_empty());

        // A member of both still has to go through w1.
        mgr.add_participant(w2, &mallory, &UserId::new("bob"), full_access())
            .await
            .unwrap();
        assert!(mgr
            .resolve_conflict(w2, conflict.id, &UserId::new("bob"), Payload::new())
            .await
            .is_err());
        mgr.resolve_conflict(w1, conflict.id, &UserId::new("bob"), payload(json!({"status": "c"})))
            .await
            .unwrap();
        assert!(mgr.pending_conflicts(w1).await.unwrap().is_empty());
    }

    /// Accepts every write until `fail_heads` is set, then refuses to move heads.
    #[derive(Default)]
    struct HeadFailingBackend {
        fail_heads: AtomicBool,
    }

    impl VersionBackend for HeadFailingBackend {
        fn persist_version(&self, _version: &DataVersion) -> Result<(), StoreError> {
            Ok(())
        }

        fn persist_head(&self, _entity: &EntityKey, _head: VersionId) -> Result<(), StoreError> {
            if self.fail_heads.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("disk full".into()));
            }
            Ok(())
        }

        fn persist_conflict(&self, _conflict: &ConflictRecord) -> Result<(), StoreError> {
            Ok(())
        }

        fn load_entity(&self, _entity: &EntityKey) -> Result<PersistedEntity, StoreError> {
            Ok(PersistedEntity::default())
        }
    }

    #[tokio::test]
    async fn test_failed_auto_resolution_falls_back_to_pending() {
        let backend = Arc::new(HeadFailingBackend::default());
        let store = VersionedDataStore::with_backend(
            SyncConfig::for_testing().store,
            backend.clone(),
        );
        let mgr = CollaborationManager::with_store(SyncConfig::for_testing(), Arc::new(store));
        let ws = shared_workspace(&mgr, CreateWorkspace::default()).await;
        let (_obs, mut observer) = connect(&mgr, "alice").await;

        let v1 = seed(&mgr, ws).await;
        let v2a = mgr
            .sync_data_version(ws, task(), payload(json!({"status": "a"})), &UserId::new("alice"), Some(v1.id))
            .await
            .unwrap();
        drain(&mut observer);

        backend.fail_heads.store(true, Ordering::SeqCst);
        let outcome = mgr
            .sync_data_version(ws, task(), payload(json!({"status": "b"})), &UserId::new("bob"), Some(v1.id))
            .await
            .unwrap();
        let SyncOutcome::Pending { conflict, .. } = &outcome else {
            panic!("expected pending, got {}", outcome.status());
        };
        assert_eq!(conflict.status, ConflictStatus::PendingManualResolution);
        assert_eq!(mgr.latest(&task()).await.unwrap().unwrap().id, v2a.head().unwrap().id);
        assert_eq!(mgr.pending_conflicts(ws).await.unwrap().len(), 1);
        assert_eq!(
            kinds(&drain(&mut observer)),
            vec![EventKind::ConflictDetected]
        );
    }

    #[tokio::test]
    async fn test_unknown_parent_is_validation_error() {
        let mgr = manager();
        let ws = shared_workspace(&mgr, CreateWorkspace::default()).await;
        seed(&mgr, ws).await;
        let err = mgr
            .sync_data_version(ws, task(), Payload::new(), &UserId::new("bob"), Some(VersionId::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert!(!err.is_fatal());

        let err = mgr
            .sync_data_version(ws, task(), Payload::new(), &UserId::new("bob"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn test_malformed_frame_errors_only_to_originator() {
        let mgr = manager();
        let ws = shared_workspace(&mgr, CreateWorkspace::default()).await;
        let (alice, mut alice_rx) = connect(&mgr, "alice").await;
        let (_bob, mut bob_rx) = connect(&mgr, "bob").await;

        mgr.handle_frame(alice, "{not json").await;
        let update = format!(r#"{{"kind":"update","workspaceId":"{ws}","data":{{}}}}"#);
        mgr.handle_frame(alice, &update).await;

        let replies = drain(&mut alice_rx);
        assert_eq!(replies.len(), 2);
        assert!(replies.iter().all(|m| m.message_kind == MessageKind::Error));
        assert!(replies.iter().all(|m| m.payload["code"] == "validation"));
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn test_inbound_write_acks_originator() {
        let mgr = manager();
        let ws = shared_workspace(&mgr, CreateWorkspace::default()).await;
        let (bob, mut bob_rx) = connect(&mgr, "bob").await;

        let event = InboundEvent::new(EventKind::Create, Some(ws))
            .with_resource(&task())
            .with_data(json!({"title": "New"}));
        mgr.handle_inbound(bob, event).await;

        let messages = drain(&mut bob_rx);
        let ack = messages
            .iter()
            .find(|m| m.message_kind == MessageKind::Ack)
            .unwrap();
        assert_eq!(ack.payload["status"], "accepted");
        assert_eq!(ack.payload["version"], 1);
        assert_eq!(kinds(&messages), vec![EventKind::Update]);
    }

    #[tokio::test]
    async fn test_relay_skips_actor_and_checks_membership() {
        let mgr = manager();
        let ws = shared_workspace(&mgr, CreateWorkspace::default()).await;
        let (alice, mut alice_rx) = connect(&mgr, "alice").await;
        let (_bob, mut bob_rx) = connect(&mgr, "bob").await;
        let (eve, mut eve_rx) = connect(&mgr, "eve").await;

        mgr.handle_inbound(alice, InboundEvent::new(EventKind::Typing, Some(ws)))
            .await;
        assert_eq!(kinds(&drain(&mut bob_rx)), vec![EventKind::Typing]);
        assert!(drain(&mut alice_rx).is_empty());

        mgr.handle_inbound(eve, InboundEvent::new(EventKind::Cursor, Some(ws)))
            .await;
        let replies = drain(&mut eve_rx);
        assert_eq!(replies[0].payload["code"], "access");
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up_and_broadcasts_offline() {
        let mgr = manager();
        let ws = shared_workspace(&mgr, CreateWorkspace::default()).await;
        let (alice, _alice_rx) = connect(&mgr, "alice").await;
        let (_bob, mut bob_rx) = connect(&mgr, "bob").await;

        mgr.handle_inbound(
            alice,
            InboundEvent::new(EventKind::Presence, Some(ws)).with_data(json!({"status": "online"})),
        )
        .await;
        assert_eq!(kinds(&drain(&mut bob_rx)), vec![EventKind::Presence]);

        let removed = mgr.disconnect(alice).await.unwrap();
        assert!(!removed.user_still_connected);
        assert!(!mgr.bus().subscribers(ws).await.contains(&alice));
        assert!(mgr.presence().get(&UserId::new("alice")).await.is_none());

        let offline = drain(&mut bob_rx);
        assert_eq!(offline[0].payload["status"], "offline");
        assert!(mgr.disconnect(alice).await.is_none());
    }

    #[tokio::test]
    async fn test_workspace_status() {
        let mgr = manager();
        let ws = shared_workspace(&mgr, CreateWorkspace::named("Ops")).await;
        let (_bob, _rx) = connect(&mgr, "bob").await;

        let status = mgr.get_workspace_status(ws).await.unwrap();
        assert_eq!(status.name, "Ops");
        assert_eq!(status.participants.len(), 2);
        assert_eq!(status.online_count, 1);
        assert_eq!(status.subscriber_count, 1);
        assert!(status.active);
        assert!(matches!(
            mgr.get_workspace_status(WorkspaceId::new()).await,
            Err(SyncError::WorkspaceNotFound(_))
        ));
    }
}
