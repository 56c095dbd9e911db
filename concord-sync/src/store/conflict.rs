//! Conflict records and the field-level comparison behind them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;

use crate::ids::{ConflictId, EntityKey, UserId, VersionId, WorkspaceId};
use crate::resolver::Strategy;
use crate::store::version::{changed_fields, Payload};

/// `Detected → AutoResolved | PendingManualResolution → Resolved`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Detected,
    AutoResolved,
    PendingManualResolution,
    Resolved,
}

impl ConflictStatus {
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            ConflictStatus::Detected | ConflictStatus::PendingManualResolution
        )
    }
}

/// Two divergent versions of one entity and what to do about them.
///
/// Kept free of `skip_serializing_if` and internally tagged enums so the
/// same derive works for both JSON and bincode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: ConflictId,
    pub entity: EntityKey,
    /// Workspace the diverging write came through. Only that workspace's
    /// writers may resolve the conflict.
    pub workspace: Option<WorkspaceId>,
    /// Common ancestor; `None` when the bounded search found none.
    pub base: Option<VersionId>,
    /// Head at detection time.
    pub local: VersionId,
    /// The incoming write that diverged.
    pub remote: VersionId,
    pub conflicting_fields: BTreeSet<String>,
    pub auto_resolvable: bool,
    pub status: ConflictStatus,
    pub strategy: Option<Strategy>,
    pub resolved_version: Option<VersionId>,
    pub resolved_by: Option<UserId>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConflictRecord {
    pub fn detected(
        entity: EntityKey,
        base: Option<VersionId>,
        local: VersionId,
        remote: VersionId,
        conflicting_fields: BTreeSet<String>,
        auto_resolvable: bool,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            entity,
            workspace: None,
            base,
            local,
            remote,
            conflicting_fields,
            auto_resolvable,
            status: ConflictStatus::Detected,
            strategy: None,
            resolved_version: None,
            resolved_by: None,
            detected_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    pub fn raised_in(mut self, workspace: WorkspaceId) -> Self {
        self.workspace = Some(workspace);
        self
    }

    /// Base search ran out of depth; only a person can sort this out.
    pub fn is_escalated(&self) -> bool {
        self.base.is_none()
    }

    pub fn mark_pending(&mut self) {
        self.status = ConflictStatus::PendingManualResolution;
    }

    /// Close the record. `manual` selects `Resolved` over `AutoResolved`.
    pub fn close(
        &mut self,
        strategy: Strategy,
        version: VersionId,
        by: UserId,
        manual: bool,
    ) {
        self.status = if manual {
            ConflictStatus::Resolved
        } else {
            ConflictStatus::AutoResolved
        };
        self.strategy = Some(strategy);
        self.resolved_version = Some(version);
        self.resolved_by = Some(by);
        self.resolved_at = Some(Utc::now());
    }

    /// Metadata-only view broadcast to workspace participants. Carries no
    /// field values.
    pub fn summary(&self) -> Value {
        json!({
            "conflictId": self.id.0.to_string(),
            "workspaceId": self.workspace.map(|w| w.0.to_string()),
            "resourceType": self.entity.resource_type,
            "resourceId": self.entity.resource_id,
            "baseVersion": self.base.map(|v| v.0.to_string()),
            "localVersion": self.local.0.to_string(),
            "remoteVersion": self.remote.0.to_string(),
            "conflictingFields": self.conflicting_fields,
            "autoResolvable": self.auto_resolvable,
            "status": self.status,
        })
    }
}

/// Fields both branches changed relative to `base` and that ended up with
/// different values.
pub fn conflicting_fields(base: &Payload, local: &Payload, remote: &Payload) -> BTreeSet<String> {
    let local_changes = changed_fields(base, local);
    let remote_changes = changed_fields(base, remote);
    local_changes
        .intersection(&remote_changes)
        .filter(|field| local.get(*field) != remote.get(*field))
        .cloned()
        .collect()
}
