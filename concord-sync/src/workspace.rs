//! Workspaces: a named set of participants with per-user permissions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::ids::{UserId, WorkspaceId};
use crate::resolver::Strategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Comment,
    Write,
    /// Implies every other permission.
    Admin,
}

impl Permission {
    pub const ALL: [Permission; 4] = [
        Permission::Read,
        Permission::Comment,
        Permission::Write,
        Permission::Admin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Comment => "comment",
            Permission::Write => "write",
            Permission::Admin => "admin",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type PermissionSet = BTreeSet<Permission>;

pub fn read_only() -> PermissionSet {
    PermissionSet::from([Permission::Read])
}

pub fn full_access() -> PermissionSet {
    Permission::ALL.into_iter().collect()
}

/// How writes to a workspace are reconciled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Auto-resolvable conflicts are resolved on the spot.
    #[default]
    Realtime,
    /// Every conflict waits for a person.
    Manual,
}

/// Options for a new workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateWorkspace {
    /// Reuse a known id, e.g. to bring back a workspace after a restart.
    #[serde(skip)]
    pub id: Option<WorkspaceId>,
    pub name: String,
    pub sync_mode: SyncMode,
    pub default_strategy: Strategy,
    pub require_approval: bool,
}

impl Default for CreateWorkspace {
    fn default() -> Self {
        Self {
            id: None,
            name: "Untitled workspace".to_string(),
            sync_mode: SyncMode::Realtime,
            default_strategy: Strategy::LastWriteWins,
            require_approval: false,
        }
    }
}

impl CreateWorkspace {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: WorkspaceId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn require_approval(mut self) -> Self {
        self.require_approval = true;
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    pub fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub name: String,
    pub owner: UserId,
    pub participants: HashMap<UserId, PermissionSet>,
    pub sync_mode: SyncMode,
    pub default_strategy: Strategy,
    pub require_approval: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Workspace {
    /// New active workspace; the owner holds every permission.
    pub fn new(owner: UserId, options: CreateWorkspace) -> Self {
        let mut participants = HashMap::new();
        participants.insert(owner.clone(), full_access());
        Self {
            id: options.id.unwrap_or_default(),
            name: options.name,
            owner,
            participants,
            sync_mode: options.sync_mode,
            default_strategy: options.default_strategy,
            require_approval: options.require_approval,
            active: true,
            created_at: Utc::now(),
        }
    }

    pub fn is_participant(&self, user: &UserId) -> bool {
        self.participants.contains_key(user)
    }

    pub fn has_permission(&self, user: &UserId, permission: Permission) -> bool {
        self.participants
            .get(user)
            .is_some_and(|set| set.contains(&permission) || set.contains(&Permission::Admin))
    }

    /// Whether automatic resolution may run at all here.
    pub fn auto_resolves(&self) -> bool {
        self.sync_mode == SyncMode::Realtime && self.default_strategy != Strategy::Manual
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantStatus {
    pub user_id: UserId,
    pub permissions: PermissionSet,
    pub online: bool,
}

/// Point-in-time view of a workspace.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStatus {
    pub id: WorkspaceId,
    pub name: String,
    pub owner: UserId,
    pub active: bool,
    pub sync_mode: SyncMode,
    pub default_strategy: Strategy,
    pub require_approval: bool,
    pub participants: Vec<ParticipantStatus>,
    pub online_count: usize,
    pub subscriber_count: usize,
    pub pending_conflicts: usize,
    pub created_at: DateTime<Utc>,
}
