//! Pluggable conflict resolution.
//!
//! A strategy looks at a [`ConflictSnapshot`] (base, local, remote) and
//! returns the payload that should win. The [`ConflictResolver`] turns that
//! into a [`DataVersion`] the same way every time:
//!
//! ```text
//! id        = UUID v5(conflict id, strategy name)
//! parent    = local      merge_parents = [remote]
//! version   = snapshot.next_version
//! timestamp = max(local.timestamp, remote.timestamp)
//! ```
//!
//! so resolving one conflict twice with the same strategy yields the same
//! version both times.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::ids::{UserId, VersionId, WorkspaceId};
use crate::store::{changed_fields, content_hash, ConflictSnapshot, DataVersion, Payload};

/// Strategy identifier. `Custom` names a user-registered strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    LastWriteWins,
    FirstWriteWins,
    AutoMerge,
    RolePriority,
    /// Never resolved automatically.
    Manual,
    Custom(String),
}

impl Strategy {
    pub fn name(&self) -> &str {
        match self {
            Strategy::LastWriteWins => "last_write_wins",
            Strategy::FirstWriteWins => "first_write_wins",
            Strategy::AutoMerge => "auto_merge",
            Strategy::RolePriority => "role_priority",
            Strategy::Manual => "manual",
            Strategy::Custom(name) => name,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Strategy {
    type Err = std::convert::Infallible;

    /// Unknown names become `Custom`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "last_write_wins" => Strategy::LastWriteWins,
            "first_write_wins" => Strategy::FirstWriteWins,
            "auto_merge" => Strategy::AutoMerge,
            "role_priority" => Strategy::RolePriority,
            "manual" => Strategy::Manual,
            other => Strategy::Custom(other.to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no resolution strategy registered as '{0}'")]
    NotRegistered(Strategy),
    #[error("strategy '{0}' could not resolve the conflict")]
    Declined(Strategy),
    #[error("conflict requires manual resolution")]
    Manual,
}

/// Who triggered a resolution.
#[derive(Debug, Clone)]
pub struct ActorContext {
    pub actor: UserId,
    pub workspace_id: Option<WorkspaceId>,
}

impl ActorContext {
    pub fn new(actor: UserId, workspace_id: Option<WorkspaceId>) -> Self {
        Self {
            actor,
            workspace_id,
        }
    }
}

/// A strategy's verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub payload: Payload,
    pub author: UserId,
    /// Set when one branch won outright.
    pub winner: Option<VersionId>,
}

impl Resolution {
    fn take(version: &DataVersion) -> Self {
        Self {
            payload: version.payload.clone(),
            author: version.author.clone(),
            winner: Some(version.id),
        }
    }
}

/// A conflict resolution policy. Implementations must be pure functions of
/// their inputs.
pub trait ResolutionStrategy: Send + Sync {
    fn kind(&self) -> Strategy;

    /// `None` declines; the conflict then stays pending.
    fn resolve(&self, snapshot: &ConflictSnapshot, ctx: &ActorContext) -> Option<Resolution>;
}

fn later<'a>(a: &'a DataVersion, b: &'a DataVersion) -> &'a DataVersion {
    if (a.timestamp, a.id) >= (b.timestamp, b.id) {
        a
    } else {
        b
    }
}

fn earlier<'a>(a: &'a DataVersion, b: &'a DataVersion) -> &'a DataVersion {
    if (a.timestamp, a.id) <= (b.timestamp, b.id) {
        a
    } else {
        b
    }
}

/// Later author timestamp wins; ties go to the larger version id.
pub struct LastWriteWins;

impl ResolutionStrategy for LastWriteWins {
    fn kind(&self) -> Strategy {
        Strategy::LastWriteWins
    }

    fn resolve(&self, s: &ConflictSnapshot, _ctx: &ActorContext) -> Option<Resolution> {
        Some(Resolution::take(later(&s.local, &s.remote)))
    }
}

/// Earlier author timestamp wins; ties go to the smaller version id.
pub struct FirstWriteWins;

impl ResolutionStrategy for FirstWriteWins {
    fn kind(&self) -> Strategy {
        Strategy::FirstWriteWins
    }

    fn resolve(&self, s: &ConflictSnapshot, _ctx: &ActorContext) -> Option<Resolution> {
        Some(Resolution::take(earlier(&s.local, &s.remote)))
    }
}

/// Three-way merge against the common ancestor. Non-conflicting changes
/// from both branches are kept; conflicting fields take the later write.
pub struct AutoMerge;

impl ResolutionStrategy for AutoMerge {
    fn kind(&self) -> Strategy {
        Strategy::AutoMerge
    }

    fn resolve(&self, s: &ConflictSnapshot, ctx: &ActorContext) -> Option<Resolution> {
        let base = s.base.as_ref()?;
        let newer = later(&s.local, &s.remote);

        let mut merged = base.payload.clone();
        for branch in [&s.local, &s.remote] {
            for field in changed_fields(&base.payload, &branch.payload) {
                if s.record.conflicting_fields.contains(&field) {
                    continue;
                }
                match branch.payload.get(&field) {
                    Some(value) => merged.insert(field, value.clone()),
                    None => merged.remove(&field),
                };
            }
        }
        for field in &s.record.conflicting_fields {
            match newer.payload.get(field) {
                Some(value) => merged.insert(field.clone(), value.clone()),
                None => merged.remove(field),
            };
        }

        Some(Resolution {
            payload: merged,
            author: ctx.actor.clone(),
            winner: None,
        })
    }
}

/// Source of role names for a user.
pub trait RoleLookup: Send + Sync {
    fn roles(&self, user: &UserId, workspace: Option<&WorkspaceId>) -> Vec<String>;
}

/// Fixed user → roles table.
#[derive(Debug, Default, Clone)]
pub struct StaticRoles {
    roles: HashMap<UserId, Vec<String>>,
}

impl StaticRoles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role(mut self, user: impl Into<String>, role: impl Into<String>) -> Self {
        self.roles
            .entry(UserId::new(user))
            .or_default()
            .push(role.into());
        self
    }
}

impl RoleLookup for StaticRoles {
    fn roles(&self, user: &UserId, _workspace: Option<&WorkspaceId>) -> Vec<String> {
        self.roles.get(user).cloned().unwrap_or_default()
    }
}

/// The author with the higher-priority role wins. Unknown roles rank 0;
/// ties fall back to last-write-wins.
pub struct RolePriority {
    lookup: Arc<dyn RoleLookup>,
    priorities: HashMap<String, u32>,
}

impl RolePriority {
    pub fn new(lookup: Arc<dyn RoleLookup>, priorities: HashMap<String, u32>) -> Self {
        Self { lookup, priorities }
    }

    fn priority(&self, user: &UserId, workspace: Option<&WorkspaceId>) -> u32 {
        self.lookup
            .roles(user, workspace)
            .iter()
            .filter_map(|role| self.priorities.get(role))
            .copied()
            .max()
            .unwrap_or(0)
    }
}

impl ResolutionStrategy for RolePriority {
    fn kind(&self) -> Strategy {
        Strategy::RolePriority
    }

    fn resolve(&self, s: &ConflictSnapshot, ctx: &ActorContext) -> Option<Resolution> {
        let ws = ctx.workspace_id.as_ref();
        let local = self.priority(&s.local.author, ws);
        let remote = self.priority(&s.remote.author, ws);
        let winner = match local.cmp(&remote) {
            std::cmp::Ordering::Greater => &s.local,
            std::cmp::Ordering::Less => &s.remote,
            std::cmp::Ordering::Equal => later(&s.local, &s.remote),
        };
        Some(Resolution::take(winner))
    }
}

/// Registry of strategies by kind.
pub struct ConflictResolver {
    strategies: HashMap<Strategy, Arc<dyn ResolutionStrategy>>,
}

impl ConflictResolver {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Last-write-wins, first-write-wins and auto-merge. Role priority needs
    /// a role source and is registered separately.
    pub fn with_defaults() -> Self {
        let mut resolver = Self::new();
        resolver.register(Arc::new(LastWriteWins));
        resolver.register(Arc::new(FirstWriteWins));
        resolver.register(Arc::new(AutoMerge));
        resolver
    }

    /// Register (or replace) the strategy for `strategy.kind()`.
    pub fn register(&mut self, strategy: Arc<dyn ResolutionStrategy>) {
        let kind = strategy.kind();
        log::debug!("Registered resolution strategy {kind}");
        self.strategies.insert(kind, strategy);
    }

    pub fn is_registered(&self, kind: &Strategy) -> bool {
        self.strategies.contains_key(kind)
    }

    /// Resolve with one strategy. Deterministic for a given snapshot.
    pub fn resolve(
        &self,
        kind: &Strategy,
        snapshot: &ConflictSnapshot,
        ctx: &ActorContext,
    ) -> Result<DataVersion, ResolveError> {
        if *kind == Strategy::Manual {
            return Err(ResolveError::Manual);
        }
        let strategy = self
            .strategies
            .get(kind)
            .ok_or_else(|| ResolveError::NotRegistered(kind.clone()))?;
        let resolution = strategy
            .resolve(snapshot, ctx)
            .ok_or_else(|| ResolveError::Declined(kind.clone()))?;
        Ok(resolution_version(snapshot, kind, resolution))
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn resolution_version(
    snapshot: &ConflictSnapshot,
    kind: &Strategy,
    resolution: Resolution,
) -> DataVersion {
    let local = &snapshot.local;
    let remote = &snapshot.remote;
    let id = Uuid::new_v5(snapshot.record.id.as_uuid(), kind.name().as_bytes());
    let payload = resolution.payload;
    DataVersion {
        id: VersionId::from(id),
        entity: snapshot.record.entity.clone(),
        version: snapshot.next_version,
        parent: Some(local.id),
        merge_parents: vec![remote.id],
        author: resolution.author,
        timestamp: local.timestamp.max(remote.timestamp),
        changed_fields: changed_fields(&local.payload, &payload),
        content_hash: content_hash(&payload),
        payload,
    }
}
