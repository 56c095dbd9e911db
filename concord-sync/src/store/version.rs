//! Immutable entity snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use crate::ids::{EntityKey, UserId, VersionId};

/// Field map of an entity. Keys are kept sorted, so the JSON encoding of a
/// payload is canonical and hashes stably.
pub type Payload = serde_json::Map<String, Value>;

/// One stored state of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataVersion {
    pub id: VersionId,
    pub entity: EntityKey,
    /// Monotonic per entity, assigned by the store (`max + 1`).
    pub version: u64,
    /// `None` only for the first version of an entity.
    pub parent: Option<VersionId>,
    /// Extra parents of a resolution version (the other divergent branch).
    pub merge_parents: Vec<VersionId>,
    pub author: UserId,
    pub timestamp: DateTime<Utc>,
    pub changed_fields: BTreeSet<String>,
    pub payload: Payload,
    pub content_hash: String,
}

impl DataVersion {
    /// Build a version with a fresh id and the current time.
    pub fn new(
        entity: EntityKey,
        version: u64,
        parent: Option<VersionId>,
        author: UserId,
        payload: Payload,
        changed_fields: BTreeSet<String>,
    ) -> Self {
        let content_hash = content_hash(&payload);
        Self {
            id: VersionId::new(),
            entity,
            version,
            parent,
            merge_parents: Vec::new(),
            author,
            timestamp: Utc::now(),
            changed_fields,
            payload,
            content_hash,
        }
    }

    /// First version of an entity. Every field counts as changed.
    pub fn root(entity: EntityKey, author: UserId, payload: Payload) -> Self {
        let changed = payload.keys().cloned().collect();
        Self::new(entity, 1, None, author, payload, changed)
    }

    /// Version derived from `parent` by overlaying `patch`.
    pub fn child(parent: &DataVersion, version: u64, author: UserId, patch: &Payload) -> Self {
        let payload = apply_patch(&parent.payload, patch);
        let changed = changed_fields(&parent.payload, &payload);
        Self::new(
            parent.entity.clone(),
            version,
            Some(parent.id),
            author,
            payload,
            changed,
        )
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_merge_parent(mut self, parent: VersionId) -> Self {
        if Some(parent) != self.parent && !self.merge_parents.contains(&parent) {
            self.merge_parents.push(parent);
        }
        self
    }

    /// Primary parent first, then merge parents.
    pub fn parents(&self) -> impl Iterator<Item = VersionId> + '_ {
        self.parent.iter().copied().chain(self.merge_parents.iter().copied())
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// Recompute the hash and compare.
    pub fn verify_hash(&self) -> bool {
        content_hash(&self.payload) == self.content_hash
    }
}

/// SHA-256 over the canonical JSON of a payload, hex encoded.
pub fn content_hash(payload: &Payload) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
}

/// `base` with every field of `patch` written over it.
pub fn apply_patch(base: &Payload, patch: &Payload) -> Payload {
    let mut out = base.clone();
    for (field, value) in patch {
        out.insert(field.clone(), value.clone());
    }
    out
}

/// Fields whose value differs between two payloads. A field present on
/// only one side counts as changed.
pub fn changed_fields(from: &Payload, to: &Payload) -> BTreeSet<String> {
    from.keys()
        .chain(to.keys())
        .filter(|field| from.get(*field) != to.get(*field))
        .cloned()
        .collect()
}
