//! Versioned data store.
//!
//! Every entity owns an append-only chain of [`DataVersion`]s plus a head
//! pointer. Chains are guarded by one mutex each, created on demand:
//!
//! ```text
//! VersionedDataStore
//!   entities: RwLock<HashMap<EntityKey, Arc<Mutex<EntityChain>>>>
//!                                          │
//!                        lock_entity() ────┘  (held across detect + store)
//!   conflicts: RwLock<HashMap<ConflictId, EntityKey>>
//!   backend:   Option<Arc<dyn VersionBackend>>   (write-through, hydrate on first lock)
//! ```
//!
//! Writers to unrelated entities never contend. Check-then-act sequences
//! (detect a conflict, then store) run under a single [`EntityGuard`].

pub mod conflict;
pub mod version;

pub use conflict::{conflicting_fields, ConflictRecord, ConflictStatus};
pub use version::{apply_patch, changed_fields, content_hash, DataVersion, Payload};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::config::StoreConfig;
use crate::ids::{ConflictId, EntityKey, UserId, VersionId};
use crate::resolver::Strategy;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A version references a parent the chain does not contain.
    #[error("{entity}: parent version {parent} is missing from the chain")]
    MissingParent { entity: EntityKey, parent: VersionId },

    /// A stored version no longer matches its content hash.
    #[error("{entity}: version {version} fails its content hash check")]
    HashMismatch { entity: EntityKey, version: VersionId },

    #[error("{0} already has versions; a root version is not allowed")]
    RootExists(EntityKey),

    #[error("version {0} is already stored")]
    DuplicateVersion(VersionId),

    #[error("{entity}: version number {got} does not follow {current}")]
    NonMonotonic {
        entity: EntityKey,
        current: u64,
        got: u64,
    },

    #[error("version belongs to {got}, not {expected}")]
    EntityMismatch { expected: EntityKey, got: EntityKey },

    #[error("conflict {0} not found")]
    ConflictNotFound(ConflictId),

    #[error("conflict {0} is already resolved")]
    AlreadyResolved(ConflictId),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// The chain itself is broken and needs an operator.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            StoreError::MissingParent { .. } | StoreError::HashMismatch { .. }
        )
    }
}

/// Everything a backend knows about one entity.
#[derive(Debug, Clone, Default)]
pub struct PersistedEntity {
    pub versions: Vec<DataVersion>,
    pub head: Option<VersionId>,
    pub conflicts: Vec<ConflictRecord>,
}

/// Durable storage behind the in-memory chains.
///
/// Called with the entity lock held, so calls for one entity are serialized.
pub trait VersionBackend: Send + Sync {
    fn persist_version(&self, version: &DataVersion) -> Result<(), StoreError>;

    fn persist_head(&self, entity: &EntityKey, head: VersionId) -> Result<(), StoreError>;

    fn persist_conflict(&self, conflict: &ConflictRecord) -> Result<(), StoreError>;

    fn load_entity(&self, entity: &EntityKey) -> Result<PersistedEntity, StoreError>;

    /// Which entity a conflict belongs to, for conflicts not yet hydrated.
    fn conflict_entity(&self, _id: ConflictId) -> Result<Option<EntityKey>, StoreError> {
        Ok(None)
    }
}

/// Base, local and remote versions of one conflict, loaded for a resolver.
#[derive(Debug, Clone)]
pub struct ConflictSnapshot {
    pub record: ConflictRecord,
    pub base: Option<DataVersion>,
    pub local: DataVersion,
    pub remote: DataVersion,
    /// Version number the resolution must carry.
    pub next_version: u64,
}

struct EntityChain {
    entity: EntityKey,
    loaded: bool,
    versions: HashMap<VersionId, DataVersion>,
    /// Ascending version number.
    order: Vec<VersionId>,
    head: Option<VersionId>,
    conflicts: Vec<ConflictRecord>,
}

impl EntityChain {
    fn empty(entity: EntityKey) -> Self {
        Self {
            entity,
            loaded: false,
            versions: HashMap::new(),
            order: Vec::new(),
            head: None,
            conflicts: Vec::new(),
        }
    }

    fn hydrate(&mut self, mut persisted: PersistedEntity) -> Result<(), StoreError> {
        persisted.versions.sort_by_key(|v| v.version);
        let mut versions = HashMap::with_capacity(persisted.versions.len());
        let mut order = Vec::with_capacity(persisted.versions.len());
        for version in persisted.versions {
            if version.entity != self.entity {
                return Err(StoreError::EntityMismatch {
                    expected: self.entity.clone(),
                    got: version.entity,
                });
            }
            if !version.verify_hash() {
                return Err(StoreError::HashMismatch {
                    entity: self.entity.clone(),
                    version: version.id,
                });
            }
            order.push(version.id);
            versions.insert(version.id, version);
        }
        if let Some(head) = persisted.head {
            if !versions.contains_key(&head) {
                return Err(StoreError::MissingParent {
                    entity: self.entity.clone(),
                    parent: head,
                });
            }
        }
        self.versions = versions;
        self.order = order;
        if let Some(foreign) = persisted.conflicts.iter().find(|c| c.entity != self.entity) {
            return Err(StoreError::EntityMismatch {
                expected: self.entity.clone(),
                got: foreign.entity.clone(),
            });
        }
        self.head = persisted.head;
        self.conflicts = persisted.conflicts;
        log::debug!(
            "Hydrated {} ({} versions, {} conflicts)",
            self.entity,
            self.order.len(),
            self.conflicts.len()
        );
        Ok(())
    }

    fn latest_number(&self) -> u64 {
        self.order
            .last()
            .and_then(|id| self.versions.get(id))
            .map(|v| v.version)
            .unwrap_or(0)
    }

    fn validate_append(&self, version: &DataVersion) -> Result<(), StoreError> {
        if version.entity != self.entity {
            return Err(StoreError::EntityMismatch {
                expected: self.entity.clone(),
                got: version.entity.clone(),
            });
        }
        if self.versions.contains_key(&version.id) {
            return Err(StoreError::DuplicateVersion(version.id));
        }
        let current = self.latest_number();
        if version.version <= current {
            return Err(StoreError::NonMonotonic {
                entity: self.entity.clone(),
                current,
                got: version.version,
            });
        }
        if version.parent.is_none() && !self.order.is_empty() {
            return Err(StoreError::RootExists(self.entity.clone()));
        }
        for parent in version.parents() {
            if !self.versions.contains_key(&parent) {
                return Err(StoreError::MissingParent {
                    entity: self.entity.clone(),
                    parent,
                });
            }
        }
        Ok(())
    }

    fn append(&mut self, version: DataVersion, move_head: bool) {
        if move_head {
            self.head = Some(version.id);
        }
        self.order.push(version.id);
        self.versions.insert(version.id, version);
    }

    /// `start` plus everything reachable through parent links within
    /// `depth` generations.
    fn ancestry(&self, start: VersionId, depth: usize) -> HashSet<VersionId> {
        let mut seen = HashSet::from([start]);
        let mut frontier = vec![start];
        for _ in 0..depth {
            let mut next = Vec::new();
            for id in frontier {
                if let Some(version) = self.versions.get(&id) {
                    for parent in version.parents() {
                        if seen.insert(parent) {
                            next.push(parent);
                        }
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        seen
    }

    fn common_ancestor(&self, a: VersionId, b: VersionId, depth: usize) -> Option<VersionId> {
        let left = self.ancestry(a, depth);
        self.ancestry(b, depth)
            .into_iter()
            .filter(|id| left.contains(id))
            .filter_map(|id| self.versions.get(&id))
            .max_by_key(|v| v.version)
            .map(|v| v.id)
    }

    fn detect(
        &self,
        incoming: &DataVersion,
        config: &StoreConfig,
    ) -> Result<Option<ConflictRecord>, StoreError> {
        if incoming.entity != self.entity {
            return Err(StoreError::EntityMismatch {
                expected: self.entity.clone(),
                got: incoming.entity.clone(),
            });
        }

        let Some(head) = self.head else {
            return match incoming.parent {
                None => Ok(None),
                Some(parent) => Err(StoreError::MissingParent {
                    entity: self.entity.clone(),
                    parent,
                }),
            };
        };
        let Some(parent) = incoming.parent else {
            return Err(StoreError::RootExists(self.entity.clone()));
        };
        if parent == head {
            return Ok(None);
        }
        if !self.versions.contains_key(&parent) {
            return Err(StoreError::MissingParent {
                entity: self.entity.clone(),
                parent,
            });
        }

        let local = &self.versions[&head];
        let record = match self.common_ancestor(head, parent, config.max_ancestor_depth) {
            Some(base_id) => {
                let base = &self.versions[&base_id];
                let fields = conflicting_fields(&base.payload, &local.payload, &incoming.payload);
                let auto = fields.len() <= config.auto_resolve_max_fields;
                ConflictRecord::detected(
                    self.entity.clone(),
                    Some(base_id),
                    head,
                    incoming.id,
                    fields,
                    auto,
                )
            }
            None => {
                log::warn!(
                    "{}: no common ancestor within {} generations, escalating",
                    self.entity,
                    config.max_ancestor_depth
                );
                ConflictRecord::detected(
                    self.entity.clone(),
                    None,
                    head,
                    incoming.id,
                    changed_fields(&local.payload, &incoming.payload),
                    false,
                )
            }
        };
        Ok(Some(record))
    }
}

/// Exclusive access to one entity's chain.
pub struct EntityGuard<'a> {
    chain: OwnedMutexGuard<EntityChain>,
    store: &'a VersionedDataStore,
}

impl EntityGuard<'_> {
    pub fn entity(&self) -> &EntityKey {
        &self.chain.entity
    }

    pub fn latest(&self) -> Option<&DataVersion> {
        self.chain.head.and_then(|id| self.chain.versions.get(&id))
    }

    pub fn get(&self, id: &VersionId) -> Option<&DataVersion> {
        self.chain.versions.get(id)
    }

    /// All versions, oldest first, including divergent ones.
    pub fn history(&self) -> Vec<DataVersion> {
        self.chain
            .order
            .iter()
            .filter_map(|id| self.chain.versions.get(id))
            .cloned()
            .collect()
    }

    pub fn next_version_number(&self) -> u64 {
        self.chain.latest_number() + 1
    }

    pub fn detect_conflict(
        &self,
        incoming: &DataVersion,
    ) -> Result<Option<ConflictRecord>, StoreError> {
        self.chain.detect(incoming, &self.store.config)
    }

    /// Append and move the head.
    pub fn store_version(&mut self, version: DataVersion) -> Result<(), StoreError> {
        self.chain.validate_append(&version)?;
        if let Some(backend) = &self.store.backend {
            backend.persist_version(&version)?;
            backend.persist_head(&version.entity, version.id)?;
        }
        log::trace!("{}: head -> v{} ({})", self.chain.entity, version.version, version.id);
        self.chain.append(version, true);
        Ok(())
    }

    /// Append without moving the head.
    pub fn store_divergent(&mut self, version: DataVersion) -> Result<(), StoreError> {
        self.chain.validate_append(&version)?;
        if let Some(backend) = &self.store.backend {
            backend.persist_version(&version)?;
        }
        log::trace!("{}: divergent v{} ({})", self.chain.entity, version.version, version.id);
        self.chain.append(version, false);
        Ok(())
    }

    /// Store a new or updated conflict record.
    pub async fn record_conflict(&mut self, record: ConflictRecord) -> Result<(), StoreError> {
        if record.entity != self.chain.entity {
            return Err(StoreError::EntityMismatch {
                expected: self.chain.entity.clone(),
                got: record.entity,
            });
        }
        if let Some(backend) = &self.store.backend {
            backend.persist_conflict(&record)?;
        }
        self.store
            .conflicts
            .write()
            .await
            .insert(record.id, record.entity.clone());
        match self.chain.conflicts.iter_mut().find(|c| c.id == record.id) {
            Some(existing) => *existing = record,
            None => self.chain.conflicts.push(record),
        }
        Ok(())
    }

    pub fn conflict(&self, id: ConflictId) -> Option<&ConflictRecord> {
        self.chain.conflicts.iter().find(|c| c.id == id)
    }

    pub fn pending_conflicts(&self) -> Vec<ConflictRecord> {
        self.chain
            .conflicts
            .iter()
            .filter(|c| c.is_open())
            .cloned()
            .collect()
    }

    pub fn snapshot(&self, id: ConflictId) -> Result<ConflictSnapshot, StoreError> {
        let record = self
            .conflict(id)
            .cloned()
            .ok_or(StoreError::ConflictNotFound(id))?;
        let fetch = |version: VersionId| {
            self.get(&version)
                .cloned()
                .ok_or_else(|| StoreError::MissingParent {
                    entity: record.entity.clone(),
                    parent: version,
                })
        };
        let base = record.base.map(fetch).transpose()?;
        let local = fetch(record.local)?;
        let remote = fetch(record.remote)?;
        Ok(ConflictSnapshot {
            record,
            base,
            local,
            remote,
            next_version: self.next_version_number(),
        })
    }

    /// Store `resolution` as the new head and close the conflict.
    ///
    /// `manual` selects the `Resolved` status over `AutoResolved`.
    pub async fn resolve_conflict(
        &mut self,
        id: ConflictId,
        resolution: DataVersion,
        strategy: Strategy,
        by: UserId,
        manual: bool,
    ) -> Result<ConflictRecord, StoreError> {
        let mut record = self
            .conflict(id)
            .cloned()
            .ok_or(StoreError::ConflictNotFound(id))?;
        if !record.is_open() {
            return Err(StoreError::AlreadyResolved(id));
        }
        record.close(strategy, resolution.id, by, manual);
        self.store_version(resolution)?;
        self.record_conflict(record.clone()).await?;
        Ok(record)
    }
}

/// Registry of entity chains. See the module docs.
pub struct VersionedDataStore {
    config: StoreConfig,
    entities: RwLock<HashMap<EntityKey, Arc<Mutex<EntityChain>>>>,
    conflicts: RwLock<HashMap<ConflictId, EntityKey>>,
    backend: Option<Arc<dyn VersionBackend>>,
}

impl VersionedDataStore {
    /// In-memory only.
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            entities: RwLock::new(HashMap::new()),
            conflicts: RwLock::new(HashMap::new()),
            backend: None,
        }
    }

    pub fn with_backend(config: StoreConfig, backend: Arc<dyn VersionBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn is_persistent(&self) -> bool {
        self.backend.is_some()
    }

    async fn chain(&self, entity: &EntityKey) -> Arc<Mutex<EntityChain>> {
        // Fast path: read lock
        {
            let entities = self.entities.read().await;
            if let Some(chain) = entities.get(entity) {
                return chain.clone();
            }
        }

        let mut entities = self.entities.write().await;
        // Double-check after acquiring write lock
        entities
            .entry(entity.clone())
            .or_insert_with(|| Arc::new(Mutex::new(EntityChain::empty(entity.clone()))))
            .clone()
    }

    /// Lock one entity, hydrating it from the backend on first use.
    pub async fn lock_entity(&self, entity: &EntityKey) -> Result<EntityGuard<'_>, StoreError> {
        let mut chain = self.chain(entity).await.lock_owned().await;
        if !chain.loaded {
            if let Some(backend) = &self.backend {
                chain.hydrate(backend.load_entity(entity)?)?;
                let mut index = self.conflicts.write().await;
                for conflict in &chain.conflicts {
                    index.insert(conflict.id, entity.clone());
                }
            }
            chain.loaded = true;
        }
        Ok(EntityGuard { chain, store: self })
    }

    /// Append `version` and make it the head of its entity.
    pub async fn store_version(&self, version: DataVersion) -> Result<(), StoreError> {
        let entity = version.entity.clone();
        self.lock_entity(&entity).await?.store_version(version)
    }

    pub async fn get_latest(&self, entity: &EntityKey) -> Result<Option<DataVersion>, StoreError> {
        Ok(self.lock_entity(entity).await?.latest().cloned())
    }

    pub async fn get_history(&self, entity: &EntityKey) -> Result<Vec<DataVersion>, StoreError> {
        Ok(self.lock_entity(entity).await?.history())
    }

    pub async fn get_version(
        &self,
        entity: &EntityKey,
        id: VersionId,
    ) -> Result<Option<DataVersion>, StoreError> {
        Ok(self.lock_entity(entity).await?.get(&id).cloned())
    }

    pub async fn detect_conflict(
        &self,
        entity: &EntityKey,
        incoming: &DataVersion,
    ) -> Result<Option<ConflictRecord>, StoreError> {
        self.lock_entity(entity).await?.detect_conflict(incoming)
    }

    /// Entity a conflict belongs to.
    pub async fn conflict_entity(&self, id: ConflictId) -> Result<EntityKey, StoreError> {
        if let Some(entity) = self.conflicts.read().await.get(&id) {
            return Ok(entity.clone());
        }
        if let Some(backend) = &self.backend {
            if let Some(entity) = backend.conflict_entity(id)? {
                return Ok(entity);
            }
        }
        Err(StoreError::ConflictNotFound(id))
    }

    pub async fn get_conflict(&self, id: ConflictId) -> Result<ConflictRecord, StoreError> {
        let entity = self.conflict_entity(id).await?;
        self.lock_entity(&entity)
            .await?
            .conflict(id)
            .cloned()
            .ok_or(StoreError::ConflictNotFound(id))
    }

    pub async fn pending_conflicts(
        &self,
        entity: &EntityKey,
    ) -> Result<Vec<ConflictRecord>, StoreError> {
        Ok(self.lock_entity(entity).await?.pending_conflicts())
    }

    /// Number of entities touched since startup.
    pub async fn entity_count(&self) -> usize {
        self.entities.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::Mutex as StdMutex;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn task() -> EntityKey {
        EntityKey::new("task", "1")
    }

    fn store() -> VersionedDataStore {
        VersionedDataStore::new(StoreConfig::default())
    }

    async fn seed(store: &VersionedDataStore) -> DataVersion {
        let root = DataVersion::root(
            task(),
            UserId::new("alice"),
            payload(json!({"title": "Draft", "status": "open", "owner": "alice"})),
        );
        store.store_version(root.clone()).await.unwrap();
        root
    }

    #[tokio::test]
    async fn test_latest_is_last_stored() {
        let store = store();
        let root = seed(&store).await;
        let v2 = DataVersion::child(&root, 2, UserId::new("bob"), &payload(json!({"status": "done"})));
        store.store_version(v2.clone()).await.unwrap();

        assert_eq!(store.get_latest(&task()).await.unwrap(), Some(v2));
        assert_eq!(store.get_history(&task()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_entity_is_empty() {
        let store = store();
        assert!(store.get_latest(&task()).await.unwrap().is_none());
        assert!(store.get_history(&task()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_conflict_when_parent_is_head() {
        let store = store();
        let root = seed(&store).await;
        let v2 = DataVersion::child(&root, 2, UserId::new("bob"), &payload(json!({"status": "done"})));
        assert!(store.detect_conflict(&task(), &v2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_root_on_empty_entity_is_fine() {
        let store = store();
        let root = DataVersion::root(task(), UserId::new("alice"), Payload::new());
        assert!(store.detect_conflict(&task(), &root).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_root_on_existing_entity_rejected() {
        let store = store();
        seed(&store).await;
        let again = DataVersion::root(task(), UserId::new("bob"), Payload::new());
        assert!(matches!(
            store.detect_conflict(&task(), &again).await,
            Err(StoreError::RootExists(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_parent_is_integrity_violation() {
        let store = store();
        let root = seed(&store).await;
        let mut orphan = DataVersion::child(&root, 2, UserId::new("bob"), &Payload::new());
        orphan.parent = Some(VersionId::new());

        let err = store.detect_conflict(&task(), &orphan).await.unwrap_err();
        assert!(err.is_integrity_violation());
        let err = store.store_version(orphan).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingParent { .. }));
    }

    #[tokio::test]
    async fn test_non_monotonic_rejected() {
        let store = store();
        let root = seed(&store).await;
        let stale = DataVersion::child(&root, 1, UserId::new("bob"), &Payload::new());
        assert!(matches!(
            store.store_version(stale).await,
            Err(StoreError::NonMonotonic { current: 1, got: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_conflicting_fields_exact() {
        let store = store();
        let root = seed(&store).await;
        let mut guard = store.lock_entity(&task()).await.unwrap();

        let local = DataVersion::child(
            &root,
            2,
            UserId::new("alice"),
            &payload(json!({"status": "approved", "title": "Final"})),
        );
        guard.store_version(local.clone()).unwrap();

        let remote = DataVersion::child(
            &root,
            3,
            UserId::new("bob"),
            &payload(json!({"status": "rejected", "owner": "bob"})),
        );
        let record = guard.detect_conflict(&remote).unwrap().unwrap();

        assert_eq!(record.base, Some(root.id));
        assert_eq!(record.local, local.id);
        assert_eq!(record.remote, remote.id);
        assert_eq!(
            record.conflicting_fields.into_iter().collect::<Vec<_>>(),
            vec!["status".to_string()]
        );
        assert!(record.auto_resolvable);
    }

    #[tokio::test]
    async fn test_too_many_fields_not_auto_resolvable() {
        let store = VersionedDataStore::new(StoreConfig {
            auto_resolve_max_fields: 1,
            ..StoreConfig::default()
        });
        let root = seed(&store).await;
        let mut guard = store.lock_entity(&task()).await.unwrap();
        let local = DataVersion::child(
            &root,
            2,
            UserId::new("alice"),
            &payload(json!({"status": "a", "title": "a"})),
        );
        guard.store_version(local).unwrap();
        let remote = DataVersion::child(
            &root,
            3,
            UserId::new("bob"),
            &payload(json!({"status": "b", "title": "b"})),
        );
        let record = guard.detect_conflict(&remote).unwrap().unwrap();
        assert_eq!(record.conflicting_fields.len(), 2);
        assert!(!record.auto_resolvable);
    }

    #[tokio::test]
    async fn test_escalates_beyond_depth() {
        let store = VersionedDataStore::new(StoreConfig {
            max_ancestor_depth: 2,
            ..StoreConfig::default()
        });
        let root = seed(&store).await;
        let mut guard = store.lock_entity(&task()).await.unwrap();

        let mut head = root.clone();
        for i in 0..4 {
            let next = DataVersion::child(
                &head,
                guard.next_version_number(),
                UserId::new("alice"),
                &payload(json!({"title": format!("t{i}")})),
            );
            guard.store_version(next.clone()).unwrap();
            head = next;
        }

        let remote = DataVersion::child(
            &root,
            guard.next_version_number(),
            UserId::new("bob"),
            &payload(json!({"title": "bob"})),
        );
        let record = guard.detect_conflict(&remote).unwrap().unwrap();
        assert!(record.is_escalated());
        assert!(!record.auto_resolvable);
        assert!(record.conflicting_fields.contains("title"));
    }

    #[tokio::test]
    async fn test_divergent_store_and_resolve() {
        let store = store();
        let root = seed(&store).await;
        let mut guard = store.lock_entity(&task()).await.unwrap();

        let local = DataVersion::child(&root, 2, UserId::new("alice"), &payload(json!({"status": "a"})));
        guard.store_version(local.clone()).unwrap();
        let remote = DataVersion::child(&root, 3, UserId::new("bob"), &payload(json!({"status": "b"})));
        let mut record = guard.detect_conflict(&remote).unwrap().unwrap();
        guard.store_divergent(remote.clone()).unwrap();
        assert_eq!(guard.latest().unwrap().id, local.id);

        record.mark_pending();
        let conflict_id = record.id;
        guard.record_conflict(record).await.unwrap();
        assert_eq!(guard.pending_conflicts().len(), 1);

        let snapshot = guard.snapshot(conflict_id).unwrap();
        assert_eq!(snapshot.base.as_ref().map(|v| v.id), Some(root.id));
        assert_eq!(snapshot.next_version, 4);

        let resolution = DataVersion::child(
            &snapshot.local,
            snapshot.next_version,
            UserId::new("admin"),
            &payload(json!({"status": "c"})),
        )
        .with_merge_parent(remote.id);
        let closed = guard
            .resolve_conflict(conflict_id, resolution.clone(), Strategy::Manual, UserId::new("admin"), true)
            .await
            .unwrap();
        assert_eq!(closed.status, ConflictStatus::Resolved);
        assert_eq!(guard.latest().unwrap().id, resolution.id);
        assert!(guard.pending_conflicts().is_empty());
        drop(guard);

        let err = store
            .lock_entity(&task())
            .await
            .unwrap()
            .resolve_conflict(conflict_id, resolution, Strategy::Manual, UserId::new("admin"), true)
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::AlreadyResolved(conflict_id));
        assert_eq!(store.get_conflict(conflict_id).await.unwrap().id, conflict_id);
    }

    #[tokio::test]
    async fn test_stale_write_after_resolution_finds_remote_as_base() {
        let store = store();
        let root = seed(&store).await;
        let mut guard = store.lock_entity(&task()).await.unwrap();

        let local = DataVersion::child(&root, 2, UserId::new("a"), &payload(json!({"status": "a"})));
        guard.store_version(local.clone()).unwrap();
        let remote = DataVersion::child(&root, 3, UserId::new("b"), &payload(json!({"status": "b"})));
        guard.store_divergent(remote.clone()).unwrap();
        let merged = DataVersion::child(&local, 4, UserId::new("a"), &payload(json!({"status": "b"})))
            .with_merge_parent(remote.id);
        guard.store_version(merged).unwrap();

        let late = DataVersion::child(&remote, 5, UserId::new("b"), &payload(json!({"title": "x"})));
        let record = guard.detect_conflict(&late).unwrap().unwrap();
        assert_eq!(record.base, Some(remote.id));
        assert!(record.conflicting_fields.is_empty());
    }

    #[tokio::test]
    async fn test_unrelated_entities_do_not_block() {
        let store = Arc::new(store());
        seed(&store).await;
        let _held = store.lock_entity(&task()).await.unwrap();

        let other = EntityKey::new("task", "2");
        let root = DataVersion::root(other.clone(), UserId::new("bob"), Payload::new());
        tokio::time::timeout(std::time::Duration::from_millis(200), store.store_version(root))
            .await
            .expect("other entity blocked")
            .unwrap();
        assert_eq!(store.entity_count().await, 2);
    }

    #[derive(Default)]
    struct MemoryBackend {
        entities: StdMutex<HashMap<EntityKey, PersistedEntity>>,
    }

    impl VersionBackend for MemoryBackend {
        fn persist_version(&self, version: &DataVersion) -> Result<(), StoreError> {
            let mut entities = self.entities.lock().unwrap();
            entities
                .entry(version.entity.clone())
                .or_default()
                .versions
                .push(version.clone());
            Ok(())
        }

        fn persist_head(&self, entity: &EntityKey, head: VersionId) -> Result<(), StoreError> {
            self.entities.lock().unwrap().entry(entity.clone()).or_default().head = Some(head);
            Ok(())
        }

        fn persist_conflict(&self, conflict: &ConflictRecord) -> Result<(), StoreError> {
            let mut entities = self.entities.lock().unwrap();
            let conflicts = &mut entities.entry(conflict.entity.clone()).or_default().conflicts;
            conflicts.retain(|c| c.id != conflict.id);
            conflicts.push(conflict.clone());
            Ok(())
        }

        fn load_entity(&self, entity: &EntityKey) -> Result<PersistedEntity, StoreError> {
            Ok(self.entities.lock().unwrap().get(entity).cloned().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn test_hydrates_from_backend() {
        let backend = Arc::new(MemoryBackend::default());
        let first = VersionedDataStore::with_backend(StoreConfig::default(), backend.clone());
        let root = seed(&first).await;
        let v2 = DataVersion::child(&root, 2, UserId::new("bob"), &payload(json!({"status": "done"})));
        first.store_version(v2.clone()).await.unwrap();
        drop(first);

        let second = VersionedDataStore::with_backend(StoreConfig::default(), backend);
        assert!(second.is_persistent());
        assert_eq!(second.get_latest(&task()).await.unwrap(), Some(v2));
        assert_eq!(second.get_history(&task()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_tampered_version_fails_hydration() {
        let backend = Arc::new(MemoryBackend::default());
        let mut root = DataVersion::root(task(), UserId::new("a"), payload(json!({"x": 1})));
        root.payload.insert("x".into(), json!(2));
        backend.persist_version(&root).unwrap();
        backend.persist_head(&task(), root.id).unwrap();

        let store = VersionedDataStore::with_backend(StoreConfig::default(), backend);
        let err = store.get_latest(&task()).await.unwrap_err();
        assert!(err.is_integrity_violation());
    }

    #[tokio::test]
    async fn test_foreign_rows_fail_hydration() {
        let backend = Arc::new(MemoryBackend::default());
        let other = DataVersion::root(
            EntityKey::new("task", "1\0x"),
            UserId::new("mallory"),
            payload(json!({"secret": 1})),
        );
        backend
            .entities
            .lock()
            .unwrap()
            .entry(task())
            .or_default()
            .versions
            .push(other);

        let store = VersionedDataStore::with_backend(StoreConfig::default(), backend);
        let err = store.get_history(&task()).await.unwrap_err();
        assert!(matches!(err, StoreError::EntityMismatch { .. }));
    }
}
