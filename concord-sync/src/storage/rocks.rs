//! RocksDB-backed version store.
//!
//! Column families:
//! - `versions`        `<entity prefix><version:8 BE><id:16>` → bincode envelope,
//!                       payload JSON LZ4 compressed inside it
//! - `heads`           `<entity prefix>` → head version id (16 bytes)
//! - `conflicts`       `<entity prefix><conflict id:16>` → bincode `ConflictRecord`
//! - `conflict_index`  `<conflict id:16>` → bincode `EntityKey`
//!
//! The entity prefix is `len:4 BE, resource_type, len:4 BE, resource_id`.
//! It is prefix-free, so one forward scan from it returns exactly one
//! entity's versions, in version order.

use chrono::{DateTime, Utc};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteOptions,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::ids::{ConflictId, EntityKey, UserId, VersionId};
use crate::store::{
    ConflictRecord, DataVersion, Payload, PersistedEntity, StoreError, VersionBackend,
};

const CF_VERSIONS: &str = "versions";
const CF_HEADS: &str = "heads";
const CF_CONFLICTS: &str = "conflicts";
const CF_CONFLICT_INDEX: &str = "conflict_index";

const COLUMN_FAMILIES: &[&str] = &[CF_VERSIONS, CF_HEADS, CF_CONFLICTS, CF_CONFLICT_INDEX];

/// RocksDB tuning.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl RocksConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }

    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            block_cache_size: 8 * 1024 * 1024,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            ..Self::new(path)
        }
    }
}

/// On-disk form of a [`DataVersion`]. `serde_json::Value` cannot round-trip
/// through bincode, so the payload travels as compressed JSON bytes.
#[derive(Serialize, Deserialize)]
struct StoredVersion {
    id: VersionId,
    entity: EntityKey,
    version: u64,
    parent: Option<VersionId>,
    merge_parents: Vec<VersionId>,
    author: UserId,
    timestamp: DateTime<Utc>,
    changed_fields: BTreeSet<String>,
    content_hash: String,
    payload: Vec<u8>,
}

impl StoredVersion {
    fn pack(version: &DataVersion) -> Result<Self, StoreError> {
        let json = serde_json::to_vec(&version.payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Self {
            id: version.id,
            entity: version.entity.clone(),
            version: version.version,
            parent: version.parent,
            merge_parents: version.merge_parents.clone(),
            author: version.author.clone(),
            timestamp: version.timestamp,
            changed_fields: version.changed_fields.clone(),
            content_hash: version.content_hash.clone(),
            payload: lz4_flex::compress_prepend_size(&json),
        })
    }

    fn unpack(self) -> Result<DataVersion, StoreError> {
        let json = lz4_flex::decompress_size_prepended(&self.payload)
            .map_err(|e| StoreError::Serialization(format!("lz4: {e}")))?;
        let payload: Payload =
            serde_json::from_slice(&json).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(DataVersion {
            id: self.id,
            entity: self.entity,
            version: self.version,
            parent: self.parent,
            merge_parents: self.merge_parents,
            author: self.author,
            timestamp: self.timestamp,
            changed_fields: self.changed_fields,
            payload,
            content_hash: self.content_hash,
        })
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(value)
}

fn db_error(e: rocksdb::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Durable [`VersionBackend`] on RocksDB.
pub struct RocksBackend {
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksConfig,
}

impl RocksBackend {
    /// Open (or create) the database and its column families.
    pub fn open(config: RocksConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )
        .map_err(db_error)?;

        log::info!("Opened version store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &RocksConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_VERSIONS => {
                // Append-heavy, prefix-scanned per entity
                opts.set_max_write_buffer_number(4);
            }
            CF_HEADS | CF_CONFLICT_INDEX => {
                // Small values, point lookups
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_CONFLICTS => {
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Backend(format!("column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn version_key(version: &DataVersion) -> Vec<u8> {
        let mut key = version.entity.storage_prefix();
        key.extend_from_slice(&version.version.to_be_bytes());
        key.extend_from_slice(version.id.as_uuid().as_bytes());
        key
    }

    fn conflict_key(conflict: &ConflictRecord) -> Vec<u8> {
        let mut key = conflict.entity.storage_prefix();
        key.extend_from_slice(conflict.id.as_uuid().as_bytes());
        key
    }

    /// Every value stored under `prefix` in one column family, in key order.
    fn scan_prefix(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<Box<[u8]>>, StoreError> {
        let cf = self.cf(cf_name)?;
        let mut values = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(db_error)?;
            if !key.starts_with(prefix) {
                break;
            }
            values.push(value);
        }
        Ok(values)
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(db_error)
    }
}

impl VersionBackend for RocksBackend {
    fn persist_version(&self, version: &DataVersion) -> Result<(), StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        let value = encode(&StoredVersion::pack(version)?)?;
        self.db
            .put_cf_opt(cf, Self::version_key(version), value, &self.write_options())
            .map_err(db_error)
    }

    fn persist_head(&self, entity: &EntityKey, head: VersionId) -> Result<(), StoreError> {
        let cf = self.cf(CF_HEADS)?;
        self.db
            .put_cf_opt(
                cf,
                entity.storage_prefix(),
                head.as_uuid().as_bytes(),
                &self.write_options(),
            )
            .map_err(db_error)
    }

    fn persist_conflict(&self, conflict: &ConflictRecord) -> Result<(), StoreError> {
        let cf_conflicts = self.cf(CF_CONFLICTS)?;
        let cf_index = self.cf(CF_CONFLICT_INDEX)?;

        let mut batch = rocksdb::WriteBatch::default();
        batch.put_cf(cf_conflicts, Self::conflict_key(conflict), encode(conflict)?);
        batch.put_cf(cf_index, conflict.id.as_uuid().as_bytes(), encode(&conflict.entity)?);
        self.db
            .write_opt(batch, &self.write_options())
            .map_err(db_error)
    }

    fn load_entity(&self, entity: &EntityKey) -> Result<PersistedEntity, StoreError> {
        let prefix = entity.storage_prefix();

        let versions = self
            .scan_prefix(CF_VERSIONS, &prefix)?
            .iter()
            .map(|bytes| decode::<StoredVersion>(bytes)?.unpack())
            .collect::<Result<Vec<_>, _>>()?;

        let head = match self.db.get_cf(self.cf(CF_HEADS)?, &prefix).map_err(db_error)? {
            Some(bytes) => {
                let raw: [u8; 16] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Serialization("invalid head id".into()))?;
                Some(VersionId::from(uuid::Uuid::from_bytes(raw)))
            }
            None => None,
        };

        let conflicts = self
            .scan_prefix(CF_CONFLICTS, &prefix)?
            .iter()
            .map(|bytes| decode::<ConflictRecord>(bytes))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PersistedEntity {
            versions,
            head,
            conflicts,
        })
    }

    fn conflict_entity(&self, id: ConflictId) -> Result<Option<EntityKey>, StoreError> {
        let cf = self.cf(CF_CONFLICT_INDEX)?;
        match self.db.get_cf(cf, id.as_uuid().as_bytes()).map_err(db_error)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
