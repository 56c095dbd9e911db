//! Durable backends for the versioned data store.
//!
//! ```text
//! ┌────────────────────┐  persist_version / persist_head   ┌──────────────┐
//! │ VersionedDataStore │ ───────────────────────────────►  │ RocksBackend │
//! │   (in-memory)      │  persist_conflict                 │  (RocksDB)   │
//! └─────────┬──────────┘                                   └──────┬───────┘
//!           │ first lock of an entity                             │
//!           ◄─────────────────── load_entity ─────────────────────┘
//! ```

pub mod rocks;

pub use rocks::{RocksBackend, RocksConfig};
