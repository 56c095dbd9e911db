//! Runtime configuration.
//!
//! Every section has a `Default`, so a TOML file only needs the keys it
//! wants to change:
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:9090"
//! storage_path = "/var/lib/concord"
//!
//! [bus]
//! offline_queue_capacity = 100
//! offline_message_ttl_secs = 3600
//!
//! [store]
//! max_ancestor_depth = 16
//! auto_resolve_max_fields = 3
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub server: ServerConfig,
    pub bus: BusConfig,
    pub store: StoreConfig,
}

impl SyncConfig {
    /// Parse from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Small buffers, loopback address, no persistence.
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig {
                bind_addr: "127.0.0.1:0".to_string(),
                ..ServerConfig::default()
            },
            bus: BusConfig {
                offline_queue_capacity: 16,
                offline_message_ttl_secs: None,
                recent_events_capacity: 64,
                connection_buffer: 64,
            },
            store: StoreConfig::default(),
        }
    }
}

/// WebSocket server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,
    /// Seconds the first frame (the handshake) may take to arrive
    pub handshake_timeout_secs: u64,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// RocksDB path for version persistence (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_connections: 0,
            handshake_timeout_secs: 10,
            heartbeat_interval_secs: 30,
            storage_path: None,
        }
    }
}

/// Event bus sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Per-user offline queue capacity (drop-oldest beyond this)
    pub offline_queue_capacity: usize,
    /// Default time-to-live for queued messages (None = keep until flushed)
    pub offline_message_ttl_secs: Option<u64>,
    /// Size of the diagnostic ring buffer of recent events
    pub recent_events_capacity: usize,
    /// Outbound buffer per connection (messages)
    pub connection_buffer: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            offline_queue_capacity: 100,
            offline_message_ttl_secs: None,
            recent_events_capacity: 1000,
            connection_buffer: 256,
        }
    }
}

/// Versioned store tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// How many generations the common-ancestor search walks on each side
    /// before escalating to manual resolution.
    pub max_ancestor_depth: usize,
    /// Conflicts with at most this many conflicting fields are auto-resolvable.
    pub auto_resolve_max_fields: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_ancestor_depth: 16,
            auto_resolve_max_fields: 3,
        }
    }
}
