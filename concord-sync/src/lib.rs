//! # concord-sync: Realtime synchronization core
//!
//! Versioned entity storage with conflict detection and resolution, a
//! workspace-scoped event bus and presence, served over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄────────────────► │ CollabServer │
//! │ (per session)│     JSON frames    │ (central)    │
//! └──────────────┘                    └──────┬───────┘
//!                                            │
//!                                 ┌──────────┴───────────┐
//!                                 │ CollaborationManager │
//!                                 │ workspaces + routing │
//!                                 └──┬───────┬────────┬──┘
//!                                    │       │        │
//!                     ┌──────────────┘       │        └─────────────┐
//!                     ▼                      ▼                      ▼
//!           ┌──────────────────┐   ┌──────────────────┐   ┌──────────────────┐
//!           │VersionedDataStore│   │ ConflictResolver │   │ EventBus         │
//!           │ (RocksBackend)   │   │ (strategies)     │   │ + PresenceTracker│
//!           └──────────────────┘   └──────────────────┘   └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`store`]: Version chains, hash integrity, conflict detection
//! - [`resolver`]: Pluggable resolution strategies
//! - [`bus`]: Connections, subscriptions, fan-out, offline delivery
//! - [`presence`]: Per-user live status
//! - [`manager`]: Workspaces, permissions, inbound routing
//! - [`server`] / [`client`]: WebSocket transport
//! - [`storage`]: RocksDB persistence for the store

pub mod bus;
pub mod client;
pub mod config;
pub mod error;
pub mod ids;
pub mod manager;
pub mod offline;
pub mod presence;
pub mod protocol;
pub mod resolver;
pub mod server;
pub mod storage;
pub mod store;
pub mod workspace;

// Re-exports for convenience
pub use bus::{
    BusStats, DeliveryReport, DirectMessage, DirectOutcome, EventBus, EventHandler, MessageSink,
};
pub use client::{CollabClient, ConnectionState};
pub use config::{BusConfig, ConfigError, ServerConfig, StoreConfig, SyncConfig};
pub use error::{ErrorCategory, SyncError, TransportError};
pub use ids::{
    ConflictId, ConnectionId, DeviceId, EntityKey, SessionId, SessionIdentity, UserId, VersionId,
    WorkspaceId,
};
pub use manager::{CollaborationManager, SyncOutcome};
pub use offline::OfflineQueue;
pub use presence::{CursorPosition, PresenceStatus, PresenceTracker, UserPresence};
pub use protocol::{
    CollaborationEvent, EventKind, InboundEvent, MessageKind, OutboundMessage, ProtocolError,
};
pub use resolver::{ActorContext, ConflictResolver, Resolution, ResolutionStrategy, Strategy};
pub use server::{CollabServer, ServerStats};
pub use storage::{RocksBackend, RocksConfig};
pub use store::{
    ConflictRecord, ConflictStatus, DataVersion, StoreError, VersionBackend, VersionedDataStore,
};
pub use workspace::{CreateWorkspace, Permission, PermissionSet, SyncMode, Workspace, WorkspaceStatus};
