//! Crate-level error types.
//!
//! Every fallible public operation of the collaboration manager returns
//! [`SyncError`]. Lower layers keep their own enums ([`StoreError`],
//! [`ResolveError`], [`TransportError`]) and are folded in here.

use thiserror::Error;

use crate::ids::{ConflictId, ConnectionId, UserId, WorkspaceId};
use crate::resolver::ResolveError;
use crate::store::StoreError;
use crate::workspace::Permission;

/// Coarse classification used for logging and for the `code` field of
/// outbound error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Access,
    NotFound,
    Conflict,
    Transport,
    Storage,
    Integrity,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Access => "access",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::Transport => "transport",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Integrity => "integrity",
        }
    }
}

/// Failure to hand a message to one connection.
///
/// Always isolated to that connection: the bus logs it and moves on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("outbound buffer full")]
    Full,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid event: {0}")]
    Validation(String),

    #[error("workspace {0} not found")]
    WorkspaceNotFound(WorkspaceId),

    #[error("workspace {0} is inactive")]
    WorkspaceInactive(WorkspaceId),

    #[error("user {user} is not a participant of workspace {workspace}")]
    NotParticipant { workspace: WorkspaceId, user: UserId },

    #[error("workspace {workspace} requires approval before {user} can join")]
    ApprovalRequired { workspace: WorkspaceId, user: UserId },

    #[error("user {user} lacks {permission} permission in workspace {workspace}")]
    PermissionDenied {
        workspace: WorkspaceId,
        user: UserId,
        permission: Permission,
    },

    #[error("the owner of workspace {0} cannot leave or be removed")]
    OwnerCannotLeave(WorkspaceId),

    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),

    #[error("conflict {0} not found")]
    ConflictNotFound(ConflictId),

    #[error(transparent)]
    Resolution(#[from] ResolveError),

    /// A version chain references a parent that does not exist.
    /// Requires operator intervention.
    #[error("integrity violation: {0}")]
    Integrity(StoreError),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SyncError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::Validation(_) => ErrorCategory::Validation,
            SyncError::NotParticipant { .. }
            | SyncError::ApprovalRequired { .. }
            | SyncError::PermissionDenied { .. }
            | SyncError::OwnerCannotLeave(_)
            | SyncError::WorkspaceInactive(_) => ErrorCategory::Access,
            SyncError::WorkspaceNotFound(_)
            | SyncError::UnknownConnection(_)
            | SyncError::ConflictNotFound(_) => ErrorCategory::NotFound,
            SyncError::Resolution(_) => ErrorCategory::Conflict,
            SyncError::Integrity(_) => ErrorCategory::Integrity,
            SyncError::Store(_) => ErrorCategory::Storage,
            SyncError::Transport(_) => ErrorCategory::Transport,
        }
    }

    /// Only integrity violations are fatal; everything else is recovered
    /// locally.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Integrity(_))
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ConflictNotFound(id) => SyncError::ConflictNotFound(id),
            e if e.is_integrity_violation() => SyncError::Integrity(e),
            e => SyncError::Store(e),
        }
    }
}
