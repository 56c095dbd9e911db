//! Identifier newtypes shared by every layer.
//!
//! Users, sessions and devices come from the external identity layer and are
//! opaque strings. Workspaces, versions and conflicts are minted here as
//! UUIDs. Connections are arena handles owned by the event bus.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Authenticated user id, as supplied by the identity layer.
    UserId
);
string_id!(SessionId);
string_id!(DeviceId);

uuid_id!(WorkspaceId);
uuid_id!(
    /// Identity of a single stored `DataVersion`.
    VersionId
);
uuid_id!(ConflictId);

/// Arena handle for a live connection.
///
/// Handles are never reused within one bus instance, so a stale handle
/// simply fails lookup instead of aliasing a newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// The verified `(user, session, device)` triple handed over at channel open.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdentity {
    pub user_id: UserId,
    pub session_id: SessionId,
    pub device_id: DeviceId,
}

impl SessionIdentity {
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: UserId::new(user_id),
            session_id: SessionId::new(session_id),
            device_id: DeviceId::new(device_id),
        }
    }
}

/// Logical entity addressed by the versioned store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityKey {
    pub resource_type: String,
    pub resource_id: String,
}

impl EntityKey {
    pub fn new(resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
        }
    }

    /// Byte prefix used by persistent backends: each part as a 4-byte
    /// big-endian length followed by its bytes. No entity's prefix is a
    /// byte prefix of another's.
    pub fn storage_prefix(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.resource_type.len() + self.resource_id.len() + 8);
        for part in [&self.resource_type, &self.resource_id] {
            key.extend_from_slice(&(part.len() as u32).to_be_bytes());
            key.extend_from_slice(part.as_bytes());
        }
        key
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.resource_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_key_display() {
        let key = EntityKey::new("task", "42");
        assert_eq!(key.to_string(), "task/42");
    }

    #[test]
    fn test_storage_prefix_is_unambiguous() {
        let a = EntityKey::new("ab", "c");
        let b = EntityKey::new("a", "bc");
        assert_ne!(a.storage_prefix(), b.storage_prefix());
    }

    #[test]
    fn test_storage_prefix_is_prefix_free() {
        let pairs = [
            (EntityKey::new("task", "1"), EntityKey::new("task", "1\0x")),
            (EntityKey::new("task", "4"), EntityKey::new("task", "42")),
            (EntityKey::new("doc", ""), EntityKey::new("doc", "a")),
            (EntityKey::new("a", "b"), EntityKey::new("a\0b", "")),
        ];
        for (a, b) in pairs {
            let (pa, pb) = (a.storage_prefix(), b.storage_prefix());
            assert!(!pb.starts_with(&pa), "{a:?} is a prefix of {b:?}");
            assert!(!pa.starts_with(&pb), "{b:?} is a prefix of {a:?}");
        }
    }

    #[test]
    fn test_session_identity_json_shape() {
        let identity = SessionIdentity::new("alice", "s1", "laptop");
        let json = serde_json::to_value(&identity).unwrap();
        assert_eq!(json["userId"], "alice");
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["deviceId"], "laptop");
    }

    #[test]
    fn test_uuid_ids_are_unique() {
        assert_ne!(VersionId::new(), VersionId::new());
        assert_ne!(WorkspaceId::new(), WorkspaceId::new());
    }
}
