//! Stored permission and role models.

use serde::Serialize;
use sqlx::FromRow;

/// Database counterpart of a catalog [`crate::permissions::Permission`].
/// Created lazily at registry-sync time, purged when no longer registered.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StoredPermission {
    pub id: i64,
    pub namespace: String,
    pub name: String,
}

impl StoredPermission {
    pub fn uid(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

/// A named bundle of permissions. Roles are the only unit of grant:
/// permissions attach to roles, roles attach to groups, groups hold users.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Role {
    pub id: i64,
    pub label: String,
}
