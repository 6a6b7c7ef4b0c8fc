//! Permission bookkeeping service.
//!
//! Reconciles stored permissions against the in-process registry at startup
//! and manages the role, group and membership tables the ACL engine joins
//! through.

use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::models::permission::{Role, StoredPermission};
use crate::models::user::{Group, User};
use crate::permissions::Permission;
use crate::services::permission_registry::PermissionRegistry;

pub struct PermissionService {
    pool: SqlitePool,
    registry: Arc<PermissionRegistry>,
}

impl PermissionService {
    pub fn new(pool: SqlitePool, registry: Arc<PermissionRegistry>) -> Self {
        Self { pool, registry }
    }

    /// Bring `stored_permissions` in line with the registry: create rows for
    /// registered permissions that have none, purge rows whose permission is
    /// no longer registered anywhere. Grants referencing purged rows cascade
    /// away with them.
    pub async fn sync_registry(&self) -> Result<()> {
        let registered = self.registry.all_permissions();

        let mut tx = self.pool.begin().await?;
        for permission in &registered {
            sqlx::query(
                "INSERT INTO stored_permissions (namespace, name) VALUES (?, ?) \
                 ON CONFLICT (namespace, name) DO NOTHING",
            )
            .bind(permission.namespace)
            .bind(permission.name)
            .execute(&mut *tx)
            .await?;
        }

        let stored = sqlx::query_as::<_, StoredPermission>(
            "SELECT id, namespace, name FROM stored_permissions",
        )
        .fetch_all(&mut *tx)
        .await?;
        for row in stored {
            let known = registered
                .iter()
                .any(|permission| permission.uid() == row.uid());
            if !known {
                warn!(permission = %row.uid(), "purging obsolete stored permission");
                sqlx::query("DELETE FROM stored_permissions WHERE id = ?")
                    .bind(row.id)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;

        info!(count = registered.len(), "stored permissions synchronized");
        Ok(())
    }

    pub async fn create_role(&self, label: &str) -> Result<Role> {
        let role = sqlx::query_as::<_, Role>(
            "INSERT INTO roles (label) VALUES (?) RETURNING id, label",
        )
        .bind(label)
        .fetch_one(&self.pool)
        .await?;
        Ok(role)
    }

    pub async fn create_group(&self, name: &str) -> Result<Group> {
        let group =
            sqlx::query_as::<_, Group>("INSERT INTO auth_groups (name) VALUES (?) RETURNING id, name")
                .bind(name)
                .fetch_one(&self.pool)
                .await?;
        Ok(group)
    }

    pub async fn create_user(&self, username: &str, is_superuser: bool, is_staff: bool) -> Result<User> {
        let user = sqlx::query_as::<_, User>(
            "INSERT INTO users (username, is_superuser, is_staff, created_at) \
             VALUES (?, ?, ?, ?) \
             RETURNING id, username, is_active, is_superuser, is_staff, created_at",
        )
        .bind(username)
        .bind(is_superuser)
        .bind(is_staff)
        .bind(chrono::Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn add_user_to_group(&self, user_id: i64, group_id: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO auth_group_members (group_id, user_id) VALUES (?, ?) \
             ON CONFLICT (group_id, user_id) DO NOTHING",
        )
        .bind(group_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn add_group_to_role(&self, group_id: i64, role_id: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO role_groups (role_id, group_id) VALUES (?, ?) \
             ON CONFLICT (role_id, group_id) DO NOTHING",
        )
        .bind(role_id)
        .bind(group_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Grant a permission to a role without object scope. Role-wide grants
    /// make the permission apply to every object of every class it is
    /// registered for.
    pub async fn grant_to_role(&self, role_id: i64, permission: &Permission) -> Result<()> {
        let permission_id: Option<i64> =
            sqlx::query_scalar("SELECT id FROM stored_permissions WHERE namespace = ? AND name = ?")
                .bind(permission.namespace)
                .bind(permission.name)
                .fetch_optional(&self.pool)
                .await?;
        let permission_id = permission_id.ok_or_else(|| {
            AppError::NotFound(format!("stored permission {}", permission.uid()))
        })?;

        sqlx::query(
            "INSERT INTO role_permissions (role_id, permission_id) VALUES (?, ?) \
             ON CONFLICT (role_id, permission_id) DO NOTHING",
        )
        .bind(role_id)
        .bind(permission_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn revoke_from_role(&self, role_id: i64, permission: &Permission) -> Result<()> {
        sqlx::query(
            "DELETE FROM role_permissions WHERE role_id = ? AND permission_id IN \
             (SELECT id FROM stored_permissions WHERE namespace = ? AND name = ?)",
        )
        .bind(role_id)
        .bind(permission.namespace)
        .bind(permission.name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Permissions a role holds role-wide, for introspection surfaces.
    pub async fn role_permissions(&self, role_id: i64) -> Result<Vec<StoredPermission>> {
        let rows = sqlx::query_as::<_, StoredPermission>(
            "SELECT sp.id, sp.namespace, sp.name FROM stored_permissions sp \
             JOIN role_permissions rp ON rp.permission_id = sp.id \
             WHERE rp.role_id = ? ORDER BY sp.namespace, sp.name",
        )
        .bind(role_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
