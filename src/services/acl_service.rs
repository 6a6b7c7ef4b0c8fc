//! Access control service.
//!
//! The public surface of the permission engine: queryset-style restriction,
//! single-object checks, and grant management. All checks run through the
//! same filter pipeline so list views and direct access can never disagree.

use std::collections::HashSet;
use std::sync::Arc;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error::{AppError, Result};
use crate::models::permission::StoredPermission;
use crate::models::user::UserContext;
use crate::models::{EntityType, ObjectRef};
use crate::permissions::Permission;
use crate::services::acl_filter::{
    build_acl_filters, collect_related_parents, compile_grant_probe, compile_restriction,
    prune_empty, AclFilter, BindValue, CompiledFilter,
};
use crate::services::permission_registry::{PermissionRegistry, Relation};

/// Result of restricting an entity's rows to what a user may act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessScope {
    /// No filtering applies; every row is in scope.
    Unrestricted,
    /// Only the listed row ids are in scope. May be empty.
    Restricted(Vec<i64>),
}

impl AccessScope {
    pub fn contains(&self, id: i64) -> bool {
        match self {
            AccessScope::Unrestricted => true,
            AccessScope::Restricted(ids) => ids.contains(&id),
        }
    }
}

pub struct AclService {
    pool: SqlitePool,
    registry: Arc<PermissionRegistry>,
}

fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    binds: &'q [BindValue],
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for bind in binds {
        query = match bind {
            BindValue::Text(value) => query.bind(value),
            BindValue::Int(value) => query.bind(value),
        };
    }
    query
}

impl AclService {
    pub fn new(pool: SqlitePool, registry: Arc<PermissionRegistry>) -> Self {
        Self { pool, registry }
    }

    pub fn registry(&self) -> &PermissionRegistry {
        &self.registry
    }

    /// Restrict `entity`'s rows to those `user` holds `permission` on,
    /// directly or through inheritance.
    pub async fn restrict(
        &self,
        entity: &'static EntityType,
        permission: &Permission,
        user: &UserContext,
    ) -> Result<AccessScope> {
        if !user.is_authenticated {
            return Ok(AccessScope::Restricted(Vec::new()));
        }
        if user.is_superuser || user.is_staff {
            return Ok(AccessScope::Unrestricted);
        }
        if self.has_role_grant(permission, user.id).await? {
            // The permission is held role-wide, without object scope.
            return Ok(AccessScope::Unrestricted);
        }

        let filters = build_acl_filters(&self.registry, entity);
        let filters = self.prune(filters, permission, user.id).await?;

        let compiled = compile_restriction(
            entity,
            self.registry.manager_filter(entity),
            &filters,
            permission,
            user.id,
        );
        let ids = self.fetch_ids(&compiled).await?;
        debug!(
            entity = entity.key,
            permission = %permission,
            user_id = user.id,
            matched = ids.len(),
            "restricted queryset"
        );
        Ok(AccessScope::Restricted(ids))
    }

    /// Intersect `candidates` with the user's access scope, preserving the
    /// candidates' order.
    pub async fn restrict_ids(
        &self,
        entity: &'static EntityType,
        permission: &Permission,
        user: &UserContext,
        candidates: &[i64],
    ) -> Result<Vec<i64>> {
        match self.restrict(entity, permission, user).await? {
            AccessScope::Unrestricted => Ok(candidates.to_vec()),
            AccessScope::Restricted(ids) => {
                let allowed: HashSet<i64> = ids.into_iter().collect();
                Ok(candidates
                    .iter()
                    .copied()
                    .filter(|id| allowed.contains(id))
                    .collect())
            }
        }
    }

    /// Check that `user` holds at least one of `permissions` on `object`.
    /// Objects outside the ACL system pass unconditionally.
    pub async fn check_access(
        &self,
        object: &ObjectRef,
        permissions: &[Permission],
        user: &UserContext,
    ) -> Result<()> {
        let entity = match object.entity {
            Some(entity) => entity,
            None => {
                debug!(label = %object.label, "access check against non-database object, allowing");
                return Ok(());
            }
        };

        for permission in permissions {
            let scope = self.restrict(entity, permission, user).await?;
            if scope.contains(object.id) {
                return Ok(());
            }
        }
        Err(AppError::PermissionDenied(object.label.clone()))
    }

    /// Grant `permission` to `role_id` on `object`. Creates the ACL row on
    /// first use; repeated grants are no-ops.
    pub async fn grant(
        &self,
        object: &ObjectRef,
        permission: &Permission,
        role_id: i64,
    ) -> Result<()> {
        let entity = object.entity.ok_or_else(|| {
            AppError::Validation(format!(
                "cannot grant on non-database object: {}",
                object.label
            ))
        })?;
        if !self.registry.get_for_class(entity).contains(permission) {
            return Err(AppError::PermissionNotValid(format!(
                "{} on {}",
                permission.uid(),
                entity.key
            )));
        }

        let object_id = object.id.to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO access_control_lists (object_type, object_id, role_id) \
             VALUES (?, ?, ?) ON CONFLICT (object_type, object_id, role_id) DO NOTHING",
        )
        .bind(entity.key)
        .bind(&object_id)
        .bind(role_id)
        .execute(&mut *tx)
        .await?;

        let acl_id: i64 = sqlx::query_scalar(
            "SELECT id FROM access_control_lists \
             WHERE object_type = ? AND object_id = ? AND role_id = ?",
        )
        .bind(entity.key)
        .bind(&object_id)
        .bind(role_id)
        .fetch_one(&mut *tx)
        .await?;

        let permission_id = Self::stored_permission_id(&mut tx, permission).await?;

        sqlx::query(
            "INSERT INTO acl_permissions (acl_id, permission_id) VALUES (?, ?) \
             ON CONFLICT (acl_id, permission_id) DO NOTHING",
        )
        .bind(acl_id)
        .bind(permission_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(
            object_type = entity.key,
            object_id = object.id,
            role_id,
            permission = %permission,
            "granted"
        );
        Ok(())
    }

    /// Revoke `permission` from `role_id` on `object`. The ACL row is deleted
    /// once its permission set becomes empty. Revoking something never
    /// granted is a no-op.
    pub async fn revoke(
        &self,
        object: &ObjectRef,
        permission: &Permission,
        role_id: i64,
    ) -> Result<()> {
        let entity = object.entity.ok_or_else(|| {
            AppError::Validation(format!(
                "cannot revoke on non-database object: {}",
                object.label
            ))
        })?;

        let object_id = object.id.to_string();
        let mut tx = self.pool.begin().await?;

        let acl_id: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM access_control_lists \
             WHERE object_type = ? AND object_id = ? AND role_id = ?",
        )
        .bind(entity.key)
        .bind(&object_id)
        .bind(role_id)
        .fetch_optional(&mut *tx)
        .await?;

        let acl_id = match acl_id {
            Some(id) => id,
            None => return Ok(()),
        };

        sqlx::query(
            "DELETE FROM acl_permissions WHERE acl_id = ? AND permission_id IN \
             (SELECT id FROM stored_permissions WHERE namespace = ? AND name = ?)",
        )
        .bind(acl_id)
        .bind(permission.namespace)
        .bind(permission.name)
        .execute(&mut *tx)
        .await?;

        let remaining: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM acl_permissions WHERE acl_id = ?")
                .bind(acl_id)
                .fetch_one(&mut *tx)
                .await?;
        if remaining == 0 {
            sqlx::query("DELETE FROM access_control_lists WHERE id = ?")
                .bind(acl_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Permissions `role_id` holds on `object` through its ancestors only,
    /// filtered to those valid for the object's own class. Follows both
    /// foreign-key and generic references at instance level; a reference
    /// chain stops at unresolvable targets and at types already visited.
    pub async fn get_inherited_permissions(
        &self,
        object: &ObjectRef,
        role_id: i64,
    ) -> Result<Vec<StoredPermission>> {
        let entity = match object.entity {
            Some(entity) => entity,
            None => return Ok(Vec::new()),
        };

        let valid: HashSet<String> = self
            .registry
            .get_for_class(entity)
            .iter()
            .map(|permission| permission.uid())
            .collect();

        let mut visited: HashSet<&'static str> = HashSet::new();
        visited.insert(entity.key);
        let mut ancestors: Vec<(&'static EntityType, i64)> = Vec::new();
        let mut frontier = vec![(entity, object.id)];

        while let Some((current, current_id)) = frontier.pop() {
            let relations = match self.registry.get_inheritances(current) {
                Ok(relations) => relations,
                Err(_) => continue,
            };
            for relation in relations.iter().copied() {
                let parent = match relation {
                    Relation::ForeignKey { column, parent } => self
                        .resolve_foreign_key(current, current_id, column)
                        .await?
                        .map(|id| (parent, id)),
                    Relation::Generic {
                        type_column,
                        id_column,
                        ..
                    } => {
                        self.resolve_generic(current, current_id, type_column, id_column)
                            .await?
                    }
                };
                if let Some((parent_entity, parent_id)) = parent {
                    if visited.insert(parent_entity.key) {
                        ancestors.push((parent_entity, parent_id));
                        frontier.push((parent_entity, parent_id));
                    }
                }
            }
        }

        // Role-wide permissions count as inherited too.
        let mut result: Vec<StoredPermission> = sqlx::query_as::<_, StoredPermission>(
            "SELECT sp.id, sp.namespace, sp.name FROM stored_permissions sp \
             JOIN role_permissions rp ON rp.permission_id = sp.id WHERE rp.role_id = ?",
        )
        .bind(role_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .filter(|permission| valid.contains(&permission.uid()))
        .collect();

        for (ancestor, ancestor_id) in ancestors {
            let held = sqlx::query_as::<_, StoredPermission>(
                "SELECT sp.id, sp.namespace, sp.name FROM stored_permissions sp \
                 JOIN acl_permissions ap ON ap.permission_id = sp.id \
                 JOIN access_control_lists a ON a.id = ap.acl_id \
                 WHERE a.object_type = ? AND a.object_id = ? AND a.role_id = ?",
            )
            .bind(ancestor.key)
            .bind(ancestor_id.to_string())
            .bind(role_id)
            .fetch_all(&self.pool)
            .await?;

            for permission in held {
                if valid.contains(&permission.uid())
                    && !result.iter().any(|known| known.id == permission.id)
                {
                    result.push(permission);
                }
            }
        }
        Ok(result)
    }

    /// Drop filter branches whose referenced parent type holds no matching
    /// grant at all, so they cannot zero out an AND-combined chain.
    async fn prune(
        &self,
        filters: Vec<AclFilter>,
        permission: &Permission,
        user_id: i64,
    ) -> Result<Vec<AclFilter>> {
        let parents = collect_related_parents(&filters);
        let mut empty: HashSet<&'static str> = HashSet::new();
        for parent_key in parents {
            let probe = compile_grant_probe(permission, user_id, parent_key);
            let found: i64 = bind_all(sqlx::query(&probe.sql), &probe.binds)
                .fetch_one(&self.pool)
                .await?
                .try_get(0)?;
            if found == 0 {
                empty.insert(parent_key);
            }
        }
        Ok(filters
            .into_iter()
            .filter_map(|filter| prune_empty(filter, &empty))
            .collect())
    }

    async fn fetch_ids(&self, compiled: &CompiledFilter) -> Result<Vec<i64>> {
        let rows: Vec<SqliteRow> = bind_all(sqlx::query(&compiled.sql), &compiled.binds)
            .fetch_all(&self.pool)
            .await?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(row.try_get(0)?);
        }
        Ok(ids)
    }

    /// Whether the user holds the permission role-wide (role to group to
    /// user, no object scope).
    async fn has_role_grant(&self, permission: &Permission, user_id: i64) -> Result<bool> {
        let found: i64 = sqlx::query_scalar(
            "SELECT EXISTS(\
             SELECT 1 FROM role_permissions rp \
             JOIN stored_permissions sp ON sp.id = rp.permission_id \
             JOIN role_groups rg ON rg.role_id = rp.role_id \
             JOIN auth_group_members gm ON gm.group_id = rg.group_id \
             WHERE sp.namespace = ? AND sp.name = ? AND gm.user_id = ?)",
        )
        .bind(permission.namespace)
        .bind(permission.name)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(found != 0)
    }

    async fn resolve_foreign_key(
        &self,
        entity: &EntityType,
        id: i64,
        column: &'static str,
    ) -> Result<Option<i64>> {
        let sql = format!("SELECT {} FROM {} WHERE id = ?", column, entity.table);
        let parent_id: Option<Option<i64>> = sqlx::query_scalar(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(parent_id.flatten())
    }

    async fn resolve_generic(
        &self,
        entity: &EntityType,
        id: i64,
        type_column: &'static str,
        id_column: &'static str,
    ) -> Result<Option<(&'static EntityType, i64)>> {
        let sql = format!(
            "SELECT {}, {} FROM {} WHERE id = ?",
            type_column, id_column, entity.table
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };
        let parent_key: String = row.try_get(0)?;
        let parent_id: String = row.try_get(1)?;

        let parent_entity = match self.registry.entity(&parent_key) {
            Some(entity) => entity,
            None => return Ok(None),
        };
        // Ids of unregistered or malformed targets are skipped, not errors.
        match parent_id.parse::<i64>() {
            Ok(parent_id) => Ok(Some((parent_entity, parent_id))),
            Err(_) => Ok(None),
        }
    }

    async fn stored_permission_id(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        permission: &Permission,
    ) -> Result<i64> {
        sqlx::query(
            "INSERT INTO stored_permissions (namespace, name) VALUES (?, ?) \
             ON CONFLICT (namespace, name) DO NOTHING",
        )
        .bind(permission.namespace)
        .bind(permission.name)
        .execute(&mut **tx)
        .await?;
        let id = sqlx::query_scalar("SELECT id FROM stored_permissions WHERE namespace = ? AND name = ?")
            .bind(permission.namespace)
            .bind(permission.name)
            .fetch_one(&mut **tx)
            .await?;
        Ok(id)
    }
}
