//! Process-wide permission registry.
//!
//! Maps each model class to the permissions that apply to its instances,
//! plus the relational inheritance rules that let an access check on one
//! object be satisfied by an ACL on a related object. Built once at startup
//! and handed (via `Arc`) to every service that needs it; registration is
//! single-threaded, reads are lock-free thereafter.

use std::collections::HashMap;

use thiserror::Error;

use crate::models::document::{COMMENT, DOCUMENT, DOCUMENT_TYPE};
use crate::models::workflow::{WORKFLOW, WORKFLOW_INSTANCE, WORKFLOW_TRANSITION};
use crate::models::{EntityType, ObjectRef};
use crate::permissions::{self, Permission};

/// Registry lookup misses. Treated as expected control flow by the ACL
/// engine (the recursion base case); never propagated to callers.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("entity has no registration: {0}")]
    NotRegistered(&'static str),
}

/// Value-type coercion applied when an inheritance path crosses the ACL
/// table's text `object_id` storage into a typed primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdCast {
    Integer,
}

/// One inheritance rule: how to reach the parent object whose ACLs may
/// satisfy a check on the child.
#[derive(Debug, Clone, Copy)]
pub enum Relation {
    /// Plain foreign key; all rows point at the same parent type.
    ForeignKey {
        column: &'static str,
        parent: &'static EntityType,
    },
    /// Generic reference: a (type tag, id) column pair that may point at
    /// instances of any registered type.
    Generic {
        type_column: &'static str,
        id_column: &'static str,
        cast: Option<IdCast>,
    },
}

/// Escape hatch for access relations that cannot be expressed as a
/// relational traversal. The engine intersects the base ACL filter with
/// `acl_filter` over the model's own table and wraps the projection in a
/// `field_lookup IN (...)` predicate.
#[derive(Debug, Clone)]
pub struct FieldQuery {
    /// Column on the queryset's model compared against the projection.
    pub field_lookup: &'static str,
    /// Extra SQL predicate over the model's table (alias `m`).
    pub acl_filter: String,
    /// Column projected out of the authorized rows; defaults to `id`.
    pub acl_values: Option<&'static str>,
}

pub type FieldQueryFn = fn() -> FieldQuery;

#[derive(Default)]
pub struct PermissionRegistry {
    permissions: HashMap<&'static str, Vec<Permission>>,
    inheritances: HashMap<&'static str, Vec<Relation>>,
    field_queries: HashMap<&'static str, FieldQueryFn>,
    manager_filters: HashMap<&'static str, &'static str>,
    entities: HashMap<&'static str, &'static EntityType>,
}

impl PermissionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate permissions with a model class. Idempotent union.
    pub fn register(&mut self, entity: &'static EntityType, permissions: &[Permission]) {
        self.entities.insert(entity.key, entity);
        let registered = self.permissions.entry(entity.key).or_default();
        for permission in permissions {
            if !registered.contains(permission) {
                registered.push(*permission);
            }
        }
    }

    /// Declare that access checks on `entity` may be satisfied through the
    /// related object reachable via `relation`.
    pub fn register_inheritance(&mut self, entity: &'static EntityType, relation: Relation) {
        self.entities.insert(entity.key, entity);
        if let Relation::ForeignKey { parent, .. } = relation {
            self.entities.insert(parent.key, parent);
        }
        self.inheritances.entry(entity.key).or_default().push(relation);
    }

    /// Register the custom field-query escape hatch for a model.
    pub fn register_field_query(&mut self, entity: &'static EntityType, function: FieldQueryFn) {
        self.entities.insert(entity.key, entity);
        self.field_queries.insert(entity.key, function);
    }

    /// Name the row universe used when access-filtering this model, for
    /// models with more than one manager (e.g. trashed vs active rows).
    pub fn register_manager_filter(&mut self, entity: &'static EntityType, filter: &'static str) {
        self.entities.insert(entity.key, entity);
        self.manager_filters.insert(entity.key, filter);
    }

    /// Inheritance rules for a model. Errs when none were registered;
    /// callers treat that as "no inheritance, stop recursion".
    pub fn get_inheritances(
        &self,
        entity: &EntityType,
    ) -> Result<&[Relation], RegistryError> {
        self.inheritances
            .get(entity.key)
            .map(Vec::as_slice)
            .ok_or(RegistryError::NotRegistered(entity.key))
    }

    /// Permissions registered for a model class; empty when unregistered.
    pub fn get_for_class(&self, entity: &EntityType) -> &[Permission] {
        self.permissions
            .get(entity.key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Permissions applicable to one instance; empty for objects outside
    /// the ACL system.
    pub fn get_for_instance(&self, object: &ObjectRef) -> &[Permission] {
        match object.entity {
            Some(entity) => self.get_for_class(entity),
            None => &[],
        }
    }

    pub fn get_field_query(&self, entity: &EntityType) -> Result<FieldQueryFn, RegistryError> {
        self.field_queries
            .get(entity.key)
            .copied()
            .ok_or(RegistryError::NotRegistered(entity.key))
    }

    pub fn manager_filter(&self, entity: &EntityType) -> Option<&'static str> {
        self.manager_filters.get(entity.key).copied()
    }

    /// Resolve an entity descriptor from its content-type key. Used when a
    /// generic reference must be followed at instance level.
    pub fn entity(&self, key: &str) -> Option<&'static EntityType> {
        self.entities.get(key).copied()
    }

    /// Every permission registered for any class, deduplicated. This is the
    /// set the stored-permission reconciliation keeps the database in sync
    /// with.
    pub fn all_permissions(&self) -> Vec<Permission> {
        let mut seen = Vec::new();
        for registered in self.permissions.values() {
            for permission in registered {
                if !seen.contains(permission) {
                    seen.push(*permission);
                }
            }
        }
        seen
    }
}

/// Build the registry the application ships with.
pub fn build_default() -> PermissionRegistry {
    let mut registry = PermissionRegistry::new();

    registry.register(
        &DOCUMENT_TYPE,
        &[
            permissions::DOCUMENT_TYPE_VIEW,
            permissions::DOCUMENT_TYPE_EDIT,
            // Document permissions are valid on types so a type-level grant
            // covers every document of that type through inheritance.
            permissions::DOCUMENT_VIEW,
            permissions::DOCUMENT_EDIT,
            permissions::DOCUMENT_TRASH,
            permissions::COMMENT_VIEW,
            permissions::COMMENT_EDIT,
        ],
    );
    registry.register(
        &DOCUMENT,
        &[
            permissions::DOCUMENT_VIEW,
            permissions::DOCUMENT_EDIT,
            permissions::DOCUMENT_TRASH,
            permissions::COMMENT_VIEW,
            permissions::COMMENT_EDIT,
            permissions::WORKFLOW_VIEW,
        ],
    );
    registry.register(
        &COMMENT,
        &[permissions::COMMENT_VIEW, permissions::COMMENT_EDIT],
    );
    registry.register(
        &WORKFLOW,
        &[
            permissions::WORKFLOW_VIEW,
            permissions::WORKFLOW_EDIT,
            permissions::WORKFLOW_TRANSITION,
        ],
    );
    registry.register(&WORKFLOW_TRANSITION, &[permissions::WORKFLOW_TRANSITION]);
    registry.register(&WORKFLOW_INSTANCE, &[permissions::WORKFLOW_VIEW]);

    registry.register_inheritance(
        &DOCUMENT,
        Relation::ForeignKey {
            column: "document_type_id",
            parent: &DOCUMENT_TYPE,
        },
    );
    registry.register_inheritance(
        &COMMENT,
        Relation::Generic {
            type_column: "object_type",
            id_column: "object_id",
            cast: Some(IdCast::Integer),
        },
    );
    registry.register_inheritance(
        &WORKFLOW_TRANSITION,
        Relation::ForeignKey {
            column: "workflow_id",
            parent: &WORKFLOW,
        },
    );
    registry.register_inheritance(
        &WORKFLOW_INSTANCE,
        Relation::ForeignKey {
            column: "document_id",
            parent: &DOCUMENT,
        },
    );

    registry
}
