//! Database models (SQLx).

pub mod acl;
pub mod document;
pub mod permission;
pub mod user;
pub mod workflow;

/// Descriptor of a model class as seen by the permission machinery: a stable
/// content-type key plus the table its rows live in. Declared as constants
/// next to each model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityType {
    /// Content-type tag stored in ACL rows and generic references,
    /// e.g. "documents.document".
    pub key: &'static str,
    /// Table holding the rows. The primary key column is always `id`.
    pub table: &'static str,
}

/// A polymorphic reference to one model instance, carrying enough context to
/// render a denial message.
#[derive(Debug, Clone)]
pub struct ObjectRef {
    /// None for objects that are not database-backed; access checks on those
    /// are unconditionally granted.
    pub entity: Option<&'static EntityType>,
    pub id: i64,
    pub label: String,
}

impl ObjectRef {
    pub fn new(entity: &'static EntityType, id: i64, label: impl Into<String>) -> Self {
        Self {
            entity: Some(entity),
            id,
            label: label.into(),
        }
    }

    /// Reference to an object outside the ACL system.
    pub fn foreign(label: impl Into<String>) -> Self {
        Self {
            entity: None,
            id: 0,
            label: label.into(),
        }
    }
}
