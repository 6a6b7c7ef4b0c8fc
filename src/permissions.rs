//! Compile-time permission catalog.
//!
//! A permission is a `(namespace, name)` pair identifying a class of
//! operation. The catalog here is the source of truth; database counterparts
//! (`stored_permissions` rows) are reconciled against it at startup by
//! [`crate::services::permission_service::PermissionService::sync_registry`].

use std::fmt;

/// A class of operation, e.g. "documents.document_view".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Permission {
    pub namespace: &'static str,
    pub name: &'static str,
}

impl Permission {
    pub const fn new(namespace: &'static str, name: &'static str) -> Self {
        Self { namespace, name }
    }

    /// Dotted identifier used in logs and event payloads.
    pub fn uid(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

pub const DOCUMENT_TYPE_VIEW: Permission = Permission::new("documents", "document_type_view");
pub const DOCUMENT_TYPE_EDIT: Permission = Permission::new("documents", "document_type_edit");
pub const DOCUMENT_VIEW: Permission = Permission::new("documents", "document_view");
pub const DOCUMENT_EDIT: Permission = Permission::new("documents", "document_edit");
pub const DOCUMENT_TRASH: Permission = Permission::new("documents", "document_trash");

pub const COMMENT_VIEW: Permission = Permission::new("comments", "comment_view");
pub const COMMENT_EDIT: Permission = Permission::new("comments", "comment_edit");

pub const WORKFLOW_VIEW: Permission = Permission::new("workflows", "workflow_view");
pub const WORKFLOW_EDIT: Permission = Permission::new("workflows", "workflow_edit");
/// Blanket transition permission: held on a Workflow it supersedes the
/// per-transition ACL checks entirely.
pub const WORKFLOW_TRANSITION: Permission = Permission::new("workflows", "workflow_transition");

/// Every permission the application ships with.
pub const ALL: &[Permission] = &[
    DOCUMENT_TYPE_VIEW,
    DOCUMENT_TYPE_EDIT,
    DOCUMENT_VIEW,
    DOCUMENT_EDIT,
    DOCUMENT_TRASH,
    COMMENT_VIEW,
    COMMENT_EDIT,
    WORKFLOW_VIEW,
    WORKFLOW_EDIT,
    WORKFLOW_TRANSITION,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_is_namespace_dot_name() {
        assert_eq!(DOCUMENT_VIEW.uid(), "documents.document_view");
        assert_eq!(format!("{}", WORKFLOW_TRANSITION), "workflows.workflow_transition");
    }

    #[test]
    fn catalog_has_no_duplicates() {
        let mut seen = std::collections::HashSet::new();
        for permission in ALL {
            assert!(seen.insert(permission.uid()), "duplicate: {}", permission);
        }
    }
}
