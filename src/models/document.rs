//! Document graph models.
//!
//! This is the minimal object graph the ACL inheritance rules operate on:
//! documents inherit access from their type, comments from whatever object
//! they attach to through a generic `(object_type, object_id)` reference.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

use super::{EntityType, ObjectRef};

pub const DOCUMENT_TYPE: EntityType = EntityType {
    key: "documents.documenttype",
    table: "document_types",
};

pub const DOCUMENT: EntityType = EntityType {
    key: "documents.document",
    table: "documents",
};

pub const COMMENT: EntityType = EntityType {
    key: "comments.comment",
    table: "comments",
};

/// Document type entity
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DocumentType {
    pub id: i64,
    pub label: String,
    pub created_at: DateTime<Utc>,
}

impl DocumentType {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(&DOCUMENT_TYPE, self.id, &self.label)
    }
}

/// Document entity
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Document {
    pub id: i64,
    pub document_type_id: i64,
    pub label: String,
    pub description: String,
    pub in_trash: bool,
    pub created_at: DateTime<Utc>,
}

impl Document {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(&DOCUMENT, self.id, &self.label)
    }
}

/// Comment entity, attached to any registered object.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Comment {
    pub id: i64,
    pub object_type: String,
    pub object_id: String,
    pub user_id: Option<i64>,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Comment {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(&COMMENT, self.id, format!("comment {}", self.id))
    }
}
