//! Document graph service.
//!
//! CRUD for the object graph the permission engine protects. Mutations emit
//! domain events so workflow trigger bindings can react to them.

use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::models::document::{Comment, Document, DocumentType};
use crate::models::ObjectRef;
use crate::services::event_bus::{DomainEvent, EventBus};

pub const EVENT_DOCUMENT_CREATED: &str = "documents.document_created";
pub const EVENT_DOCUMENT_EDITED: &str = "documents.document_edited";
pub const EVENT_DOCUMENT_TRASHED: &str = "documents.document_trashed";

pub struct DocumentService {
    pool: SqlitePool,
    events: EventBus,
}

impl DocumentService {
    pub fn new(pool: SqlitePool, events: EventBus) -> Self {
        Self { pool, events }
    }

    pub async fn create_document_type(&self, label: &str) -> Result<DocumentType> {
        let document_type = sqlx::query_as::<_, DocumentType>(
            "INSERT INTO document_types (label, created_at) VALUES (?, ?) \
             RETURNING id, label, created_at",
        )
        .bind(label)
        .bind(chrono::Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(document_type)
    }

    pub async fn create_document(
        &self,
        document_type_id: i64,
        label: &str,
        actor: Option<i64>,
    ) -> Result<Document> {
        let document = sqlx::query_as::<_, Document>(
            "INSERT INTO documents (document_type_id, label, created_at) VALUES (?, ?, ?) \
             RETURNING id, document_type_id, label, description, in_trash, created_at",
        )
        .bind(document_type_id)
        .bind(label)
        .bind(chrono::Utc::now())
        .fetch_one(&self.pool)
        .await?;

        debug!(document_id = document.id, label, "document created");
        self.events
            .publish(DomainEvent::new(EVENT_DOCUMENT_CREATED, document.id, actor));
        Ok(document)
    }

    pub async fn edit_document(
        &self,
        document_id: i64,
        label: Option<&str>,
        description: Option<&str>,
        actor: Option<i64>,
    ) -> Result<Document> {
        let mut tx = self.pool.begin().await?;
        if let Some(label) = label {
            sqlx::query("UPDATE documents SET label = ? WHERE id = ?")
                .bind(label)
                .bind(document_id)
                .execute(&mut *tx)
                .await?;
        }
        if let Some(description) = description {
            sqlx::query("UPDATE documents SET description = ? WHERE id = ?")
                .bind(description)
                .bind(document_id)
                .execute(&mut *tx)
                .await?;
        }
        let document = sqlx::query_as::<_, Document>(
            "SELECT id, document_type_id, label, description, in_trash, created_at \
             FROM documents WHERE id = ?",
        )
        .bind(document_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("document {}", document_id)))?;
        tx.commit().await?;

        self.events
            .publish(DomainEvent::new(EVENT_DOCUMENT_EDITED, document.id, actor));
        Ok(document)
    }

    /// Move a document to the trash. Idempotent.
    pub async fn trash_document(&self, document_id: i64, actor: Option<i64>) -> Result<()> {
        let updated = sqlx::query("UPDATE documents SET in_trash = 1 WHERE id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("document {}", document_id)));
        }
        self.events
            .publish(DomainEvent::new(EVENT_DOCUMENT_TRASHED, document_id, actor));
        Ok(())
    }

    pub async fn get_document(&self, document_id: i64) -> Result<Document> {
        sqlx::query_as::<_, Document>(
            "SELECT id, document_type_id, label, description, in_trash, created_at \
             FROM documents WHERE id = ?",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("document {}", document_id)))
    }

    pub async fn get_document_type(&self, document_type_id: i64) -> Result<DocumentType> {
        sqlx::query_as::<_, DocumentType>(
            "SELECT id, label, created_at FROM document_types WHERE id = ?",
        )
        .bind(document_type_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("document type {}", document_type_id)))
    }

    /// Attach a comment to any registered object through its reference.
    pub async fn create_comment(
        &self,
        target: &ObjectRef,
        user_id: Option<i64>,
        text: &str,
    ) -> Result<Comment> {
        let entity = target.entity.ok_or_else(|| {
            AppError::Validation(format!("cannot comment on non-database object: {}", target.label))
        })?;
        let comment = sqlx::query_as::<_, Comment>(
            "INSERT INTO comments (object_type, object_id, user_id, text, created_at) \
             VALUES (?, ?, ?, ?, ?) \
             RETURNING id, object_type, object_id, user_id, text, created_at",
        )
        .bind(entity.key)
        .bind(target.id.to_string())
        .bind(user_id)
        .bind(text)
        .bind(chrono::Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(comment)
    }

    pub async fn get_comment(&self, comment_id: i64) -> Result<Comment> {
        sqlx::query_as::<_, Comment>(
            "SELECT id, object_type, object_id, user_id, text, created_at \
             FROM comments WHERE id = ?",
        )
        .bind(comment_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("comment {}", comment_id)))
    }
}
