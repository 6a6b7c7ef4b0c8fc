//! Workflow state actions.
//!
//! Actions are side effects bound to a state and executed when an instance
//! enters or leaves it. Implementations register under a stable name; stored
//! action rows reference that name plus a JSON configuration blob, so
//! templates survive restarts and refactors of the implementing type.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::SqliteConnection;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::models::document::Document;
use crate::models::workflow::{
    Workflow, WorkflowInstance, WorkflowInstanceLogEntry, WorkflowStateAction,
};

/// Everything an action may inspect while executing. Runs on the transition's
/// own connection so its writes commit or roll back with the transition.
pub struct ActionContext<'a> {
    pub document: &'a Document,
    pub workflow: &'a Workflow,
    pub workflow_instance: &'a WorkflowInstance,
    /// Merged instance context at execution time.
    pub context: &'a serde_json::Value,
    /// Log entry of the transition that caused this execution; `None` when
    /// the action fires on initial-state entry at launch.
    pub entry_log: Option<&'a WorkflowInstanceLogEntry>,
    pub action: &'a WorkflowStateAction,
}

#[async_trait]
pub trait WorkflowAction: Send + Sync {
    fn label(&self) -> &str;

    async fn execute(&self, conn: &mut SqliteConnection, ctx: &ActionContext<'_>) -> Result<()>;
}

/// Constructor taking the stored JSON configuration.
pub type ActionFactory = fn(serde_json::Value) -> Result<Box<dyn WorkflowAction>>;

/// Name-indexed action constructors.
#[derive(Default)]
pub struct ActionRegistry {
    factories: HashMap<&'static str, ActionFactory>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &'static str, factory: ActionFactory) {
        self.factories.insert(name, factory);
    }

    /// Instantiate the action a stored row names, with its configuration.
    pub fn instantiate(&self, name: &str, data: serde_json::Value) -> Result<Box<dyn WorkflowAction>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| AppError::NotFound(format!("workflow action {}", name)))?;
        factory(data)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Registry with the actions the application ships with.
pub fn build_default() -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    registry.register("document_properties_update", DocumentPropertiesUpdateAction::factory);
    registry.register("document_trash", DocumentTrashAction::factory);
    registry
}

#[derive(Debug, Deserialize)]
struct DocumentPropertiesUpdateConfig {
    #[serde(default)]
    document_label: Option<String>,
    #[serde(default)]
    document_description: Option<String>,
}

/// Overwrite the document's label and/or description with configured values.
pub struct DocumentPropertiesUpdateAction {
    config: DocumentPropertiesUpdateConfig,
}

impl DocumentPropertiesUpdateAction {
    fn factory(data: serde_json::Value) -> Result<Box<dyn WorkflowAction>> {
        let config: DocumentPropertiesUpdateConfig = serde_json::from_value(data)?;
        Ok(Box::new(Self { config }))
    }
}

#[async_trait]
impl WorkflowAction for DocumentPropertiesUpdateAction {
    fn label(&self) -> &str {
        "Modify document properties"
    }

    async fn execute(&self, conn: &mut SqliteConnection, ctx: &ActionContext<'_>) -> Result<()> {
        if let Some(label) = &self.config.document_label {
            sqlx::query("UPDATE documents SET label = ? WHERE id = ?")
                .bind(label)
                .bind(ctx.document.id)
                .execute(&mut *conn)
                .await?;
        }
        if let Some(description) = &self.config.document_description {
            sqlx::query("UPDATE documents SET description = ? WHERE id = ?")
                .bind(description)
                .bind(ctx.document.id)
                .execute(&mut *conn)
                .await?;
        }
        debug!(document_id = ctx.document.id, "document properties updated by action");
        Ok(())
    }
}

/// Send the instance's document to the trash.
pub struct DocumentTrashAction;

impl DocumentTrashAction {
    fn factory(_data: serde_json::Value) -> Result<Box<dyn WorkflowAction>> {
        Ok(Box::new(Self))
    }
}

#[async_trait]
impl WorkflowAction for DocumentTrashAction {
    fn label(&self) -> &str {
        "Send document to trash"
    }

    async fn execute(&self, conn: &mut SqliteConnection, ctx: &ActionContext<'_>) -> Result<()> {
        sqlx::query("UPDATE documents SET in_trash = 1 WHERE id = ?")
            .bind(ctx.document.id)
            .execute(&mut *conn)
            .await?;
        debug!(document_id = ctx.document.id, "document trashed by action");
        Ok(())
    }
}
