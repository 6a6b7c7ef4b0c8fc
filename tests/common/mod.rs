//! Common test utilities for integration tests
//!
//! Provides a per-test in-memory database with migrations applied, the
//! default permission registry, and constructors for the services under
//! test.

#![allow(dead_code)]

pub mod fixtures;

use std::sync::Arc;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use docuvault::services::acl_service::AclService;
use docuvault::services::document_service::DocumentService;
use docuvault::services::event_bus::EventBus;
use docuvault::services::permission_registry::{self, PermissionRegistry};
use docuvault::services::permission_service::PermissionService;
use docuvault::services::workflow_actions::{self, ActionRegistry};
use docuvault::services::workflow_service::WorkflowService;

/// Test context containing shared resources for tests
pub struct TestContext {
    pub pool: SqlitePool,
    pub registry: Arc<PermissionRegistry>,
    pub events: EventBus,
}

impl TestContext {
    /// Create a new test context backed by a fresh in-memory database
    pub async fn new() -> Self {
        Self::with_registry(permission_registry::build_default()).await
    }

    /// Create a test context with a custom permission registry
    pub async fn with_registry(registry: PermissionRegistry) -> Self {
        // A single connection keeps the in-memory database alive for the
        // whole test.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to open in-memory database");

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("Failed to run migrations");

        let context = Self {
            pool,
            registry: Arc::new(registry),
            events: EventBus::new(16),
        };
        context
            .permissions()
            .sync_registry()
            .await
            .expect("Failed to sync permissions");
        context
    }

    pub fn acl(&self) -> Arc<AclService> {
        Arc::new(AclService::new(self.pool.clone(), self.registry.clone()))
    }

    pub fn permissions(&self) -> PermissionService {
        PermissionService::new(self.pool.clone(), self.registry.clone())
    }

    pub fn documents(&self) -> DocumentService {
        DocumentService::new(self.pool.clone(), self.events.clone())
    }

    pub fn workflows(&self) -> WorkflowService {
        self.workflows_with(workflow_actions::build_default(), false)
    }

    pub fn workflows_strict(&self) -> WorkflowService {
        self.workflows_with(workflow_actions::build_default(), true)
    }

    pub fn workflows_with(&self, actions: ActionRegistry, strict: bool) -> WorkflowService {
        WorkflowService::new(
            self.pool.clone(),
            self.acl(),
            Arc::new(actions),
            self.events.clone(),
            strict,
        )
    }
}
