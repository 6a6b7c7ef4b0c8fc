//! DocuVault - Main Entry Point

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docuvault::{
    config::Config,
    db,
    error::Result,
    services::{
        acl_service::AclService,
        event_bus::EventBus,
        permission_registry,
        permission_service::PermissionService,
        workflow_actions,
        workflow_service::{spawn_trigger_dispatcher, WorkflowService},
    },
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing; RUST_LOG overrides the configured level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting DocuVault");

    // Connect to database
    let db_pool = db::create_pool(&config.database_url).await?;
    tracing::info!("Connected to database");

    // Run migrations
    db::migrate(&db_pool).await?;
    tracing::info!("Database migrations complete");

    // Wire the permission machinery
    let registry = Arc::new(permission_registry::build_default());
    let permission_service = PermissionService::new(db_pool.clone(), registry.clone());
    permission_service.sync_registry().await?;

    let acl_service = Arc::new(AclService::new(db_pool.clone(), registry));
    let action_registry = Arc::new(workflow_actions::build_default());
    let event_bus = EventBus::new(config.event_bus_capacity);

    let workflow_service = Arc::new(WorkflowService::new(
        db_pool,
        acl_service,
        action_registry,
        event_bus.clone(),
        config.strict_workflow_actions,
    ));

    // Forward domain events into workflow trigger evaluation
    let dispatcher = spawn_trigger_dispatcher(workflow_service, &event_bus);
    tracing::info!("Trigger dispatcher running");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| docuvault::error::AppError::Internal(e.to_string()))?;
    tracing::info!("Shutting down");
    dispatcher.abort();

    Ok(())
}
