//! Application configuration loaded from environment variables.

use crate::error::{AppError, Result};
use std::env;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Log filter directive, overridable per run with RUST_LOG
    pub log_level: String,

    /// When set, workflow action failures abort the transition instead of
    /// being recorded to the action error log and swallowed
    pub strict_workflow_actions: bool,

    /// Buffered capacity of the domain event bus
    pub event_bus_capacity: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| AppError::Config("DATABASE_URL not set".into()))?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "docuvault=debug".into()),
            strict_workflow_actions: env::var("STRICT_WORKFLOW_ACTIONS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            event_bus_capacity: env::var("EVENT_BUS_CAPACITY")
                .unwrap_or_else(|_| "256".into())
                .parse()
                .unwrap_or(256),
        })
    }
}
