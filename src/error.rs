//! Application error types and result alias.

use thiserror::Error;

/// Application result type alias
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Authorization denial. The expected, user-facing outcome of a failed
    /// access check; carries the display form of the denied object.
    #[error("Insufficient access for: {0}")]
    PermissionDenied(String),

    /// A permission was granted for an object whose class never registered it
    #[error("Permission not valid for class: {0}")]
    PermissionNotValid(String),

    /// Not found error
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Conflict error (e.g., duplicate workflow launch)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether this error is an authorization denial rather than a system fault.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, AppError::PermissionDenied(_))
    }
}
