//! Actor models: users and groups.
//!
//! Authentication itself is out of scope; the engine consumes a resolved
//! [`UserContext`] supplied by the session layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// User entity
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub is_active: bool,
    pub is_superuser: bool,
    pub is_staff: bool,
    pub created_at: DateTime<Utc>,
}

/// Group entity. Groups are the organizational unit roles attach to.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
}

/// The actor value every access check receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserContext {
    pub id: i64,
    pub is_authenticated: bool,
    pub is_superuser: bool,
    pub is_staff: bool,
}

impl UserContext {
    pub fn anonymous() -> Self {
        Self {
            id: 0,
            is_authenticated: false,
            is_superuser: false,
            is_staff: false,
        }
    }
}

impl From<&User> for UserContext {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            is_authenticated: true,
            is_superuser: user.is_superuser,
            is_staff: user.is_staff,
        }
    }
}
