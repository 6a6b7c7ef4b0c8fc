//! Access control list model.

use serde::Serialize;
use sqlx::FromRow;

/// One object-scoped grant: binds a polymorphic `(object_type, object_id)`
/// reference to a role. The permissions restricting the grant live in
/// `acl_permissions`. At most one row exists per `(object, role)` pair; a row
/// whose permission set becomes empty is deleted on revoke.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AccessControlList {
    pub id: i64,
    pub object_type: String,
    /// Stored as text because it references rows of any table; cast back to
    /// the target key type when filtering.
    pub object_id: String,
    pub role_id: i64,
}
