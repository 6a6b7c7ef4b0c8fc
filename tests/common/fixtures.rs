//! Database fixtures shared across integration tests.

use docuvault::models::user::{User, UserContext};

use super::TestContext;

/// A user wired through a group into a role, ready to receive grants.
pub struct Actor {
    pub user: User,
    pub context: UserContext,
    pub group_id: i64,
    pub role_id: i64,
}

/// Create a regular user and the group/role plumbing grants attach to.
pub async fn create_actor(ctx: &TestContext, username: &str) -> Actor {
    let permissions = ctx.permissions();
    let user = permissions
        .create_user(username, false, false)
        .await
        .expect("create user");
    let group = permissions
        .create_group(&format!("{}-group", username))
        .await
        .expect("create group");
    let role = permissions
        .create_role(&format!("{}-role", username))
        .await
        .expect("create role");
    permissions
        .add_user_to_group(user.id, group.id)
        .await
        .expect("add user to group");
    permissions
        .add_group_to_role(group.id, role.id)
        .await
        .expect("add group to role");

    let context = UserContext::from(&user);
    Actor {
        user,
        context,
        group_id: group.id,
        role_id: role.id,
    }
}

/// Create a superuser; superusers bypass every ACL check.
pub async fn create_superuser(ctx: &TestContext, username: &str) -> Actor {
    let permissions = ctx.permissions();
    let user = permissions
        .create_user(username, true, false)
        .await
        .expect("create superuser");
    let group = permissions
        .create_group(&format!("{}-group", username))
        .await
        .expect("create group");
    let role = permissions
        .create_role(&format!("{}-role", username))
        .await
        .expect("create role");
    permissions
        .add_user_to_group(user.id, group.id)
        .await
        .expect("add user to group");
    permissions
        .add_group_to_role(group.id, role.id)
        .await
        .expect("add group to role");

    let context = UserContext::from(&user);
    Actor {
        user,
        context,
        group_id: group.id,
        role_id: role.id,
    }
}
