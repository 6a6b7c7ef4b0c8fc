//! Integration tests for the ACL permission engine.

mod common;

use common::fixtures::{create_actor, create_superuser};
use common::TestContext;

use docuvault::error::AppError;
use docuvault::models::document::{COMMENT, DOCUMENT};
use docuvault::models::user::UserContext;
use docuvault::models::workflow::WORKFLOW_INSTANCE;
use docuvault::models::ObjectRef;
use docuvault::permissions;
use docuvault::services::acl_service::AccessScope;
use docuvault::services::permission_registry::{self, FieldQuery};

#[tokio::test]
async fn direct_grant_restricts_to_granted_rows() {
    let ctx = TestContext::new().await;
    let actor = create_actor(&ctx, "alice").await;
    let documents = ctx.documents();
    let acl = ctx.acl();

    let kind = documents.create_document_type("memo").await.unwrap();
    let visible = documents
        .create_document(kind.id, "visible", None)
        .await
        .unwrap();
    let hidden = documents
        .create_document(kind.id, "hidden", None)
        .await
        .unwrap();

    acl.grant(
        &visible.object_ref(),
        &permissions::DOCUMENT_VIEW,
        actor.role_id,
    )
    .await
    .unwrap();

    let scope = acl
        .restrict(&DOCUMENT, &permissions::DOCUMENT_VIEW, &actor.context)
        .await
        .unwrap();
    assert_eq!(scope, AccessScope::Restricted(vec![visible.id]));

    acl.check_access(
        &visible.object_ref(),
        &[permissions::DOCUMENT_VIEW],
        &actor.context,
    )
    .await
    .unwrap();
    let denied = acl
        .check_access(
            &hidden.object_ref(),
            &[permissions::DOCUMENT_VIEW],
            &actor.context,
        )
        .await
        .unwrap_err();
    assert!(denied.is_permission_denied());
    assert_eq!(denied.to_string(), "Insufficient access for: hidden");
}

#[tokio::test]
async fn type_level_grant_covers_all_documents_of_that_type() {
    let ctx = TestContext::new().await;
    let actor = create_actor(&ctx, "alice").await;
    let documents = ctx.documents();
    let acl = ctx.acl();

    let memo = documents.create_document_type("memo").await.unwrap();
    let report = documents.create_document_type("report").await.unwrap();
    let first = documents.create_document(memo.id, "a", None).await.unwrap();
    let second = documents.create_document(memo.id, "b", None).await.unwrap();
    let other = documents.create_document(report.id, "c", None).await.unwrap();

    acl.grant(&memo.object_ref(), &permissions::DOCUMENT_VIEW, actor.role_id)
        .await
        .unwrap();

    let scope = acl
        .restrict(&DOCUMENT, &permissions::DOCUMENT_VIEW, &actor.context)
        .await
        .unwrap();
    assert_eq!(scope, AccessScope::Restricted(vec![first.id, second.id]));
    assert!(!scope.contains(other.id));
}

#[tokio::test]
async fn superuser_and_staff_are_unrestricted() {
    let ctx = TestContext::new().await;
    let root = create_superuser(&ctx, "root").await;
    let acl = ctx.acl();

    let scope = acl
        .restrict(&DOCUMENT, &permissions::DOCUMENT_VIEW, &root.context)
        .await
        .unwrap();
    assert_eq!(scope, AccessScope::Unrestricted);
}

#[tokio::test]
async fn unauthenticated_user_sees_nothing() {
    let ctx = TestContext::new().await;
    let documents = ctx.documents();
    let acl = ctx.acl();

    let kind = documents.create_document_type("memo").await.unwrap();
    documents.create_document(kind.id, "a", None).await.unwrap();

    let scope = acl
        .restrict(
            &DOCUMENT,
            &permissions::DOCUMENT_VIEW,
            &UserContext::anonymous(),
        )
        .await
        .unwrap();
    assert_eq!(scope, AccessScope::Restricted(vec![]));
}

#[tokio::test]
async fn role_wide_grant_skips_object_filtering() {
    let ctx = TestContext::new().await;
    let actor = create_actor(&ctx, "alice").await;
    let acl = ctx.acl();

    ctx.permissions()
        .grant_to_role(actor.role_id, &permissions::DOCUMENT_VIEW)
        .await
        .unwrap();

    let scope = acl
        .restrict(&DOCUMENT, &permissions::DOCUMENT_VIEW, &actor.context)
        .await
        .unwrap();
    assert_eq!(scope, AccessScope::Unrestricted);
}

#[tokio::test]
async fn three_level_chain_reaches_workflow_instances() {
    let ctx = TestContext::new().await;
    let actor = create_actor(&ctx, "alice").await;
    let documents = ctx.documents();
    let workflows = ctx.workflows();
    let acl = ctx.acl();

    let kind = documents.create_document_type("memo").await.unwrap();
    let document = documents.create_document(kind.id, "a", None).await.unwrap();
    let other = documents.create_document(kind.id, "b", None).await.unwrap();

    let workflow = workflows.create_workflow("approval", "Approval").await.unwrap();
    workflows.add_document_type(workflow.id, kind.id).await.unwrap();
    workflows
        .create_state(workflow.id, "draft", true, 0)
        .await
        .unwrap();
    let instance = workflows.launch_for(workflow.id, document.id).await.unwrap();
    workflows.launch_for(workflow.id, other.id).await.unwrap();

    // A workflow-view grant on the document alone must surface its instance,
    // even though the deeper document-type link holds no grant.
    acl.grant(
        &document.object_ref(),
        &permissions::WORKFLOW_VIEW,
        actor.role_id,
    )
    .await
    .unwrap();

    let scope = acl
        .restrict(&WORKFLOW_INSTANCE, &permissions::WORKFLOW_VIEW, &actor.context)
        .await
        .unwrap();
    assert_eq!(scope, AccessScope::Restricted(vec![instance.id]));
}

#[tokio::test]
async fn generic_reference_disambiguates_equal_ids() {
    let ctx = TestContext::new().await;
    let actor = create_actor(&ctx, "alice").await;
    let documents = ctx.documents();
    let acl = ctx.acl();

    // The document and its type share the numeric id 1; the synthetic
    // type-id key must keep their comments apart.
    let kind = documents.create_document_type("memo").await.unwrap();
    let document = documents.create_document(kind.id, "a", None).await.unwrap();
    assert_eq!(kind.id, document.id);

    let on_document = documents
        .create_comment(&document.object_ref(), None, "on the document")
        .await
        .unwrap();
    documents
        .create_comment(&kind.object_ref(), None, "on the type")
        .await
        .unwrap();

    acl.grant(
        &document.object_ref(),
        &permissions::COMMENT_VIEW,
        actor.role_id,
    )
    .await
    .unwrap();

    let scope = acl
        .restrict(&COMMENT, &permissions::COMMENT_VIEW, &actor.context)
        .await
        .unwrap();
    assert_eq!(scope, AccessScope::Restricted(vec![on_document.id]));
}

#[tokio::test]
async fn check_access_passes_non_database_objects() {
    let ctx = TestContext::new().await;
    let actor = create_actor(&ctx, "alice").await;
    let acl = ctx.acl();

    acl.check_access(
        &ObjectRef::foreign("system setting"),
        &[permissions::DOCUMENT_VIEW],
        &actor.context,
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn check_access_accepts_any_of_several_permissions() {
    let ctx = TestContext::new().await;
    let actor = create_actor(&ctx, "alice").await;
    let documents = ctx.documents();
    let acl = ctx.acl();

    let kind = documents.create_document_type("memo").await.unwrap();
    let document = documents.create_document(kind.id, "a", None).await.unwrap();

    acl.grant(
        &document.object_ref(),
        &permissions::DOCUMENT_EDIT,
        actor.role_id,
    )
    .await
    .unwrap();

    // View is not held, edit is; the disjunction passes.
    acl.check_access(
        &document.object_ref(),
        &[permissions::DOCUMENT_VIEW, permissions::DOCUMENT_EDIT],
        &actor.context,
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn grant_rejects_permission_not_registered_for_class() {
    let ctx = TestContext::new().await;
    let actor = create_actor(&ctx, "alice").await;
    let documents = ctx.documents();
    let acl = ctx.acl();

    let kind = documents.create_document_type("memo").await.unwrap();
    let document = documents.create_document(kind.id, "a", None).await.unwrap();

    let err = acl
        .grant(
            &document.object_ref(),
            &permissions::WORKFLOW_EDIT,
            actor.role_id,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PermissionNotValid(_)));
}

#[tokio::test]
async fn grant_is_idempotent_and_revoke_removes_access() {
    let ctx = TestContext::new().await;
    let actor = create_actor(&ctx, "alice").await;
    let documents = ctx.documents();
    let acl = ctx.acl();

    let kind = documents.create_document_type("memo").await.unwrap();
    let document = documents.create_document(kind.id, "a", None).await.unwrap();

    for _ in 0..2 {
        acl.grant(
            &document.object_ref(),
            &permissions::DOCUMENT_VIEW,
            actor.role_id,
        )
        .await
        .unwrap();
    }

    let scope = acl
        .restrict(&DOCUMENT, &permissions::DOCUMENT_VIEW, &actor.context)
        .await
        .unwrap();
    assert_eq!(scope, AccessScope::Restricted(vec![document.id]));

    acl.revoke(
        &document.object_ref(),
        &permissions::DOCUMENT_VIEW,
        actor.role_id,
    )
    .await
    .unwrap();

    let scope = acl
        .restrict(&DOCUMENT, &permissions::DOCUMENT_VIEW, &actor.context)
        .await
        .unwrap();
    assert_eq!(scope, AccessScope::Restricted(vec![]));

    // The emptied ACL row is gone; revoking again is a quiet no-op.
    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM access_control_lists")
        .fetch_one(&ctx.pool)
        .await
        .unwrap();
    assert_eq!(rows, 0);
    acl.revoke(
        &document.object_ref(),
        &permissions::DOCUMENT_VIEW,
        actor.role_id,
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn revoke_keeps_acl_row_while_other_permissions_remain() {
    let ctx = TestContext::new().await;
    let actor = create_actor(&ctx, "alice").await;
    let documents = ctx.documents();
    let acl = ctx.acl();

    let kind = documents.create_document_type("memo").await.unwrap();
    let document = documents.create_document(kind.id, "a", None).await.unwrap();

    acl.grant(&document.object_ref(), &permissions::DOCUMENT_VIEW, actor.role_id)
        .await
        .unwrap();
    acl.grant(&document.object_ref(), &permissions::DOCUMENT_EDIT, actor.role_id)
        .await
        .unwrap();
    acl.revoke(&document.object_ref(), &permissions::DOCUMENT_VIEW, actor.role_id)
        .await
        .unwrap();

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM access_control_lists")
        .fetch_one(&ctx.pool)
        .await
        .unwrap();
    assert_eq!(rows, 1);

    let scope = acl
        .restrict(&DOCUMENT, &permissions::DOCUMENT_EDIT, &actor.context)
        .await
        .unwrap();
    assert_eq!(scope, AccessScope::Restricted(vec![document.id]));
}

#[tokio::test]
async fn inherited_permissions_come_from_ancestors() {
    let ctx = TestContext::new().await;
    let actor = create_actor(&ctx, "alice").await;
    let documents = ctx.documents();
    let acl = ctx.acl();

    let kind = documents.create_document_type("memo").await.unwrap();
    let document = documents.create_document(kind.id, "a", None).await.unwrap();
    let comment = documents
        .create_comment(&document.object_ref(), None, "hi")
        .await
        .unwrap();

    // Grants on the type flow to the document; grants on the document flow
    // to its comments through the generic reference.
    acl.grant(&kind.object_ref(), &permissions::DOCUMENT_VIEW, actor.role_id)
        .await
        .unwrap();
    acl.grant(&kind.object_ref(), &permissions::DOCUMENT_TYPE_EDIT, actor.role_id)
        .await
        .unwrap();
    acl.grant(&document.object_ref(), &permissions::COMMENT_VIEW, actor.role_id)
        .await
        .unwrap();

    let inherited = acl
        .get_inherited_permissions(&document.object_ref(), actor.role_id)
        .await
        .unwrap();
    let uids: Vec<String> = inherited.iter().map(|p| p.uid()).collect();
    // Valid for documents and held on an ancestor.
    assert!(uids.contains(&"documents.document_view".to_string()));
    // Held on the ancestor but not a document permission.
    assert!(!uids.contains(&"documents.document_type_edit".to_string()));

    let inherited = acl
        .get_inherited_permissions(&comment.object_ref(), actor.role_id)
        .await
        .unwrap();
    let uids: Vec<String> = inherited.iter().map(|p| p.uid()).collect();
    assert!(uids.contains(&"comments.comment_view".to_string()));

    // Direct grants on the object itself are not "inherited".
    acl.grant(&document.object_ref(), &permissions::DOCUMENT_EDIT, actor.role_id)
        .await
        .unwrap();
    let inherited = acl
        .get_inherited_permissions(&document.object_ref(), actor.role_id)
        .await
        .unwrap();
    assert!(!inherited
        .iter()
        .any(|p| p.uid() == "documents.document_edit"));
}

#[tokio::test]
async fn manager_filter_narrows_the_row_universe() {
    let mut registry = permission_registry::build_default();
    registry.register_manager_filter(&DOCUMENT, "t.in_trash = 0");
    let ctx = TestContext::with_registry(registry).await;
    let actor = create_actor(&ctx, "alice").await;
    let documents = ctx.documents();
    let acl = ctx.acl();

    let kind = documents.create_document_type("memo").await.unwrap();
    let active = documents.create_document(kind.id, "active", None).await.unwrap();
    let trashed = documents.create_document(kind.id, "trashed", None).await.unwrap();
    documents.trash_document(trashed.id, None).await.unwrap();

    acl.grant(&kind.object_ref(), &permissions::DOCUMENT_VIEW, actor.role_id)
        .await
        .unwrap();

    let scope = acl
        .restrict(&DOCUMENT, &permissions::DOCUMENT_VIEW, &actor.context)
        .await
        .unwrap();
    assert_eq!(scope, AccessScope::Restricted(vec![active.id]));
}

fn untrashed_documents_query() -> FieldQuery {
    FieldQuery {
        field_lookup: "id",
        acl_filter: "m.in_trash = 0".to_string(),
        acl_values: None,
    }
}

#[tokio::test]
async fn field_query_opens_an_extra_access_path() {
    let mut registry = permission_registry::build_default();
    registry.register_field_query(&DOCUMENT, untrashed_documents_query);
    let ctx = TestContext::with_registry(registry).await;
    let actor = create_actor(&ctx, "alice").await;
    let documents = ctx.documents();
    let acl = ctx.acl();

    let kind = documents.create_document_type("memo").await.unwrap();
    let granted = documents.create_document(kind.id, "granted", None).await.unwrap();
    let trashed = documents.create_document(kind.id, "trashed", None).await.unwrap();
    documents.trash_document(trashed.id, None).await.unwrap();

    acl.grant(&granted.object_ref(), &permissions::DOCUMENT_VIEW, actor.role_id)
        .await
        .unwrap();
    acl.grant(&trashed.object_ref(), &permissions::DOCUMENT_VIEW, actor.role_id)
        .await
        .unwrap();

    // Both carry direct grants; the field query admits only untrashed rows
    // but the direct case still admits the trashed one, OR-combined.
    let scope = acl
        .restrict(&DOCUMENT, &permissions::DOCUMENT_VIEW, &actor.context)
        .await
        .unwrap();
    assert_eq!(scope, AccessScope::Restricted(vec![granted.id, trashed.id]));
}

#[tokio::test]
async fn restrict_ids_preserves_candidate_order() {
    let ctx = TestContext::new().await;
    let actor = create_actor(&ctx, "alice").await;
    let documents = ctx.documents();
    let acl = ctx.acl();

    let kind = documents.create_document_type("memo").await.unwrap();
    let first = documents.create_document(kind.id, "a", None).await.unwrap();
    let second = documents.create_document(kind.id, "b", None).await.unwrap();
    let third = documents.create_document(kind.id, "c", None).await.unwrap();

    acl.grant(&first.object_ref(), &permissions::DOCUMENT_VIEW, actor.role_id)
        .await
        .unwrap();
    acl.grant(&third.object_ref(), &permissions::DOCUMENT_VIEW, actor.role_id)
        .await
        .unwrap();

    let allowed = acl
        .restrict_ids(
            &DOCUMENT,
            &permissions::DOCUMENT_VIEW,
            &actor.context,
            &[third.id, second.id, first.id],
        )
        .await
        .unwrap();
    assert_eq!(allowed, vec![third.id, first.id]);
}

#[tokio::test]
async fn grants_do_not_leak_across_roles() {
    let ctx = TestContext::new().await;
    let alice = create_actor(&ctx, "alice").await;
    let bob = create_actor(&ctx, "bob").await;
    let documents = ctx.documents();
    let acl = ctx.acl();

    let kind = documents.create_document_type("memo").await.unwrap();
    let document = documents.create_document(kind.id, "a", None).await.unwrap();

    acl.grant(&document.object_ref(), &permissions::DOCUMENT_VIEW, alice.role_id)
        .await
        .unwrap();

    let scope = acl
        .restrict(&DOCUMENT, &permissions::DOCUMENT_VIEW, &bob.context)
        .await
        .unwrap();
    assert_eq!(scope, AccessScope::Restricted(vec![]));
}
