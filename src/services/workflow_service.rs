//! Workflow template and execution service.
//!
//! Templates (workflows, states, transitions, actions) are plain CRUD with a
//! few structural rules: one initial state per workflow, transition labels
//! unique per edge, internal names machine-safe. Execution is append-only:
//! the instance log is the source of truth and `current_state_id` is a cache
//! maintained in the same transaction as each log append.

use std::sync::{Arc, OnceLock};

use chrono::Utc;
use regex::Regex;
use sqlx::SqlitePool;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::models::document::Document;
use crate::models::user::UserContext;
use crate::models::workflow::{
    ActionTiming, Workflow, WorkflowInstance, WorkflowInstanceLogEntry, WorkflowState,
    WorkflowStateAction, WorkflowTransition, WorkflowTransitionField,
    WorkflowTransitionTriggerEvent, WORKFLOW_TRANSITION,
};
use crate::permissions;
use crate::services::acl_service::AclService;
use crate::services::event_bus::{DomainEvent, EventBus};
use crate::services::workflow_actions::{ActionContext, ActionRegistry};

pub const EVENT_WORKFLOW_INSTANCE_TRANSITIONED: &str =
    "workflows.workflow_instance_transitioned";

/// Result of attempting a transition. Invalid requests are reported, never
/// silently ignored; authorization failures surface as errors instead.
#[derive(Debug)]
pub enum TransitionOutcome {
    Applied(WorkflowInstanceLogEntry),
    /// The transition does not leave the instance's current state, belongs
    /// to another workflow, or its condition does not hold.
    InvalidTransition,
    /// The workflow has no initial state; the instance cannot move.
    NoInitialState,
}

fn internal_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_]+$").expect("hardcoded pattern"))
}

fn valid_internal_name(name: &str) -> bool {
    internal_name_pattern().is_match(name)
}

/// Evaluate a transition condition against the instance context.
///
/// The expression is a dotted key path resolved in the context object, with
/// an optional leading `!` for negation. An absent or blank condition always
/// holds. A value counts as true unless it is null, false, zero, or an empty
/// string, array or object.
fn evaluate_condition(condition: Option<&str>, context: &serde_json::Value) -> bool {
    let condition = match condition {
        Some(condition) => condition.trim(),
        None => return true,
    };
    if condition.is_empty() {
        return true;
    }

    let (negated, path) = match condition.strip_prefix('!') {
        Some(rest) => (true, rest.trim()),
        None => (false, condition),
    };

    let mut value = context;
    for segment in path.split('.') {
        value = match value.get(segment) {
            Some(nested) => nested,
            None => return negated,
        };
    }

    let truthy = match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(flag) => *flag,
        serde_json::Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        serde_json::Value::String(text) => !text.is_empty(),
        serde_json::Value::Array(items) => !items.is_empty(),
        serde_json::Value::Object(map) => !map.is_empty(),
    };
    truthy != negated
}

pub struct WorkflowService {
    pool: SqlitePool,
    acl: Arc<AclService>,
    actions: Arc<ActionRegistry>,
    events: EventBus,
    /// When set, a failing state action aborts (and rolls back) the
    /// transition instead of being recorded and skipped.
    strict_actions: bool,
}

impl WorkflowService {
    pub fn new(
        pool: SqlitePool,
        acl: Arc<AclService>,
        actions: Arc<ActionRegistry>,
        events: EventBus,
        strict_actions: bool,
    ) -> Self {
        Self {
            pool,
            acl,
            actions,
            events,
            strict_actions,
        }
    }

    // ------------------------------------------------------------------
    // Template management
    // ------------------------------------------------------------------

    pub async fn create_workflow(&self, internal_name: &str, label: &str) -> Result<Workflow> {
        if !valid_internal_name(internal_name) {
            return Err(AppError::Validation(format!(
                "internal name may only contain letters, numbers and underscores: {}",
                internal_name
            )));
        }
        let workflow = sqlx::query_as::<_, Workflow>(
            "INSERT INTO workflows (internal_name, label, created_at) VALUES (?, ?, ?) \
             RETURNING id, internal_name, label, created_at",
        )
        .bind(internal_name)
        .bind(label)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(workflow)
    }

    /// Bind the workflow to a document type; new documents of that type
    /// launch it automatically.
    pub async fn add_document_type(&self, workflow_id: i64, document_type_id: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO workflow_document_types (workflow_id, document_type_id) VALUES (?, ?) \
             ON CONFLICT (workflow_id, document_type_id) DO NOTHING",
        )
        .bind(workflow_id)
        .bind(document_type_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Create a state. Flagging it initial clears the flag on its siblings
    /// in the same transaction; the newest flagged state wins.
    pub async fn create_state(
        &self,
        workflow_id: i64,
        label: &str,
        initial: bool,
        completion: i64,
    ) -> Result<WorkflowState> {
        let mut tx = self.pool.begin().await?;
        if initial {
            sqlx::query("UPDATE workflow_states SET initial = 0 WHERE workflow_id = ?")
                .bind(workflow_id)
                .execute(&mut *tx)
                .await?;
        }
        let state = sqlx::query_as::<_, WorkflowState>(
            "INSERT INTO workflow_states (workflow_id, label, initial, completion) \
             VALUES (?, ?, ?, ?) \
             RETURNING id, workflow_id, label, initial, completion",
        )
        .bind(workflow_id)
        .bind(label)
        .bind(initial)
        .bind(completion)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(state)
    }

    /// Attach an action to a state. The action name must be registered and
    /// the configuration must satisfy its constructor.
    pub async fn create_state_action(
        &self,
        state_id: i64,
        label: &str,
        timing: ActionTiming,
        action_name: &str,
        action_data: serde_json::Value,
        enabled: bool,
    ) -> Result<WorkflowStateAction> {
        // Fail at template time, not at transition time.
        self.actions.instantiate(action_name, action_data.clone())?;

        let action = sqlx::query_as::<_, WorkflowStateAction>(
            "INSERT INTO workflow_state_actions \
             (state_id, label, enabled, timing, action_name, action_data) \
             VALUES (?, ?, ?, ?, ?, ?) \
             RETURNING id, state_id, label, enabled, timing, action_name, action_data",
        )
        .bind(state_id)
        .bind(label)
        .bind(enabled)
        .bind(timing)
        .bind(action_name)
        .bind(action_data.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(action)
    }

    pub async fn create_transition(
        &self,
        workflow_id: i64,
        label: &str,
        origin_state_id: i64,
        destination_state_id: i64,
        condition: Option<&str>,
    ) -> Result<WorkflowTransition> {
        let transition = sqlx::query_as::<_, WorkflowTransition>(
            "INSERT INTO workflow_transitions \
             (workflow_id, label, origin_state_id, destination_state_id, condition) \
             VALUES (?, ?, ?, ?, ?) \
             RETURNING id, workflow_id, label, origin_state_id, destination_state_id, condition",
        )
        .bind(workflow_id)
        .bind(label)
        .bind(origin_state_id)
        .bind(destination_state_id)
        .bind(condition)
        .fetch_one(&self.pool)
        .await?;
        Ok(transition)
    }

    pub async fn add_transition_field(
        &self,
        transition_id: i64,
        name: &str,
        label: &str,
        field_type: &str,
        required: bool,
        help_text: &str,
    ) -> Result<WorkflowTransitionField> {
        let field = sqlx::query_as::<_, WorkflowTransitionField>(
            "INSERT INTO workflow_transition_fields \
             (transition_id, name, label, field_type, required, help_text) \
             VALUES (?, ?, ?, ?, ?, ?) \
             RETURNING id, transition_id, name, label, field_type, required, help_text",
        )
        .bind(transition_id)
        .bind(name)
        .bind(label)
        .bind(field_type)
        .bind(required)
        .bind(help_text)
        .fetch_one(&self.pool)
        .await?;
        Ok(field)
    }

    /// Bind a transition to a system event type; the trigger dispatcher
    /// attempts it when the event fires for the instance's document.
    pub async fn add_trigger_event(
        &self,
        transition_id: i64,
        event_type: &str,
    ) -> Result<WorkflowTransitionTriggerEvent> {
        let trigger = sqlx::query_as::<_, WorkflowTransitionTriggerEvent>(
            "INSERT INTO workflow_transition_trigger_events (transition_id, event_type) \
             VALUES (?, ?) \
             RETURNING id, transition_id, event_type",
        )
        .bind(transition_id)
        .bind(event_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(trigger)
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Launch `workflow_id` for a document. Re-launching an already running
    /// pair is a no-op returning the existing instance. Entry actions of the
    /// initial state run on first launch, in the creating transaction.
    pub async fn launch_for(&self, workflow_id: i64, document_id: i64) -> Result<WorkflowInstance> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO workflow_instances (workflow_id, document_id) VALUES (?, ?) \
             ON CONFLICT (document_id, workflow_id) DO NOTHING",
        )
        .bind(workflow_id)
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

        let instance = sqlx::query_as::<_, WorkflowInstance>(
            "SELECT id, workflow_id, document_id, context, current_state_id \
             FROM workflow_instances WHERE workflow_id = ? AND document_id = ?",
        )
        .bind(workflow_id)
        .bind(document_id)
        .fetch_one(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.commit().await?;
            return Ok(instance);
        }

        debug!(workflow_id, document_id, instance_id = instance.id, "workflow launched");

        let initial: Option<WorkflowState> = sqlx::query_as(
            "SELECT id, workflow_id, label, initial, completion \
             FROM workflow_states WHERE workflow_id = ? AND initial = 1",
        )
        .bind(workflow_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(state) = initial {
            let workflow = Self::workflow_in_tx(&mut tx, workflow_id).await?;
            let document = Self::document_in_tx(&mut tx, document_id).await?;
            let context = instance.loads()?;
            self.run_state_actions(
                &mut tx,
                state.id,
                ActionTiming::Entry,
                &workflow,
                &document,
                &instance,
                &context,
                None,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(instance)
    }

    /// Launch every workflow bound to the document's type.
    pub async fn launch_all_for(&self, document_id: i64) -> Result<Vec<WorkflowInstance>> {
        let workflow_ids: Vec<i64> = sqlx::query_scalar(
            "SELECT w.id FROM workflows w \
             JOIN workflow_document_types wdt ON wdt.workflow_id = w.id \
             JOIN documents d ON d.document_type_id = wdt.document_type_id \
             WHERE d.id = ? ORDER BY w.id",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        let mut instances = Vec::with_capacity(workflow_ids.len());
        for workflow_id in workflow_ids {
            instances.push(self.launch_for(workflow_id, document_id).await?);
        }
        Ok(instances)
    }

    /// The state the instance currently sits in: the cached fold over the
    /// log when any transition ran, the workflow's initial state otherwise.
    /// `None` when the workflow has no initial state.
    pub async fn get_current_state(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<Option<WorkflowState>> {
        if let Some(state_id) = instance.current_state_id {
            let state = sqlx::query_as::<_, WorkflowState>(
                "SELECT id, workflow_id, label, initial, completion \
                 FROM workflow_states WHERE id = ?",
            )
            .bind(state_id)
            .fetch_optional(&self.pool)
            .await?;
            return Ok(state);
        }
        let state = sqlx::query_as::<_, WorkflowState>(
            "SELECT id, workflow_id, label, initial, completion \
             FROM workflow_states WHERE workflow_id = ? AND initial = 1",
        )
        .bind(instance.workflow_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(state)
    }

    /// Transitions the instance may take right now: leaving the current
    /// state, condition satisfied, and (when an actor is given) permitted.
    ///
    /// The permission check is two-tier: the blanket transition permission
    /// on the workflow admits every choice, otherwise each transition is
    /// filtered through its own ACLs.
    pub async fn get_transition_choices(
        &self,
        instance: &WorkflowInstance,
        user: Option<&UserContext>,
    ) -> Result<Vec<WorkflowTransition>> {
        let current = match self.get_current_state(instance).await? {
            Some(state) => state,
            None => return Ok(Vec::new()),
        };

        let candidates = sqlx::query_as::<_, WorkflowTransition>(
            "SELECT id, workflow_id, label, origin_state_id, destination_state_id, condition \
             FROM workflow_transitions \
             WHERE workflow_id = ? AND origin_state_id = ? ORDER BY id",
        )
        .bind(instance.workflow_id)
        .bind(current.id)
        .fetch_all(&self.pool)
        .await?;

        let context = instance.loads()?;
        let mut choices: Vec<WorkflowTransition> = candidates
            .into_iter()
            .filter(|transition| evaluate_condition(transition.condition.as_deref(), &context))
            .collect();

        if let Some(user) = user {
            let workflow = self.get_workflow(instance.workflow_id).await?;
            let blanket = self
                .acl
                .check_access(
                    &workflow.object_ref(),
                    &[permissions::WORKFLOW_TRANSITION],
                    user,
                )
                .await;
            match blanket {
                Ok(()) => {}
                Err(error) if error.is_permission_denied() => {
                    let candidate_ids: Vec<i64> =
                        choices.iter().map(|transition| transition.id).collect();
                    let allowed = self
                        .acl
                        .restrict_ids(
                            &WORKFLOW_TRANSITION,
                            &permissions::WORKFLOW_TRANSITION,
                            user,
                            &candidate_ids,
                        )
                        .await?;
                    choices.retain(|transition| allowed.contains(&transition.id));
                }
                Err(error) => return Err(error),
            }
        }
        Ok(choices)
    }

    /// Execute a transition. Everything the transition implies (log append,
    /// cache update, context merge, exit and entry actions) happens in one
    /// transaction. Requests that are structurally impossible return an
    /// outcome instead of an error; authorization failures are errors.
    pub async fn do_transition(
        &self,
        instance_id: i64,
        transition_id: i64,
        user: Option<&UserContext>,
        comment: &str,
        extra_data: Option<serde_json::Value>,
        context_updates: Option<serde_json::Value>,
    ) -> Result<TransitionOutcome> {
        let instance = self.get_instance(instance_id).await?;
        let current = match self.get_current_state(&instance).await? {
            Some(state) => state,
            None => return Ok(TransitionOutcome::NoInitialState),
        };

        let transition = match self.find_transition(transition_id).await? {
            Some(transition) => transition,
            None => return Ok(TransitionOutcome::InvalidTransition),
        };
        if transition.workflow_id != instance.workflow_id
            || transition.origin_state_id != current.id
        {
            return Ok(TransitionOutcome::InvalidTransition);
        }
        let context = instance.loads()?;
        if !evaluate_condition(transition.condition.as_deref(), &context) {
            return Ok(TransitionOutcome::InvalidTransition);
        }

        let workflow = self.get_workflow(instance.workflow_id).await?;
        if let Some(user) = user {
            self.check_transition_access(&workflow, &transition, user)
                .await?;
        }

        let mut tx = self.pool.begin().await?;

        // Merge context updates before actions run so they observe them.
        let mut merged = context;
        if let Some(serde_json::Value::Object(updates)) = context_updates {
            if let serde_json::Value::Object(target) = &mut merged {
                for (key, value) in updates {
                    target.insert(key, value);
                }
            }
            sqlx::query("UPDATE workflow_instances SET context = ? WHERE id = ?")
                .bind(merged.to_string())
                .bind(instance.id)
                .execute(&mut *tx)
                .await?;
        }

        let extra = extra_data.unwrap_or_else(|| serde_json::Value::Object(Default::default()));
        let log_entry = sqlx::query_as::<_, WorkflowInstanceLogEntry>(
            "INSERT INTO workflow_instance_log_entries \
             (workflow_instance_id, recorded_at, transition_id, user_id, comment, extra_data) \
             VALUES (?, ?, ?, ?, ?, ?) \
             RETURNING id, workflow_instance_id, recorded_at, transition_id, user_id, \
             comment, extra_data",
        )
        .bind(instance.id)
        .bind(Utc::now())
        .bind(transition.id)
        .bind(user.map(|user| user.id))
        .bind(comment)
        .bind(extra.to_string())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE workflow_instances SET current_state_id = ? WHERE id = ?")
            .bind(transition.destination_state_id)
            .bind(instance.id)
            .execute(&mut *tx)
            .await?;

        let document = Self::document_in_tx(&mut tx, instance.document_id).await?;
        self.run_state_actions(
            &mut tx,
            transition.origin_state_id,
            ActionTiming::Exit,
            &workflow,
            &document,
            &instance,
            &merged,
            Some(&log_entry),
        )
        .await?;
        self.run_state_actions(
            &mut tx,
            transition.destination_state_id,
            ActionTiming::Entry,
            &workflow,
            &document,
            &instance,
            &merged,
            Some(&log_entry),
        )
        .await?;

        tx.commit().await?;

        debug!(
            instance_id = instance.id,
            transition = %transition.label,
            destination = transition.destination_state_id,
            "transition applied"
        );
        self.events.publish(DomainEvent::new(
            EVENT_WORKFLOW_INSTANCE_TRANSITIONED,
            instance.document_id,
            user.map(|user| user.id),
        ));
        Ok(TransitionOutcome::Applied(log_entry))
    }

    /// React to a domain event: for every running instance of the event's
    /// document, attempt the transition bound to this event type that leaves
    /// the current state. When several qualify the lowest transition id
    /// wins, making trigger resolution deterministic.
    pub async fn handle_event(&self, event: &DomainEvent) -> Result<()> {
        // Workflow transition events are not themselves trigger sources;
        // reacting to them could loop.
        if event.event_type == EVENT_WORKFLOW_INSTANCE_TRANSITIONED {
            return Ok(());
        }

        let instances = sqlx::query_as::<_, WorkflowInstance>(
            "SELECT id, workflow_id, document_id, context, current_state_id \
             FROM workflow_instances WHERE document_id = ? ORDER BY id",
        )
        .bind(event.entity_id)
        .fetch_all(&self.pool)
        .await?;

        for instance in instances {
            let current = match self.get_current_state(&instance).await? {
                Some(state) => state,
                None => continue,
            };
            let candidates = sqlx::query_as::<_, WorkflowTransition>(
                "SELECT t.id, t.workflow_id, t.label, t.origin_state_id, \
                 t.destination_state_id, t.condition \
                 FROM workflow_transitions t \
                 JOIN workflow_transition_trigger_events te ON te.transition_id = t.id \
                 WHERE te.event_type = ? AND t.workflow_id = ? AND t.origin_state_id = ? \
                 ORDER BY t.id",
            )
            .bind(&event.event_type)
            .bind(instance.workflow_id)
            .bind(current.id)
            .fetch_all(&self.pool)
            .await?;

            let context = instance.loads()?;
            let chosen = candidates
                .into_iter()
                .find(|transition| evaluate_condition(transition.condition.as_deref(), &context));
            if let Some(transition) = chosen {
                debug!(
                    instance_id = instance.id,
                    transition = %transition.label,
                    event = %event.event_type,
                    "trigger fired"
                );
                self.do_transition(instance.id, transition.id, None, "", None, None)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn get_workflow(&self, workflow_id: i64) -> Result<Workflow> {
        sqlx::query_as::<_, Workflow>(
            "SELECT id, internal_name, label, created_at FROM workflows WHERE id = ?",
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("workflow {}", workflow_id)))
    }

    pub async fn get_instance(&self, instance_id: i64) -> Result<WorkflowInstance> {
        sqlx::query_as::<_, WorkflowInstance>(
            "SELECT id, workflow_id, document_id, context, current_state_id \
             FROM workflow_instances WHERE id = ?",
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("workflow instance {}", instance_id)))
    }

    /// The instance's full history, oldest first.
    pub async fn get_log_entries(&self, instance_id: i64) -> Result<Vec<WorkflowInstanceLogEntry>> {
        let entries = sqlx::query_as::<_, WorkflowInstanceLogEntry>(
            "SELECT id, workflow_instance_id, recorded_at, transition_id, user_id, \
             comment, extra_data \
             FROM workflow_instance_log_entries \
             WHERE workflow_instance_id = ? ORDER BY recorded_at, id",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    async fn find_transition(&self, transition_id: i64) -> Result<Option<WorkflowTransition>> {
        let transition = sqlx::query_as::<_, WorkflowTransition>(
            "SELECT id, workflow_id, label, origin_state_id, destination_state_id, condition \
             FROM workflow_transitions WHERE id = ?",
        )
        .bind(transition_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(transition)
    }

    /// Blanket transition permission on the workflow, or a grant on the
    /// specific transition (directly or via its workflow's ACLs).
    async fn check_transition_access(
        &self,
        workflow: &Workflow,
        transition: &WorkflowTransition,
        user: &UserContext,
    ) -> Result<()> {
        let blanket = self
            .acl
            .check_access(
                &workflow.object_ref(),
                &[permissions::WORKFLOW_TRANSITION],
                user,
            )
            .await;
        match blanket {
            Ok(()) => Ok(()),
            Err(error) if error.is_permission_denied() => {
                self.acl
                    .check_access(
                        &transition.object_ref(),
                        &[permissions::WORKFLOW_TRANSITION],
                        user,
                    )
                    .await
            }
            Err(error) => Err(error),
        }
    }

    async fn workflow_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        workflow_id: i64,
    ) -> Result<Workflow> {
        sqlx::query_as::<_, Workflow>(
            "SELECT id, internal_name, label, created_at FROM workflows WHERE id = ?",
        )
        .bind(workflow_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("workflow {}", workflow_id)))
    }

    async fn document_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        document_id: i64,
    ) -> Result<Document> {
        sqlx::query_as::<_, Document>(
            "SELECT id, document_type_id, label, description, in_trash, created_at \
             FROM documents WHERE id = ?",
        )
        .bind(document_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("document {}", document_id)))
    }

    /// Run a state's enabled actions for one timing, on the transition's
    /// connection. A failing action is recorded in the error log and skipped
    /// unless strict mode is on, in which case it aborts the transaction.
    #[allow(clippy::too_many_arguments)]
    async fn run_state_actions(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        state_id: i64,
        timing: ActionTiming,
        workflow: &Workflow,
        document: &Document,
        instance: &WorkflowInstance,
        context: &serde_json::Value,
        entry_log: Option<&WorkflowInstanceLogEntry>,
    ) -> Result<()> {
        let rows = sqlx::query_as::<_, WorkflowStateAction>(
            "SELECT id, state_id, label, enabled, timing, action_name, action_data \
             FROM workflow_state_actions \
             WHERE state_id = ? AND enabled = 1 AND timing = ? ORDER BY id",
        )
        .bind(state_id)
        .bind(timing)
        .fetch_all(&mut **tx)
        .await?;

        for row in rows {
            let outcome = async {
                let action = self.actions.instantiate(&row.action_name, row.loads()?)?;
                let ctx = ActionContext {
                    document,
                    workflow,
                    workflow_instance: instance,
                    context,
                    entry_log,
                    action: &row,
                };
                action.execute(&mut **tx, &ctx).await
            }
            .await;

            if let Err(error) = outcome {
                if self.strict_actions {
                    return Err(error);
                }
                warn!(
                    action_id = row.id,
                    action = %row.label,
                    error = %error,
                    "state action failed"
                );
                sqlx::query(
                    "INSERT INTO workflow_action_error_logs (action_id, result, logged_at) \
                     VALUES (?, ?, ?)",
                )
                .bind(row.id)
                .bind(error.to_string())
                .bind(Utc::now())
                .execute(&mut **tx)
                .await?;
            }
        }
        Ok(())
    }
}

/// Spawn the background task forwarding bus events into trigger evaluation.
pub fn spawn_trigger_dispatcher(
    service: Arc<WorkflowService>,
    events: &EventBus,
) -> tokio::task::JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(error) = service.handle_event(&event).await {
                        warn!(event = %event.event_type, error = %error, "trigger handling failed");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "trigger dispatcher lagged, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn blank_condition_always_holds() {
        let context = json!({});
        assert!(evaluate_condition(None, &context));
        assert!(evaluate_condition(Some(""), &context));
        assert!(evaluate_condition(Some("   "), &context));
    }

    #[test]
    fn condition_resolves_dotted_paths() {
        let context = json!({"review": {"approved": true, "score": 0}});
        assert!(evaluate_condition(Some("review.approved"), &context));
        assert!(!evaluate_condition(Some("review.score"), &context));
        assert!(!evaluate_condition(Some("review.missing"), &context));
    }

    #[test]
    fn condition_negation() {
        let context = json!({"blocked": false, "tags": []});
        assert!(evaluate_condition(Some("!blocked"), &context));
        assert!(evaluate_condition(Some("!tags"), &context));
        assert!(evaluate_condition(Some("!missing"), &context));
        assert!(!evaluate_condition(Some("!missing"), &json!({"missing": 1})));
    }

    #[test]
    fn emptiness_is_falsy() {
        let context = json!({"name": "", "items": [], "meta": {}, "count": 0.0});
        for key in ["name", "items", "meta", "count"] {
            assert!(!evaluate_condition(Some(key), &context), "{} should be falsy", key);
        }
    }

    #[test]
    fn internal_names_are_machine_safe() {
        assert!(valid_internal_name("approval_flow_2"));
        assert!(!valid_internal_name("approval flow"));
        assert!(!valid_internal_name("approval-flow"));
        assert!(!valid_internal_name(""));
    }
}
