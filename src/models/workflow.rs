//! Workflow template and instance models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::Result;

use super::{EntityType, ObjectRef};

pub const WORKFLOW: EntityType = EntityType {
    key: "workflows.workflow",
    table: "workflows",
};

pub const WORKFLOW_TRANSITION: EntityType = EntityType {
    key: "workflows.workflowtransition",
    table: "workflow_transitions",
};

pub const WORKFLOW_INSTANCE: EntityType = EntityType {
    key: "workflows.workflowinstance",
    table: "workflow_instances",
};

/// Workflow template: a reusable definition of states, transitions and
/// actions, applied to documents through its document types.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Workflow {
    pub id: i64,
    /// Referenced by other apps; letters, numbers and underscores only.
    pub internal_name: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(&WORKFLOW, self.id, &self.label)
    }
}

/// One state of a workflow. Exactly one state per workflow should carry the
/// `initial` flag; flagging a new one clears the siblings (last write wins).
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WorkflowState {
    pub id: i64,
    pub workflow_id: i64,
    pub label: String,
    pub initial: bool,
    /// Percent of workflow completion this state represents.
    pub completion: i64,
}

/// When a state action fires relative to its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ActionTiming {
    Entry,
    Exit,
}

/// A side effect bound to a state, executed on entry or exit. `action_name`
/// is a key into the action registry, `action_data` its JSON configuration.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WorkflowStateAction {
    pub id: i64,
    pub state_id: i64,
    pub label: String,
    pub enabled: bool,
    pub timing: ActionTiming,
    pub action_name: String,
    pub action_data: String,
}

impl WorkflowStateAction {
    /// Deserialize the configuration data.
    pub fn loads(&self) -> Result<serde_json::Value> {
        if self.action_data.is_empty() {
            return Ok(serde_json::Value::Object(Default::default()));
        }
        Ok(serde_json::from_str(&self.action_data)?)
    }
}

/// Directed edge between two states, optionally guarded by a condition
/// expression evaluated against the instance context.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WorkflowTransition {
    pub id: i64,
    pub workflow_id: i64,
    pub label: String,
    pub origin_state_id: i64,
    pub destination_state_id: i64,
    pub condition: Option<String>,
}

impl WorkflowTransition {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(&WORKFLOW_TRANSITION, self.id, &self.label)
    }
}

/// Input field collected from the user when a transition executes; values
/// land in the log entry's extra data.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WorkflowTransitionField {
    pub id: i64,
    pub transition_id: i64,
    pub name: String,
    pub label: String,
    pub field_type: String,
    pub required: bool,
    pub help_text: String,
}

/// Binding of a transition to a system event type; the trigger dispatcher
/// attempts the transition when the event fires for the instance's document.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WorkflowTransitionTriggerEvent {
    pub id: i64,
    pub transition_id: i64,
    pub event_type: String,
}

/// Live execution of a workflow for one document. The current state is a
/// fold over the log entries; `current_state_id` caches that fold and is
/// updated transactionally with each append.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WorkflowInstance {
    pub id: i64,
    pub workflow_id: i64,
    pub document_id: i64,
    pub context: String,
    pub current_state_id: Option<i64>,
}

impl WorkflowInstance {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(
            &WORKFLOW_INSTANCE,
            self.id,
            format!("workflow instance {}", self.id),
        )
    }

    /// Deserialize the context data.
    pub fn loads(&self) -> Result<serde_json::Value> {
        if self.context.is_empty() {
            return Ok(serde_json::Value::Object(Default::default()));
        }
        Ok(serde_json::from_str(&self.context)?)
    }
}

/// Append-only record of one executed transition.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WorkflowInstanceLogEntry {
    pub id: i64,
    pub workflow_instance_id: i64,
    pub recorded_at: DateTime<Utc>,
    pub transition_id: i64,
    pub user_id: Option<i64>,
    pub comment: String,
    pub extra_data: String,
}

impl WorkflowInstanceLogEntry {
    /// Deserialize the extra field data.
    pub fn loads(&self) -> Result<serde_json::Value> {
        if self.extra_data.is_empty() {
            return Ok(serde_json::Value::Object(Default::default()));
        }
        Ok(serde_json::from_str(&self.extra_data)?)
    }
}

/// Persisted record of a swallowed action failure.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ActionErrorLog {
    pub id: i64,
    pub action_id: i64,
    pub result: String,
    pub logged_at: DateTime<Utc>,
}
