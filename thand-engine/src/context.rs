//! Implementation of the per-instance workflow context.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::Utc;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use thand_model::ELEVATION_CONTEXT_KEY;
use thand_model::ElevationRequest;
use thand_model::TaskList;
use thand_model::WorkflowDocument;
use uuid::Uuid;

use crate::TaskPath;
use crate::WorkflowBackend;
use crate::WorkflowResult;
use crate::error::validation;

/// Represents the opaque identifier of a live workflow instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(String);

impl WorkflowId {
    /// Generates a fresh identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Gets the string form of the identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkflowId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkflowId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Represents the status of a workflow instance.
///
/// The status is monotonic within a phase but may cycle between `Running`
/// and `Waiting` across resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    /// The instance has been created but not started.
    Pending,
    /// The instance is executing.
    Running,
    /// The instance is parked awaiting an external signal.
    Waiting,
    /// The instance completed successfully.
    Completed,
    /// The instance faulted.
    Faulted,
    /// The instance was cancelled.
    Cancelled,
}

impl WorkflowStatus {
    /// Returns `true` if the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Faulted | Self::Cancelled)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Waiting => "Waiting",
            Self::Completed => "Completed",
            Self::Faulted => "Faulted",
            Self::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// Represents the status of a single task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// The task is about to run.
    Pending,
    /// The task is running.
    Running,
    /// The task completed.
    Completed,
    /// The task faulted.
    Faulted,
}

/// Represents the state of the currently executing task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    /// The key of the task.
    pub name: String,
    /// The reference of the task within the document.
    pub reference: TaskPath,
    /// The time the task started.
    pub started_at: DateTime<Utc>,
    /// The raw input of the task, before the input transform.
    pub raw_input: Value,
    /// The raw output of the task, before the output transform.
    pub raw_output: Value,
}

/// Represents a recorded task status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskTransition {
    /// The key of the task.
    pub name: String,
    /// The reference of the task within the document.
    pub reference: TaskPath,
    /// The recorded status.
    pub status: TaskStatus,
}

/// Represents the logical state of a workflow instance: everything the
/// durable backend materializes from the event history, and everything a
/// `getWorkflowTask` query returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    /// The identifier of the instance.
    pub id: WorkflowId,
    /// The name of the workflow.
    pub workflow: String,
    /// The status of the instance.
    pub status: WorkflowStatus,
    /// The raw input of the instance.
    pub raw_input: Value,
    /// The effective input of the instance.
    pub input: Value,
    /// The effective output of the instance.
    pub output: Value,
    /// The raw output of the instance.
    pub raw_output: Value,
    /// The instance context.
    pub context: Map<String, Value>,
    /// The entry point a resuming run begins at.
    pub entry_point: Option<String>,
    /// The tri-state approval of the instance.
    pub approved: Option<bool>,
}

/// Represents the mutable per-instance state of a workflow.
///
/// The runner owns the context exclusively; concurrent branches of a `fork`
/// evaluate over cloned snapshots and merge their exports back at the
/// barrier.
#[derive(Clone)]
pub struct WorkflowContext {
    /// The identifier of the instance.
    id: WorkflowId,
    /// The document the instance executes.
    document: Arc<WorkflowDocument>,
    /// The status of the instance.
    status: WorkflowStatus,
    /// The raw input of the instance.
    raw_input: Value,
    /// The effective input of the instance.
    input: Value,
    /// The effective output of the instance.
    output: Value,
    /// The raw output of the instance.
    raw_output: Value,
    /// The instance context, readable from expressions as `$context`.
    instance_context: Map<String, Value>,
    /// The state of the currently executing task.
    current_task: Option<TaskState>,
    /// The entry point a resuming run begins at; cleared on consumption.
    entry_point: Option<String>,
    /// The tri-state approval of the instance.
    approved: Option<bool>,
    /// The recorded task status transitions.
    transitions: Vec<TaskTransition>,
    /// The execution backend of the instance.
    backend: Arc<dyn WorkflowBackend>,
    /// An optional externally shared snapshot cell, refreshed on state
    /// changes so queries can observe a running instance.
    observer: Option<Arc<Mutex<WorkflowSnapshot>>>,
}

impl WorkflowContext {
    /// Constructs a new context for the given document and backend.
    pub fn new(
        id: WorkflowId,
        document: Arc<WorkflowDocument>,
        backend: Arc<dyn WorkflowBackend>,
    ) -> Self {
        Self {
            id,
            document,
            status: WorkflowStatus::Pending,
            raw_input: Value::Null,
            input: Value::Null,
            output: Value::Null,
            raw_output: Value::Null,
            instance_context: Map::new(),
            current_task: None,
            entry_point: None,
            approved: None,
            transitions: Vec::new(),
            backend,
            observer: None,
        }
    }

    /// Reconstructs a context from a snapshot.
    ///
    /// Used by continue-as-new: the packaged logical state restarts the
    /// workflow under the same identifier.
    pub fn from_snapshot(
        snapshot: WorkflowSnapshot,
        document: Arc<WorkflowDocument>,
        backend: Arc<dyn WorkflowBackend>,
    ) -> Self {
        Self {
            id: snapshot.id,
            document,
            status: snapshot.status,
            raw_input: snapshot.raw_input,
            input: snapshot.input,
            output: snapshot.output,
            raw_output: snapshot.raw_output,
            instance_context: snapshot.context,
            current_task: None,
            entry_point: snapshot.entry_point,
            approved: snapshot.approved,
            transitions: Vec::new(),
            backend,
            observer: None,
        }
    }

    /// Attaches a shared snapshot cell refreshed on state changes.
    pub fn with_observer(mut self, observer: Arc<Mutex<WorkflowSnapshot>>) -> Self {
        self.observer = Some(observer);
        self.publish();
        self
    }

    /// Gets the attached snapshot cell, if any.
    pub fn observer(&self) -> Option<Arc<Mutex<WorkflowSnapshot>>> {
        self.observer.clone()
    }

    /// Gets the identifier of the instance.
    pub fn id(&self) -> &WorkflowId {
        &self.id
    }

    /// Gets the document of the instance.
    pub fn document(&self) -> &Arc<WorkflowDocument> {
        &self.document
    }

    /// Gets the status of the instance.
    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    /// Sets the status of the instance.
    pub fn set_status(&mut self, status: WorkflowStatus) {
        self.status = status;
        self.publish();
    }

    /// Gets the raw input of the instance.
    pub fn raw_input(&self) -> &Value {
        &self.raw_input
    }

    /// Sets the raw input of the instance.
    pub fn set_raw_input(&mut self, input: Value) {
        self.raw_input = input;
    }

    /// Gets the effective input of the instance.
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Sets the effective input of the instance.
    pub fn set_input(&mut self, input: Value) {
        self.input = input;
    }

    /// Gets the effective output of the instance.
    pub fn output(&self) -> &Value {
        &self.output
    }

    /// Sets the effective output of the instance.
    pub fn set_output(&mut self, output: Value) {
        self.output = output;
        self.publish();
    }

    /// Gets the raw output of the instance.
    pub fn raw_output(&self) -> &Value {
        &self.raw_output
    }

    /// Sets the raw output of the instance.
    pub fn set_raw_output(&mut self, output: Value) {
        self.raw_output = output;
    }

    /// Gets the instance context.
    pub fn instance_context(&self) -> &Map<String, Value> {
        &self.instance_context
    }

    /// Gets the instance context as a value, for binding as `$context`.
    pub fn context_value(&self) -> Value {
        Value::Object(self.instance_context.clone())
    }

    /// Sets a key of the instance context.
    pub fn set_context_key(&mut self, key: impl Into<String>, value: Value) {
        self.instance_context.insert(key.into(), value);
        self.publish();
    }

    /// Gets a key of the instance context.
    pub fn context_key(&self, key: &str) -> Option<&Value> {
        self.instance_context.get(key)
    }

    /// Merges an exported value into the instance context.
    ///
    /// The exported value must be a map; its entries overwrite existing
    /// keys.
    pub fn merge_export(&mut self, exported: Value, reference: &TaskPath) -> WorkflowResult<()> {
        match exported {
            Value::Object(map) => {
                for (key, value) in map {
                    self.instance_context.insert(key, value);
                }
                self.publish();
                Ok(())
            }
            Value::Null => Ok(()),
            other => Err(validation(
                format!("export must evaluate to a map, found `{other}`"),
                reference,
            )),
        }
    }

    /// Gets the elevation request stored in the instance context.
    pub fn elevation_request(&self, reference: &TaskPath) -> WorkflowResult<ElevationRequest> {
        let value = self.instance_context.get(ELEVATION_CONTEXT_KEY).ok_or_else(|| {
            validation(
                "the instance context does not hold an elevation request; run a `validate` task \
                 first",
                reference,
            )
        })?;

        serde_json::from_value(value.clone())
            .map_err(|e| validation(format!("invalid elevation request: {e}"), reference))
    }

    /// Gets the tri-state approval of the instance.
    pub fn approved(&self) -> Option<bool> {
        self.approved
    }

    /// Returns `true` if the instance is approved.
    pub fn is_approved(&self) -> bool {
        self.approved == Some(true)
    }

    /// Sets the approval of the instance.
    ///
    /// A recorded denial is sticky: once `false`, the approval never becomes
    /// `true` again within the same instance.
    pub fn set_approved(&mut self, approved: bool) {
        if self.approved == Some(false) {
            return;
        }
        self.approved = Some(approved);
        self.set_context_key("approved", Value::Bool(approved));
    }

    /// Gets the state of the currently executing task.
    pub fn current_task(&self) -> Option<&TaskState> {
        self.current_task.as_ref()
    }

    /// Binds the per-task state at task entry.
    pub fn begin_task(&mut self, name: &str, reference: &TaskPath, raw_input: Value) {
        self.current_task = Some(TaskState {
            name: name.to_string(),
            reference: reference.clone(),
            started_at: self.backend.now(),
            raw_input,
            raw_output: Value::Null,
        });
    }

    /// Records the raw output of the current task.
    pub fn set_task_raw_output(&mut self, raw_output: Value) {
        if let Some(task) = self.current_task.as_mut() {
            task.raw_output = raw_output;
        }
    }

    /// Clears the per-task state between root-level task transitions.
    pub fn clear_task(&mut self) {
        self.current_task = None;
    }

    /// Records a task status transition.
    pub fn record_transition(&mut self, name: &str, reference: &TaskPath, status: TaskStatus) {
        self.transitions.push(TaskTransition {
            name: name.to_string(),
            reference: reference.clone(),
            status,
        });
    }

    /// Gets the recorded task status transitions.
    pub fn transitions(&self) -> &[TaskTransition] {
        &self.transitions
    }

    /// Sets the entry point a resuming run begins at.
    pub fn set_entry_point(&mut self, key: impl Into<String>) {
        self.entry_point = Some(key.into());
        self.publish();
    }

    /// Returns `true` if an entry point is set.
    pub fn has_entry_point(&self) -> bool {
        self.entry_point.is_some()
    }

    /// Gets the entry point without consuming it.
    pub fn entry_point(&self) -> Option<&str> {
        self.entry_point.as_deref()
    }

    /// Resolves and consumes the entry point against the given task list.
    ///
    /// Returns 0 when no entry point is set; fails when the key does not
    /// name a root-level task.
    pub fn entry_point_index(&mut self, list: &TaskList) -> WorkflowResult<usize> {
        let Some(key) = self.entry_point.take() else {
            return Ok(0);
        };
        self.publish();

        list.position(&key).ok_or_else(|| {
            validation(
                format!("entry point `{key}` does not name a root-level task"),
                &TaskPath::root(),
            )
        })
    }

    /// Gets the execution backend of the instance.
    pub fn backend(&self) -> &Arc<dyn WorkflowBackend> {
        &self.backend
    }

    /// Gets the workflow descriptor bound as `$workflow` in expressions.
    pub fn workflow_descriptor(&self) -> Value {
        json!({
            "id": self.id.as_str(),
            "name": self.document.document.name,
            "namespace": self.document.document.namespace,
            "version": self.document.document.version,
            "status": self.status.to_string(),
        })
    }

    /// Gets the task descriptor bound as `$task` in expressions.
    pub fn task_descriptor(&self) -> Value {
        match &self.current_task {
            Some(task) => json!({
                "name": task.name,
                "reference": task.reference.as_str(),
                "startedAt": task.started_at.to_rfc3339(),
                "rawInput": task.raw_input,
                "rawOutput": task.raw_output,
            }),
            None => Value::Null,
        }
    }

    /// Builds the expression bindings for the current state.
    pub fn bindings(&self) -> crate::ExpressionBindings {
        crate::ExpressionBindings {
            context: self.context_value(),
            workflow: self.workflow_descriptor(),
            task: self.task_descriptor(),
            extras: Vec::new(),
        }
    }

    /// Builds the search attributes the engine indexes through the backend.
    pub fn search_attributes(&self) -> IndexMap<String, Value> {
        let mut attributes = IndexMap::new();
        attributes.insert("status".to_string(), json!(self.status.to_string()));
        attributes.insert("workflow".to_string(), json!(self.document.document.name));
        if let Some(approved) = self.approved {
            attributes.insert("approved".to_string(), json!(approved));
        }
        if let Some(task) = &self.current_task {
            attributes.insert("task".to_string(), json!(task.name));
        }
        if let Ok(elevation) = self.elevation_request(&TaskPath::root()) {
            attributes.insert("user".to_string(), json!(elevation.user));
            attributes.insert("role".to_string(), json!(elevation.role));
            attributes.insert("providers".to_string(), json!(elevation.providers));
            attributes.insert("identities".to_string(), json!(elevation.identities));
        }
        attributes
    }

    /// Packages the logical state of the instance.
    pub fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            id: self.id.clone(),
            workflow: self.document.document.name.clone(),
            status: self.status,
            raw_input: self.raw_input.clone(),
            input: self.input.clone(),
            output: self.output.clone(),
            raw_output: self.raw_output.clone(),
            context: self.instance_context.clone(),
            entry_point: self.entry_point.clone(),
            approved: self.approved,
        }
    }

    /// Refreshes the shared snapshot cell, if one is attached.
    fn publish(&self) {
        if let Some(observer) = &self.observer {
            *observer.lock().expect("observer lock poisoned") = self.snapshot();
        }
    }
}

impl fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("id", &self.id)
            .field("workflow", &self.document.document.name)
            .field("status", &self.status)
            .field("entry_point", &self.entry_point)
            .field("approved", &self.approved)
            .finish_non_exhaustive()
    }
}
