//! Implementation of workflow execution backends.
//!
//! A backend is the engine's only source of time, suspension, signals, and
//! activity execution: everything externally observable goes through it so
//! the durable implementation can replay deterministically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thand_model::CloudEvent;
use tokio_util::sync::CancellationToken;

use crate::WorkflowId;
use crate::WorkflowResult;
use crate::WorkflowSnapshot;

pub mod durable;
pub mod in_process;

/// The reserved name of the workflow resume signal.
pub const RESUME_SIGNAL: &str = "resume";

/// The reserved name of the workflow termination signal.
pub const TERMINATE_SIGNAL: &str = "terminate";

/// The reserved name of the CloudEvent signal.
pub const EVENT_SIGNAL: &str = "event";

/// Represents the kind of an execution backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// The in-process backend: parallel OS threads, no signal channels.
    InProcess,
    /// The durable backend: deterministic replay, durable timers and
    /// signals.
    Durable,
}

/// Represents the payload of a workflow resume signal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeInput {
    /// The root task key the resumed run begins at.
    ///
    /// When absent, the instance's stored entry point is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    /// The input delivered to the resumed task.
    #[serde(default)]
    pub input: Value,
}

/// Represents the payload of a workflow termination signal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TerminationRequest {
    /// The time the termination is scheduled for.
    ///
    /// When in the future, delivery is deferred until then.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// The root task key the terminating run resumes at before completing.
    ///
    /// This is the scheduled revocation path: the workflow runs the named
    /// task and then completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    /// The reason for the termination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Represents a signal delivered to a workflow instance.
#[derive(Debug, Clone)]
pub enum SignalPayload {
    /// A resume signal.
    Resume(ResumeInput),
    /// A CloudEvent signal.
    Event(CloudEvent),
    /// A termination signal.
    Terminate(TerminationRequest),
}

impl SignalPayload {
    /// Gets the reserved name of the signal's channel.
    pub fn channel(&self) -> &'static str {
        match self {
            Self::Resume(_) => RESUME_SIGNAL,
            Self::Event(_) => EVENT_SIGNAL,
            Self::Terminate(_) => TERMINATE_SIGNAL,
        }
    }
}

/// Represents backend information exposed to the runner.
#[derive(Debug, Clone)]
pub struct BackendInfo {
    /// Whether the backend suggests restarting the workflow under the same
    /// identifier.
    pub continue_as_new_suggested: bool,
    /// The build identifier of the current worker.
    pub current_build_id: String,
}

/// Represents the options scoping an activity execution.
#[derive(Debug, Clone)]
pub struct ActivityOptions {
    /// The start-to-close timeout of the activity.
    pub start_to_close: Duration,
    /// The task queue the activity is scheduled on.
    pub task_queue: String,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            start_to_close: Duration::from_secs(crate::config::DEFAULT_ACTIVITY_TIMEOUT_SECS),
            task_queue: "thand".to_string(),
        }
    }
}

/// Represents an interpolated `call` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequest {
    /// The name of the called function.
    pub function: String,
    /// The interpolated `with` payload.
    pub with: IndexMap<String, Value>,
}

/// Represents the arguments of a named activity invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityInvocation {
    /// The logical state of the invoking workflow.
    pub workflow: WorkflowSnapshot,
    /// The name of the invoking task.
    pub task_name: String,
    /// The interpolated call.
    pub call: CallRequest,
    /// The input of the invoking task.
    pub input: Value,
}

/// The function type of a named activity.
pub type ActivityFn =
    Arc<dyn Fn(ActivityInvocation) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Represents the explicit map of named activities registered with a
/// backend.
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    /// The registered activities, keyed by name.
    activities: HashMap<String, ActivityFn>,
}

impl ActivityRegistry {
    /// Constructs an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an activity under the given name.
    pub fn register(&mut self, name: impl Into<String>, activity: ActivityFn) {
        self.activities.insert(name.into(), activity);
    }

    /// Gets the activity registered under the given name.
    pub fn get(&self, name: &str) -> Option<&ActivityFn> {
        self.activities.get(name)
    }

    /// Gets the names of the registered activities.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.activities.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("activities", &self.activities.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Represents a workflow execution backend.
///
/// The engine requires the same contract of both implementations; only
/// suspension differs: the in-process backend surfaces the await-signal
/// sentinel where the durable backend blocks on its signal channels.
#[async_trait]
pub trait WorkflowBackend: Send + Sync {
    /// Gets the kind of the backend.
    fn kind(&self) -> BackendKind;

    /// Gets the current logical time.
    fn now(&self) -> DateTime<Utc>;

    /// Suspends the caller for the given duration.
    async fn sleep(&self, duration: Duration) -> WorkflowResult<()>;

    /// Receives the next signal delivered to the workflow.
    ///
    /// The in-process backend has no signal channels and returns the
    /// await-signal sentinel.
    async fn next_signal(&self) -> WorkflowResult<SignalPayload>;

    /// Executes a named activity.
    async fn execute_activity(
        &self,
        name: &str,
        invocation: ActivityInvocation,
        options: &ActivityOptions,
    ) -> WorkflowResult<Value>;

    /// Sends a signal to another (or the same) workflow.
    async fn signal_external(
        &self,
        target: &WorkflowId,
        signal: SignalPayload,
    ) -> WorkflowResult<()>;

    /// Indexes the given fields externally.
    fn upsert_search_attributes(&self, attributes: IndexMap<String, Value>);

    /// Gets the currently indexed fields.
    fn search_attributes(&self) -> IndexMap<String, Value>;

    /// Gets information about the backend.
    fn info(&self) -> BackendInfo;

    /// Gets the cancellation token of the workflow.
    fn cancellation(&self) -> CancellationToken;
}
