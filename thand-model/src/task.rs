//! Implementation of the task definition model.

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::DurationSpec;
use crate::ExportBlock;
use crate::FlowTarget;
use crate::InputBlock;
use crate::Named;
use crate::OutputBlock;
use crate::TaskList;

/// Represents the fields common to every task definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskBase {
    /// The predicate controlling whether the task runs.
    ///
    /// A task whose predicate evaluates to `false` is skipped without
    /// producing output.
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub if_: Option<String>,
    /// The task-level input schema and transform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputBlock>,
    /// The task-level output schema and transform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputBlock>,
    /// The task-level export schema and transform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<ExportBlock>,
    /// The flow target to continue at once the task completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub then: Option<FlowTarget>,
    /// The task-level timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutDefinition>,
}

/// Represents a task-level timeout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeoutDefinition {
    /// The duration after which the task times out.
    pub after: DurationSpec,
}

/// Represents a task definition: a tagged union over the fixed set of task
/// kinds.
///
/// The kind of a task is determined by its distinguishing field (`set`,
/// `switch`, `for`, …). The variant order matters for deserialization: `for`
/// must precede `do` as both carry a `do` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskDefinition {
    /// A `for` task.
    For(ForTask),
    /// A `try` task.
    Try(TryTask),
    /// A `fork` task.
    Fork(ForkTask),
    /// A `raise` task.
    Raise(RaiseTask),
    /// An `emit` task.
    Emit(EmitTask),
    /// A `listen` task.
    Listen(ListenTask),
    /// A `run` task.
    Run(RunTask),
    /// A `call` task.
    Call(CallTask),
    /// A `switch` task.
    Switch(SwitchTask),
    /// A `set` task.
    Set(SetTask),
    /// A `wait` task.
    Wait(WaitTask),
    /// A domain (`thand`) task.
    Thand(ThandTask),
    /// A `do` task.
    Do(DoTask),
}

impl TaskDefinition {
    /// Gets the common base fields of the task.
    pub fn base(&self) -> &TaskBase {
        match self {
            Self::For(t) => &t.base,
            Self::Try(t) => &t.base,
            Self::Fork(t) => &t.base,
            Self::Raise(t) => &t.base,
            Self::Emit(t) => &t.base,
            Self::Listen(t) => &t.base,
            Self::Run(t) => &t.base,
            Self::Call(t) => &t.base,
            Self::Switch(t) => &t.base,
            Self::Set(t) => &t.base,
            Self::Wait(t) => &t.base,
            Self::Thand(t) => &t.base,
            Self::Do(t) => &t.base,
        }
    }

    /// Gets the name of the task's kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::For(_) => "for",
            Self::Try(_) => "try",
            Self::Fork(_) => "fork",
            Self::Raise(_) => "raise",
            Self::Emit(_) => "emit",
            Self::Listen(_) => "listen",
            Self::Run(_) => "run",
            Self::Call(_) => "call",
            Self::Switch(_) => "switch",
            Self::Set(_) => "set",
            Self::Wait(_) => "wait",
            Self::Thand(_) => "thand",
            Self::Do(_) => "do",
        }
    }
}

/// Represents a `set` task: evaluates the `set` template against the task
/// input and returns the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetTask {
    /// The common task fields.
    #[serde(flatten)]
    pub base: TaskBase,
    /// The template to evaluate.
    pub set: Value,
}

/// Represents a `switch` task: returns the flow target of the first matching
/// case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchTask {
    /// The common task fields.
    #[serde(flatten)]
    pub base: TaskBase,
    /// The cases, in document order.
    pub switch: Vec<Named<SwitchCase>>,
}

/// Represents a single case of a `switch` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    /// The predicate of the case.
    ///
    /// A case without a predicate is the default case.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// The flow target returned when the case matches.
    pub then: FlowTarget,
}

/// Represents a `for` task: iterates an expression-evaluated sequence over a
/// nested task list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForTask {
    /// The common task fields.
    #[serde(flatten)]
    pub base: TaskBase,
    /// The iteration clause.
    #[serde(rename = "for")]
    pub for_: ForClause,
    /// The nested task list run once per element.
    #[serde(rename = "do")]
    pub do_: TaskList,
}

/// Represents the iteration clause of a `for` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForClause {
    /// The name the current element is bound to.
    ///
    /// Defaults to `item`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub each: Option<String>,
    /// The expression producing the sequence to iterate.
    #[serde(rename = "in")]
    pub in_: String,
    /// The name the current index is bound to.
    ///
    /// Defaults to `index`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
}

/// Represents a `try` task: runs the `try` block and dispatches failures to
/// the `catch` clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TryTask {
    /// The common task fields.
    #[serde(flatten)]
    pub base: TaskBase,
    /// The task list to attempt.
    #[serde(rename = "try")]
    pub try_: TaskList,
    /// The catch clause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catch: Option<CatchClause>,
}

/// Represents the `catch` clause of a `try` task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatchClause {
    /// The error filter limiting which errors the clause catches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<ErrorFilter>,
    /// The context key the caught error is bound to.
    ///
    /// Defaults to `error`.
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub as_: Option<String>,
    /// An additional predicate the caught error must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// A predicate that, when satisfied, prevents the clause from catching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except_when: Option<String>,
    /// The retry policy applied to matched errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// The task list run when the error is caught and retries are exhausted
    /// or absent.
    #[serde(rename = "do", default, skip_serializing_if = "Option::is_none")]
    pub do_: Option<TaskList>,
}

/// Represents an error filter of a `catch` clause.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorFilter {
    /// The error properties to match.
    pub with: ErrorFilterWith,
}

/// Represents the matched properties of an error filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorFilterWith {
    /// The error type to match.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    /// The error status to match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// The error title to match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// The error detail to match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// The error instance to match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

/// Represents the retry policy of a `catch` clause.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// The base delay between attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<DurationSpec>,
    /// The backoff strategy applied to the delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<RetryBackoff>,
    /// The limits bounding the retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<RetryLimit>,
}

/// Represents a retry backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryBackoff {
    /// The delay is constant across attempts.
    Constant,
    /// The delay grows linearly with the attempt number.
    Linear,
    /// The delay doubles with each attempt.
    Exponential,
}

/// Represents the limits of a retry policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryLimit {
    /// The per-attempt limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<AttemptLimit>,
    /// The total duration across all attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<DurationSpec>,
}

/// Represents the per-attempt limits of a retry policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttemptLimit {
    /// The maximum number of attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    /// The maximum duration of a single attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<DurationSpec>,
}

/// Represents a `wait` task: sleeps for the given duration.
///
/// The value is either a duration (ISO-8601 string or structural form) or an
/// expression evaluating to one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitTask {
    /// The common task fields.
    #[serde(flatten)]
    pub base: TaskBase,
    /// The duration to wait, possibly an expression.
    pub wait: Value,
}

/// Represents a `fork` task: runs branches concurrently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkTask {
    /// The common task fields.
    #[serde(flatten)]
    pub base: TaskBase,
    /// The fork clause.
    pub fork: ForkClause,
}

/// Represents the branches of a `fork` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkClause {
    /// The branches to launch.
    pub branches: TaskList,
    /// Whether the first branch to complete wins.
    ///
    /// When `false`, all branch outputs are returned in branch order.
    #[serde(default)]
    pub compete: bool,
}

/// Represents a `do` task: runs a nested task list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoTask {
    /// The common task fields.
    #[serde(flatten)]
    pub base: TaskBase,
    /// The nested task list.
    #[serde(rename = "do")]
    pub do_: TaskList,
}

/// Represents a `raise` task: constructs a structured error and fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaiseTask {
    /// The common task fields.
    #[serde(flatten)]
    pub base: TaskBase,
    /// The raise clause.
    pub raise: RaiseClause,
}

/// Represents the error of a `raise` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaiseClause {
    /// The error definition to raise.
    pub error: RaisedErrorDefinition,
}

/// Represents the properties of a raised error.
///
/// Each property may be a literal or an expression.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RaisedErrorDefinition {
    /// The error type.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<Value>,
    /// The error status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
    /// The error title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<Value>,
    /// The error detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    /// The error instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<Value>,
}

/// Represents an `emit` task: builds a CloudEvent and delivers it on the
/// event signal channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitTask {
    /// The common task fields.
    #[serde(flatten)]
    pub base: TaskBase,
    /// The emit clause.
    pub emit: EmitClause,
}

/// Represents the event of an `emit` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitClause {
    /// The event specification.
    pub event: EventSpec,
}

/// Represents the properties of an event to emit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventSpec {
    /// The event properties; `source` and `type` are required at execution
    /// time.
    pub with: IndexMap<String, Value>,
}

/// Represents a `listen` task: waits for exactly one matching event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenTask {
    /// The common task fields.
    #[serde(flatten)]
    pub base: TaskBase,
    /// The listen clause.
    pub listen: ListenClause,
}

/// Represents the consumption strategy of a `listen` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenClause {
    /// The predicate selecting the event to consume.
    pub to: ListenTo,
}

/// Represents the predicate kinds of a `listen` task.
///
/// At most one kind may be set; the kinds are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ListenTo {
    /// Match a single event filter.
    One {
        /// The filter to match.
        one: EventFilter,
    },
    /// Match if any filter in the list matches.
    Any {
        /// The filters to match.
        any: Vec<EventFilter>,
    },
    /// Match across all filters in the list.
    All {
        /// The filters to match.
        all: Vec<EventFilter>,
    },
    /// Match a condition once the event type matches a reference filter.
    Until {
        /// The until clause.
        until: UntilFilter,
    },
}

/// Represents an event filter: a map of event properties to expected values.
///
/// Values may be literals or expressions evaluated against the candidate
/// event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    /// The properties to match.
    pub with: IndexMap<String, Value>,
}

/// Represents the `until` predicate of a `listen` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UntilFilter {
    /// The reference filter the event type must match.
    pub event: EventFilter,
    /// The condition applied after the reference filter matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// Represents a `run` task: an external process or a nested workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTask {
    /// The common task fields.
    #[serde(flatten)]
    pub base: TaskBase,
    /// The run clause.
    pub run: RunClause,
}

/// Represents the kinds of a `run` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunClause {
    /// Run a shell process on the host.
    Shell {
        /// The process to run.
        shell: ShellProcess,
    },
    /// Run a container.
    Container {
        /// The container to run.
        container: ContainerProcess,
    },
    /// Run a nested workflow.
    Workflow {
        /// The workflow to run.
        workflow: SubflowSpec,
    },
}

/// Represents a shell process of a `run` task.
///
/// The command is executed without a shell interpreter; arguments are passed
/// verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellProcess {
    /// The command to execute.
    pub command: String,
    /// The arguments passed to the command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
    /// The environment variables of the process.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub environment: IndexMap<String, String>,
}

/// Represents a container process of a `run` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerProcess {
    /// The image to run.
    pub image: String,
    /// The command overriding the image entrypoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    /// The environment variables of the container.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub environment: IndexMap<String, String>,
    /// The image pull policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_policy: Option<PullPolicy>,
}

/// Represents an image pull policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PullPolicy {
    /// Always pull the image.
    Always,
    /// Pull the image only if it is not present.
    IfNotPresent,
    /// Never pull the image.
    Never,
}

/// Represents a nested workflow of a `run` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubflowSpec {
    /// The namespace of the workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// The name of the workflow.
    pub name: String,
    /// The version of the workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// The input passed to the workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

/// Represents a `call` task: invokes a registered function with a `with`
/// payload.
///
/// The built-in families `http`, `grpc`, `openapi`, and `asyncapi` are
/// resolved by the same name lookup as user-registered functions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallTask {
    /// The common task fields.
    #[serde(flatten)]
    pub base: TaskBase,
    /// The name of the function to call.
    pub call: String,
    /// The payload passed to the function.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub with: IndexMap<String, Value>,
}

/// Represents a domain (`thand`) task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThandTask {
    /// The common task fields.
    #[serde(flatten)]
    pub base: TaskBase,
    /// The domain task payload.
    pub thand: DomainTask,
}

/// Represents the domain task family.
///
/// Each member is distinguished by its parameter field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DomainTask {
    /// Collect multi-party approvals.
    Approvals(ApprovalsSpec),
    /// Authorize the elevation against the providers.
    Authorize(AuthorizeSpec),
    /// Revoke a previously authorized elevation.
    Revoke(RevokeSpec),
    /// Fan out a notification.
    Notify(NotifySpec),
    /// Wait for a critical alert.
    Monitor(MonitorSpec),
    /// Collect a form submission.
    Form(FormSpec),
    /// Validate the elevation request.
    Validate(ValidateSpec),
}

impl DomainTask {
    /// Gets the name of the domain task's kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Approvals(_) => "approvals",
            Self::Authorize(_) => "authorize",
            Self::Revoke(_) => "revoke",
            Self::Notify(_) => "notify",
            Self::Monitor(_) => "monitor",
            Self::Form(_) => "form",
            Self::Validate(_) => "validate",
        }
    }
}

/// Represents the parameters of an approvals task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalsSpec {
    /// The number of approvals required.
    pub approvals: u32,
    /// Whether the elevation requester may approve their own request.
    #[serde(default)]
    pub self_approve: bool,
    /// The notifiers to fan out the approval request through.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub notifiers: IndexMap<String, NotifierRequest>,
    /// The outcome routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on: Option<ApprovalRouting>,
}

/// Represents the outcome routing of an approvals task.
///
/// Both targets must be declared; the task errors otherwise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRouting {
    /// The target once enough approvals are recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<FlowTarget>,
    /// The target once any denial is recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied: Option<FlowTarget>,
}

/// Represents an authorize task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizeSpec {
    /// The authorize parameters.
    pub authorize: AuthorizeParams,
}

/// Represents the parameters of an authorize task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthorizeParams {
    /// The notifiers informed once authorization succeeds.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub notifiers: IndexMap<String, NotifierRequest>,
    /// The scheduled revocation routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on: Option<RevocationRouting>,
}

/// Represents the revocation routing of an authorize task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RevocationRouting {
    /// The task key the scheduled revocation resumes at.
    ///
    /// Defaults to `revoke`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoke: Option<FlowTarget>,
}

/// Represents a revoke task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevokeSpec {
    /// The revoke parameters.
    pub revoke: RevokeParams,
}

/// Represents the parameters of a revoke task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RevokeParams {
    /// The notifiers informed once revocation completes.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub notifiers: IndexMap<String, NotifierRequest>,
}

/// Represents a notify task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifySpec {
    /// The notify parameters.
    pub notify: NotifyParams,
}

/// Represents the parameters of a notify task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotifyParams {
    /// The notifiers to fan the payload out through.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub notifiers: IndexMap<String, NotifierRequest>,
}

/// Represents a monitor task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSpec {
    /// The monitor parameters.
    pub monitor: MonitorParams,
}

/// Represents the parameters of a monitor task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorParams {
    /// The alert level that terminates the monitor.
    ///
    /// Defaults to `critical`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

/// Represents a form task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormSpec {
    /// The form parameters.
    pub form: FormParams,
}

/// Represents the parameters of a form task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormParams {
    /// The notifiers the form is sent through.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub notifiers: IndexMap<String, NotifierRequest>,
    /// The fields of the form.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FormField>,
}

/// Represents a single field of a form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    /// The name of the field.
    pub name: String,
    /// The label shown for the field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Whether the field is required.
    #[serde(default)]
    pub required: bool,
}

/// Represents a validate task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidateSpec {
    /// The validate parameters.
    pub validate: ValidateParams,
}

/// Represents the parameters of a validate task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidateParams {
    /// The optional narrative validation delegated to a language model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmValidation>,
}

/// Represents a narrative validation request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmValidation {
    /// The prompt framing the validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// Represents a single notification request: a provider and its recipients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotifierRequest {
    /// The name of the notification provider.
    pub provider: String,
    /// The recipients of the notification.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<String>,
    /// The message body, when the task supplies one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn task_kinds_deserialize() {
        let doc = r#"
- init:
    set:
      x: 20
- choose:
    switch:
      - red:
          when: '${ .color == "red" }'
          then: init
      - fallback:
          then: end
- each:
    for:
      each: color
      in: '${ .colors }'
    do:
      - collect:
          set:
            seen: '${ $context.seen }'
- pause:
    wait: PT5S
- guarded:
    try:
      - risky:
          raise:
            error:
              type: https://thand.io/errors/authorization
              status: 403
    catch:
      errors:
        with:
          status: 403
      retry:
        delay: PT1S
        backoff: exponential
        limit:
          attempt:
            count: 3
- branches:
    fork:
      branches:
        - a:
            set:
              n: 1
        - b:
            set:
              n: 2
      compete: false
- approvals:
    thand:
      approvals: 2
      selfApprove: false
      on:
        approved: authorize
        denied: denied
- authorize:
    thand:
      authorize:
        on:
          revoke: revoke
- revoke:
    thand:
      revoke: {}
- fetch:
    call: http
    with:
      method: get
      endpoint: https://example.com/{id}
"#;

        let tasks: crate::TaskList =
            serde_yaml_ng::from_str(doc).expect("task list should deserialize");
        let kinds: Vec<_> = tasks.iter().map(|t| t.item.kind()).collect();
        assert_eq!(
            kinds,
            [
                "set", "switch", "for", "wait", "try", "fork", "thand", "thand", "thand", "call"
            ]
        );

        match &tasks.get(6).expect("has task").item {
            TaskDefinition::Thand(t) => match &t.thand {
                DomainTask::Approvals(spec) => {
                    assert_eq!(spec.approvals, 2);
                    assert!(!spec.self_approve);
                    let on = spec.on.as_ref().expect("has routing");
                    assert_eq!(
                        on.approved,
                        Some(FlowTarget::Task("authorize".to_string()))
                    );
                    assert_eq!(on.denied, Some(FlowTarget::Task("denied".to_string())));
                }
                other => panic!("expected approvals, found {kind}", kind = other.kind()),
            },
            other => panic!("expected thand task, found {kind}", kind = other.kind()),
        }
    }

    #[test]
    fn for_parses_before_do() {
        // A task with both `for` and `do` must parse as a `for` task, not a
        // `do` task.
        let task: TaskDefinition = serde_yaml_ng::from_str(
            r#"
for:
  in: '${ .items }'
do:
  - step:
      set:
        x: 1
"#,
        )
        .expect("task should deserialize");
        assert_eq!(task.kind(), "for");
    }

    #[test]
    fn run_clause_kinds() {
        let shell: TaskDefinition = serde_yaml_ng::from_str(
            r#"
run:
  shell:
    command: echo
    arguments: ["hello"]
"#,
        )
        .expect("shell run should deserialize");
        assert_eq!(shell.kind(), "run");

        let container: TaskDefinition = serde_yaml_ng::from_str(
            r#"
run:
  container:
    image: alpine:3
    command: ["true"]
    pullPolicy: ifNotPresent
"#,
        )
        .expect("container run should deserialize");
        match container {
            TaskDefinition::Run(run) => match run.run {
                RunClause::Container { container } => {
                    assert_eq!(container.pull_policy, Some(PullPolicy::IfNotPresent));
                }
                _ => panic!("expected container run"),
            },
            _ => panic!("expected run task"),
        }
    }

    #[test]
    fn listen_predicates() {
        let listen: ListenClause = serde_yaml_ng::from_str(
            r#"
to:
  any:
    - with:
        type: com.thand.approval
    - with:
        type: com.thand.alert
"#,
        )
        .expect("listen clause should deserialize");
        match listen.to {
            ListenTo::Any { any } => assert_eq!(any.len(), 2),
            _ => panic!("expected any predicate"),
        }
    }
}
