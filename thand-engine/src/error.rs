//! Implementation of workflow errors.
//!
//! Errors follow the problem-details shape the workflow dialect uses for
//! `raise` and `try.catch` filtering: every error maps to a descriptor with
//! a type URI, a status, and an instance (the task reference path).

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use thand_model::ErrorFilterWith;

/// The error type URI raised for schema and structural failures.
pub const VALIDATION_ERROR_TYPE: &str = "https://thand.io/errors/validation";

/// The error type URI raised for expression evaluation failures.
pub const EXPRESSION_ERROR_TYPE: &str = "https://thand.io/errors/expression";

/// The error type URI raised for authentication failures.
pub const AUTHENTICATION_ERROR_TYPE: &str = "https://thand.io/errors/authentication";

/// The error type URI raised for authorization failures.
pub const AUTHORIZATION_ERROR_TYPE: &str = "https://thand.io/errors/authorization";

/// The error type URI raised for HTTP communication failures.
pub const COMMUNICATION_ERROR_TYPE: &str = "https://thand.io/errors/communication";

/// The error type URI raised for generic runtime failures.
pub const RUNTIME_ERROR_TYPE: &str = "https://thand.io/errors/runtime";

/// A specialized `Result` for workflow evaluation.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Represents a slash-delimited reference to a node within a workflow
/// document, e.g. `/do/2/approvals`.
///
/// Every error is tagged with the reference of the task it arose in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskPath(String);

impl TaskPath {
    /// Creates the reference of the document's root task list.
    pub fn root() -> Self {
        Self("/do".to_string())
    }

    /// Creates a reference from its string form.
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Appends a segment to the reference.
    pub fn push(&self, segment: impl fmt::Display) -> Self {
        Self(format!("{base}/{segment}", base = self.0))
    }

    /// Returns `true` if the reference is the root task list.
    pub fn is_root(&self) -> bool {
        self.0 == "/do"
    }

    /// Gets the string form of the reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Represents the problem-details descriptor of a workflow error.
///
/// This is the shape `raise` constructs and `try.catch.errors.with` matches
/// against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    /// The type URI of the error.
    #[serde(rename = "type")]
    pub type_: String,
    /// The status code of the error.
    pub status: u16,
    /// The title of the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// The detail of the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// The instance the error arose in: the task reference path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl ErrorDescriptor {
    /// Returns `true` if the descriptor matches the given catch filter.
    pub fn matches(&self, filter: &ErrorFilterWith) -> bool {
        if let Some(type_) = &filter.type_ {
            if &self.type_ != type_ {
                return false;
            }
        }
        if let Some(status) = filter.status {
            if self.status != status {
                return false;
            }
        }
        if let Some(title) = &filter.title {
            if self.title.as_deref() != Some(title.as_str()) {
                return false;
            }
        }
        if let Some(detail) = &filter.detail {
            if self.detail.as_deref() != Some(detail.as_str()) {
                return false;
            }
        }
        if let Some(instance) = &filter.instance {
            if self.instance.as_deref() != Some(instance.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Represents an error arising during workflow evaluation.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// A schema or structural failure in input, output, export, or in a
    /// workflow document reference.
    #[error("{message} (at `{reference}`)")]
    Validation {
        /// The failure message.
        message: String,
        /// The reference of the task the failure arose in.
        reference: TaskPath,
    },
    /// The expression evaluator returned an error or produced the wrong
    /// type.
    #[error("{message} (at `{reference}`)")]
    Expression {
        /// The failure message.
        message: String,
        /// The reference of the task the failure arose in.
        reference: TaskPath,
    },
    /// A structured error raised by a `raise` task or a provider client.
    #[error("{}", raised_display(.error))]
    Raised {
        /// The raised error descriptor.
        error: ErrorDescriptor,
    },
    /// A generic runtime failure.
    #[error("{message} (at `{reference}`)")]
    Runtime {
        /// The failure message.
        message: String,
        /// The reference of the task the failure arose in.
        reference: TaskPath,
    },
    /// All provider authorization calls failed.
    #[error("authorization failed for every identity (at `{reference}`): {}", .causes.join("; "))]
    AuthorizationFailed {
        /// The per-identity causes.
        causes: Vec<String>,
        /// The reference of the task the failure arose in.
        reference: TaskPath,
    },
    /// All provider revocation calls failed.
    #[error("revocation failed for every identity (at `{reference}`): {}", .causes.join("; "))]
    RevocationFailed {
        /// The per-identity causes.
        causes: Vec<String>,
        /// The reference of the task the failure arose in.
        reference: TaskPath,
    },
    /// The sentinel a task emits when it needs an external input.
    ///
    /// This is not a failure: the runner translates it into the `Waiting`
    /// status and returns without error.
    #[error("task is awaiting an external signal")]
    AwaitSignal,
    /// The workflow was cancelled.
    #[error("workflow was cancelled")]
    Cancelled,
    /// The workflow received a termination request.
    ///
    /// The runner consumes this to resume at the request's entry point (the
    /// scheduled revocation path) or to cancel the instance.
    #[error("workflow received a termination request")]
    Terminated {
        /// The termination request.
        request: crate::TerminationRequest,
    },
    /// The backend suggested restarting the workflow under the same
    /// identifier.
    #[error("workflow should continue as new")]
    ContinueAsNew {
        /// The root task key the restarted run begins at.
        next: Option<String>,
    },
    /// A workflow error wrapped with its instance.
    #[error("workflow `{workflow}` faulted: {source}")]
    Instance {
        /// The name of the workflow.
        workflow: String,
        /// The underlying error.
        #[source]
        source: Box<WorkflowError>,
    },
}

/// Formats a raised error descriptor for display.
fn raised_display(error: &ErrorDescriptor) -> String {
    let mut s = format!("{type_} ({status})", type_ = error.type_, status = error.status);
    if let Some(title) = &error.title {
        s.push_str(": ");
        s.push_str(title);
    }
    if let Some(detail) = &error.detail {
        s.push_str(": ");
        s.push_str(detail);
    }
    if let Some(instance) = &error.instance {
        s.push_str(&format!(" (at `{instance}`)"));
    }
    s
}

impl WorkflowError {
    /// Returns `true` if the error is the await-signal sentinel.
    pub fn is_await_signal(&self) -> bool {
        matches!(self, Self::AwaitSignal)
    }

    /// Returns `true` if the error must not be caught by a `try` task.
    ///
    /// The await-signal sentinel, cancellation, termination, and
    /// continue-as-new are control flow, not failures.
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            Self::AwaitSignal | Self::Cancelled | Self::Terminated { .. } | Self::ContinueAsNew { .. }
        )
    }

    /// Gets the problem-details descriptor of the error.
    pub fn descriptor(&self) -> ErrorDescriptor {
        match self {
            Self::Validation { message, reference } => ErrorDescriptor {
                type_: VALIDATION_ERROR_TYPE.to_string(),
                status: 400,
                title: Some("validation failed".to_string()),
                detail: Some(message.clone()),
                instance: Some(reference.to_string()),
            },
            Self::Expression { message, reference } => ErrorDescriptor {
                type_: EXPRESSION_ERROR_TYPE.to_string(),
                status: 400,
                title: Some("expression evaluation failed".to_string()),
                detail: Some(message.clone()),
                instance: Some(reference.to_string()),
            },
            Self::Raised { error } => error.clone(),
            Self::Runtime { message, reference } => ErrorDescriptor {
                type_: RUNTIME_ERROR_TYPE.to_string(),
                status: 500,
                title: Some("runtime failure".to_string()),
                detail: Some(message.clone()),
                instance: Some(reference.to_string()),
            },
            Self::AuthorizationFailed { causes, reference } => ErrorDescriptor {
                type_: AUTHORIZATION_ERROR_TYPE.to_string(),
                status: 403,
                title: Some("authorization failed".to_string()),
                detail: Some(causes.join("; ")),
                instance: Some(reference.to_string()),
            },
            Self::RevocationFailed { causes, reference } => ErrorDescriptor {
                type_: AUTHORIZATION_ERROR_TYPE.to_string(),
                status: 403,
                title: Some("revocation failed".to_string()),
                detail: Some(causes.join("; ")),
                instance: Some(reference.to_string()),
            },
            Self::AwaitSignal
            | Self::Cancelled
            | Self::Terminated { .. }
            | Self::ContinueAsNew { .. } => ErrorDescriptor {
                type_: RUNTIME_ERROR_TYPE.to_string(),
                status: 500,
                title: Some("control flow".to_string()),
                detail: Some(self.to_string()),
                instance: None,
            },
            Self::Instance { source, .. } => source.descriptor(),
        }
    }

    /// Wraps the error with the name of the faulted workflow.
    pub fn into_instance(self, workflow: &str) -> Self {
        match self {
            Self::Instance { .. } => self,
            other => Self::Instance {
                workflow: workflow.to_string(),
                source: Box::new(other),
            },
        }
    }
}

/// Creates a "validation failed" error.
pub fn validation(message: impl fmt::Display, reference: &TaskPath) -> WorkflowError {
    WorkflowError::Validation {
        message: message.to_string(),
        reference: reference.clone(),
    }
}

/// Creates an "expression evaluation failed" error.
pub fn expression(message: impl fmt::Display, reference: &TaskPath) -> WorkflowError {
    WorkflowError::Expression {
        message: message.to_string(),
        reference: reference.clone(),
    }
}

/// Creates a generic runtime error.
pub fn runtime(message: impl fmt::Display, reference: &TaskPath) -> WorkflowError {
    WorkflowError::Runtime {
        message: message.to_string(),
        reference: reference.clone(),
    }
}

/// Creates an "unsupported task type" error.
pub fn unsupported_task_type(kind: &str, reference: &TaskPath) -> WorkflowError {
    validation(format!("unsupported task type `{kind}`"), reference)
}

/// Creates a "no matching switch case" error.
pub fn no_matching_switch_case(reference: &TaskPath) -> WorkflowError {
    runtime("no matching switch case", reference)
}

/// Creates a "flow directive target not found" error.
pub fn flow_directive_target_not_found(target: &str, reference: &TaskPath) -> WorkflowError {
    validation(
        format!("flow directive target `{target}` not found in the current task list"),
        reference,
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn descriptor_matching() {
        let error = validation("bad input", &TaskPath::root().push(0).push("init"));
        let descriptor = error.descriptor();
        assert_eq!(descriptor.status, 400);
        assert_eq!(descriptor.instance.as_deref(), Some("/do/0/init"));

        let filter = ErrorFilterWith {
            type_: Some(VALIDATION_ERROR_TYPE.to_string()),
            status: Some(400),
            ..Default::default()
        };
        assert!(descriptor.matches(&filter));

        let filter = ErrorFilterWith {
            status: Some(403),
            ..Default::default()
        };
        assert!(!descriptor.matches(&filter));
    }

    #[test]
    fn await_signal_is_control_flow() {
        assert!(WorkflowError::AwaitSignal.is_control_flow());
        assert!(WorkflowError::Cancelled.is_control_flow());
        assert!(!validation("x", &TaskPath::root()).is_control_flow());
    }

    #[test]
    fn instance_wrapping_is_idempotent() {
        let wrapped = validation("x", &TaskPath::root()).into_instance("elevate");
        let rewrapped = wrapped.into_instance("other");
        match rewrapped {
            WorkflowError::Instance { workflow, .. } => assert_eq!(workflow, "elevate"),
            other => panic!("expected instance error, found {other}"),
        }
    }
}
