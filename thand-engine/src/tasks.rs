//! Implementation of the domain task family: approvals, authorization,
//! revocation, notification, monitoring, forms, and validation.
//!
//! These tasks share a common shape: parse their parameters, optionally fan
//! out notifications, optionally listen for a triggering event, evaluate a
//! switch over the resulting state, and return a flow directive.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use thand_model::CloudEvent;
use thand_model::DomainTask;
use thand_model::TaskDefinition;

use crate::SignalPayload;
use crate::TaskContext;
use crate::TaskPath;
use crate::WorkflowContext;
use crate::WorkflowError;
use crate::WorkflowResult;
use crate::WorkflowSnapshot;
use crate::error::unsupported_task_type;
use crate::eval::TaskOutcome;
use crate::eval::listen::event_from_value;
use crate::provider::AuthorizeRoleResponse;
use crate::provider::ProviderRegistry;
use crate::registry::TaskHandler;

mod approval;
mod authorize;
mod form;
mod monitor;
mod notify;
mod revoke;
mod validate;

pub use approval::APPROVALS_CONTEXT_KEY;
pub use approval::ApprovalRecord;
pub use revoke::AUTHORIZATIONS_CONTEXT_KEY;

/// Dispatches `thand` tasks to the domain handlers.
#[derive(Debug, Default)]
pub struct DomainTaskHandler;

impl DomainTaskHandler {
    /// Constructs a new handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TaskHandler for DomainTaskHandler {
    async fn execute(
        &self,
        task: &mut TaskContext<'_>,
        definition: &TaskDefinition,
        input: Value,
    ) -> WorkflowResult<TaskOutcome> {
        let TaskDefinition::Thand(thand) = definition else {
            return Err(unsupported_task_type(definition.kind(), task.reference));
        };

        match &thand.thand {
            DomainTask::Approvals(spec) => approval::execute(task, spec, input).await,
            DomainTask::Authorize(spec) => authorize::execute(task, &spec.authorize, input).await,
            DomainTask::Revoke(spec) => revoke::execute(task, &spec.revoke, input).await,
            DomainTask::Notify(spec) => notify::execute(task, &spec.notify, input).await,
            DomainTask::Monitor(spec) => monitor::execute(task, &spec.monitor, input).await,
            DomainTask::Form(spec) => form::execute(task, &spec.form, input).await,
            DomainTask::Validate(spec) => validate::execute(task, &spec.validate, input).await,
        }
    }
}

/// Receives the next CloudEvent delivered to the workflow that satisfies the
/// given predicate.
///
/// Resume signals carrying an event payload count; non-matching events
/// re-arm the wait; a termination signal surfaces as control flow. Under the
/// in-process backend this parks the instance via the await-signal sentinel.
pub(crate) async fn next_event_matching<F>(
    workflow: &WorkflowContext,
    reference: &TaskPath,
    matches: F,
) -> WorkflowResult<CloudEvent>
where
    F: Fn(&CloudEvent) -> bool + Send,
{
    let backend = Arc::clone(workflow.backend());
    loop {
        let event = match backend.next_signal().await? {
            SignalPayload::Event(event) => event,
            SignalPayload::Resume(resume) => match event_from_value(&resume.input, reference)? {
                Some(event) => event,
                None => continue,
            },
            SignalPayload::Terminate(request) => {
                return Err(WorkflowError::Terminated { request });
            }
        };

        if matches(&event) {
            return Ok(event);
        }

        tracing::debug!(
            "ignoring event of type `{ty}` at `{reference}`",
            ty = event.ty
        );
    }
}

/// Performs terminal-state cleanup over a workflow snapshot: when the
/// instance is approved and holds recorded authorizations, every one of them
/// is revoked.
///
/// This is the body of the reserved `Cleanup` activity and of the runner's
/// deferred cleanup; it takes a snapshot rather than a live context so both
/// paths share it.
pub(crate) async fn cleanup_snapshot(
    providers: &ProviderRegistry,
    snapshot: &WorkflowSnapshot,
) -> anyhow::Result<()> {
    if snapshot.approved != Some(true) {
        return Ok(());
    }

    let authorizations: IndexMap<String, AuthorizeRoleResponse> = snapshot
        .context
        .get(AUTHORIZATIONS_CONTEXT_KEY)
        .map(|value| serde_json::from_value(value.clone()))
        .transpose()
        .map_err(|e| anyhow::anyhow!("invalid recorded authorizations: {e}"))?
        .unwrap_or_default();

    if authorizations.is_empty() {
        return Ok(());
    }

    let (revoked, failures) = revoke::revoke_all(providers, &authorizations).await;

    tracing::info!(
        "cleanup revoked {count} of {total} authorizations for workflow `{id}`",
        count = revoked.len(),
        total = authorizations.len(),
        id = snapshot.id
    );

    if !failures.is_empty() {
        anyhow::bail!(
            "cleanup failed to revoke {count} authorizations: {causes}",
            count = failures.len(),
            causes = failures.join("; ")
        );
    }

    Ok(())
}
