//! Implementation of the authorize task.

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use serde_json::json;
use thand_model::AuthorizeParams;
use thand_model::FlowTarget;
use tokio::task::JoinSet;
use tracing::info;
use tracing::warn;

use super::notify;
use super::revoke::AUTHORIZATIONS_CONTEXT_KEY;
use crate::BackendKind;
use crate::ScheduledCallback;
use crate::SignalPayload;
use crate::TaskContext;
use crate::TerminationRequest;
use crate::WorkflowError;
use crate::WorkflowResult;
use crate::WorkflowStatus;
use crate::error::runtime;
use crate::error::validation;
use crate::eval::TaskOutcome;
use crate::provider::AuthorizeRoleRequest;
use crate::provider::AuthorizeRoleResponse;

/// The default root task key scheduled revocation resumes at.
const DEFAULT_REVOKE_TASK: &str = "revoke";

/// Executes an authorize task.
///
/// For each `(provider, identity)` pair of the elevation request, the role
/// is validated and granted, in parallel. Partial failures are logged and
/// execution continues with the successful subset; total failure surfaces a
/// composite error. The per-identity responses are recorded in the instance
/// context, revocation is scheduled for `now + duration`, and the instance
/// parks until the scheduled termination resumes it at the revoke task.
pub(crate) async fn execute(
    task: &mut TaskContext<'_>,
    params: &AuthorizeParams,
    input: Value,
) -> WorkflowResult<TaskOutcome> {
    let _ = input;
    let now = task.workflow.backend().now();

    let elevation = task.workflow.elevation_request(task.reference)?;
    let duration = elevation
        .duration()
        .map_err(|e| validation(e.to_string(), task.reference))?;
    let revocation_at = now
        + chrono::Duration::from_std(duration)
            .map_err(|e| validation(format!("elevation duration out of range: {e}"), task.reference))?;

    // Idempotent short-circuit: an already approved instance (a re-entered
    // run) does not re-authorize.
    if task.workflow.is_approved() {
        return Ok(TaskOutcome::Output(json!({
            "authorized_at": now.to_rfc3339(),
            "revocation_at": revocation_at.to_rfc3339(),
        })));
    }

    if elevation.providers.is_empty() || elevation.identities.is_empty() {
        return Err(validation(
            "the elevation request names no providers or identities",
            task.reference,
        ));
    }

    let mut set = JoinSet::new();
    for provider_name in &elevation.providers {
        let Some(provider) = task.engine.providers().provider(provider_name) else {
            return Err(validation(
                format!("unknown provider `{provider_name}`"),
                task.reference,
            ));
        };

        for identity in &elevation.identities {
            let provider = Arc::clone(provider);
            let request = AuthorizeRoleRequest {
                provider: provider_name.clone(),
                identity: identity.clone(),
                role: elevation.role.clone(),
                duration: Some(elevation.duration.clone()),
                reason: Some(elevation.reason.clone()),
            };
            let key = format!("{provider_name}/{identity}");

            set.spawn(async move {
                let result = async {
                    provider.validate_role(&request.role).await?;
                    provider.authorize_role(request.clone()).await
                }
                .await;
                (key, result)
            });
        }
    }

    let mut authorizations: IndexMap<String, AuthorizeRoleResponse> = IndexMap::new();
    let mut failures = Vec::new();

    while let Some(joined) = set.join_next().await {
        let (key, result) = joined
            .map_err(|e| runtime(format!("authorization task panicked: {e}"), task.reference))?;

        match result {
            Ok(response) => {
                authorizations.insert(key, response);
            }
            Err(e) => failures.push(format!("{key}: {e:#}")),
        }
    }

    if authorizations.is_empty() {
        return Err(WorkflowError::AuthorizationFailed {
            causes: failures,
            reference: task.reference.clone(),
        });
    }

    for failure in &failures {
        warn!("authorization partially failed: {failure}");
    }

    // Keep the map in provider-then-identity order for the revoke path.
    authorizations.sort_unstable_keys();

    let value = serde_json::to_value(&authorizations)
        .map_err(|e| runtime(format!("failed to serialize authorizations: {e}"), task.reference))?;
    task.workflow.set_context_key(AUTHORIZATIONS_CONTEXT_KEY, value);
    task.workflow.set_approved(true);

    info!(
        "authorized `{user}` into `{role}` across {count} grants until {revocation_at}",
        user = elevation.user,
        role = elevation.role,
        count = authorizations.len()
    );

    let revoke_target = params
        .on
        .as_ref()
        .and_then(|on| on.revoke.as_ref())
        .map(|target| target.as_str().to_string())
        .unwrap_or_else(|| DEFAULT_REVOKE_TASK.to_string());

    schedule_revocation(task, revocation_at, &revoke_target).await?;

    let delivered = notify::fan_out(
        task.engine,
        &params.notifiers,
        "access granted",
        &json!({
            "user": elevation.user,
            "role": elevation.role,
            "revocation_at": revocation_at.to_rfc3339(),
        }),
    )
    .await;
    tracing::debug!("notified {delivered} recipients of the authorization");

    let output = json!({
        "authorized_at": now.to_rfc3339(),
        "revocation_at": revocation_at.to_rfc3339(),
    });
    task.workflow.set_task_raw_output(output.clone());

    // The instance now waits out the elevation. Under the durable backend
    // the wait happens here, on the signal channel; in-process the instance
    // parks and the scheduler's callback resumes it at the revoke task.
    match task.workflow.backend().kind() {
        BackendKind::Durable => {
            task.workflow.set_status(WorkflowStatus::Waiting);
            let request = wait_for_termination(task).await?;
            task.workflow.set_status(WorkflowStatus::Running);

            let target = request
                .entry_point
                .unwrap_or_else(|| revoke_target.clone());
            info!("scheduled termination arrived; resuming at `{target}`");
            Ok(TaskOutcome::Directive(FlowTarget::Task(target)))
        }
        BackendKind::InProcess => Err(WorkflowError::AwaitSignal),
    }
}

/// Schedules the revocation of the elevation.
///
/// The durable backend's termination signal is preferred; in-process
/// instances fall back to the scheduler bridge. Having neither is an error.
async fn schedule_revocation(
    task: &mut TaskContext<'_>,
    revocation_at: chrono::DateTime<chrono::Utc>,
    revoke_target: &str,
) -> WorkflowResult<()> {
    let backend = Arc::clone(task.workflow.backend());

    if backend.kind() == BackendKind::Durable {
        let id = task.workflow.id().clone();
        return backend
            .signal_external(
                &id,
                SignalPayload::Terminate(TerminationRequest {
                    scheduled_at: Some(revocation_at),
                    entry_point: Some(revoke_target.to_string()),
                    reason: Some("scheduled revocation".to_string()),
                }),
            )
            .await;
    }

    if let Some(scheduler) = task.engine.scheduler() {
        let snapshot = task.workflow.snapshot();
        return scheduler
            .schedule(
                revocation_at,
                ScheduledCallback {
                    workflow_id: task.workflow.id().clone(),
                    entry_point: Some(revoke_target.to_string()),
                    snapshot,
                },
            )
            .await
            .map_err(|e| runtime(format!("failed to schedule revocation: {e:#}"), task.reference));
    }

    Err(runtime(
        "no scheduler available to schedule revocation",
        task.reference,
    ))
}

/// Waits for the scheduled termination signal, ignoring other traffic.
async fn wait_for_termination(task: &TaskContext<'_>) -> WorkflowResult<TerminationRequest> {
    let backend = Arc::clone(task.workflow.backend());
    loop {
        match backend.next_signal().await? {
            SignalPayload::Terminate(request) => return Ok(request),
            SignalPayload::Resume(resume) => {
                // An explicit resume with an entry point also releases the
                // wait (an operator-driven early revocation).
                if let Some(entry_point) = resume.entry_point {
                    return Ok(TerminationRequest {
                        scheduled_at: None,
                        entry_point: Some(entry_point),
                        reason: Some("resumed".to_string()),
                    });
                }
            }
            SignalPayload::Event(event) => {
                tracing::debug!(
                    "ignoring event of type `{ty}` while awaiting revocation",
                    ty = event.ty
                );
            }
        }
    }
}
