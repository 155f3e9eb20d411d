//! Implementation of the approvals task.

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thand_model::APPROVAL_EVENT_TYPE;
use thand_model::ApprovalsSpec;
use thand_model::CloudEvent;
use thand_model::ElevationRequest;
use thand_model::FlowTarget;
use tracing::info;
use tracing::warn;

use super::next_event_matching;
use super::notify;
use crate::TaskContext;
use crate::TaskPath;
use crate::WorkflowResult;
use crate::error::validation;
use crate::eval::TaskOutcome;
use crate::eval::listen::event_from_value;

/// The instance context key the approval ledger is stored under.
pub const APPROVALS_CONTEXT_KEY: &str = "approvals";

/// Represents a recorded approval vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    /// The recorded decision.
    pub approved: bool,
    /// The RFC 3339 time the decision was recorded.
    pub timestamp: String,
}

/// Reads the approval ledger from the instance context.
fn read_ledger(task: &TaskContext<'_>) -> WorkflowResult<IndexMap<String, ApprovalRecord>> {
    match task.workflow.context_key(APPROVALS_CONTEXT_KEY) {
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| validation(format!("invalid approval ledger: {e}"), task.reference)),
        None => Ok(IndexMap::new()),
    }
}

/// Writes the approval ledger back into the instance context.
fn write_ledger(
    task: &mut TaskContext<'_>,
    ledger: &IndexMap<String, ApprovalRecord>,
) -> WorkflowResult<()> {
    let value = serde_json::to_value(ledger)
        .map_err(|e| validation(format!("invalid approval ledger: {e}"), task.reference))?;
    task.workflow.set_context_key(APPROVALS_CONTEXT_KEY, value);
    Ok(())
}

/// Records one approval event into the ledger.
///
/// A self-approval (the approver is the elevation requester or one of the
/// elevated identities) is ignored unless the task allows it; a denial marks
/// the instance as not approved, stickily.
fn record(
    task: &mut TaskContext<'_>,
    spec: &ApprovalsSpec,
    elevation: &ElevationRequest,
    event: &CloudEvent,
) -> WorkflowResult<()> {
    let Some(user) = event.user().map(str::to_string) else {
        warn!("ignoring approval event without a `user` extension");
        return Ok(());
    };

    let approved = match event.data.as_ref().and_then(|d| d.get("approved")) {
        Some(Value::Bool(approved)) => *approved,
        _ => {
            warn!("ignoring approval event from `{user}` without an `approved` decision");
            return Ok(());
        }
    };

    if !spec.self_approve && elevation.involves(&user) {
        info!("ignoring self-approval from `{user}`");
        return Ok(());
    }

    // At most one entry per identity: the latest vote wins.
    let mut ledger = read_ledger(task)?;
    ledger.insert(
        user.clone(),
        ApprovalRecord {
            approved,
            timestamp: task.workflow.backend().now().to_rfc3339(),
        },
    );
    write_ledger(task, &ledger)?;

    if approved {
        info!("recorded approval from `{user}`");
    } else {
        info!("recorded denial from `{user}`");
        task.workflow.set_approved(false);
    }

    Ok(())
}

/// Resolves the routing targets, requiring both outcomes to be declared.
fn routing<'a>(
    spec: &'a ApprovalsSpec,
    reference: &TaskPath,
) -> WorkflowResult<(&'a FlowTarget, &'a FlowTarget)> {
    let on = spec.on.as_ref().ok_or_else(|| {
        validation("the approvals task requires `on.approved` and `on.denied`", reference)
    })?;

    let approved = on.approved.as_ref().ok_or_else(|| {
        validation("the approvals task requires `on.approved`", reference)
    })?;
    let denied = on.denied.as_ref().ok_or_else(|| {
        validation("the approvals task requires `on.denied`", reference)
    })?;

    Ok((approved, denied))
}

/// Executes an approvals task.
///
/// On first entry (empty input) the approval request is fanned out to every
/// recipient across the configured notifiers; the task then waits for
/// approval events, recording each vote, until either a denial is recorded
/// (jump to `on.denied`) or enough approvals accumulate (jump to
/// `on.approved`). In-process instances park between events and are resumed
/// at this task with the next event as input.
pub(crate) async fn execute(
    task: &mut TaskContext<'_>,
    spec: &ApprovalsSpec,
    input: Value,
) -> WorkflowResult<TaskOutcome> {
    if spec.approvals < 1 {
        return Err(validation(
            "the approvals task requires at least one approval",
            task.reference,
        ));
    }

    let (approved_target, denied_target) = {
        let (a, d) = routing(spec, task.reference)?;
        (a.clone(), d.clone())
    };

    let elevation = task.workflow.elevation_request(task.reference)?;

    let mut pending = event_from_value(&input, task.reference)?;

    if pending.is_none() {
        let delivered = notify::fan_out(
            task.engine,
            &spec.notifiers,
            "approval requested",
            &serde_json::to_value(&elevation).unwrap_or(Value::Null),
        )
        .await;
        info!(
            "requested approval from {delivered} recipients for `{user}` into `{role}`",
            user = elevation.user,
            role = elevation.role
        );
    }

    loop {
        if let Some(event) = pending.take() {
            record(task, spec, &elevation, &event)?;
        }

        let ledger = read_ledger(task)?;

        if ledger.values().any(|record| !record.approved) {
            task.workflow.set_approved(false);
            info!("approval denied; routing to `{denied_target}`");
            return Ok(TaskOutcome::Directive(denied_target));
        }

        let count = ledger.values().filter(|record| record.approved).count();
        if count >= spec.approvals as usize {
            info!(
                "collected {count} of {required} approvals; routing to `{approved_target}`",
                required = spec.approvals
            );
            return Ok(TaskOutcome::Directive(approved_target));
        }

        // Not decided yet: wait for the next approval event. In-process this
        // parks the instance; the resumed run re-enters this task.
        let event = next_event_matching(task.workflow, task.reference, |event| {
            event.ty == APPROVAL_EVENT_TYPE
        })
        .await?;
        pending = Some(event);
    }
}
