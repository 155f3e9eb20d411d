//! Implementation of the monitor task.

use serde_json::Value;
use thand_model::ALERT_EVENT_TYPE;
use thand_model::CloudEvent;
use thand_model::MonitorParams;
use tracing::debug;

use super::next_event_matching;
use crate::TaskContext;
use crate::WorkflowError;
use crate::WorkflowResult;
use crate::error::runtime;
use crate::eval::TaskOutcome;
use crate::eval::listen::event_from_value;

/// The alert level that terminates a monitor by default.
const DEFAULT_LEVEL: &str = "critical";

/// Returns `true` if the alert event carries the monitored level.
fn is_monitored(event: &CloudEvent, level: &str) -> bool {
    event.ty == ALERT_EVENT_TYPE
        && event
            .data
            .as_ref()
            .and_then(|data| data.get("level"))
            .and_then(Value::as_str)
            .map(|l| l == level)
            .unwrap_or(false)
}

/// Executes a monitor task: listens for a single alert event and returns it
/// once its level matches; other alerts re-arm the listen.
pub(crate) async fn execute(
    task: &mut TaskContext<'_>,
    params: &MonitorParams,
    input: Value,
) -> WorkflowResult<TaskOutcome> {
    let level = params.level.as_deref().unwrap_or(DEFAULT_LEVEL);

    if let Some(event) = event_from_value(&input, task.reference)? {
        if is_monitored(&event, level) {
            let value = serde_json::to_value(&event).map_err(|e| {
                runtime(format!("failed to serialize event: {e}"), task.reference)
            })?;
            return Ok(TaskOutcome::Output(value));
        }
        debug!(
            "alert of level below `{level}` ignored at `{reference}`",
            reference = task.reference
        );
        // Delivered alert did not reach the monitored level: in-process this
        // parks again, durable falls through to the listen below.
        if !matches!(
            task.workflow.backend().kind(),
            crate::BackendKind::Durable
        ) {
            return Err(WorkflowError::AwaitSignal);
        }
    }

    let event =
        next_event_matching(task.workflow, task.reference, |event| is_monitored(event, level))
            .await?;

    let value = serde_json::to_value(&event)
        .map_err(|e| runtime(format!("failed to serialize event: {e}"), task.reference))?;
    Ok(TaskOutcome::Output(value))
}
