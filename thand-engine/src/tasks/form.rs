//! Implementation of the form task.

use serde_json::Value;
use serde_json::json;
use thand_model::FORM_EVENT_TYPE;
use thand_model::CloudEvent;
use thand_model::FormParams;
use tracing::info;

use super::next_event_matching;
use super::notify;
use crate::TaskContext;
use crate::WorkflowResult;
use crate::eval::TaskOutcome;
use crate::eval::listen::event_from_value;

/// The instance context key the submission is stored under.
pub(crate) const FORM_SUBMISSION_CONTEXT_KEY: &str = "form_submission";

/// Builds the stored submission from a form event.
fn submission(task: &TaskContext<'_>, event: &CloudEvent) -> Value {
    let data = event.data.clone().unwrap_or(Value::Null);
    json!({
        "values": data.get("values").cloned().unwrap_or(Value::Null),
        "submitted_by": event.user(),
        "submitted_at": data
            .get("submitted_at")
            .cloned()
            .unwrap_or_else(|| json!(task.workflow.backend().now().to_rfc3339())),
    })
}

/// Executes a form task: sends the form to the recipients, listens for the
/// submission event, and stores `{values, submitted_by, submitted_at}` in
/// the instance context.
pub(crate) async fn execute(
    task: &mut TaskContext<'_>,
    params: &FormParams,
    input: Value,
) -> WorkflowResult<TaskOutcome> {
    let mut pending = event_from_value(&input, task.reference)?
        .filter(|event| event.ty == FORM_EVENT_TYPE);

    if pending.is_none() {
        let fields = serde_json::to_value(&params.fields).unwrap_or(Value::Null);
        let delivered = notify::fan_out(
            task.engine,
            &params.notifiers,
            "form requested",
            &json!({ "fields": fields }),
        )
        .await;
        info!("sent the form to {delivered} recipients");
    }

    let event = match pending.take() {
        Some(event) => event,
        None => {
            next_event_matching(task.workflow, task.reference, |event| {
                event.ty == FORM_EVENT_TYPE
            })
            .await?
        }
    };

    let submission = submission(task, &event);
    task.workflow
        .set_context_key(FORM_SUBMISSION_CONTEXT_KEY, submission.clone());

    info!(
        "recorded form submission from `{user}`",
        user = event.user().unwrap_or("unknown")
    );

    Ok(TaskOutcome::Output(submission))
}
