//! Implementation of the validate task.

use serde_json::Value;
use thand_model::ELEVATION_CONTEXT_KEY;
use thand_model::ElevationRequest;
use thand_model::ValidateParams;
use tracing::info;

use crate::TaskContext;
use crate::WorkflowResult;
use crate::error::validation;
use crate::eval::TaskOutcome;

/// Executes a validate task: statically checks the elevation request and
/// stores it in the instance context for the approval and authorization
/// stack.
///
/// The checks: the duration parses, the reason is non-empty, and the role
/// is valid under the primary provider. When a narrative validator is
/// registered and the task requests it, the request is also delegated to it.
pub(crate) async fn execute(
    task: &mut TaskContext<'_>,
    params: &ValidateParams,
    input: Value,
) -> WorkflowResult<TaskOutcome> {
    let elevation: ElevationRequest = serde_json::from_value(input)
        .map_err(|e| validation(format!("invalid elevation request: {e}"), task.reference))?;

    elevation
        .duration()
        .map_err(|e| validation(e.to_string(), task.reference))?;

    if elevation.reason.trim().is_empty() {
        return Err(validation(
            "the elevation request requires a reason",
            task.reference,
        ));
    }

    let primary = elevation.providers.first().ok_or_else(|| {
        validation("the elevation request names no providers", task.reference)
    })?;

    let provider = task.engine.providers().provider(primary).ok_or_else(|| {
        validation(format!("unknown provider `{primary}`"), task.reference)
    })?;

    provider.validate_role(&elevation.role).await.map_err(|e| {
        validation(
            format!(
                "role `{role}` is not valid under provider `{primary}`: {e:#}",
                role = elevation.role
            ),
            task.reference,
        )
    })?;

    if let Some(llm) = &params.llm {
        if let Some(validator) = task.engine.providers().narrative_validator() {
            validator
                .validate(&elevation, llm.prompt.as_deref())
                .await
                .map_err(|e| {
                    validation(format!("narrative validation failed: {e:#}"), task.reference)
                })?;
        }
    }

    let value = serde_json::to_value(&elevation)
        .map_err(|e| validation(format!("invalid elevation request: {e}"), task.reference))?;
    task.workflow
        .set_context_key(ELEVATION_CONTEXT_KEY, value.clone());

    info!(
        "validated elevation of `{user}` into `{role}` for {duration}",
        user = elevation.user,
        role = elevation.role,
        duration = elevation.duration
    );

    Ok(TaskOutcome::Output(value))
}
