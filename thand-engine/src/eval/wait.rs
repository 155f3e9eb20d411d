//! Implementation of the `wait` task.

use std::time::Duration;

use serde_json::Value;
use thand_model::DurationSpec;
use thand_model::WaitTask;
use tracing::debug;

use super::TaskEvaluator;
use super::TaskOutcome;
use crate::TaskPath;
use crate::WorkflowResult;
use crate::config::MAX_EPHEMERAL_WAIT_SECS;
use crate::error::validation;
use crate::expr;

impl TaskEvaluator<'_> {
    /// Executes a `wait` task: parses the duration (ISO-8601, structural, or
    /// expression-produced) and sleeps through the backend.
    ///
    /// A zero duration completes immediately; an ephemeral in-process
    /// instance rejects durations longer than one minute without sleeping.
    pub(crate) async fn execute_wait(
        &mut self,
        task: &WaitTask,
        reference: &TaskPath,
        input: Value,
    ) -> WorkflowResult<TaskOutcome> {
        let bindings = self.bindings();
        let value = expr::evaluate_value(&task.wait, &input, &bindings, reference)?;

        let spec: DurationSpec = serde_json::from_value(value.clone())
            .map_err(|_| validation(format!("`{value}` is not a valid duration"), reference))?;
        let duration = spec
            .to_duration()
            .map_err(|e| validation(e.to_string(), reference))?;

        if self.engine.is_ephemeral() && duration > Duration::from_secs(MAX_EPHEMERAL_WAIT_SECS) {
            return Err(validation(
                format!(
                    "ephemeral instances cannot wait longer than {MAX_EPHEMERAL_WAIT_SECS} \
                     seconds, requested {duration:?}"
                ),
                reference,
            ));
        }

        if !duration.is_zero() {
            debug!("waiting {duration:?} at `{reference}`");
            self.context.backend().sleep(duration).await?;
        }

        Ok(TaskOutcome::Output(input))
    }
}
