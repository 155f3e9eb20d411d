//! Implementation of the `set` task.

use serde_json::Value;
use thand_model::SetTask;

use super::TaskEvaluator;
use super::TaskOutcome;
use crate::TaskPath;
use crate::WorkflowResult;
use crate::expr;

impl TaskEvaluator<'_> {
    /// Executes a `set` task: evaluates the `set` template against the task
    /// input and returns the result.
    ///
    /// Evaluation builds a fresh value from the template, so the document is
    /// never mutated.
    pub(crate) fn execute_set(
        &mut self,
        task: &SetTask,
        reference: &TaskPath,
        input: Value,
    ) -> WorkflowResult<TaskOutcome> {
        let bindings = self.bindings();
        let value = expr::evaluate_value(&task.set, &input, &bindings, reference)?;
        Ok(TaskOutcome::Output(value))
    }
}
