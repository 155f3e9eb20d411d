//! Implementation of the `for` task.

use serde_json::Value;
use serde_json::json;
use thand_model::ForTask;

use super::ListOutcome;
use super::TaskEvaluator;
use super::TaskOutcome;
use crate::TaskPath;
use crate::WorkflowResult;
use crate::error::validation;
use crate::expr;

/// The default binding name of the current element.
const DEFAULT_EACH: &str = "item";

/// The default binding name of the current index.
const DEFAULT_AT: &str = "index";

impl TaskEvaluator<'_> {
    /// Executes a `for` task: iterates an expression-evaluated sequence over
    /// the nested task list, binding the element and index for the inner
    /// expressions.
    ///
    /// Each iteration receives the previous iteration's output as input, so
    /// the loop reduces; an accumulator can also be carried through the
    /// instance context via `export`.
    pub(crate) async fn execute_for(
        &mut self,
        task: &ForTask,
        reference: &TaskPath,
        input: Value,
    ) -> WorkflowResult<TaskOutcome> {
        let bindings = self.bindings();
        let in_reference = reference.push("for").push("in");
        let program = expr::as_expression(&task.for_.in_).unwrap_or(&task.for_.in_);
        let sequence = expr::evaluate_expression(program, &input, &bindings, &in_reference)?;

        let items = match sequence {
            Value::Array(items) => items,
            other => {
                return Err(validation(
                    format!("`for.in` must evaluate to a sequence, found `{other}`"),
                    &in_reference,
                ));
            }
        };

        let each = task.for_.each.as_deref().unwrap_or(DEFAULT_EACH);
        let at = task.for_.at.as_deref().unwrap_or(DEFAULT_AT);
        let do_path = reference.push("do");

        let saved = self.extras.len();
        let mut current = input;

        for (index, item) in items.into_iter().enumerate() {
            self.extras.truncate(saved);
            self.extras.push((each.to_string(), item));
            self.extras.push((at.to_string(), json!(index)));

            match self.evaluate_list(&task.do_, &do_path, 0, current).await {
                Ok(ListOutcome::Next(value)) => current = value,
                Ok(ListOutcome::End(value)) => {
                    self.extras.truncate(saved);
                    return Ok(TaskOutcome::End(value));
                }
                Err(e) => {
                    self.extras.truncate(saved);
                    return Err(e);
                }
            }
        }

        self.extras.truncate(saved);
        Ok(TaskOutcome::Output(current))
    }
}
