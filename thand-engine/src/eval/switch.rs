//! Implementation of the `switch` task.

use serde_json::Value;
use thand_model::SwitchTask;

use super::TaskEvaluator;
use super::TaskOutcome;
use crate::TaskPath;
use crate::WorkflowResult;
use crate::error::no_matching_switch_case;
use crate::expr;

impl TaskEvaluator<'_> {
    /// Executes a `switch` task: the first case whose `when` is truthy
    /// returns its `then` as a flow directive.
    ///
    /// A case without `when` is the default; it is remembered but only
    /// returned once every predicated case has been exhausted. No match and
    /// no default is an error.
    pub(crate) fn execute_switch(
        &mut self,
        task: &SwitchTask,
        reference: &TaskPath,
        input: Value,
    ) -> WorkflowResult<TaskOutcome> {
        let bindings = self.bindings();
        let mut default = None;

        for case in &task.switch {
            match &case.item.when {
                Some(when) => {
                    let case_reference = reference.push("switch").push(&case.name);
                    if expr::evaluate_bool(when, &input, &bindings, &case_reference)? {
                        return Ok(TaskOutcome::Directive(case.item.then.clone()));
                    }
                }
                None => default = Some(&case.item.then),
            }
        }

        default
            .map(|then| TaskOutcome::Directive(then.clone()))
            .ok_or_else(|| no_matching_switch_case(reference))
    }
}
