//! Implementation of the `fork` task.

use serde_json::Value;
use thand_model::ForkTask;
use thand_model::TaskList;
use tokio::task::JoinSet;
use tracing::debug;

use super::TaskEvaluator;
use super::TaskOutcome;
use crate::TaskPath;
use crate::WorkflowContext;
use crate::WorkflowResult;
use crate::error::runtime;

impl TaskEvaluator<'_> {
    /// Executes a `fork` task: launches the branches concurrently.
    ///
    /// With `compete = false`, all branch outputs are returned in branch
    /// order regardless of completion order. With `compete = true`, the
    /// first branch to complete successfully wins and the remaining branches
    /// are cancelled cooperatively.
    ///
    /// Branches evaluate over cloned context snapshots; their exports are
    /// merged back into the parent context at the barrier, in branch order
    /// (or winner-only when competing).
    pub(crate) async fn execute_fork(
        &mut self,
        task: &ForkTask,
        reference: &TaskPath,
        input: Value,
    ) -> WorkflowResult<TaskOutcome> {
        let branches = &task.fork.branches;
        if branches.is_empty() {
            return Ok(TaskOutcome::Output(Value::Array(Vec::new())));
        }

        let branch_path = reference.push("fork").push("branches");
        let mut set = JoinSet::new();

        for (index, branch) in branches.iter().enumerate() {
            let engine = self.engine.clone();
            let mut context = self.context.clone();
            let extras = self.extras.clone();
            let branch = branch.clone();
            let input = input.clone();
            let path = branch_path.clone();

            set.spawn(async move {
                let result = {
                    let mut evaluator = TaskEvaluator::with_extras(engine, &mut context, extras);
                    let list = TaskList(vec![branch]);
                    evaluator.evaluate_list(&list, &path, 0, input).await
                };
                (index, result, context)
            });
        }

        if task.fork.compete {
            let mut last_error = None;
            while let Some(joined) = set.join_next().await {
                let (index, result, context) = joined
                    .map_err(|e| runtime(format!("fork branch panicked: {e}"), reference))?;

                match result {
                    Ok(outcome) => {
                        debug!("fork branch {index} won the competition at `{reference}`");
                        set.abort_all();
                        self.adopt_branch(&context);
                        return Ok(TaskOutcome::Output(outcome.into_value()));
                    }
                    Err(e) if e.is_control_flow() => return Err(e),
                    Err(e) => last_error = Some(e),
                }
            }

            Err(last_error
                .unwrap_or_else(|| runtime("all competing fork branches failed", reference)))
        } else {
            let mut results: Vec<Option<(Value, WorkflowContext)>> =
                (0..branches.len()).map(|_| None).collect();

            while let Some(joined) = set.join_next().await {
                let (index, result, context) = joined
                    .map_err(|e| runtime(format!("fork branch panicked: {e}"), reference))?;

                match result {
                    Ok(outcome) => results[index] = Some((outcome.into_value(), context)),
                    Err(e) => {
                        set.abort_all();
                        return Err(e);
                    }
                }
            }

            // Merge the branch contexts in branch order, then return the
            // outputs in the same order.
            let mut outputs = Vec::with_capacity(results.len());
            for result in results {
                let (value, context) =
                    result.ok_or_else(|| runtime("fork branch produced no result", reference))?;
                self.adopt_branch(&context);
                outputs.push(value);
            }

            Ok(TaskOutcome::Output(Value::Array(outputs)))
        }
    }

    /// Merges a completed branch's context changes back into the parent
    /// context.
    ///
    /// A cancelled competing branch may have committed side effects before
    /// cancellation; only the winner's exports are adopted, so losing
    /// branches must be idempotent.
    fn adopt_branch(&mut self, branch: &WorkflowContext) {
        for (key, value) in branch.instance_context() {
            self.context.set_context_key(key.clone(), value.clone());
        }

        if let Some(approved) = branch.approved() {
            self.context.set_approved(approved);
        }
    }
}
