//! Implementation of workflow evaluation: the task dispatcher and the
//! sequencer driving a task list.

use std::sync::Arc;

use async_recursion::async_recursion;
use serde_json::Value;
use thand_model::FlowTarget;
use thand_model::Named;
use thand_model::TaskDefinition;
use thand_model::TaskList;
use tracing::debug;

use crate::Engine;
use crate::ExpressionBindings;
use crate::TaskContext;
use crate::TaskPath;
use crate::TaskStatus;
use crate::WorkflowContext;
use crate::WorkflowError;
use crate::WorkflowResult;
use crate::error::flow_directive_target_not_found;
use crate::error::unsupported_task_type;
use crate::expr;

pub mod call;
mod emit;
mod for_loop;
mod fork;
pub(crate) mod listen;
mod raise;
mod run;
mod set;
mod switch;
mod try_catch;
mod wait;

/// Represents the result of executing a single task.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// The task produced a value, which becomes the next task's input.
    Output(Value),
    /// The task produced a flow directive.
    Directive(FlowTarget),
    /// The task ended the workflow with the given value.
    End(Value),
}

/// Represents the result of evaluating a task list.
#[derive(Debug, Clone)]
pub enum ListOutcome {
    /// The list ran to its end (or exited) with the given value.
    Next(Value),
    /// A task ended the workflow with the given value.
    End(Value),
}

impl ListOutcome {
    /// Unwraps the carried value.
    pub fn into_value(self) -> Value {
        match self {
            Self::Next(value) | Self::End(value) => value,
        }
    }
}

/// Evaluates tasks against a workflow context.
pub struct TaskEvaluator<'a> {
    /// The engine services.
    pub(crate) engine: Engine,
    /// The instance being evaluated.
    pub(crate) context: &'a mut WorkflowContext,
    /// Extra expression bindings, e.g. the loop variables of enclosing `for`
    /// tasks.
    pub(crate) extras: Vec<(String, Value)>,
}

impl<'a> TaskEvaluator<'a> {
    /// Constructs a new evaluator over the given context.
    pub fn new(engine: Engine, context: &'a mut WorkflowContext) -> Self {
        Self {
            engine,
            context,
            extras: Vec::new(),
        }
    }

    /// Constructs a new evaluator carrying extra expression bindings.
    pub(crate) fn with_extras(
        engine: Engine,
        context: &'a mut WorkflowContext,
        extras: Vec<(String, Value)>,
    ) -> Self {
        Self {
            engine,
            context,
            extras,
        }
    }

    /// Builds the expression bindings for the current state, including the
    /// evaluator's extra bindings.
    pub(crate) fn bindings(&self) -> ExpressionBindings {
        let mut bindings = self.context.bindings();
        bindings.extras = self.extras.clone();
        bindings
    }

    /// Evaluates a task list starting at the given index.
    ///
    /// The returned value is the output of the last completed task (the
    /// input threading of the sequencer); an empty list returns the input
    /// unchanged.
    #[async_recursion]
    pub async fn evaluate_list(
        &mut self,
        list: &TaskList,
        path: &TaskPath,
        start: usize,
        input: Value,
    ) -> WorkflowResult<ListOutcome> {
        let mut index = start;
        let mut current = input;

        while let Some(item) = list.get(index) {
            let reference = path.push(index).push(&item.name);
            let base = item.item.base();

            if path.is_root() && self.context.backend().info().continue_as_new_suggested {
                return Err(WorkflowError::ContinueAsNew {
                    next: Some(item.name.clone()),
                });
            }

            // `if` is evaluated before any status recording or input
            // transform: skipped tasks appear in no state and leave the
            // input unchanged for the next task.
            if let Some(condition) = &base.if_ {
                let bindings = self.bindings();
                if !expr::evaluate_bool(condition, &current, &bindings, &reference)? {
                    debug!("skipping task `{reference}`: `if` evaluated to false");
                    index += 1;
                    continue;
                }
            }

            self.context
                .record_transition(&item.name, &reference, TaskStatus::Pending);
            self.context.begin_task(&item.name, &reference, current.clone());
            self.context
                .record_transition(&item.name, &reference, TaskStatus::Running);
            self.context
                .backend()
                .upsert_search_attributes(self.context.search_attributes());

            debug!(
                "running task `{reference}` ({kind})",
                kind = item.item.kind()
            );

            match self.run_task_item(item, &reference, current.clone()).await {
                Err(e) if e.is_await_signal() => {
                    // Parked, not faulted: record the root-level entry point
                    // the resumed run begins at.
                    if path.is_root() {
                        self.context.set_entry_point(item.name.clone());
                    }
                    return Err(e);
                }
                Err(e) if e.is_control_flow() => return Err(e),
                Err(e) => {
                    self.context
                        .record_transition(&item.name, &reference, TaskStatus::Faulted);
                    return Err(e);
                }
                Ok(TaskOutcome::Output(value)) => {
                    self.context
                        .record_transition(&item.name, &reference, TaskStatus::Completed);

                    match &base.then {
                        None | Some(FlowTarget::Continue) => {
                            current = value;
                            index += 1;
                        }
                        Some(FlowTarget::Exit) => {
                            return Ok(ListOutcome::Next(value));
                        }
                        Some(FlowTarget::End) => {
                            return Ok(ListOutcome::End(value));
                        }
                        Some(FlowTarget::Task(key)) => {
                            // A jump bypasses the input rebind: the previous
                            // output is not smeared into the target's input.
                            index = list.position(key).ok_or_else(|| {
                                flow_directive_target_not_found(key, &reference)
                            })?;
                        }
                    }
                }
                Ok(TaskOutcome::Directive(target)) => {
                    self.context
                        .record_transition(&item.name, &reference, TaskStatus::Completed);

                    match &target {
                        FlowTarget::Continue => index += 1,
                        FlowTarget::Exit => return Ok(ListOutcome::Next(current)),
                        FlowTarget::End => return Ok(ListOutcome::End(current)),
                        FlowTarget::Task(key) => {
                            index = list.position(key).ok_or_else(|| {
                                flow_directive_target_not_found(key, &reference)
                            })?;
                        }
                    }
                }
                Ok(TaskOutcome::End(value)) => {
                    self.context
                        .record_transition(&item.name, &reference, TaskStatus::Completed);
                    return Ok(ListOutcome::End(value));
                }
            }

            if path.is_root() {
                self.context.clear_task();
            }
        }

        Ok(ListOutcome::Next(current))
    }

    /// Runs a single task item: input validation and transform, dispatch,
    /// output transform and validation, and export.
    async fn run_task_item(
        &mut self,
        item: &Named<TaskDefinition>,
        reference: &TaskPath,
        input: Value,
    ) -> WorkflowResult<TaskOutcome> {
        let base = item.item.base();
        let bindings = self.bindings();

        if let Some(block) = &base.input {
            expr::validate_schema(&input, block.schema.as_ref(), reference)?;
        }

        let transformed = match base.input.as_ref().and_then(|block| block.from.as_ref()) {
            Some(from) => expr::evaluate_value(from, &input, &bindings, reference)?,
            None => input,
        };

        let outcome = self
            .dispatch(&item.name, &item.item, reference, transformed)
            .await?;

        match outcome {
            TaskOutcome::Output(raw_output) => {
                self.context.set_task_raw_output(raw_output.clone());

                // Rebuild the bindings: the dispatch may have grown the
                // instance context.
                let bindings = self.bindings();

                let output = match base.output.as_ref().and_then(|block| block.as_.as_ref()) {
                    Some(as_) => expr::evaluate_struct(as_, &raw_output, &bindings, reference)?,
                    None => raw_output,
                };

                if let Some(block) = &base.output {
                    expr::validate_schema(&output, block.schema.as_ref(), reference)?;
                }

                if let Some(export) = &base.export {
                    let exported = match export.as_.as_ref() {
                        Some(as_) => expr::evaluate_struct(as_, &output, &bindings, reference)?,
                        None => Value::Null,
                    };
                    expr::validate_schema(&exported, export.schema.as_ref(), reference)?;
                    self.context.merge_export(exported, reference)?;
                }

                Ok(TaskOutcome::Output(output))
            }
            other => Ok(other),
        }
    }

    /// Dispatches a task to its handler.
    ///
    /// The custom task registry is consulted first (key-specific handlers,
    /// then kind handlers), then the built-ins; an unknown kind is an error.
    async fn dispatch(
        &mut self,
        key: &str,
        task: &TaskDefinition,
        reference: &TaskPath,
        input: Value,
    ) -> WorkflowResult<TaskOutcome> {
        if let Some(handler) = self.engine.tasks().lookup(key, task.kind()).cloned() {
            let mut context = TaskContext {
                workflow: &mut *self.context,
                engine: &self.engine,
                key,
                reference,
            };
            return handler.execute(&mut context, task, input).await;
        }

        match task {
            TaskDefinition::Set(t) => self.execute_set(t, reference, input),
            TaskDefinition::Switch(t) => self.execute_switch(t, reference, input),
            TaskDefinition::For(t) => self.execute_for(t, reference, input).await,
            TaskDefinition::Try(t) => self.execute_try(t, reference, input).await,
            TaskDefinition::Wait(t) => self.execute_wait(t, reference, input).await,
            TaskDefinition::Fork(t) => self.execute_fork(t, reference, input).await,
            TaskDefinition::Do(t) => {
                let do_path = reference.push("do");
                match self.evaluate_list(&t.do_, &do_path, 0, input).await? {
                    ListOutcome::Next(value) => Ok(TaskOutcome::Output(value)),
                    ListOutcome::End(value) => Ok(TaskOutcome::End(value)),
                }
            }
            TaskDefinition::Raise(t) => self.execute_raise(t, reference, input),
            TaskDefinition::Emit(t) => self.execute_emit(t, reference, input).await,
            TaskDefinition::Listen(t) => self.execute_listen(t, reference, input).await,
            TaskDefinition::Run(t) => self.execute_run(t, reference, input).await,
            TaskDefinition::Call(t) => self.execute_call(key, t, reference, input).await,
            TaskDefinition::Thand(_) => Err(unsupported_task_type(task.kind(), reference)),
        }
    }
}

/// Evaluates a whole document against a context: workflow-level input
/// processing, the root task list, and workflow-level output processing.
///
/// A resumed run (one with an entry point) skips the workflow-level input
/// processing: its input is the resume payload, not the original request.
pub(crate) async fn evaluate_document(
    engine: &Engine,
    context: &mut WorkflowContext,
    raw_input: Value,
) -> WorkflowResult<Value> {
    let document = Arc::clone(context.document());
    let root = TaskPath::root();
    let resuming = context.has_entry_point();

    let input = if resuming {
        context.set_input(raw_input.clone());
        raw_input
    } else {
        context.set_raw_input(raw_input.clone());
        let bindings = context.bindings();

        if let Some(block) = &document.input {
            expr::validate_schema(&raw_input, block.schema.as_ref(), &root)?;
        }

        let input = match document.input.as_ref().and_then(|block| block.from.as_ref()) {
            Some(from) => expr::evaluate_value(from, &raw_input, &bindings, &root)?,
            None => raw_input,
        };
        context.set_input(input.clone());
        input
    };

    let start = context.entry_point_index(&document.do_)?;

    let mut evaluator = TaskEvaluator::new(engine.clone(), context);
    let outcome = evaluator
        .evaluate_list(&document.do_, &root, start, input)
        .await?;
    let raw_output = outcome.into_value();

    context.set_raw_output(raw_output.clone());
    let bindings = context.bindings();

    let output = match document.output.as_ref().and_then(|block| block.as_.as_ref()) {
        Some(as_) => expr::evaluate_struct(as_, &raw_output, &bindings, &root)?,
        None => raw_output,
    };

    if let Some(block) = &document.output {
        expr::validate_schema(&output, block.schema.as_ref(), &root)?;
    }

    context.set_output(output.clone());
    Ok(output)
}
