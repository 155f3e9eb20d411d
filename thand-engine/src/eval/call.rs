//! Implementation of the `call` task family.

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thand_model::CallTask;

use super::TaskEvaluator;
use super::TaskOutcome;
use crate::ActivityInvocation;
use crate::BackendKind;
use crate::CallRequest;
use crate::TaskPath;
use crate::WorkflowResult;
use crate::engine::activity_name;
use crate::error::runtime;
use crate::error::validation;
use crate::expr;

pub mod http;

/// The interpolated request shape of the `grpc` caller.
///
/// The transport is an external collaborator: a handler registered under
/// `grpc` receives this shape and performs reflection, dynamic request
/// construction, and the invoke itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrpcCallRequest {
    /// The proto definition or reflection endpoint.
    pub proto: Option<String>,
    /// The target service, e.g. `example.PetStore`.
    pub service: String,
    /// The method to invoke.
    pub method: String,
    /// The endpoint of the server.
    pub endpoint: String,
    /// The argument map the dynamic request message is built from.
    #[serde(default)]
    pub arguments: IndexMap<String, Value>,
}

/// The interpolated request shape of the `openapi` caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenApiCallRequest {
    /// The location of the OpenAPI document.
    pub document: String,
    /// The operation identifier to invoke.
    #[serde(rename = "operationId")]
    pub operation_id: String,
    /// The operation parameters.
    #[serde(default)]
    pub parameters: IndexMap<String, Value>,
}

/// The interpolated request shape of the `asyncapi` caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncApiCallRequest {
    /// The location of the AsyncAPI document.
    pub document: String,
    /// The operation to publish or subscribe on.
    pub operation: String,
    /// The message payload.
    #[serde(default)]
    pub message: Option<Value>,
}

impl TaskEvaluator<'_> {
    /// Executes a `call` task: interpolates the `with` payload, validates it
    /// with the registered handler, and executes the function.
    ///
    /// Under the durable backend, execution is scheduled as a named activity
    /// on the backend's task queue with its start-to-close timeout; the
    /// in-process backend calls the handler directly.
    ///
    /// When the handler declares its own output or export transform and the
    /// document did not specify one, the handler's is adopted.
    pub(crate) async fn execute_call(
        &mut self,
        key: &str,
        task: &CallTask,
        reference: &TaskPath,
        input: Value,
    ) -> WorkflowResult<TaskOutcome> {
        let bindings = self.bindings();

        let mut with = IndexMap::with_capacity(task.with.len());
        for (name, value) in &task.with {
            with.insert(
                name.clone(),
                expr::evaluate_value(value, &input, &bindings, reference)?,
            );
        }

        let handler = self
            .engine
            .functions()
            .get(&task.call)
            .cloned()
            .ok_or_else(|| {
                validation(format!("unknown function `{name}`", name = task.call), reference)
            })?;

        let call = CallRequest {
            function: task.call.clone(),
            with,
        };

        handler.validate(&call).await?;

        let invocation = ActivityInvocation {
            workflow: self.context.snapshot(),
            task_name: key.to_string(),
            call,
            input: input.clone(),
        };

        let raw = match self.context.backend().kind() {
            BackendKind::Durable => {
                let options = self.engine.activity_options();
                self.context
                    .backend()
                    .execute_activity(activity_name(&task.call), invocation, &options)
                    .await?
            }
            BackendKind::InProcess => handler.execute(invocation).await.map_err(|e| {
                runtime(
                    format!("call to `{name}` failed: {e:#}", name = task.call),
                    reference,
                )
            })?,
        };

        let mut output = raw;

        if task.base.output.is_none() {
            if let Some(block) = handler.output() {
                let bindings = self.bindings();
                if let Some(as_) = &block.as_ {
                    output = expr::evaluate_struct(as_, &output, &bindings, reference)?;
                }
                expr::validate_schema(&output, block.schema.as_ref(), reference)?;
            }
        }

        if task.base.export.is_none() {
            if let Some(block) = handler.export() {
                let bindings = self.bindings();
                if let Some(as_) = &block.as_ {
                    let exported = expr::evaluate_struct(as_, &output, &bindings, reference)?;
                    expr::validate_schema(&exported, block.schema.as_ref(), reference)?;
                    self.context.merge_export(exported, reference)?;
                }
            }
        }

        Ok(TaskOutcome::Output(output))
    }
}
