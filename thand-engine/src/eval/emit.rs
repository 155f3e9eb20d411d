//! Implementation of the `emit` task.

use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use thand_model::CloudEvent;
use thand_model::EmitTask;
use uuid::Uuid;

use super::TaskEvaluator;
use super::TaskOutcome;
use crate::BackendKind;
use crate::SignalPayload;
use crate::TaskPath;
use crate::WorkflowResult;
use crate::error::runtime;
use crate::error::validation;
use crate::expr;

impl TaskEvaluator<'_> {
    /// Executes an `emit` task: builds a CloudEvent from the `with`
    /// properties and delivers it by signalling the current workflow on the
    /// event signal channel.
    ///
    /// Emission requires the durable backend; in-process instances have no
    /// signal channels to deliver on.
    pub(crate) async fn execute_emit(
        &mut self,
        task: &EmitTask,
        reference: &TaskPath,
        input: Value,
    ) -> WorkflowResult<TaskOutcome> {
        if self.context.backend().kind() != BackendKind::Durable {
            return Err(runtime("emit requires durable backend", reference));
        }

        let bindings = self.bindings();
        let mut properties = Map::new();
        for (name, value) in &task.emit.event.with {
            properties.insert(
                name.clone(),
                expr::evaluate_value(value, &input, &bindings, reference)?,
            );
        }

        for required in ["source", "type"] {
            if !properties.contains_key(required) {
                return Err(validation(
                    format!("emit requires the `{required}` event property"),
                    reference,
                ));
            }
        }

        if !properties.contains_key("id") {
            properties.insert("id".to_string(), json!(Uuid::new_v4().to_string()));
        }
        if !properties.contains_key("time") {
            properties.insert(
                "time".to_string(),
                json!(self.context.backend().now().to_rfc3339()),
            );
        }

        let event: CloudEvent = serde_json::from_value(Value::Object(properties))
            .map_err(|e| validation(format!("invalid event properties: {e}"), reference))?;

        let value = serde_json::to_value(&event)
            .map_err(|e| runtime(format!("failed to serialize event: {e}"), reference))?;

        let id = self.context.id().clone();
        self.context
            .backend()
            .signal_external(&id, SignalPayload::Event(event))
            .await?;

        Ok(TaskOutcome::Output(value))
    }
}
