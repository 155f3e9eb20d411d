//! Implementation of the `raise` task.

use serde_json::Value;
use thand_model::RaiseTask;

use super::TaskEvaluator;
use super::TaskOutcome;
use crate::ErrorDescriptor;
use crate::TaskPath;
use crate::WorkflowError;
use crate::WorkflowResult;
use crate::error::RUNTIME_ERROR_TYPE;
use crate::error::validation;
use crate::expr;

impl TaskEvaluator<'_> {
    /// Executes a `raise` task: evaluates the error properties and fails
    /// with the constructed error.
    pub(crate) fn execute_raise(
        &mut self,
        task: &RaiseTask,
        reference: &TaskPath,
        input: Value,
    ) -> WorkflowResult<TaskOutcome> {
        let bindings = self.bindings();
        let definition = &task.raise.error;

        let field = |value: &Option<Value>| -> WorkflowResult<Option<Value>> {
            value
                .as_ref()
                .map(|v| expr::evaluate_value(v, &input, &bindings, reference))
                .transpose()
        };

        let type_ = match field(&definition.type_)? {
            Some(Value::String(s)) => s,
            Some(other) => {
                return Err(validation(
                    format!("error type must be a string, found `{other}`"),
                    reference,
                ));
            }
            None => RUNTIME_ERROR_TYPE.to_string(),
        };

        let status = match field(&definition.status)? {
            Some(Value::Number(n)) => n.as_u64().and_then(|n| u16::try_from(n).ok()).ok_or_else(
                || validation(format!("error status `{n}` is out of range"), reference),
            )?,
            Some(other) => {
                return Err(validation(
                    format!("error status must be a number, found `{other}`"),
                    reference,
                ));
            }
            None => 500,
        };

        let string_field = |value: Option<Value>| -> Option<String> {
            match value {
                Some(Value::String(s)) => Some(s),
                Some(other) => Some(other.to_string()),
                None => None,
            }
        };

        let title = string_field(field(&definition.title)?);
        let detail = string_field(field(&definition.detail)?);
        let instance = string_field(field(&definition.instance)?)
            .or_else(|| Some(reference.to_string()));

        Err(WorkflowError::Raised {
            error: ErrorDescriptor {
                type_,
                status,
                title,
                detail,
                instance,
            },
        })
    }
}
