//! Implementation of the `listen` task.

use indexmap::IndexMap;
use serde_json::Value;
use serde_json::json;
use thand_model::CloudEvent;
use thand_model::EventFilter;
use thand_model::ListenTask;
use thand_model::ListenTo;
use tracing::debug;

use super::TaskEvaluator;
use super::TaskOutcome;
use crate::BackendKind;
use crate::ExpressionBindings;
use crate::SignalPayload;
use crate::TaskPath;
use crate::WorkflowError;
use crate::WorkflowResult;
use crate::config::ListenAllMode;
use crate::error::runtime;
use crate::error::validation;
use crate::expr;

/// The instance context key `all`-predicate progress is persisted under, so
/// an in-process listener can pick up where it parked.
const LISTEN_PROGRESS_KEY: &str = "listen_progress";

/// Parses a CloudEvent from a task input value.
///
/// Returns `None` when the input does not carry an event — the listening
/// task has not been resumed with one yet and must arm itself. An input
/// that is event-shaped (an object with `source` and `type`) but otherwise
/// malformed is an error.
pub(crate) fn event_from_value(
    input: &Value,
    reference: &TaskPath,
) -> WorkflowResult<Option<CloudEvent>> {
    let event_shaped = input.is_object()
        && input.get("source").is_some_and(Value::is_string)
        && input.get("type").is_some_and(Value::is_string);
    if !event_shaped {
        return Ok(None);
    }

    serde_json::from_value(input.clone())
        .map(Some)
        .map_err(|e| validation(format!("input does not carry a CloudEvent: {e}"), reference))
}

/// Evaluates a filter's property expressions against a candidate event and
/// matches the event against the result.
fn matches_filter(
    event: &CloudEvent,
    filter: &EventFilter,
    bindings: &ExpressionBindings,
    reference: &TaskPath,
) -> WorkflowResult<bool> {
    let event_value = serde_json::to_value(event)
        .map_err(|e| runtime(format!("failed to serialize event: {e}"), reference))?;

    let mut evaluated = IndexMap::with_capacity(filter.with.len());
    for (name, value) in &filter.with {
        evaluated.insert(
            name.clone(),
            expr::evaluate_value(value, &event_value, bindings, reference)?,
        );
    }

    Ok(event.matches(&evaluated))
}

impl TaskEvaluator<'_> {
    /// Executes a `listen` task: waits for exactly one event matching the
    /// listener's predicate and returns it.
    ///
    /// Under the durable backend, the listener blocks on the signal
    /// channels, re-arming until a matching event arrives. In-process, the
    /// input must already carry the event (the resume path); an empty input
    /// parks the instance via the await-signal sentinel.
    pub(crate) async fn execute_listen(
        &mut self,
        task: &ListenTask,
        reference: &TaskPath,
        input: Value,
    ) -> WorkflowResult<TaskOutcome> {
        match self.context.backend().kind() {
            BackendKind::InProcess => {
                let Some(event) = event_from_value(&input, reference)? else {
                    return Err(WorkflowError::AwaitSignal);
                };
                match self.consume(&task.listen.to, &event, reference)? {
                    Some(value) => Ok(TaskOutcome::Output(value)),
                    None => Err(WorkflowError::AwaitSignal),
                }
            }
            BackendKind::Durable => loop {
                let event = match self.context.backend().next_signal().await? {
                    SignalPayload::Event(event) => event,
                    SignalPayload::Resume(resume) => {
                        match event_from_value(&resume.input, reference)? {
                            Some(event) => event,
                            None => continue,
                        }
                    }
                    SignalPayload::Terminate(request) => {
                        return Err(WorkflowError::Terminated { request });
                    }
                };

                match self.consume(&task.listen.to, &event, reference)? {
                    Some(value) => return Ok(TaskOutcome::Output(value)),
                    None => {
                        debug!("listener `{reference}` ignored a non-matching event");
                        continue;
                    }
                }
            },
        }
    }

    /// Feeds one event to the listener's predicate.
    ///
    /// Returns the event as a value when the predicate is satisfied, `None`
    /// when the listener must keep waiting.
    fn consume(
        &mut self,
        to: &ListenTo,
        event: &CloudEvent,
        reference: &TaskPath,
    ) -> WorkflowResult<Option<Value>> {
        let bindings = self.bindings();

        let matched = match to {
            ListenTo::One { one } => matches_filter(event, one, &bindings, reference)?,
            ListenTo::Any { any } => {
                let mut matched = false;
                for filter in any {
                    if matches_filter(event, filter, &bindings, reference)? {
                        matched = true;
                        break;
                    }
                }
                matched
            }
            ListenTo::All { all } => match self.engine.config().listen.all_mode {
                ListenAllMode::FirstMatch => {
                    let mut matched = false;
                    for filter in all {
                        if matches_filter(event, filter, &bindings, reference)? {
                            matched = true;
                            break;
                        }
                    }
                    matched
                }
                ListenAllMode::AllTypes => {
                    let mut seen = self.load_progress(reference);
                    for (index, filter) in all.iter().enumerate() {
                        if !seen.contains(&index)
                            && matches_filter(event, filter, &bindings, reference)?
                        {
                            seen.push(index);
                        }
                    }

                    if seen.len() == all.len() {
                        self.clear_progress(reference);
                        true
                    } else {
                        self.store_progress(reference, seen);
                        false
                    }
                }
            },
            ListenTo::Until { until } => {
                if matches_filter(event, &until.event, &bindings, reference)? {
                    match &until.condition {
                        Some(condition) => {
                            let event_value = serde_json::to_value(event).map_err(|e| {
                                runtime(format!("failed to serialize event: {e}"), reference)
                            })?;
                            expr::evaluate_bool(condition, &event_value, &bindings, reference)?
                        }
                        None => true,
                    }
                } else {
                    false
                }
            }
        };

        if !matched {
            return Ok(None);
        }

        serde_json::to_value(event)
            .map(Some)
            .map_err(|e| runtime(format!("failed to serialize event: {e}"), reference))
    }

    /// Loads the persisted `all`-predicate progress for the given listener.
    fn load_progress(&self, reference: &TaskPath) -> Vec<usize> {
        self.context
            .context_key(LISTEN_PROGRESS_KEY)
            .and_then(|progress| progress.get(reference.as_str()))
            .and_then(|indexes| serde_json::from_value(indexes.clone()).ok())
            .unwrap_or_default()
    }

    /// Persists the `all`-predicate progress for the given listener.
    fn store_progress(&mut self, reference: &TaskPath, seen: Vec<usize>) {
        let mut progress = self
            .context
            .context_key(LISTEN_PROGRESS_KEY)
            .cloned()
            .unwrap_or_else(|| json!({}));
        progress[reference.as_str()] = json!(seen);
        self.context.set_context_key(LISTEN_PROGRESS_KEY, progress);
    }

    /// Clears the `all`-predicate progress for the given listener.
    fn clear_progress(&mut self, reference: &TaskPath) {
        if let Some(Value::Object(mut progress)) =
            self.context.context_key(LISTEN_PROGRESS_KEY).cloned()
        {
            progress.remove(reference.as_str());
            self.context
                .set_context_key(LISTEN_PROGRESS_KEY, Value::Object(progress));
        }
    }
}
