//! Implementation of the workflow runner.
//!
//! A runner drives one execution segment of an instance: from a fresh start
//! or a resume signal until the instance completes, faults, is cancelled,
//! or parks awaiting an external signal.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::Engine;
use crate::WorkflowContext;
use crate::WorkflowError;
use crate::WorkflowResult;
use crate::WorkflowStatus;
use crate::error::TaskPath;
use crate::error::runtime;
use crate::eval::evaluate_document;
use crate::tasks::cleanup_snapshot;

/// Drives a workflow instance through one execution segment.
pub struct Runner {
    /// The engine services.
    engine: Engine,
    /// The instance being driven.
    context: WorkflowContext,
    /// The number of times cleanup has run.
    cleanups: u32,
}

impl Runner {
    /// Constructs a new runner over the given context.
    pub fn new(engine: Engine, context: WorkflowContext) -> Self {
        Self {
            engine,
            context,
            cleanups: 0,
        }
    }

    /// Gets the instance context.
    pub fn context(&self) -> &WorkflowContext {
        &self.context
    }

    /// Consumes the runner, returning the instance context.
    pub fn into_context(self) -> WorkflowContext {
        self.context
    }

    /// Gets the number of times cleanup has run.
    pub fn cleanup_count(&self) -> u32 {
        self.cleanups
    }

    /// Runs the instance with the given input until it reaches a terminal
    /// status or parks.
    ///
    /// The deferral order: the await-signal sentinel becomes `Waiting`
    /// without error; a termination request re-enters at its entry point or
    /// cancels; continue-as-new restarts under the same identifier; any
    /// other error faults the instance and is returned wrapped with the
    /// workflow name. Cleanup always runs once a terminal status is reached.
    pub async fn run(&mut self, input: Value) -> WorkflowResult<WorkflowStatus> {
        let workflow = self.context.document().document.name.clone();
        info!(
            "running workflow `{workflow}` instance `{id}`",
            id = self.context.id()
        );

        self.context.set_status(WorkflowStatus::Running);
        self.context
            .backend()
            .upsert_search_attributes(self.context.search_attributes());

        let mut next_input = input;
        let mut error: Option<WorkflowError> = None;

        let status = loop {
            match evaluate_document(&self.engine, &mut self.context, next_input).await {
                Ok(_) => break WorkflowStatus::Completed,
                Err(e) if e.is_await_signal() => {
                    debug!(
                        "instance `{id}` parked awaiting a signal at entry point {entry:?}",
                        id = self.context.id(),
                        entry = self.context.entry_point()
                    );
                    break WorkflowStatus::Waiting;
                }
                Err(WorkflowError::Cancelled) => break WorkflowStatus::Cancelled,
                Err(WorkflowError::Terminated { request }) => match request.entry_point {
                    Some(entry) => {
                        info!(
                            "instance `{id}` terminating through entry point `{entry}`",
                            id = self.context.id()
                        );
                        self.context.set_entry_point(entry);
                        next_input = Value::Null;
                        continue;
                    }
                    None => break WorkflowStatus::Cancelled,
                },
                Err(WorkflowError::ContinueAsNew { next }) => {
                    info!(
                        "instance `{id}` continuing as new at {next:?}",
                        id = self.context.id()
                    );

                    let snapshot = self.context.snapshot();
                    let document = Arc::clone(self.context.document());
                    let backend = Arc::clone(self.context.backend());
                    let observer = self.context.observer();

                    let mut fresh = WorkflowContext::from_snapshot(snapshot, document, backend);
                    if let Some(observer) = observer {
                        fresh = fresh.with_observer(observer);
                    }
                    self.context = fresh;

                    if let Some(next) = next {
                        self.context.set_entry_point(next);
                    }
                    next_input = self.context.input().clone();
                    continue;
                }
                Err(e) => {
                    error = Some(e.into_instance(&workflow));
                    break WorkflowStatus::Faulted;
                }
            }
        };

        self.context.set_status(status);
        self.context
            .backend()
            .upsert_search_attributes(self.context.search_attributes());

        let status = if status.is_terminal() {
            match self.cleanup().await {
                None => status,
                Some(cleanup_error) => {
                    if status == WorkflowStatus::Cancelled {
                        // Cancellation wins over cleanup failures: the
                        // instance completes its cancellation cleanly.
                        debug!("suppressed cleanup failure after cancellation: {cleanup_error}");
                        status
                    } else if error.is_none() {
                        error = Some(cleanup_error.into_instance(&workflow));
                        self.context.set_status(WorkflowStatus::Faulted);
                        WorkflowStatus::Faulted
                    } else {
                        warn!("cleanup failed after a faulted run: {cleanup_error}");
                        status
                    }
                }
            }
        } else {
            status
        };

        info!(
            "instance `{id}` reached status {status}",
            id = self.context.id()
        );

        match error {
            Some(e) => Err(e),
            None => Ok(status),
        }
    }

    /// Cancels the instance: cancellation is signalled, the status becomes
    /// `Cancelled`, and cleanup runs on a disconnected scope.
    pub async fn cancel(&mut self, reason: Option<&str>) -> WorkflowResult<WorkflowStatus> {
        info!(
            "cancelling instance `{id}`: {reason}",
            id = self.context.id(),
            reason = reason.unwrap_or("no reason given")
        );

        self.context.backend().cancellation().cancel();
        self.context.set_status(WorkflowStatus::Cancelled);
        self.context
            .backend()
            .upsert_search_attributes(self.context.search_attributes());

        if let Some(e) = self.cleanup().await {
            debug!("suppressed cleanup failure after cancellation: {e}");
        }

        Ok(WorkflowStatus::Cancelled)
    }

    /// Runs terminal-state cleanup exactly once.
    ///
    /// Cleanup is invoked directly rather than through the backend so it
    /// survives cancellation (the disconnected-scope requirement); when the
    /// instance is approved and holds a valid elevation context, cleanup
    /// performs the revocation.
    async fn cleanup(&mut self) -> Option<WorkflowError> {
        if self.cleanups > 0 {
            return None;
        }
        self.cleanups += 1;

        debug!("running cleanup for instance `{id}`", id = self.context.id());

        match cleanup_snapshot(self.engine.providers(), &self.context.snapshot()).await {
            Ok(()) => None,
            Err(e) => Some(runtime(
                format!("cleanup failed: {e:#}"),
                &TaskPath::new("/cleanup"),
            )),
        }
    }
}
