//! Implementation of the workflow manager.
//!
//! The manager constructs a runner per request, drives its loop, and routes
//! external resume, event, and termination signals to the correct instance
//! by workflow identifier. It also answers the `isApproved` and
//! `getWorkflowTask` queries.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use serde_json::Value;
use thand_model::CloudEvent;
use thand_model::WorkflowDocument;
use tokio::task::JoinHandle;
use tracing::info;
use tracing::warn;

use crate::BackendConfig;
use crate::Engine;
use crate::ResumeInput;
use crate::Runner;
use crate::SignalPayload;
use crate::TerminationRequest;
use crate::WorkflowContext;
use crate::WorkflowId;
use crate::WorkflowResult;
use crate::WorkflowSnapshot;
use crate::WorkflowStatus;
use crate::error::TaskPath;
use crate::error::runtime;
use crate::error::validation;

/// Represents the execution state of a managed instance.
enum InstanceState {
    /// An in-process instance parked awaiting a signal.
    Parked(Box<WorkflowContext>),
    /// An in-process instance currently executing a segment.
    Busy,
    /// A durable instance driven by a background task.
    Running(JoinHandle<WorkflowResult<WorkflowStatus>>),
    /// A finished instance, kept for queries.
    Finished(WorkflowStatus),
}

/// Represents a managed instance.
struct Instance {
    /// The shared snapshot of the instance, refreshed on state changes.
    snapshot: Arc<Mutex<WorkflowSnapshot>>,
    /// The execution state of the instance.
    state: InstanceState,
}

/// Manages workflow instances: construction, signal routing, and queries.
pub struct WorkflowManager {
    /// The engine services.
    engine: Engine,
    /// The managed instances, keyed by identifier.
    instances: tokio::sync::Mutex<HashMap<WorkflowId, Instance>>,
}

impl WorkflowManager {
    /// Constructs a new manager over the given engine.
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            instances: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Gets the engine of the manager.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Returns `true` if the configured backend is durable.
    fn is_durable(&self) -> bool {
        matches!(self.engine.config().backend, BackendConfig::Durable(_))
    }

    /// Starts a new instance of the given document.
    ///
    /// In-process instances run inline until they complete or park; durable
    /// instances run on a background task and this returns immediately.
    pub async fn start(
        &self,
        document: Arc<WorkflowDocument>,
        input: Value,
    ) -> WorkflowResult<(WorkflowId, WorkflowStatus)> {
        let id = WorkflowId::generate();
        let backend = self.engine.new_backend(&id);
        let context = WorkflowContext::new(id.clone(), document, backend);
        let snapshot = Arc::new(Mutex::new(context.snapshot()));
        let context = context.with_observer(Arc::clone(&snapshot));

        info!(
            "starting workflow `{workflow}` as instance `{id}`",
            workflow = context.document().document.name
        );

        if self.is_durable() {
            let engine = self.engine.clone();
            let task_input = input;
            let handle = tokio::spawn(async move {
                let mut runner = Runner::new(engine, context);
                runner.run(task_input).await.inspect_err(|e| {
                    warn!("durable instance faulted: {e}");
                })
            });

            self.instances.lock().await.insert(
                id.clone(),
                Instance {
                    snapshot,
                    state: InstanceState::Running(handle),
                },
            );

            return Ok((id, WorkflowStatus::Running));
        }

        let mut runner = Runner::new(self.engine.clone(), context);
        let status = match runner.run(input).await {
            Ok(status) => status,
            Err(e) => {
                warn!("instance `{id}` faulted: {e}");
                WorkflowStatus::Faulted
            }
        };

        let state = match status {
            WorkflowStatus::Waiting => InstanceState::Parked(Box::new(runner.into_context())),
            status => InstanceState::Finished(status),
        };

        self.instances
            .lock()
            .await
            .insert(id.clone(), Instance { snapshot, state });

        Ok((id, status))
    }

    /// Resumes a parked instance with the given input.
    ///
    /// Durable instances receive the resume on their signal channel; for
    /// in-process instances the stored context is re-entered at the resume's
    /// entry point (or the entry point recorded when the instance parked).
    pub async fn resume(
        &self,
        id: &WorkflowId,
        resume: ResumeInput,
    ) -> WorkflowResult<WorkflowStatus> {
        if self.is_durable() {
            self.engine
                .router()
                .deliver(id, SignalPayload::Resume(resume))?;
            return self.status(id).await;
        }

        let mut context = self.take_parked(id).await?;

        if let Some(entry) = &resume.entry_point {
            context.set_entry_point(entry.clone());
        }

        let mut runner = Runner::new(self.engine.clone(), *context);
        let status = match runner.run(resume.input).await {
            Ok(status) => status,
            Err(e) => {
                warn!("instance `{id}` faulted on resume: {e}");
                WorkflowStatus::Faulted
            }
        };

        self.settle(id, runner, status).await;
        Ok(status)
    }

    /// Delivers a CloudEvent to an instance.
    pub async fn deliver_event(
        &self,
        id: &WorkflowId,
        event: CloudEvent,
    ) -> WorkflowResult<WorkflowStatus> {
        if self.is_durable() {
            self.engine
                .router()
                .deliver(id, SignalPayload::Event(event))?;
            return self.status(id).await;
        }

        let input = serde_json::to_value(&event)
            .map_err(|e| runtime(format!("failed to serialize event: {e}"), &TaskPath::root()))?;

        self.resume(
            id,
            ResumeInput {
                entry_point: None,
                input,
            },
        )
        .await
    }

    /// Terminates an instance.
    ///
    /// A request with an entry point runs that task before completing (the
    /// scheduled revocation path); without one the instance is cancelled,
    /// with cleanup.
    pub async fn terminate(
        &self,
        id: &WorkflowId,
        request: TerminationRequest,
    ) -> WorkflowResult<WorkflowStatus> {
        if self.is_durable() {
            self.engine
                .router()
                .deliver(id, SignalPayload::Terminate(request))?;
            return self.status(id).await;
        }

        match request.entry_point {
            Some(entry) => {
                self.resume(
                    id,
                    ResumeInput {
                        entry_point: Some(entry),
                        input: Value::Null,
                    },
                )
                .await
            }
            None => {
                let context = self.take_parked(id).await?;
                let mut runner = Runner::new(self.engine.clone(), *context);
                let status = runner.cancel(request.reason.as_deref()).await?;
                self.settle(id, runner, status).await;
                Ok(status)
            }
        }
    }

    /// Answers the `isApproved` query.
    pub async fn is_approved(&self, id: &WorkflowId) -> WorkflowResult<Option<bool>> {
        Ok(self.workflow_task(id).await?.approved)
    }

    /// Answers the `getWorkflowTask` query: the logical state of the
    /// instance.
    pub async fn workflow_task(&self, id: &WorkflowId) -> WorkflowResult<WorkflowSnapshot> {
        let instances = self.instances.lock().await;
        let instance = instances
            .get(id)
            .ok_or_else(|| unknown_instance(id))?;
        let snapshot = instance
            .snapshot
            .lock()
            .expect("snapshot lock poisoned")
            .clone();
        Ok(snapshot)
    }

    /// Gets the current status of an instance.
    pub async fn status(&self, id: &WorkflowId) -> WorkflowResult<WorkflowStatus> {
        Ok(self.workflow_task(id).await?.status)
    }

    /// Waits for a durable instance's background task to finish and returns
    /// its final status.
    pub async fn join(&self, id: &WorkflowId) -> WorkflowResult<WorkflowStatus> {
        let handle = {
            let mut instances = self.instances.lock().await;
            let instance = instances
                .get_mut(id)
                .ok_or_else(|| unknown_instance(id))?;

            match std::mem::replace(&mut instance.state, InstanceState::Busy) {
                InstanceState::Running(handle) => handle,
                other => {
                    instance.state = other;
                    return self.status(id).await;
                }
            }
        };

        let result = handle
            .await
            .map_err(|e| runtime(format!("instance task panicked: {e}"), &TaskPath::root()))?;

        let status = match &result {
            Ok(status) => *status,
            Err(_) => WorkflowStatus::Faulted,
        };

        let mut instances = self.instances.lock().await;
        if let Some(instance) = instances.get_mut(id) {
            instance.state = InstanceState::Finished(status);
        }

        result
    }

    /// Takes a parked in-process context out of the instance table, leaving
    /// the entry busy.
    async fn take_parked(&self, id: &WorkflowId) -> WorkflowResult<Box<WorkflowContext>> {
        let mut instances = self.instances.lock().await;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| unknown_instance(id))?;

        match std::mem::replace(&mut instance.state, InstanceState::Busy) {
            InstanceState::Parked(context) => Ok(context),
            other => {
                let message = match &other {
                    InstanceState::Busy => "the instance is already executing",
                    InstanceState::Running(_) => "the instance is not in-process",
                    InstanceState::Finished(_) => "the instance has finished",
                    InstanceState::Parked(_) => unreachable!(),
                };
                instance.state = other;
                Err(validation(
                    format!("cannot resume instance `{id}`: {message}"),
                    &TaskPath::root(),
                ))
            }
        }
    }

    /// Records the outcome of an in-process segment back into the instance
    /// table.
    async fn settle(&self, id: &WorkflowId, runner: Runner, status: WorkflowStatus) {
        let state = match status {
            WorkflowStatus::Waiting => InstanceState::Parked(Box::new(runner.into_context())),
            status => InstanceState::Finished(status),
        };

        if let Some(instance) = self.instances.lock().await.get_mut(id) {
            instance.state = state;
        }
    }
}

/// Creates an "unknown instance" error.
fn unknown_instance(id: &WorkflowId) -> crate::WorkflowError {
    validation(
        format!("no workflow instance `{id}`"),
        &TaskPath::root(),
    )
}
