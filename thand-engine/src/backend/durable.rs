//! Implementation of the local durable backend adapter.
//!
//! The production durable runtime is an external, event-sourced system; the
//! engine only requires the contract in [`WorkflowBackend`]. This adapter
//! satisfies that contract within a single process: signals are delivered
//! over channels routed by workflow identifier, scheduled termination
//! signals are held back by timers, and activities run with the configured
//! start-to-close timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use indexmap::IndexMap;
use serde_json::Value;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use super::ActivityInvocation;
use super::ActivityOptions;
use super::ActivityRegistry;
use super::BackendInfo;
use super::BackendKind;
use super::SignalPayload;
use super::WorkflowBackend;
use crate::WorkflowError;
use crate::WorkflowId;
use crate::WorkflowResult;
use crate::error::TaskPath;
use crate::error::runtime;

/// Represents a recorded signal delivery.
///
/// The router keeps a log of every delivery so callers can assert on
/// scheduled terminations without waiting for their timers.
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    /// The target workflow.
    pub target: WorkflowId,
    /// The reserved channel the signal was sent on.
    pub channel: &'static str,
    /// The time the delivery was scheduled for, when deferred.
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Routes signals between workflow instances by identifier.
#[derive(Default)]
pub struct SignalRouter {
    /// The signal senders of the registered instances.
    routes: Mutex<HashMap<WorkflowId, mpsc::UnboundedSender<SignalPayload>>>,
    /// The log of deliveries.
    log: Mutex<Vec<DeliveryRecord>>,
}

impl SignalRouter {
    /// Constructs a new router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an instance's signal sender.
    pub fn register(&self, id: WorkflowId, sender: mpsc::UnboundedSender<SignalPayload>) {
        self.routes
            .lock()
            .expect("routes lock poisoned")
            .insert(id, sender);
    }

    /// Unregisters an instance.
    pub fn unregister(&self, id: &WorkflowId) {
        self.routes.lock().expect("routes lock poisoned").remove(id);
    }

    /// Delivers a signal to the given instance.
    ///
    /// A termination signal scheduled for the future is held back by a timer
    /// and delivered when it fires.
    pub fn deliver(self: &Arc<Self>, target: &WorkflowId, signal: SignalPayload) -> WorkflowResult<()> {
        let scheduled_at = match &signal {
            SignalPayload::Terminate(request) => request.scheduled_at,
            SignalPayload::Resume(_) | SignalPayload::Event(_) => None,
        };

        self.log.lock().expect("log lock poisoned").push(DeliveryRecord {
            target: target.clone(),
            channel: signal.channel(),
            scheduled_at,
        });

        if let Some(at) = scheduled_at {
            let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            if !delay.is_zero() {
                let router = Arc::clone(self);
                let target = target.clone();
                info!(
                    "deferring `{channel}` signal for workflow `{target}` until {at}",
                    channel = signal.channel()
                );
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = router.deliver_now(&target, signal) {
                        debug!("deferred signal for workflow `{target}` was dropped: {e}");
                    }
                });
                return Ok(());
            }
        }

        self.deliver_now(target, signal)
    }

    /// Delivers a signal immediately.
    fn deliver_now(&self, target: &WorkflowId, signal: SignalPayload) -> WorkflowResult<()> {
        let routes = self.routes.lock().expect("routes lock poisoned");
        let sender = routes.get(target).ok_or_else(|| {
            runtime(
                format!("no live workflow instance `{target}`"),
                &TaskPath::new("/backend"),
            )
        })?;

        sender.send(signal).map_err(|_| {
            runtime(
                format!("workflow instance `{target}` is no longer receiving signals"),
                &TaskPath::new("/backend"),
            )
        })
    }

    /// Gets the log of deliveries.
    pub fn deliveries(&self) -> Vec<DeliveryRecord> {
        self.log.lock().expect("log lock poisoned").clone()
    }
}

/// Represents the local durable backend adapter.
pub struct LocalDurableBackend {
    /// The identifier of the workflow the backend serves.
    id: WorkflowId,
    /// The named activities registered with the backend.
    activities: Arc<ActivityRegistry>,
    /// The default activity options.
    options: ActivityOptions,
    /// The receiving half of the instance's signal channel.
    signals: tokio::sync::Mutex<mpsc::UnboundedReceiver<SignalPayload>>,
    /// The signal router shared across instances.
    router: Arc<SignalRouter>,
    /// The externally indexed fields.
    attributes: Mutex<IndexMap<String, Value>>,
    /// The cancellation token of the workflow.
    cancellation: CancellationToken,
    /// Whether a continue-as-new has been suggested.
    continue_as_new: AtomicBool,
    /// The number of activities executed so far.
    executed: AtomicU64,
    /// The number of activities after which continue-as-new is suggested.
    suggest_after: Option<u64>,
}

impl LocalDurableBackend {
    /// Constructs a new backend for the given workflow, registering it with
    /// the router.
    pub fn new(
        id: WorkflowId,
        activities: Arc<ActivityRegistry>,
        options: ActivityOptions,
        suggest_after: Option<u64>,
        router: Arc<SignalRouter>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        router.register(id.clone(), sender);

        Self {
            id,
            activities,
            options,
            signals: tokio::sync::Mutex::new(receiver),
            router,
            attributes: Mutex::new(Default::default()),
            cancellation: CancellationToken::new(),
            continue_as_new: AtomicBool::new(false),
            executed: AtomicU64::new(0),
            suggest_after,
        }
    }

    /// Gets the identifier of the workflow the backend serves.
    pub fn id(&self) -> &WorkflowId {
        &self.id
    }

    /// Gets the signal router of the backend.
    pub fn router(&self) -> &Arc<SignalRouter> {
        &self.router
    }

    /// Marks the backend as suggesting continue-as-new.
    pub fn suggest_continue_as_new(&self) {
        self.continue_as_new.store(true, Ordering::Relaxed);
    }
}

impl Drop for LocalDurableBackend {
    fn drop(&mut self) {
        self.router.unregister(&self.id);
    }
}

#[async_trait]
impl WorkflowBackend for LocalDurableBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Durable
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) -> WorkflowResult<()> {
        select! {
            // Poll the cancellation token before the timer
            biased;

            _ = self.cancellation.cancelled() => Err(WorkflowError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    async fn next_signal(&self) -> WorkflowResult<SignalPayload> {
        let mut signals = self.signals.lock().await;
        select! {
            // Poll the cancellation token before the channel
            biased;

            _ = self.cancellation.cancelled() => Err(WorkflowError::Cancelled),
            signal = signals.recv() => signal.ok_or(WorkflowError::Cancelled),
        }
    }

    async fn execute_activity(
        &self,
        name: &str,
        invocation: ActivityInvocation,
        options: &ActivityOptions,
    ) -> WorkflowResult<Value> {
        let activity = self.activities.get(name).ok_or_else(|| {
            runtime(
                format!("no activity registered under `{name}`"),
                &TaskPath::new(format!("/activities/{name}")),
            )
        })?;

        debug!(
            "executing activity `{name}` on task queue `{queue}`",
            queue = options.task_queue
        );

        let executed = self.executed.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(after) = self.suggest_after {
            if after > 0 && executed % after == 0 {
                self.continue_as_new.store(true, Ordering::Relaxed);
            }
        }

        let reference = TaskPath::new(format!("/activities/{name}"));
        select! {
            // Poll the cancellation token before the activity
            biased;

            _ = self.cancellation.cancelled() => Err(WorkflowError::Cancelled),
            result = tokio::time::timeout(options.start_to_close, activity(invocation)) => {
                match result {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(runtime(format!("activity `{name}` failed: {e:#}"), &reference)),
                    Err(_) => Err(runtime(
                        format!(
                            "activity `{name}` exceeded its start-to-close timeout of {timeout:?}",
                            timeout = options.start_to_close
                        ),
                        &reference,
                    )),
                }
            }
        }
    }

    async fn signal_external(
        &self,
        target: &WorkflowId,
        signal: SignalPayload,
    ) -> WorkflowResult<()> {
        self.router.deliver(target, signal)
    }

    fn upsert_search_attributes(&self, attributes: IndexMap<String, Value>) {
        let mut current = self.attributes.lock().expect("attributes lock poisoned");
        for (key, value) in attributes {
            current.insert(key, value);
        }
    }

    fn search_attributes(&self) -> IndexMap<String, Value> {
        self.attributes
            .lock()
            .expect("attributes lock poisoned")
            .clone()
    }

    fn info(&self) -> BackendInfo {
        BackendInfo {
            // The suggestion is consumed by observation so a restarted run
            // does not immediately restart again.
            continue_as_new_suggested: self.continue_as_new.swap(false, Ordering::Relaxed),
            current_build_id: "local-durable".to_string(),
        }
    }

    fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::ResumeInput;

    /// Constructs a backend wired to a fresh router.
    fn backend(id: &str) -> LocalDurableBackend {
        LocalDurableBackend::new(
            WorkflowId::from(id),
            Arc::new(ActivityRegistry::new()),
            ActivityOptions::default(),
            None,
            Arc::new(SignalRouter::new()),
        )
    }

    #[tokio::test]
    async fn signals_round_trip_through_the_router() {
        let backend = backend("wf-1");
        backend
            .router()
            .deliver(
                &WorkflowId::from("wf-1"),
                SignalPayload::Resume(ResumeInput {
                    entry_point: Some("revoke".to_string()),
                    input: serde_json::Value::Null,
                }),
            )
            .expect("delivery should succeed");

        match backend.next_signal().await.expect("signal should arrive") {
            SignalPayload::Resume(resume) => {
                assert_eq!(resume.entry_point.as_deref(), Some("revoke"));
            }
            other => panic!("unexpected signal on channel `{}`", other.channel()),
        }
    }

    #[tokio::test]
    async fn delivery_to_unknown_instance_fails() {
        let backend = backend("wf-2");
        let e = backend
            .router()
            .deliver(
                &WorkflowId::from("missing"),
                SignalPayload::Resume(ResumeInput::default()),
            )
            .expect_err("delivery should fail");
        assert!(e.to_string().contains("no live workflow instance"));
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_signal_wait() {
        let backend = backend("wf-3");
        backend.cancellation().cancel();
        let e = backend.next_signal().await.expect_err("should be cancelled");
        assert!(matches!(e, WorkflowError::Cancelled));
    }
}
