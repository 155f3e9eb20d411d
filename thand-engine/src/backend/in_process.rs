//! Implementation of the in-process backend.
//!
//! In-process instances run on the host's wall clock and have no signal
//! channels: a task that needs an external input surfaces the await-signal
//! sentinel, the runner parks the instance as `Waiting`, and the manager
//! later re-enters it at the stored entry point.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use indexmap::IndexMap;
use serde_json::Value;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;

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
use crate::error::runtime;
use crate::error::TaskPath;

/// Represents the in-process execution backend.
pub struct InProcessBackend {
    /// The named activities registered with the backend.
    activities: Arc<ActivityRegistry>,
    /// The externally indexed fields.
    attributes: Mutex<IndexMap<String, Value>>,
    /// The cancellation token of the workflow.
    cancellation: CancellationToken,
}

impl InProcessBackend {
    /// Constructs a new in-process backend with the given activities.
    pub fn new(activities: Arc<ActivityRegistry>) -> Self {
        Self {
            activities,
            attributes: Mutex::new(Default::default()),
            cancellation: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl WorkflowBackend for InProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::InProcess
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
        // No signal channels exist in-process; the runner translates this
        // into the `Waiting` status.
        Err(WorkflowError::AwaitSignal)
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

        debug!("executing activity `{name}` in-process");

        let reference = TaskPath::new(format!("/activities/{name}"));
        match tokio::time::timeout(options.start_to_close, activity(invocation)).await {
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

    async fn signal_external(
        &self,
        target: &WorkflowId,
        signal: SignalPayload,
    ) -> WorkflowResult<()> {
        Err(runtime(
            format!(
                "the in-process backend cannot signal workflow `{target}` on channel `{channel}`",
                channel = signal.channel()
            ),
            &TaskPath::new("/backend"),
        ))
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
            continue_as_new_suggested: false,
            current_build_id: "in-process".to_string(),
        }
    }

    fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn next_signal_surfaces_the_sentinel() {
        let backend = InProcessBackend::new(Arc::new(ActivityRegistry::new()));
        let e = backend.next_signal().await.expect_err("should not yield");
        assert!(e.is_await_signal());
    }

    #[tokio::test]
    async fn search_attributes_accumulate() {
        let backend = InProcessBackend::new(Arc::new(ActivityRegistry::new()));
        backend.upsert_search_attributes(
            [("status".to_string(), json!("Running"))].into_iter().collect(),
        );
        backend.upsert_search_attributes(
            [("approved".to_string(), json!(true))].into_iter().collect(),
        );

        let attributes = backend.search_attributes();
        assert_eq!(attributes.get("status"), Some(&json!("Running")));
        assert_eq!(attributes.get("approved"), Some(&json!(true)));
    }
}
