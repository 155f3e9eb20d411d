//! Implementation of the scheduler bridge.
//!
//! In-process instances have no durable timers; scheduled revocation is
//! bridged through an at-time job that performs a self-callback over HTTP,
//! re-entering the instance at the recorded entry point.

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;
use tracing::warn;
use url::Url;

use crate::WorkflowId;
use crate::WorkflowSnapshot;

/// Represents a deferred self-callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledCallback {
    /// The instance to re-enter.
    pub workflow_id: WorkflowId,
    /// The root task key the re-entered run begins at.
    pub entry_point: Option<String>,
    /// The logical state of the instance at scheduling time.
    pub snapshot: WorkflowSnapshot,
}

/// Represents a scheduler of deferred self-callbacks.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Schedules a callback at the given wall-clock time.
    async fn schedule(&self, at: DateTime<Utc>, callback: ScheduledCallback)
    -> anyhow::Result<()>;
}

/// Represents a scheduler that posts the callback to an HTTP endpoint when
/// the scheduled time arrives.
pub struct HttpCallbackScheduler {
    /// The HTTP client used for the callback.
    client: reqwest::Client,
    /// The URL the callback is posted to.
    callback_url: Url,
}

impl HttpCallbackScheduler {
    /// Constructs a new scheduler posting to the given URL.
    pub fn new(callback_url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            callback_url,
        }
    }
}

#[async_trait]
impl Scheduler for HttpCallbackScheduler {
    async fn schedule(
        &self,
        at: DateTime<Utc>,
        callback: ScheduledCallback,
    ) -> anyhow::Result<()> {
        let delay = (at - Utc::now()).to_std().unwrap_or_default();
        let client = self.client.clone();
        let url = self.callback_url.clone();

        info!(
            "scheduling self-callback for workflow `{id}` at {at}",
            id = callback.workflow_id
        );

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            match client.post(url.clone()).json(&callback).send().await {
                Ok(response) if response.status().is_success() => {
                    info!(
                        "delivered self-callback for workflow `{id}`",
                        id = callback.workflow_id
                    );
                }
                Ok(response) => {
                    warn!(
                        "self-callback for workflow `{id}` returned status {status}",
                        id = callback.workflow_id,
                        status = response.status()
                    );
                }
                Err(e) => {
                    warn!(
                        "self-callback for workflow `{id}` failed: {e}",
                        id = callback.workflow_id
                    );
                }
            }
        });

        Ok(())
    }
}
