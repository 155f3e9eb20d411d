//! Implementation of the notify task.

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use serde_json::json;
use thand_model::NotifierRequest;
use thand_model::NotifyParams;
use tokio::task::JoinSet;
use tracing::debug;
use tracing::warn;

use crate::Engine;
use crate::TaskContext;
use crate::WorkflowResult;
use crate::eval::TaskOutcome;
use crate::provider::Notification;

/// Fans a rendered payload out to each recipient of each notifier request.
///
/// Notification failures are logged and do not fail the caller; the number
/// of successful deliveries is returned.
pub(crate) async fn fan_out(
    engine: &Engine,
    notifiers: &IndexMap<String, NotifierRequest>,
    subject: &str,
    body: &Value,
) -> usize {
    let mut set = JoinSet::new();

    for (key, request) in notifiers {
        let Some(notifier) = engine.providers().notifier(&request.provider) else {
            warn!(
                "notifier `{key}` names an unknown provider `{provider}`; skipping",
                provider = request.provider
            );
            continue;
        };

        for recipient in &request.recipients {
            let notifier = Arc::clone(notifier);
            let notification = Notification {
                recipient: recipient.clone(),
                subject: request.message.clone().unwrap_or_else(|| subject.to_string()),
                body: body.clone(),
            };

            set.spawn(async move {
                let recipient = notification.recipient.clone();
                notifier
                    .notify(notification)
                    .await
                    .map_err(|e| (recipient, e))
            });
        }
    }

    let mut delivered = 0;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(())) => delivered += 1,
            Ok(Err((recipient, e))) => {
                warn!("failed to notify `{recipient}`: {e:#}");
            }
            Err(e) => warn!("notification task panicked: {e}"),
        }
    }

    debug!("delivered {delivered} notifications");
    delivered
}

/// Executes a notify task: a single fan-out of the task input to each
/// recipient via the notification providers.
pub(crate) async fn execute(
    task: &mut TaskContext<'_>,
    params: &NotifyParams,
    input: Value,
) -> WorkflowResult<TaskOutcome> {
    let delivered = fan_out(task.engine, &params.notifiers, "notification", &input).await;
    Ok(TaskOutcome::Output(json!({ "notified": delivered })))
}
