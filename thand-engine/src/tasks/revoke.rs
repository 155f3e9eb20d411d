//! Implementation of the revoke task.

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use serde_json::json;
use thand_model::RevokeParams;
use tokio::task::JoinSet;
use tracing::info;
use tracing::warn;

use super::notify;
use crate::TaskContext;
use crate::WorkflowError;
use crate::WorkflowResult;
use crate::error::runtime;
use crate::error::validation;
use crate::eval::TaskOutcome;
use crate::provider::AuthorizeRoleResponse;
use crate::provider::ProviderRegistry;
use crate::provider::RevokeRoleRequest;

/// The instance context key recorded authorizations are stored under.
pub const AUTHORIZATIONS_CONTEXT_KEY: &str = "authorizations";

/// Revokes every recorded authorization through its provider, in parallel.
///
/// Returns the keys of the revoked grants and the causes of the failed
/// ones.
pub(crate) async fn revoke_all(
    providers: &ProviderRegistry,
    authorizations: &IndexMap<String, AuthorizeRoleResponse>,
) -> (Vec<String>, Vec<String>) {
    let mut set = JoinSet::new();

    for (key, authorization) in authorizations {
        let Some(provider) = providers.provider(&authorization.provider) else {
            warn!(
                "recorded authorization `{key}` names an unknown provider `{provider}`",
                provider = authorization.provider
            );
            continue;
        };

        let provider = Arc::clone(provider);
        let key = key.clone();
        let request = RevokeRoleRequest {
            authorization: authorization.clone(),
        };

        set.spawn(async move {
            let result = provider.revoke_role(request).await;
            (key, result)
        });
    }

    let mut revoked = Vec::new();
    let mut failures = Vec::new();

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((key, Ok(()))) => revoked.push(key),
            Ok((key, Err(e))) => failures.push(format!("{key}: {e:#}")),
            Err(e) => failures.push(format!("revocation task panicked: {e}")),
        }
    }

    (revoked, failures)
}

/// Executes a revoke task: mirrors the authorize fan-out, calling each
/// provider with its stored authorization response.
///
/// Revocation is idempotent across retries: revoked grants are removed from
/// the instance context, so a re-entered run only retries the failed ones.
pub(crate) async fn execute(
    task: &mut TaskContext<'_>,
    params: &RevokeParams,
    input: Value,
) -> WorkflowResult<TaskOutcome> {
    let _ = input;
    let now = task.workflow.backend().now();

    let authorizations: IndexMap<String, AuthorizeRoleResponse> =
        match task.workflow.context_key(AUTHORIZATIONS_CONTEXT_KEY) {
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                validation(format!("invalid recorded authorizations: {e}"), task.reference)
            })?,
            None => IndexMap::new(),
        };

    if authorizations.is_empty() {
        return Ok(TaskOutcome::Output(json!({
            "revoked_at": now.to_rfc3339(),
            "revoked": [],
        })));
    }

    let (revoked, failures) = revoke_all(task.engine.providers(), &authorizations).await;

    if revoked.is_empty() && !failures.is_empty() {
        return Err(WorkflowError::RevocationFailed {
            causes: failures,
            reference: task.reference.clone(),
        });
    }

    for failure in &failures {
        warn!("revocation partially failed: {failure}");
    }

    let mut remaining = authorizations;
    for key in &revoked {
        remaining.shift_remove(key);
    }
    let value = serde_json::to_value(&remaining)
        .map_err(|e| runtime(format!("failed to serialize authorizations: {e}"), task.reference))?;
    task.workflow.set_context_key(AUTHORIZATIONS_CONTEXT_KEY, value);

    info!(
        "revoked {count} grants ({remaining} remaining)",
        count = revoked.len(),
        remaining = remaining.len()
    );

    let delivered = notify::fan_out(
        task.engine,
        &params.notifiers,
        "access revoked",
        &json!({ "revoked": revoked, "revoked_at": now.to_rfc3339() }),
    )
    .await;
    tracing::debug!("notified {delivered} recipients of the revocation");

    Ok(TaskOutcome::Output(json!({
        "revoked_at": now.to_rfc3339(),
        "revoked": revoked,
    })))
}
