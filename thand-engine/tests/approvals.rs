//! Approval aggregation scenarios over the in-process backend.

use pretty_assertions::assert_eq;
use serde_json::json;
use thand_engine::Config;
use thand_engine::Engine;
use thand_engine::WorkflowId;
use thand_engine::WorkflowManager;
use thand_engine::WorkflowStatus;

mod common;

use common::MockProvider;
use common::RecordingScheduler;
use common::approval_event;
use common::document;
use common::elevation_input;

/// Builds an in-process engine with the mock provider and a recording
/// scheduler.
fn engine(provider: &std::sync::Arc<MockProvider>) -> Engine {
    Engine::builder(Config::default())
        .provider(provider.clone())
        .scheduler(RecordingScheduler::new())
        .build()
        .expect("engine should build")
}

/// Starts the canonical elevation workflow and parks it at the approvals
/// task.
async fn start_elevation(manager: &WorkflowManager, user: &str) -> WorkflowId {
    let (id, status) = manager
        .start(document(common::ELEVATION_DOC), elevation_input(user, "PT1H"))
        .await
        .expect("workflow should start");
    assert_eq!(status, WorkflowStatus::Waiting);

    let snapshot = manager.workflow_task(&id).await.expect("instance should exist");
    assert_eq!(snapshot.entry_point.as_deref(), Some("approvals"));
    id
}

#[tokio::test]
async fn denial_is_sticky_and_later_votes_are_ignored() {
    let provider = MockProvider::new("mock");
    let manager = WorkflowManager::new(engine(&provider));
    let id = start_elevation(&manager, "alice@example.com").await;

    // Required = 2 in the canonical document: one approval keeps waiting.
    let status = manager
        .deliver_event(&id, approval_event("user1@example.com", true))
        .await
        .expect("event should deliver");
    assert_eq!(status, WorkflowStatus::Waiting);

    // A single denial concludes the approvals immediately.
    let status = manager
        .deliver_event(&id, approval_event("user2@example.com", false))
        .await
        .expect("event should deliver");
    assert_eq!(status, WorkflowStatus::Completed);

    let snapshot = manager.workflow_task(&id).await.expect("instance should exist");
    assert_eq!(snapshot.output, json!({ "denied": true }));
    assert_eq!(snapshot.approved, Some(false));

    // The instance is no longer listening: the straggler's vote neither
    // resumes it nor lands in the ledger.
    manager
        .deliver_event(&id, approval_event("user3@example.com", true))
        .await
        .expect_err("a finished instance should not accept events");

    let snapshot = manager.workflow_task(&id).await.expect("instance should exist");
    let ledger = snapshot.context.get("approvals").expect("ledger should exist");
    assert!(ledger.get("user1@example.com").is_some());
    assert!(ledger.get("user2@example.com").is_some());
    assert!(ledger.get("user3@example.com").is_none());

    // Nothing was ever authorized.
    assert_eq!(provider.granted(), 0);
}

#[tokio::test]
async fn self_approval_by_the_requester_is_ignored() {
    let provider = MockProvider::new("mock");
    let manager = WorkflowManager::new(engine(&provider));
    let id = start_elevation(&manager, "alice@example.com").await;

    // The requester approving their own elevation does not count; the task
    // stays parked at its own key with an empty ledger.
    let status = manager
        .deliver_event(&id, approval_event("alice@example.com", true))
        .await
        .expect("event should deliver");
    assert_eq!(status, WorkflowStatus::Waiting);

    let snapshot = manager.workflow_task(&id).await.expect("instance should exist");
    assert_eq!(snapshot.entry_point.as_deref(), Some("approvals"));
    let ledger = snapshot.context.get("approvals").cloned().unwrap_or(json!({}));
    assert_eq!(ledger, json!({}));
}

#[tokio::test]
async fn self_approval_by_an_elevated_identity_is_ignored() {
    let provider = MockProvider::new("mock");
    let manager = WorkflowManager::new(engine(&provider));
    let id = start_elevation(&manager, "alice@example.com").await;

    // `svc-ops/cloud` is one of the identities being elevated; its approval
    // is filtered exactly like the requester's.
    let status = manager
        .deliver_event(&id, approval_event("svc-ops/cloud", true))
        .await
        .expect("event should deliver");
    assert_eq!(status, WorkflowStatus::Waiting);

    let snapshot = manager.workflow_task(&id).await.expect("instance should exist");
    let ledger = snapshot.context.get("approvals").cloned().unwrap_or(json!({}));
    assert_eq!(ledger, json!({}));
}

#[tokio::test]
async fn votes_are_deduplicated_by_identity() {
    let provider = MockProvider::new("mock");
    let manager = WorkflowManager::new(engine(&provider));
    let id = start_elevation(&manager, "alice@example.com").await;

    // The same approver voting twice holds a single ledger entry; a second
    // distinct approver is still required.
    for _ in 0..2 {
        let status = manager
            .deliver_event(&id, approval_event("user1@example.com", true))
            .await
            .expect("event should deliver");
        assert_eq!(status, WorkflowStatus::Waiting);
    }

    let snapshot = manager.workflow_task(&id).await.expect("instance should exist");
    let ledger = snapshot.context.get("approvals").expect("ledger should exist");
    assert_eq!(
        ledger.as_object().expect("ledger is a map").len(),
        1,
        "at most one entry per identity"
    );
}

#[tokio::test]
async fn enough_approvals_route_to_authorize() {
    let provider = MockProvider::new("mock");
    let manager = WorkflowManager::new(engine(&provider));
    let id = start_elevation(&manager, "alice@example.com").await;

    let status = manager
        .deliver_event(&id, approval_event("user1@example.com", true))
        .await
        .expect("event should deliver");
    assert_eq!(status, WorkflowStatus::Waiting);

    // The second approval concludes the vote and the authorize task grants
    // the elevation, parking the instance until its scheduled revocation.
    let status = manager
        .deliver_event(&id, approval_event("user2@example.com", true))
        .await
        .expect("event should deliver");
    assert_eq!(status, WorkflowStatus::Waiting);

    let snapshot = manager.workflow_task(&id).await.expect("instance should exist");
    assert_eq!(snapshot.approved, Some(true));
    assert_eq!(snapshot.entry_point.as_deref(), Some("authorize"));

    // One grant per (provider, identity) pair: one provider, two identities.
    assert_eq!(provider.granted(), 2);
    assert_eq!(provider.active().len(), 2);
}
