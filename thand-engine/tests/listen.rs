//! Listener predicate scenarios over the durable backend.

use pretty_assertions::assert_eq;
use serde_json::json;
use thand_engine::BackendConfig;
use thand_engine::Config;
use thand_engine::DurableBackendConfig;
use thand_engine::Engine;
use thand_engine::ListenAllMode;
use thand_engine::ListenConfig;
use thand_engine::WorkflowManager;
use thand_engine::WorkflowStatus;
use thand_model::ALERT_EVENT_TYPE;
use thand_model::APPROVAL_EVENT_TYPE;
use thand_model::CloudEvent;

mod common;

use common::document;

/// Builds a durable engine with the given `all` semantics.
fn engine(all_mode: ListenAllMode) -> Engine {
    Engine::builder(Config {
        backend: BackendConfig::Durable(DurableBackendConfig::default()),
        listen: ListenConfig { all_mode },
        ..Default::default()
    })
    .build()
    .expect("engine should build")
}

/// A document listening across two event types.
const ALL_DOC: &str = r#"
document:
  name: listen-all
do:
  - gather:
      listen:
        to:
          all:
            - with:
                type: com.thand.approval
            - with:
                type: com.thand.alert
"#;

/// Builds an alert event of the given level.
fn alert(level: &str) -> CloudEvent {
    CloudEvent::new("https://thand.io/test", ALERT_EVENT_TYPE)
        .with_data(json!({ "level": level }))
}

#[tokio::test]
async fn first_match_mode_terminates_on_any_filter() {
    let manager = WorkflowManager::new(engine(ListenAllMode::FirstMatch));
    let (id, _) = manager
        .start(document(ALL_DOC), json!({}))
        .await
        .expect("workflow should start");

    // One matching event of either type ends the listen.
    manager
        .deliver_event(&id, alert("info"))
        .await
        .expect("event should deliver");

    let status = manager.join(&id).await.expect("workflow should complete");
    assert_eq!(status, WorkflowStatus::Completed);

    let snapshot = manager.workflow_task(&id).await.expect("instance should exist");
    assert_eq!(snapshot.output["type"], json!(ALERT_EVENT_TYPE));
}

#[tokio::test]
async fn all_types_mode_requires_every_filter_to_match() {
    let manager = WorkflowManager::new(engine(ListenAllMode::AllTypes));
    let (id, _) = manager
        .start(document(ALL_DOC), json!({}))
        .await
        .expect("workflow should start");

    manager
        .deliver_event(&id, alert("info"))
        .await
        .expect("event should deliver");
    manager
        .deliver_event(
            &id,
            common::approval_event("user1@example.com", true),
        )
        .await
        .expect("event should deliver");

    let status = manager.join(&id).await.expect("workflow should complete");
    assert_eq!(status, WorkflowStatus::Completed);

    // The listen returned the event that completed the set.
    let snapshot = manager.workflow_task(&id).await.expect("instance should exist");
    assert_eq!(snapshot.output["type"], json!(APPROVAL_EVENT_TYPE));
}

#[tokio::test]
async fn until_condition_filters_matching_events() {
    let doc = document(
        r#"
document:
  name: listen-until
do:
  - escalation:
      listen:
        to:
          until:
            event:
              with:
                type: com.thand.alert
            condition: '${ .data.level == "critical" }'
"#,
    );

    let manager = WorkflowManager::new(engine(ListenAllMode::FirstMatch));
    let (id, _) = manager
        .start(doc, json!({}))
        .await
        .expect("workflow should start");

    // A matching type with a non-matching condition re-arms the listen.
    manager
        .deliver_event(&id, alert("warning"))
        .await
        .expect("event should deliver");
    manager
        .deliver_event(&id, alert("critical"))
        .await
        .expect("event should deliver");

    let status = manager.join(&id).await.expect("workflow should complete");
    assert_eq!(status, WorkflowStatus::Completed);

    let snapshot = manager.workflow_task(&id).await.expect("instance should exist");
    assert_eq!(snapshot.output["data"], json!({ "level": "critical" }));
}

#[tokio::test]
async fn non_matching_events_are_ignored() {
    let doc = document(
        r#"
document:
  name: listen-one
do:
  - wait_for_alert:
      listen:
        to:
          one:
            with:
              type: com.thand.alert
"#,
    );

    let manager = WorkflowManager::new(engine(ListenAllMode::FirstMatch));
    let (id, _) = manager
        .start(doc, json!({}))
        .await
        .expect("workflow should start");

    manager
        .deliver_event(
            &id,
            common::approval_event("user1@example.com", true),
        )
        .await
        .expect("event should deliver");
    manager
        .deliver_event(&id, alert("critical"))
        .await
        .expect("event should deliver");

    let status = manager.join(&id).await.expect("workflow should complete");
    assert_eq!(status, WorkflowStatus::Completed);

    let snapshot = manager.workflow_task(&id).await.expect("instance should exist");
    assert_eq!(snapshot.output["type"], json!(ALERT_EVENT_TYPE));
}
