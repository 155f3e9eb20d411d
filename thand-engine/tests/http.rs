//! HTTP caller scenarios.

use pretty_assertions::assert_eq;
use serde_json::json;
use thand_engine::Config;
use thand_engine::Engine;
use thand_engine::WorkflowManager;
use thand_engine::WorkflowStatus;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path;

mod common;

use common::document;

/// Builds a default in-process engine.
fn engine() -> Engine {
    Engine::builder(Config::default())
        .build()
        .expect("engine should build")
}

#[tokio::test]
async fn response_mode_returns_the_full_envelope() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/pets/42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "rex" })))
        .mount(&server)
        .await;

    let doc = document(&format!(
        r#"
document:
  name: http-response
do:
  - fetch:
      call: http
      with:
        method: get
        endpoint: "{uri}/pets/{{petId}}"
        petId: "42"
        output: response
"#,
        uri = server.uri()
    ));

    let manager = WorkflowManager::new(engine());
    let (id, status) = manager
        .start(doc, json!({}))
        .await
        .expect("workflow should start");
    assert_eq!(status, WorkflowStatus::Completed);

    let snapshot = manager.workflow_task(&id).await.expect("instance should exist");
    let envelope = snapshot.output.as_object().expect("envelope is a map");

    // The envelope always carries the request echo, the status, and the
    // headers; `content` is present because the body parsed.
    assert!(envelope.contains_key("request"));
    assert_eq!(envelope.get("statusCode"), Some(&json!(200)));
    assert!(envelope.contains_key("headers"));
    assert_eq!(envelope.get("content"), Some(&json!({ "name": "rex" })));

    assert_eq!(snapshot.output["request"]["method"], json!("GET"));
    assert_eq!(
        snapshot.output["request"]["uri"],
        json!(format!("{uri}/pets/42", uri = server.uri()))
    );
}

#[tokio::test]
async fn response_mode_omits_content_for_an_empty_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/empty"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let doc = document(&format!(
        r#"
document:
  name: http-empty
do:
  - fetch:
      call: http
      with:
        method: get
        endpoint: "{uri}/empty"
        output: response
"#,
        uri = server.uri()
    ));

    let manager = WorkflowManager::new(engine());
    let (id, status) = manager
        .start(doc, json!({}))
        .await
        .expect("workflow should start");
    assert_eq!(status, WorkflowStatus::Completed);

    let snapshot = manager.workflow_task(&id).await.expect("instance should exist");
    let envelope = snapshot.output.as_object().expect("envelope is a map");
    assert_eq!(envelope.get("statusCode"), Some(&json!(204)));
    assert!(
        !envelope.contains_key("content"),
        "`content` is present iff the body parsed"
    );
}

#[tokio::test]
async fn content_mode_returns_the_parsed_body_and_faults_on_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let ok = document(&format!(
        r#"
document:
  name: http-content
do:
  - fetch:
      call: http
      with:
        method: get
        endpoint: "{uri}/ok"
"#,
        uri = server.uri()
    ));

    let manager = WorkflowManager::new(engine());
    let (id, status) = manager
        .start(ok, json!({}))
        .await
        .expect("workflow should start");
    assert_eq!(status, WorkflowStatus::Completed);
    let snapshot = manager.workflow_task(&id).await.expect("instance should exist");
    assert_eq!(snapshot.output, json!({ "ok": true }));

    let missing = document(&format!(
        r#"
document:
  name: http-content-missing
do:
  - fetch:
      call: http
      with:
        method: get
        endpoint: "{uri}/missing"
"#,
        uri = server.uri()
    ));

    let (_, status) = manager
        .start(missing, json!({}))
        .await
        .expect("start should record the instance");
    assert_eq!(status, WorkflowStatus::Faulted);
}

#[tokio::test]
async fn template_variables_resolve_from_the_task_input() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/alice"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "user": "alice" })))
        .mount(&server)
        .await;

    let doc = document(&format!(
        r#"
document:
  name: http-template-input
do:
  - fetch:
      call: http
      with:
        method: get
        endpoint: "{uri}/users/{{name}}"
"#,
        uri = server.uri()
    ));

    let manager = WorkflowManager::new(engine());
    let (id, status) = manager
        .start(doc, json!({ "name": "alice" }))
        .await
        .expect("workflow should start");
    assert_eq!(status, WorkflowStatus::Completed);

    let snapshot = manager.workflow_task(&id).await.expect("instance should exist");
    assert_eq!(snapshot.output, json!({ "user": "alice" }));
}
