//! Universal invariants of the sequencer and the runner.

use pretty_assertions::assert_eq;
use serde_json::json;
use thand_engine::Config;
use thand_engine::Engine;
use thand_engine::Runner;
use thand_engine::TaskStatus;
use thand_engine::WorkflowContext;
use thand_engine::WorkflowId;
use thand_engine::WorkflowStatus;

mod common;

use common::document;

/// Builds a runner over a fresh in-process instance of the given document.
fn runner(doc: &str) -> Runner {
    let engine = Engine::builder(Config::default())
        .build()
        .expect("engine should build");

    let document = document(doc);
    let id = WorkflowId::generate();
    let backend = engine.new_backend(&id);
    let context = WorkflowContext::new(id, document, backend);

    Runner::new(engine, context)
}

#[tokio::test]
async fn tasks_progress_monotonically_and_skipped_tasks_appear_in_no_state() {
    let mut runner = runner(
        r#"
document:
  name: transitions
do:
  - first:
      set:
        x: 1
  - skipped:
      if: '${ .x > 10 }'
      set:
        x: 999
  - second:
      set:
        x: '${ .x + 1 }'
"#,
    );

    let status = runner.run(json!({})).await.expect("workflow should complete");
    assert_eq!(status, WorkflowStatus::Completed);

    let transitions = runner.context().transitions();

    let statuses_of = |name: &str| -> Vec<TaskStatus> {
        transitions
            .iter()
            .filter(|t| t.name == name)
            .map(|t| t.status)
            .collect()
    };

    assert_eq!(
        statuses_of("first"),
        [TaskStatus::Pending, TaskStatus::Running, TaskStatus::Completed]
    );
    assert_eq!(
        statuses_of("second"),
        [TaskStatus::Pending, TaskStatus::Running, TaskStatus::Completed]
    );
    assert!(statuses_of("skipped").is_empty());
}

#[tokio::test]
async fn faulted_tasks_record_the_faulted_transition() {
    let mut runner = runner(
        r#"
document:
  name: faulting
do:
  - boom:
      raise:
        error:
          type: https://thand.io/errors/runtime
          status: 500
"#,
    );

    runner.run(json!({})).await.expect_err("workflow should fault");
    assert_eq!(runner.context().status(), WorkflowStatus::Faulted);

    let statuses: Vec<TaskStatus> = runner
        .context()
        .transitions()
        .iter()
        .map(|t| t.status)
        .collect();
    assert_eq!(
        statuses,
        [TaskStatus::Pending, TaskStatus::Running, TaskStatus::Faulted]
    );
}

#[tokio::test]
async fn cleanup_runs_exactly_once_per_terminal_status() {
    // Completed.
    let mut completed = runner(
        r#"
document:
  name: completes
do:
  - done:
      set:
        ok: true
"#,
    );
    completed.run(json!({})).await.expect("workflow should complete");
    assert_eq!(completed.cleanup_count(), 1);

    // Faulted.
    let mut faulted = runner(
        r#"
document:
  name: faults
do:
  - boom:
      raise:
        error:
          type: https://thand.io/errors/runtime
          status: 500
"#,
    );
    faulted.run(json!({})).await.expect_err("workflow should fault");
    assert_eq!(faulted.cleanup_count(), 1);

    // Cancelled.
    let mut cancelled = runner(
        r#"
document:
  name: cancels
do:
  - done:
      set:
        ok: true
"#,
    );
    cancelled.cancel(Some("test")).await.expect("cancel should succeed");
    assert_eq!(cancelled.cleanup_count(), 1);
}

#[tokio::test]
async fn parked_instances_do_not_clean_up() {
    let mut parked = runner(
        r#"
document:
  name: parks
do:
  - wait_for_event:
      listen:
        to:
          one:
            with:
              type: com.thand.alert
"#,
    );

    let status = parked.run(json!({})).await.expect("parking is not an error");
    assert_eq!(status, WorkflowStatus::Waiting);
    assert_eq!(parked.cleanup_count(), 0);
    assert_eq!(parked.context().entry_point(), Some("wait_for_event"));
}

#[tokio::test]
async fn search_attributes_track_the_instance() {
    let mut runner = runner(
        r#"
document:
  name: attributes
do:
  - done:
      set:
        ok: true
"#,
    );

    runner.run(json!({})).await.expect("workflow should complete");

    let attributes = runner.context().backend().search_attributes();
    assert_eq!(attributes.get("status"), Some(&json!("Completed")));
    assert_eq!(attributes.get("workflow"), Some(&json!("attributes")));
}
