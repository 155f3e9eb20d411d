//! End-to-end scenarios over the in-process backend.

use pretty_assertions::assert_eq;
use serde_json::json;
use thand_engine::Config;
use thand_engine::Engine;
use thand_engine::WorkflowManager;
use thand_engine::WorkflowStatus;

mod common;

use common::document;

/// Builds a default in-process engine.
fn engine() -> Engine {
    Engine::builder(Config::default())
        .build()
        .expect("engine should build")
}

#[tokio::test]
async fn chained_set_threads_outputs() {
    let doc = document(
        r#"
document:
  name: chained-set
do:
  - init:
      set:
        x: 20
  - triple:
      set:
        tripled: '${ .x * 3 }'
"#,
    );

    let manager = WorkflowManager::new(engine());
    let (id, status) = manager
        .start(doc, json!({}))
        .await
        .expect("workflow should start");
    assert_eq!(status, WorkflowStatus::Completed);

    let snapshot = manager.workflow_task(&id).await.expect("instance should exist");
    assert_eq!(snapshot.output, json!({ "tripled": 60 }));
}

#[tokio::test]
async fn switch_falls_through_to_the_default_case() {
    let doc = document(
        r#"
document:
  name: switch-default
do:
  - choose:
      switch:
        - red:
            when: '${ .color == "red" }'
            then: red_path
        - green:
            when: '${ .color == "green" }'
            then: green_path
        - blue:
            when: '${ .color == "blue" }'
            then: blue_path
        - fallback:
            then: default_path
  - red_path:
      then: end
      set:
        colors: ["red"]
  - green_path:
      then: end
      set:
        colors: ["green"]
  - blue_path:
      then: end
      set:
        colors: ["blue"]
  - default_path:
      then: end
      set:
        colors: ["default"]
"#,
    );

    let manager = WorkflowManager::new(engine());
    let (id, status) = manager
        .start(doc, json!({ "color": "yellow" }))
        .await
        .expect("workflow should start");
    assert_eq!(status, WorkflowStatus::Completed);

    let snapshot = manager.workflow_task(&id).await.expect("instance should exist");
    assert_eq!(snapshot.output, json!({ "colors": ["default"] }));
}

#[tokio::test]
async fn switch_without_a_match_or_default_faults() {
    let doc = document(
        r#"
document:
  name: switch-no-match
do:
  - choose:
      switch:
        - red:
            when: '${ .color == "red" }'
            then: end
"#,
    );

    let manager = WorkflowManager::new(engine());
    let (id, status) = manager
        .start(doc, json!({ "color": "yellow" }))
        .await
        .expect("start should record the instance");
    assert_eq!(status, WorkflowStatus::Faulted);

    let snapshot = manager.workflow_task(&id).await.expect("instance should exist");
    assert_eq!(snapshot.status, WorkflowStatus::Faulted);
}

#[tokio::test]
async fn for_loop_collects_elements_and_indexes() {
    let doc = document(
        r#"
document:
  name: for-loop
do:
  - each:
      for:
        each: color
        in: '${ .colors }'
        at: i
      do:
        - collect:
            set:
              colors: '${ ($context.processed.colors // []) + [$color] }'
              indexes: '${ ($context.processed.indexes // []) + [$i] }'
            export:
              as: '${ { processed: . } }'
  - result:
      set:
        processed: '${ $context.processed }'
"#,
    );

    let manager = WorkflowManager::new(engine());
    let (id, status) = manager
        .start(doc, json!({ "colors": ["red", "green", "blue"] }))
        .await
        .expect("workflow should start");
    assert_eq!(status, WorkflowStatus::Completed);

    let snapshot = manager.workflow_task(&id).await.expect("instance should exist");
    assert_eq!(
        snapshot.output,
        json!({
            "processed": {
                "colors": ["red", "green", "blue"],
                "indexes": [0, 1, 2],
            }
        })
    );
}

#[tokio::test]
async fn skipped_tasks_leave_the_input_unchanged() {
    let doc = document(
        r#"
document:
  name: if-skip
do:
  - init:
      set:
        x: 1
  - skipped:
      if: '${ .x > 10 }'
      set:
        x: 999
  - done:
      set:
        x: '${ .x + 1 }'
"#,
    );

    let manager = WorkflowManager::new(engine());
    let (id, status) = manager
        .start(doc, json!({}))
        .await
        .expect("workflow should start");
    assert_eq!(status, WorkflowStatus::Completed);

    let snapshot = manager.workflow_task(&id).await.expect("instance should exist");
    assert_eq!(snapshot.output, json!({ "x": 2 }));
}

#[tokio::test]
async fn wait_with_zero_duration_completes_immediately() {
    let doc = document(
        r#"
document:
  name: zero-wait
do:
  - pause:
      wait: PT0S
  - done:
      set:
        ok: true
"#,
    );

    let manager = WorkflowManager::new(engine());
    let (id, status) = manager
        .start(doc, json!({}))
        .await
        .expect("workflow should start");
    assert_eq!(status, WorkflowStatus::Completed);

    let snapshot = manager.workflow_task(&id).await.expect("instance should exist");
    assert_eq!(snapshot.output, json!({ "ok": true }));
}

#[tokio::test]
async fn ephemeral_wait_over_a_minute_is_rejected_without_sleeping() {
    let doc = document(
        r#"
document:
  name: long-wait
do:
  - pause:
      wait: PT2M
"#,
    );

    let manager = WorkflowManager::new(engine());
    let started = std::time::Instant::now();
    let (_, status) = manager
        .start(doc, json!({}))
        .await
        .expect("start should record the instance");

    assert_eq!(status, WorkflowStatus::Faulted);
    assert!(
        started.elapsed() < std::time::Duration::from_secs(30),
        "the rejection must not sleep"
    );
}

#[tokio::test]
async fn flow_directive_to_a_missing_target_faults() {
    let doc = document(
        r#"
document:
  name: bad-jump
do:
  - choose:
      switch:
        - always:
            then: nowhere
"#,
    );

    let manager = WorkflowManager::new(engine());
    let (_, status) = manager
        .start(doc, json!({}))
        .await
        .expect("start should record the instance");
    assert_eq!(status, WorkflowStatus::Faulted);
}

#[tokio::test]
async fn try_catches_raised_errors_and_runs_the_catch_block() {
    let doc = document(
        r#"
document:
  name: try-catch
do:
  - guarded:
      try:
        - risky:
            raise:
              error:
                type: https://thand.io/errors/authorization
                status: 403
                title: denied by policy
      catch:
        errors:
          with:
            status: 403
        do:
          - recovered:
              set:
                caught: '${ $context.error.status }'
"#,
    );

    let manager = WorkflowManager::new(engine());
    let (id, status) = manager
        .start(doc, json!({}))
        .await
        .expect("workflow should start");
    assert_eq!(status, WorkflowStatus::Completed);

    let snapshot = manager.workflow_task(&id).await.expect("instance should exist");
    assert_eq!(snapshot.output, json!({ "caught": 403 }));
}

#[tokio::test]
async fn unmatched_errors_bubble_past_the_catch() {
    let doc = document(
        r#"
document:
  name: try-miss
do:
  - guarded:
      try:
        - risky:
            raise:
              error:
                type: https://thand.io/errors/authentication
                status: 401
      catch:
        errors:
          with:
            status: 403
        do:
          - recovered:
              set:
                caught: true
"#,
    );

    let manager = WorkflowManager::new(engine());
    let (_, status) = manager
        .start(doc, json!({}))
        .await
        .expect("start should record the instance");
    assert_eq!(status, WorkflowStatus::Faulted);
}

#[tokio::test]
async fn fork_returns_branch_outputs_in_source_order() {
    let doc = document(
        r#"
document:
  name: forked
do:
  - branches:
      fork:
        compete: false
        branches:
          - slow:
              do:
                - pause:
                    wait: PT0.2S
                - value:
                    set:
                      branch: slow
          - fast:
              set:
                branch: fast
"#,
    );

    let manager = WorkflowManager::new(engine());
    let (id, status) = manager
        .start(doc, json!({}))
        .await
        .expect("workflow should start");
    assert_eq!(status, WorkflowStatus::Completed);

    let snapshot = manager.workflow_task(&id).await.expect("instance should exist");
    assert_eq!(
        snapshot.output,
        json!([{ "branch": "slow" }, { "branch": "fast" }])
    );
}

#[tokio::test]
async fn competing_fork_returns_the_first_completion() {
    let doc = document(
        r#"
document:
  name: compete
do:
  - branches:
      fork:
        compete: true
        branches:
          - slow:
              do:
                - pause:
                    wait: PT5S
                - value:
                    set:
                      branch: slow
          - fast:
              set:
                branch: fast
"#,
    );

    let manager = WorkflowManager::new(engine());
    let (id, status) = manager
        .start(doc, json!({}))
        .await
        .expect("workflow should start");
    assert_eq!(status, WorkflowStatus::Completed);

    let snapshot = manager.workflow_task(&id).await.expect("instance should exist");
    assert_eq!(snapshot.output, json!({ "branch": "fast" }));
}

#[tokio::test]
async fn shell_run_captures_output_and_exit_code() {
    let dir = tempfile::tempdir().expect("should create a scratch directory");
    let marker = dir.path().join("ran");

    let doc = document(&format!(
        r#"
document:
  name: shell
do:
  - touch:
      run:
        shell:
          command: touch
          arguments: ["{marker}"]
  - greet:
      run:
        shell:
          command: echo
          arguments: ["hello"]
"#,
        marker = marker.display()
    ));

    let manager = WorkflowManager::new(engine());
    let (id, status) = manager
        .start(doc, json!({}))
        .await
        .expect("workflow should start");
    assert_eq!(status, WorkflowStatus::Completed);
    assert!(marker.exists(), "the first command should have run");

    let snapshot = manager.workflow_task(&id).await.expect("instance should exist");
    assert_eq!(snapshot.output["code"], json!(0));
    assert_eq!(snapshot.output["stdout"], json!("hello\n"));
}

#[tokio::test]
async fn emit_requires_the_durable_backend() {
    let doc = document(
        r#"
document:
  name: emit-in-process
do:
  - announce:
      emit:
        event:
          with:
            source: https://thand.io/test
            type: com.thand.approval
"#,
    );

    let manager = WorkflowManager::new(engine());
    let (_, status) = manager
        .start(doc, json!({}))
        .await
        .expect("start should record the instance");
    assert_eq!(status, WorkflowStatus::Faulted);
}

#[tokio::test]
async fn set_with_identity_transform_returns_the_input() {
    let doc = document(
        r#"
document:
  name: identity
do:
  - same:
      set: '${ . }'
"#,
    );

    let input = json!({ "x": 20, "nested": { "y": [1, 2, 3] } });
    let manager = WorkflowManager::new(engine());
    let (id, status) = manager
        .start(doc, input.clone())
        .await
        .expect("workflow should start");
    assert_eq!(status, WorkflowStatus::Completed);

    let snapshot = manager.workflow_task(&id).await.expect("instance should exist");
    assert_eq!(snapshot.output, input);
}
