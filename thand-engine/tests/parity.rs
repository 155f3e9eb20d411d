//! Backend parity: absent suspension points, a document produces the same
//! output and instance context under both backends.

use pretty_assertions::assert_eq;
use serde_json::json;
use thand_engine::BackendConfig;
use thand_engine::Config;
use thand_engine::DurableBackendConfig;
use thand_engine::Engine;
use thand_engine::WorkflowManager;
use thand_engine::WorkflowSnapshot;
use thand_engine::WorkflowStatus;

mod common;

use common::document;

/// A suspension-free document exercising set, switch, for, try, and export.
const DOC: &str = r#"
document:
  dsl: "1.0.0"
  namespace: thand
  name: parity
  version: "0.1.0"
do:
  - init:
      set:
        values: [3, 1, 4, 1, 5]
      export:
        as: '${ { seeded: true } }'
  - sum:
      for:
        each: n
        in: '${ .values }'
      do:
        - add:
            set:
              values: '${ .values }'
              total: '${ (.total // 0) + $n }'
  - guarded:
      try:
        - check:
            switch:
              - small:
                  when: '${ .total <= 10 }'
                  then: fail
              - big:
                  then: exit
        - fail:
            raise:
              error:
                type: https://thand.io/errors/authorization
                status: 403
      catch:
        errors:
          with:
            status: 403
        do:
          - fallback:
              set:
                total: 0
  - report:
      then: end
      set:
        total: '${ .total }'
        seeded: '${ $context.seeded }'
"#;

/// Runs the document to completion and returns the final snapshot.
async fn run(engine: Engine) -> WorkflowSnapshot {
    let manager = WorkflowManager::new(engine);
    let (id, status) = manager
        .start(document(DOC), json!({}))
        .await
        .expect("workflow should start");

    let status = match status {
        WorkflowStatus::Running => manager.join(&id).await.expect("workflow should complete"),
        status => status,
    };
    assert_eq!(status, WorkflowStatus::Completed);

    manager.workflow_task(&id).await.expect("instance should exist")
}

#[tokio::test]
async fn both_backends_produce_equal_results() {
    let in_process = run(Engine::builder(Config::default())
        .build()
        .expect("engine should build"))
    .await;

    let durable = run(Engine::builder(Config {
        backend: BackendConfig::Durable(DurableBackendConfig::default()),
        ..Default::default()
    })
    .build()
    .expect("engine should build"))
    .await;

    assert_eq!(in_process.output, durable.output);
    assert_eq!(in_process.context, durable.context);
    assert_eq!(in_process.output, json!({ "total": 14, "seeded": true }));
}
