//! Pipeline scheduling, shared context and end-of-run cleanup

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

use tidyrun_cleanup::FailedCleanupStore;
use tidyrun_common::{GlobalConfig, SessionId, TrackedResource};
use tidyrun_e2e::definition::ActionStep;
use tidyrun_e2e::step::SideEffects;
use tidyrun_e2e::{
    Definition, E2eError, E2eResult, ExecutionContext, ExitStatus, NodeStatus, PipelineRunner,
    RunEnvironment, RunStatus, StepExecutor, StepOutcome,
};

/// `fail` fails, `create` tracks `{type, id}`, `emit` returns `value`;
/// everything else passes. Every action is recorded.
#[derive(Default)]
struct Scripted {
    seen: Mutex<Vec<String>>,
}

impl Scripted {
    fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl StepExecutor for Scripted {
    async fn execute(&self, action: &ActionStep, _ctx: &ExecutionContext) -> E2eResult<StepOutcome> {
        self.seen.lock().push(action.label());
        let param = |key: &str| {
            action
                .params
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        Ok(match action.action.as_str() {
            "fail" => StepOutcome::failed("scripted failure"),
            "create" => StepOutcome::passed().with_side_effects(SideEffects {
                tracked: vec![TrackedResource::new(param("type"), param("id"))],
                ..SideEffects::default()
            }),
            "emit" => StepOutcome::passed().with_value(param("value")),
            _ => StepOutcome::passed(),
        })
    }
}

fn write(dir: &Path, name: &str, content: &str) {
    fs::write(dir.join(name), content).unwrap();
}

fn workflow(dir: &Path, name: &str, action: &str) {
    write(
        dir,
        &format!("{}.yaml", name),
        &format!(
            "name: {name}\ntests:\n  - test:\n      name: {name}-test\n      steps:\n        - action: {action}\n          name: {name}\n"
        ),
    );
}

fn env(dir: &Path) -> RunEnvironment {
    RunEnvironment::new(SessionId::from("sess_pipeline"), GlobalConfig::default(), dir)
        .with_store(FailedCleanupStore::new(dir.join("failed")))
}

async fn run(dir: &Path, exec: &Scripted) -> E2eResult<tidyrun_e2e::PipelineResult> {
    let pipeline = Definition::load(&dir.join("pipeline.yaml"))?.into_pipeline();
    let env = env(dir);
    PipelineRunner::new(&env, exec).run(&pipeline).await
}

const CHAIN: &str = r#"
name: chain
workflows:
  - id: A
    file: a.yaml
  - id: B
    file: b.yaml
    depends_on: [A]
  - id: C
    file: c.yaml
    depends_on: [B]
"#;

#[tokio::test]
async fn failed_dependency_skips_downstream_nodes() {
    let dir = TempDir::new().unwrap();
    workflow(dir.path(), "a", "fail");
    workflow(dir.path(), "b", "ok");
    workflow(dir.path(), "c", "ok");
    write(dir.path(), "pipeline.yaml", CHAIN);

    let exec = Scripted::default();
    let result = run(dir.path(), &exec).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.exit_status(), ExitStatus::TestsFailed);
    assert_eq!(result.node("A").unwrap().status, NodeStatus::Failed);
    for id in ["B", "C"] {
        let node = result.node(id).unwrap();
        assert_eq!(node.status, NodeStatus::Skipped);
        assert!(node.reason.as_deref().unwrap().contains("dependencies not met"));
    }
    assert_eq!(exec.seen(), vec!["a"]);
}

#[tokio::test]
async fn fail_policy_stops_the_pipeline() {
    let dir = TempDir::new().unwrap();
    workflow(dir.path(), "a", "fail");
    workflow(dir.path(), "b", "ok");
    workflow(dir.path(), "c", "ok");
    write(
        dir.path(),
        "pipeline.yaml",
        &CHAIN.replace("    depends_on: [A]\n", "    depends_on: [A]\n    on_failure: fail\n"),
    );

    let exec = Scripted::default();
    let result = run(dir.path(), &exec).await.unwrap();

    let b = result.node("B").unwrap();
    assert_eq!(b.status, NodeStatus::Failed);
    assert!(b.reason.as_deref().unwrap().contains("dependencies failed"));
    let c = result.node("C").unwrap();
    assert_eq!(c.status, NodeStatus::Skipped);
    assert_eq!(c.reason.as_deref(), Some("pipeline stopped"));
    assert_eq!(exec.seen(), vec!["a"]);
}

#[tokio::test]
async fn ignore_policy_runs_despite_failure() {
    let dir = TempDir::new().unwrap();
    workflow(dir.path(), "a", "fail");
    workflow(dir.path(), "b", "ok");
    workflow(dir.path(), "c", "ok");
    write(dir.path(), "pipeline.yaml", &CHAIN.replace("name: chain", "name: chain\non_failure: ignore"));

    let exec = Scripted::default();
    let result = run(dir.path(), &exec).await.unwrap();

    assert_eq!(exec.seen(), vec!["a", "b", "c"]);
    assert_eq!(result.node("C").unwrap().status, NodeStatus::Passed);
    assert_eq!(result.status, RunStatus::Failed);
}

#[tokio::test]
async fn cycle_fails_before_anything_runs() {
    let dir = TempDir::new().unwrap();
    workflow(dir.path(), "a", "ok");
    workflow(dir.path(), "b", "ok");
    write(
        dir.path(),
        "pipeline.yaml",
        r#"
name: loop
workflows:
  - { id: A, file: a.yaml, depends_on: [B] }
  - { id: B, file: b.yaml, depends_on: [A] }
"#,
    );

    let exec = Scripted::default();
    match run(dir.path(), &exec).await {
        Err(E2eError::CycleDetected { nodes }) => assert_eq!(nodes, vec!["A", "B"]),
        other => panic!("expected a cycle error, got {:?}", other.map(|r| r.status)),
    }
    assert!(exec.seen().is_empty());
}

#[tokio::test]
async fn missing_workflow_file_is_a_node_failure() {
    let dir = TempDir::new().unwrap();
    workflow(dir.path(), "b", "ok");
    write(
        dir.path(),
        "pipeline.yaml",
        "name: p\nworkflows:\n  - { id: A, file: missing.yaml }\n  - { id: B, file: b.yaml }\n",
    );

    let exec = Scripted::default();
    let result = run(dir.path(), &exec).await.unwrap();

    let a = result.node("A").unwrap();
    assert_eq!(a.status, NodeStatus::Failed);
    assert!(a.reason.as_deref().unwrap().contains("missing.yaml"));
    assert_eq!(result.node("B").unwrap().status, NodeStatus::Passed);
}

#[tokio::test]
async fn node_outputs_flow_to_later_nodes() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "setup.yaml",
        "name: setup\ntests:\n  - test:\n      name: login\n      steps:\n        - { action: emit, value: tok-123, set: TOKEN }\n",
    );
    write(
        dir.path(),
        "use.yaml",
        "name: use\ntests:\n  - test:\n      name: use\n      steps:\n        - { action: check, token: \"${setup.TOKEN}\" }\n",
    );
    write(
        dir.path(),
        "pipeline.yaml",
        "name: p\nworkflows:\n  - { id: setup, file: setup.yaml }\n  - { id: use, file: use.yaml, depends_on: [setup] }\n",
    );

    #[derive(Default)]
    struct Capture(Mutex<Option<String>>);

    #[async_trait]
    impl StepExecutor for Capture {
        async fn execute(&self, action: &ActionStep, _ctx: &ExecutionContext) -> E2eResult<StepOutcome> {
            if let Some(token) = action.params.get("token").and_then(|v| v.as_str()) {
                *self.0.lock() = Some(token.to_string());
            }
            Ok(match action.params.get("value").and_then(|v| v.as_str()) {
                Some(value) => StepOutcome::passed().with_value(value),
                None => StepOutcome::passed(),
            })
        }
    }

    let pipeline = Definition::load(&dir.path().join("pipeline.yaml")).unwrap().into_pipeline();
    let env = env(dir.path());
    let exec = Capture::default();
    let result = PipelineRunner::new(&env, &exec).run(&pipeline).await.unwrap();

    assert_eq!(result.status, RunStatus::Passed);
    assert_eq!(exec.0.lock().as_deref(), Some("tok-123"));
}

const HANDLERS: &str = r#"
handlers:
  remove:
    command: "echo ${type}:${id} >> deleted.log"
types:
  row: remove
  file: remove
"#;

fn tracking_pipeline(dir: &Path, cleanup_on_failure: bool, second_action: &str) {
    write(dir, "cleanup.handlers.yaml", HANDLERS);
    write(
        dir,
        "first.yaml",
        "name: first\ntests:\n  - test:\n      name: make-row\n      steps:\n        - { action: create, type: row, id: r1 }\n",
    );
    write(
        dir,
        "second.yaml",
        &format!(
            "name: second\ncleanup_on_failure: {cleanup_on_failure}\ntests:\n  - test:\n      name: make-file\n      steps:\n        - {{ action: create, type: file, id: f1 }}\n        - {{ action: {second_action} }}\n"
        ),
    );
    write(
        dir,
        "pipeline.yaml",
        r#"
name: tracked
cleanup:
  provider: custom
  retries: 1
  handlers: [cleanup.handlers.yaml]
workflows:
  - { id: first, file: first.yaml }
  - { id: second, file: second.yaml }
"#,
    );
}

#[tokio::test]
async fn cleanup_runs_once_after_all_nodes() {
    let dir = TempDir::new().unwrap();
    tracking_pipeline(dir.path(), true, "ok");

    let exec = Scripted::default();
    let result = run(dir.path(), &exec).await.unwrap();

    assert_eq!(result.exit_status(), ExitStatus::Passed);
    for node in &result.nodes {
        assert!(node.workflow.as_ref().unwrap().cleanup.is_none());
    }
    let cleanup = result.cleanup.expect("pipeline cleanup");
    assert!(cleanup.success);
    assert_eq!(cleanup.deleted.len(), 2);

    let log = fs::read_to_string(dir.path().join("deleted.log")).unwrap();
    let mut lines: Vec<_> = log.lines().collect();
    lines.sort();
    assert_eq!(lines, vec!["file:f1", "row:r1"]);
}

#[tokio::test]
async fn cleanup_on_failure_off_leaves_resources() {
    let dir = TempDir::new().unwrap();
    tracking_pipeline(dir.path(), false, "fail");

    let exec = Scripted::default();
    let result = run(dir.path(), &exec).await.unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.cleanup.is_none());
    assert!(!dir.path().join("deleted.log").exists());
}

#[tokio::test]
async fn failed_cleanup_is_persisted_and_reported() {
    let dir = TempDir::new().unwrap();
    tracking_pipeline(dir.path(), true, "ok");
    write(
        dir.path(),
        "cleanup.handlers.yaml",
        "handlers:\n  remove:\n    command: \"exit 1\"\ntypes:\n  row: remove\n  file: remove\n",
    );

    let exec = Scripted::default();
    let result = run(dir.path(), &exec).await.unwrap();

    assert_eq!(result.status, RunStatus::Passed);
    assert_eq!(result.exit_status(), ExitStatus::CleanupFailed);

    let records = FailedCleanupStore::new(dir.path().join("failed")).list().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].session_id, SessionId::from("sess_pipeline"));
    assert_eq!(records[0].resources.len(), 2);
}

#[tokio::test]
async fn failed_node_reason_names_the_failing_test() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "a.yaml",
        r#"
name: a
viewports: [ { width: 375, height: 667 }, { width: 1280, height: 720 } ]
tests:
  - test: { name: login, steps: [ { action: ok } ] }
  - test: { name: checkout, steps: [ { action: fail } ] }
  - test: { name: receipt, steps: [ { action: ok } ] }
"#,
    );
    write(dir.path(), "pipeline.yaml", "name: single\nworkflows:\n  - id: A\n    file: a.yaml\n");

    let exec = Scripted::default();
    let result = run(dir.path(), &exec).await.unwrap();

    let a = result.node("A").unwrap();
    assert_eq!(a.status, NodeStatus::Failed);
    assert!(a.reason.as_deref().unwrap().contains("scripted failure"));
    // Both sizes replay; the test after the failure is not attempted in either.
    assert_eq!(exec.seen(), vec!["ok", "fail", "ok", "fail"]);
    assert_eq!(a.workflow.as_ref().unwrap().tests.len(), 6);
}
