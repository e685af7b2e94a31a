//! Step execution
//!
//! The core never interprets an action. It interpolates the action's
//! parameters, hands it to a [`StepExecutor`], and folds the reported side
//! effects back into the [`ExecutionContext`].

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use tidyrun_common::TrackedResource;

use crate::context::ExecutionContext;
use crate::definition::{resolve_path, ActionStep, Step, StepFile, Variables, Viewport};
use crate::error::{E2eError, E2eResult};
use crate::interpolate::{interpolate, interpolate_value, is_truthy};

/// Includes nested deeper than this are treated as a loop.
const MAX_INCLUDE_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Passed,
    Failed,
}

/// What the executor reports back for one action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    pub status: StepStatus,
    #[serde(default)]
    pub error: Option<String>,
    /// Value stored under the action's `set` variable
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub side_effects: SideEffects,
}

impl StepOutcome {
    pub fn passed() -> Self {
        Self {
            status: StepStatus::Passed,
            error: None,
            value: None,
            side_effects: SideEffects::default(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            error: Some(error.into()),
            ..Self::passed()
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_side_effects(mut self, side_effects: SideEffects) -> Self {
        self.side_effects = side_effects;
        self
    }
}

/// Changes an action made that the core must know about
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SideEffects {
    #[serde(default)]
    pub variables: Variables,
    /// Resources the action created
    #[serde(default)]
    pub tracked: Vec<TrackedResource>,
    /// Resources the action observed being deleted, as `{type, id}`
    #[serde(default)]
    pub deleted: Vec<DeletedRef>,
    #[serde(default)]
    pub email: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletedRef {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub id: String,
}

/// The browser-automation collaborator.
///
/// One executor drives one browser session. Steps are executed strictly
/// one at a time.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Open a fresh page, optionally at a viewport size. Called once per
    /// workflow replay.
    async fn open_page(&self, _viewport: Option<Viewport>) -> E2eResult<()> {
        Ok(())
    }

    /// Execute one (already interpolated) action.
    async fn execute(&self, action: &ActionStep, ctx: &ExecutionContext) -> E2eResult<StepOutcome>;

    /// Release the session.
    async fn close(&self) -> E2eResult<()> {
        Ok(())
    }
}

/// Record of one executed action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StepOptions {
    /// Timeout for actions without their own `timeout_ms`
    pub default_timeout: Duration,
    /// Directory relative includes resolve against
    pub base_dir: PathBuf,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(30_000),
            base_dir: PathBuf::from("."),
        }
    }
}

/// Outcome of a step list
#[derive(Debug, Clone, Default)]
pub struct StepsOutcome {
    pub records: Vec<StepRecord>,
    /// First failure, if any; execution stops there
    pub error: Option<String>,
}

impl StepsOutcome {
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }
}

/// Execute a step list within a context.
///
/// Inline groups and included files run through this same function, so
/// nested steps behave exactly like top-level ones.
pub async fn execute_steps(
    steps: &[Step],
    ctx: &mut ExecutionContext,
    executor: &dyn StepExecutor,
    opts: &StepOptions,
) -> StepsOutcome {
    let mut outcome = StepsOutcome::default();
    execute_list(steps, ctx, executor, opts, &opts.base_dir, 0, &mut outcome).await;
    outcome
}

fn execute_list<'a>(
    steps: &'a [Step],
    ctx: &'a mut ExecutionContext,
    executor: &'a dyn StepExecutor,
    opts: &'a StepOptions,
    base_dir: &'a Path,
    depth: usize,
    outcome: &'a mut StepsOutcome,
) -> BoxFuture<'a, ()> {
    Box::pin(async move {
        for step in steps {
            match step {
                Step::Action(action) => {
                    let record = execute_action(action, ctx, executor, opts).await;
                    let failed = record.status == StepStatus::Failed;
                    if failed {
                        outcome.error = Some(format!(
                            "{}: {}",
                            record.name,
                            record.error.clone().unwrap_or_else(|| "failed".to_string())
                        ));
                    }
                    outcome.records.push(record);
                    if failed {
                        return;
                    }
                }
                Step::Group { group } => {
                    if let Some(condition) = &group.when {
                        let value = interpolate(condition, ctx);
                        if !is_truthy(&value) {
                            debug!(group = ?group.name, condition = %condition, "Skipping group");
                            continue;
                        }
                    }
                    execute_list(&group.steps, ctx, executor, opts, base_dir, depth, outcome).await;
                }
                Step::Include { include, variables } => {
                    let path = resolve_path(base_dir, Path::new(&interpolate(&include.to_string_lossy(), ctx)));
                    if depth >= MAX_INCLUDE_DEPTH {
                        outcome.error = Some(format!(
                            "include depth exceeded at {}",
                            path.display()
                        ));
                        return;
                    }
                    let file = match StepFile::from_file(&path) {
                        Ok(file) => file,
                        Err(e) => {
                            outcome.error = Some(e.to_string());
                            return;
                        }
                    };
                    for (name, value) in file.variables.iter().chain(variables.iter()) {
                        let value = interpolate(value, ctx);
                        ctx.set_var(name.clone(), value);
                    }
                    let nested_base = path.parent().map(Path::to_path_buf).unwrap_or_default();
                    debug!(include = %path.display(), "Including steps");
                    execute_list(&file.steps, ctx, executor, opts, &nested_base, depth + 1, outcome).await;
                }
            }
            if outcome.error.is_some() {
                return;
            }
        }
    })
}

async fn execute_action(
    action: &ActionStep,
    ctx: &mut ExecutionContext,
    executor: &dyn StepExecutor,
    opts: &StepOptions,
) -> StepRecord {
    let mut resolved = action.clone();
    resolved.params = action
        .params
        .iter()
        .map(|(k, v)| (k.clone(), interpolate_value(v, ctx)))
        .collect();
    let name = resolved.label();
    let limit = action
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(opts.default_timeout);

    debug!("Executing step: {}", name);
    let start = Instant::now();
    let result = tokio::time::timeout(limit, executor.execute(&resolved, ctx)).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    let outcome = match result {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => StepOutcome::failed(e.to_string()),
        Err(_) => StepOutcome::failed(
            E2eError::Timeout(format!("{} after {}ms", name, limit.as_millis())).to_string(),
        ),
    };

    apply_side_effects(action, &outcome, ctx);
    if outcome.status == StepStatus::Failed {
        warn!(step = %name, error = ?outcome.error, "Step failed");
    } else if action.action == "log" {
        info!("[TEST LOG] {}", name);
    }

    StepRecord {
        name,
        status: outcome.status,
        duration_ms,
        error: outcome.error,
    }
}

fn apply_side_effects(action: &ActionStep, outcome: &StepOutcome, ctx: &mut ExecutionContext) {
    let effects = &outcome.side_effects;
    for (name, value) in &effects.variables {
        ctx.set_var(name.clone(), value.clone());
    }
    if let (Some(var), Some(value)) = (&action.set, &outcome.value) {
        ctx.set_var(var.clone(), value.clone());
    }
    for resource in &effects.tracked {
        if ctx.track(resource.clone()) {
            debug!(resource = %resource.label(), "Tracked resource");
        }
    }
    for deleted in &effects.deleted {
        if !ctx.mark_deleted(&deleted.resource_type, &deleted.id) {
            debug!(resource_type = %deleted.resource_type, id = %deleted.id, "Deletion of untracked resource observed");
        }
    }
    if let Some(email) = &effects.email {
        ctx.set_last_email(email.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::GroupStep;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;
    use tidyrun_common::SessionId;

    /// Records each action; fails actions named `fail`; `create` tracks a row.
    #[derive(Default)]
    struct Scripted {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StepExecutor for Scripted {
        async fn execute(&self, action: &ActionStep, _ctx: &ExecutionContext) -> E2eResult<StepOutcome> {
            self.seen.lock().push(action.label());
            match action.action.as_str() {
                "fail" => Ok(StepOutcome::failed("nope")),
                "crash" => Err(E2eError::StepExecutor("driver died".into())),
                "hang" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(StepOutcome::passed())
                }
                "create" => Ok(StepOutcome::passed().with_value("row-1").with_side_effects(SideEffects {
                    tracked: vec![TrackedResource::new("row", "row-1")],
                    ..SideEffects::default()
                })),
                "remove" => Ok(StepOutcome::passed().with_side_effects(SideEffects {
                    deleted: vec![DeletedRef {
                        resource_type: "row".into(),
                        id: "row-1".into(),
                    }],
                    ..SideEffects::default()
                })),
                _ => Ok(StepOutcome::passed()),
            }
        }
    }

    fn action(name: &str) -> Step {
        Step::Action(ActionStep::new(name))
    }

    #[tokio::test]
    async fn stops_at_first_failure() {
        let exec = Scripted::default();
        let mut ctx = ExecutionContext::new(SessionId::from("s"));
        let steps = vec![action("a"), action("fail"), action("never")];

        let out = execute_steps(&steps, &mut ctx, &exec, &StepOptions::default()).await;
        assert!(!out.passed());
        assert_eq!(out.records.len(), 2);
        assert_eq!(*exec.seen.lock(), vec!["a", "fail"]);
        assert_eq!(out.error.as_deref(), Some("fail: nope"));
    }

    #[tokio::test]
    async fn params_are_interpolated_and_values_stored() {
        let exec = Scripted::default();
        let mut ctx = ExecutionContext::new(SessionId::from("s"));
        ctx.set_var("SEL", "#go");

        let mut create = ActionStep::new("create");
        create.set = Some("ROW".into());
        let steps = vec![
            Step::Action(create),
            Step::Action(ActionStep::new("click").with_param("selector", json!("${SEL}"))),
            action("remove"),
        ];
        let out = execute_steps(&steps, &mut ctx, &exec, &StepOptions::default()).await;

        assert!(out.passed());
        assert_eq!(ctx.var("ROW"), Some("row-1"));
        assert_eq!(exec.seen.lock()[1], "click:#go");
        assert!(ctx.ledger().as_slice()[0].is_deleted());
    }

    #[tokio::test]
    async fn groups_honour_when_and_includes_recurse() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("flows")).unwrap();
        fs::write(
            dir.path().join("flows/logout.yaml"),
            "variables:\n  WHO: default\nsteps:\n  - action: logout\n    name: \"logout ${WHO}\"\n",
        )
        .unwrap();

        let exec = Scripted::default();
        let mut ctx = ExecutionContext::new(SessionId::from("s"));
        ctx.set_var("ENABLED", "true");
        let steps = vec![
            Step::Group {
                group: GroupStep {
                    name: None,
                    when: Some("${DISABLED}".into()),
                    steps: vec![action("skipped")],
                },
            },
            Step::Group {
                group: GroupStep {
                    name: None,
                    when: Some("${ENABLED}".into()),
                    steps: vec![action("inside")],
                },
            },
            Step::Include {
                include: PathBuf::from("flows/logout.yaml"),
                variables: [("WHO".to_string(), "bob".to_string())].into_iter().collect(),
            },
        ];
        let opts = StepOptions {
            base_dir: dir.path().to_path_buf(),
            ..StepOptions::default()
        };
        let out = execute_steps(&steps, &mut ctx, &exec, &opts).await;

        assert!(out.passed(), "{:?}", out.error);
        // Names are not interpolated, only params.
        assert_eq!(*exec.seen.lock(), vec!["inside", "logout ${WHO}"]);
        assert_eq!(ctx.var("WHO"), Some("bob"));
    }

    #[tokio::test]
    async fn missing_include_fails_the_list() {
        let exec = Scripted::default();
        let mut ctx = ExecutionContext::new(SessionId::from("s"));
        let steps = vec![Step::Include {
            include: PathBuf::from("does/not/exist.yaml"),
            variables: Variables::new(),
        }];
        let out = execute_steps(&steps, &mut ctx, &exec, &StepOptions::default()).await;
        assert!(!out.passed());
    }

    #[tokio::test]
    async fn executor_errors_become_step_failures() {
        let exec = Scripted::default();
        let mut ctx = ExecutionContext::new(SessionId::from("s"));
        let out = execute_steps(&[action("crash")], &mut ctx, &exec, &StepOptions::default()).await;
        assert!(out.error.unwrap().contains("driver died"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_steps_time_out() {
        let exec = Scripted::default();
        let mut ctx = ExecutionContext::new(SessionId::from("s"));
        let mut hang = ActionStep::new("hang");
        hang.timeout_ms = Some(500);
        let out = execute_steps(&[Step::Action(hang)], &mut ctx, &exec, &StepOptions::default()).await;
        let error = out.error.unwrap();
        assert!(error.contains("after 500ms"), "{}", error);
    }
}
