//! Workflow runner: tests in order on one browser session, then cleanup

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use tidyrun_cleanup::{CleanupExecutor, CleanupOptions, FailedCleanupStore, HandlerRegistry, TestIdentity};
use tidyrun_common::{infer_cleanup, CleanupConfig, GlobalConfig, Layered, SessionId};

use crate::context::ExecutionContext;
use crate::definition::{TestDefinition, TestRef, Variables, Viewport, WorkflowDefinition};
use crate::interpolate::interpolate;
use crate::result::{CleanupPlan, CleanupSummary, RunStatus, TestResult, TestStatus, WorkflowResult};
use crate::step::{execute_steps, StepExecutor, StepOptions};
use crate::tracking::TrackingCollector;

/// Variables the untracked scan reads the test identity from
pub const TEST_USER_ID_VAR: &str = "TEST_USER_ID";
pub const TEST_USER_EMAIL_VAR: &str = "TEST_USER_EMAIL";
pub const TEST_START_TIME_VAR: &str = "TEST_START_TIME";

/// Everything a run needs besides the definitions themselves
pub struct RunEnvironment {
    pub session_id: SessionId,
    pub global: GlobalConfig,
    /// Base for relative handler paths
    pub cwd: PathBuf,
    /// Where failed cleanups are persisted; `None` disables persistence
    pub store: Option<FailedCleanupStore>,
    pub tracking: Option<TrackingCollector>,
    /// Overrides the viewports declared by workflows
    pub viewports: Vec<Viewport>,
}

impl RunEnvironment {
    pub fn new(session_id: SessionId, global: GlobalConfig, cwd: impl Into<PathBuf>) -> Self {
        Self {
            session_id,
            global,
            cwd: cwd.into(),
            store: None,
            tracking: None,
            viewports: Vec::new(),
        }
    }

    pub fn with_store(mut self, store: FailedCleanupStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_tracking(mut self, tracking: TrackingCollector) -> Self {
        self.tracking = Some(tracking);
        self
    }

    pub fn with_viewports(mut self, viewports: Vec<Viewport>) -> Self {
        self.viewports = viewports;
        self
    }

    /// Pull reported resources into the context's ledger.
    pub fn drain_tracking(&self, ctx: &mut ExecutionContext) {
        if let Some(tracking) = &self.tracking {
            let mut reported = tidyrun_common::ResourceLedger::new();
            tracking.drain_into(&mut reported);
            let added = ctx.merge_resources(reported.into_vec());
            if added > 0 {
                debug!(added, "Merged reported resources into the ledger");
            }
        }
    }
}

/// Per-invocation switches
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Leave cleanup to the caller (pipeline nodes)
    pub skip_cleanup: bool,
    /// Pipeline-level cleanup section, layered under the workflow's
    pub pipeline_cleanup: Option<CleanupConfig>,
    /// A page is already open on the executor's session
    pub page_open: bool,
}

pub struct WorkflowRunner<'a> {
    env: &'a RunEnvironment,
    executor: &'a dyn StepExecutor,
}

impl<'a> WorkflowRunner<'a> {
    pub fn new(env: &'a RunEnvironment, executor: &'a dyn StepExecutor) -> Self {
        Self { env, executor }
    }

    /// Run a workflow in `ctx`.
    ///
    /// With several viewports the whole test list is replayed once per size
    /// on a fresh page, sharing variables and the resource ledger.
    pub async fn run(&self, workflow: &WorkflowDefinition, ctx: &mut ExecutionContext, opts: &RunOptions) -> WorkflowResult {
        let start = Instant::now();
        let run = &self.env.global.run;
        let continue_on_failure = workflow.continue_on_failure.unwrap_or(run.continue_on_failure);

        info!(workflow = %workflow.name, session = %ctx.session_id(), "Running workflow");
        set_variables(ctx, &workflow.variables);

        let viewports: Vec<Option<Viewport>> = if !self.env.viewports.is_empty() {
            self.env.viewports.iter().copied().map(Some).collect()
        } else if !workflow.viewports.is_empty() {
            workflow.viewports.iter().copied().map(Some).collect()
        } else {
            vec![None]
        };

        let base = workflow.base_dir();
        let mut tests = Vec::new();
        let mut test_cleanup = None;

        for viewport in viewports {
            if let Some(v) = viewport {
                info!("Viewport {}", v);
            }
            if viewport.is_some() || !opts.page_open {
                if let Err(e) = self.executor.open_page(viewport).await {
                    warn!(error = %e, "Failed to open page");
                    tests.extend(workflow.tests.iter().enumerate().map(|(i, t)| {
                        TestResult::failed(t.label(i), format!("failed to open page: {}", e), viewport)
                    }));
                    continue;
                }
            }

            let mut stopped = false;
            for (i, test_ref) in workflow.tests.iter().enumerate() {
                if stopped {
                    tests.push(TestResult::not_run(test_ref.label(i), viewport));
                    continue;
                }

                let result = match test_ref.resolve(&base) {
                    Ok(test) => {
                        if test_cleanup.is_none() && test.cleanup.is_some() {
                            test_cleanup = test.cleanup.clone();
                        }
                        self.run_test(&test, test_ref, ctx, viewport, &base).await
                    }
                    Err(e) => TestResult::failed(test_ref.label(i), e.to_string(), viewport),
                };

                if result.status == TestStatus::Failed {
                    warn!(test = %result.label(), error = ?result.error, "Test failed");
                    if !continue_on_failure {
                        stopped = true;
                    }
                } else {
                    info!(test = %result.label(), duration_ms = result.duration_ms, "Test passed");
                }
                tests.push(result);
            }
        }

        let status = if tests.iter().any(|t| t.status == TestStatus::Failed) {
            RunStatus::Failed
        } else {
            RunStatus::Passed
        };

        let plan = CleanupPlan {
            config: Layered::new(self.env.global.effective_cleanup())
                .pipeline(opts.pipeline_cleanup.clone())
                .workflow(infer_cleanup(workflow.cleanup.as_ref(), workflow.appwrite.as_ref()))
                .test(test_cleanup)
                .resolve(),
            on_failure: workflow.cleanup_on_failure.unwrap_or(run.cleanup_on_failure),
        };

        let cleanup = if opts.skip_cleanup {
            debug!("Cleanup deferred to the caller");
            None
        } else {
            run_planned_cleanup(self.env, ctx, &plan, status == RunStatus::Failed).await
        };

        WorkflowResult {
            name: workflow.name.clone(),
            status,
            session_id: ctx.session_id().clone(),
            tests,
            cleanup,
            duration_ms: start.elapsed().as_millis() as u64,
            cleanup_plan: plan,
        }
    }

    async fn run_test(
        &self,
        test: &TestDefinition,
        test_ref: &TestRef,
        ctx: &mut ExecutionContext,
        viewport: Option<Viewport>,
        workflow_base: &Path,
    ) -> TestResult {
        let start = Instant::now();
        let id = test.id().to_string();
        debug!(test = %id, "Running test");

        ctx.push_scope(id.clone());
        set_variables(ctx, &test.variables);
        set_variables(ctx, &test_ref.variables);

        let opts = StepOptions {
            default_timeout: Duration::from_millis(self.env.global.run.step_timeout_ms),
            base_dir: test
                .base_dir()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| workflow_base.to_path_buf()),
        };
        let outcome = execute_steps(&test.steps, ctx, self.executor, &opts).await;
        ctx.pop_scope();
        self.env.drain_tracking(ctx);

        TestResult {
            id,
            name: test.name.clone(),
            status: if outcome.passed() {
                TestStatus::Passed
            } else {
                TestStatus::Failed
            },
            duration_ms: start.elapsed().as_millis() as u64,
            steps: outcome.records,
            error: outcome.error,
            viewport,
        }
    }
}

/// Set variables in order, interpolating each against what is already set.
pub(crate) fn set_variables(ctx: &mut ExecutionContext, variables: &Variables) {
    for (name, value) in variables {
        let value = interpolate(value, ctx);
        ctx.set_var(name.clone(), value);
    }
}

/// Run a cleanup plan unless it is disabled or suppressed by a failure.
pub(crate) async fn run_planned_cleanup(
    env: &RunEnvironment,
    ctx: &mut ExecutionContext,
    plan: &CleanupPlan,
    run_failed: bool,
) -> Option<CleanupSummary> {
    if run_failed && !plan.on_failure {
        info!("Run failed and cleanup_on_failure is off, leaving resources in place");
        return None;
    }
    cleanup_session(env, ctx, plan.config.as_ref()).await
}

/// Delete everything the session created.
///
/// Returns `None` when cleanup is not configured, disabled, or there is
/// nothing to do.
pub async fn cleanup_session(
    env: &RunEnvironment,
    ctx: &mut ExecutionContext,
    config: Option<&CleanupConfig>,
) -> Option<CleanupSummary> {
    env.drain_tracking(ctx);

    let Some(config) = config.filter(|c| c.enabled) else {
        debug!("Cleanup not configured");
        return None;
    };
    if ctx.ledger().is_empty() && !config.scan_untracked {
        debug!("No resources to clean up");
        return None;
    }

    let registry = match HandlerRegistry::from_config(config, &env.cwd) {
        Ok(registry) => registry,
        Err(e) => {
            warn!(session = %ctx.session_id(), error = %e, "Cleanup handlers could not be loaded");
            return Some(CleanupSummary {
                success: false,
                failed: ctx
                    .ledger()
                    .pending()
                    .map(|r| format!("{} ({})", r.label(), e))
                    .collect(),
                ..CleanupSummary::default()
            });
        }
    };

    let mut opts = CleanupOptions::from_config(config).with_session(ctx.session_id().clone());
    opts.identity = test_identity(ctx);
    opts.test_start_time = ctx.var(TEST_START_TIME_VAR).and_then(parse_time);

    let mut executor = CleanupExecutor::new(Arc::new(registry));
    if let Some(store) = &env.store {
        executor = executor.with_store(store.clone());
    }

    info!(
        session = %ctx.session_id(),
        resources = ctx.ledger().len(),
        provider = %config.provider,
        "Cleaning up"
    );
    let report = executor.run(ctx.ledger().as_slice(), &opts).await;
    Some(CleanupSummary::from(&report))
}

/// Who the test ran as: explicit variables first, else the first tracked
/// `user` resource. Teams the session created count as owned by that user.
pub fn test_identity(ctx: &ExecutionContext) -> TestIdentity {
    let user = ctx.ledger().iter().find(|r| r.resource_type == "user");
    TestIdentity {
        user_id: ctx
            .var(TEST_USER_ID_VAR)
            .map(str::to_string)
            .or_else(|| user.map(|u| u.id.clone())),
        email: ctx
            .var(TEST_USER_EMAIL_VAR)
            .map(str::to_string)
            .or_else(|| user.and_then(|u| u.metadata_str("email"))),
        team_ids: ctx
            .ledger()
            .iter()
            .filter(|r| r.resource_type == "team")
            .map(|r| r.id.clone())
            .collect(),
        created_at: user.and_then(|u| u.created_at),
    }
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(value) {
        Ok(t) => Some(t.with_timezone(&Utc)),
        Err(e) => {
            warn!("Ignoring {}='{}': {}", TEST_START_TIME_VAR, value, e);
            None
        }
    }
}
