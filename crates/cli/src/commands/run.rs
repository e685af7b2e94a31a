//! Run Command - execute a test, workflow or pipeline definition

use anyhow::{bail, Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};
use tokio::signal;
use tracing::{info, warn};

use tidyrun_cleanup::FailedCleanupStore;
use tidyrun_common::{GlobalConfig, SessionId};
use tidyrun_e2e::{
    Definition, DevServer, DriverConfig, ExitStatus, PipelineRunner, ProcessStepExecutor,
    RunEnvironment, SessionMarker, StepExecutor, TrackingCollector, TrackingServer, Viewport,
};

use crate::output::{print_pipeline, print_warning, OutputFormat};
use crate::{EXIT_CLEANUP_FAILED, EXIT_INTERRUPTED, EXIT_OK, EXIT_TESTS_FAILED};

#[derive(Args)]
pub struct RunArgs {
    /// Test, workflow or pipeline definition (YAML)
    pub file: PathBuf,

    /// Replay every workflow at this size (repeatable)
    #[arg(long = "viewport", value_name = "WIDTHxHEIGHT")]
    pub viewports: Vec<Viewport>,

    /// Step driver command (overrides `[run] driver`)
    #[arg(long, env = "TIDYRUN_DRIVER")]
    pub driver: Option<String>,

    /// Use this session id instead of generating one
    #[arg(long)]
    pub session_id: Option<String>,

    /// Keep running tests after a failure
    #[arg(long)]
    pub continue_on_failure: bool,
}

pub async fn execute(args: RunArgs, mut config: GlobalConfig, cwd: PathBuf, format: OutputFormat) -> Result<i32> {
    let pipeline = Definition::load(&args.file)
        .with_context(|| format!("failed to load {}", args.file.display()))?
        .into_pipeline();

    if args.continue_on_failure {
        config.run.continue_on_failure = true;
    }
    let Some(driver) = args.driver.clone().or_else(|| config.run.driver.clone()) else {
        bail!("no step driver configured: pass --driver or set `driver` under [run]");
    };

    let session = args
        .session_id
        .clone()
        .map(SessionId::from)
        .unwrap_or_else(SessionId::generate);
    info!(session = %session, "Starting session");

    let mut marker = SessionMarker::create(&config.sessions_dir(), &session)?;
    let tracking = start_tracking(&config, &session, &cwd).await?;
    let endpoint_env = tracking
        .as_ref()
        .map(|t| t.endpoint().env())
        .unwrap_or_default();

    let server = tokio::select! {
        started = DevServer::start(&config.server, &cwd, &endpoint_env) => started?,
        _ = signal::ctrl_c() => {
            warn!("Interrupted while starting the server");
            marker.remove();
            return Ok(EXIT_INTERRUPTED);
        }
    };

    let executor = ProcessStepExecutor::new(DriverConfig {
        command: driver,
        cwd: Some(cwd.clone()),
        base_url: server
            .as_ref()
            .map(|s| s.url().to_string())
            .or_else(|| config.server.url.clone()),
        env: endpoint_env,
    });

    let store = FailedCleanupStore::new(config.failed_cleanup_dir());
    let mut env = RunEnvironment::new(session, config, cwd)
        .with_store(store)
        .with_viewports(args.viewports);
    if let Some(tracking) = tracking {
        env = env.with_tracking(tracking);
    }

    let runner = PipelineRunner::new(&env, &executor);
    let outcome = tokio::select! {
        result = runner.run(&pipeline) => Some(result),
        _ = signal::ctrl_c() => None,
    };

    if let Err(e) = executor.close().await {
        warn!(error = %e, "Failed to stop step driver");
    }
    if let Some(server) = server {
        server.stop().await;
    }
    if let Some(tracking) = env.tracking.take() {
        tracking.stop().await;
    }
    marker.remove();

    let Some(result) = outcome else {
        print_warning("Interrupted; resources created so far may remain");
        return Ok(EXIT_INTERRUPTED);
    };
    let result = result?;
    print_pipeline(&result, format);

    Ok(match result.exit_status() {
        ExitStatus::Passed => EXIT_OK,
        ExitStatus::TestsFailed => EXIT_TESTS_FAILED,
        ExitStatus::CleanupFailed => EXIT_CLEANUP_FAILED,
    })
}

async fn start_tracking(
    config: &GlobalConfig,
    session: &SessionId,
    cwd: &Path,
) -> Result<Option<TrackingCollector>> {
    if !config.tracking.enabled {
        return Ok(None);
    }
    let server = TrackingServer::start(session.clone(), config.tracking.port).await?;
    let file = config.tracking.file.as_ref().map(|f| cwd.join(f));
    Ok(Some(TrackingCollector::new(session.clone(), Some(server), file)))
}
