//! Process-backed step executor
//!
//! Drives an external automation driver (for example a small Node script
//! wrapping Playwright) over line-delimited JSON on stdin/stdout. Each
//! request is one line:
//!
//! ```json
//! {"id": 3, "action": "click", "params": {"selector": "#go"}, "variables": {...}}
//! ```
//!
//! and the driver answers with one line carrying the same id and a
//! [`StepOutcome`]. One driver process backs one page; opening a page
//! (for a new viewport) restarts the driver.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::context::ExecutionContext;
use crate::definition::{ActionStep, Variables, Viewport};
use crate::error::{E2eError, E2eResult};
use crate::step::{StepExecutor, StepOutcome};

/// Driver launch settings
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Shell command starting the driver
    pub command: String,
    pub cwd: Option<PathBuf>,
    /// Base URL of the application under test
    pub base_url: Option<String>,
    /// Extra environment, e.g. the resource-reporting endpoint
    pub env: Vec<(String, String)>,
}

#[derive(Serialize)]
struct Request<'a> {
    id: u64,
    action: &'a str,
    params: &'a serde_json::Map<String, serde_json::Value>,
    variables: &'a Variables,
}

#[derive(Deserialize)]
struct Response {
    id: u64,
    #[serde(flatten)]
    outcome: StepOutcome,
}

struct DriverProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

impl DriverProcess {
    async fn spawn(config: &DriverConfig, viewport: Option<Viewport>) -> E2eResult<Self> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&config.command);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(url) = &config.base_url {
            cmd.env("TIDYRUN_BASE_URL", url);
        }
        if let Some(vp) = viewport {
            cmd.env("TIDYRUN_VIEWPORT", vp.label());
        }
        cmd.envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            E2eError::StepExecutor(format!("failed to spawn driver '{}': {}", config.command, e))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| E2eError::StepExecutor("driver stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| E2eError::StepExecutor("driver stdout unavailable".into()))?;

        info!(command = %config.command, viewport = ?viewport.map(|v| v.label()), "Started step driver");
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 1,
        })
    }

    async fn call(&mut self, action: &ActionStep, variables: &Variables) -> E2eResult<StepOutcome> {
        let id = self.next_id;
        self.next_id += 1;

        let mut line = serde_json::to_string(&Request {
            id,
            action: &action.action,
            params: &action.params,
            variables,
        })?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;

        loop {
            let Some(line) = self.stdout.next_line().await? else {
                return Err(E2eError::StepExecutor("driver exited unexpectedly".into()));
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Response>(line) {
                Ok(response) if response.id == id => return Ok(response.outcome),
                Ok(response) => warn!(expected = id, got = response.id, "Ignoring stale driver response"),
                // Drivers may print their own logging on stdout.
                Err(_) => debug!("[driver] {}", line),
            }
        }
    }

    async fn shutdown(mut self) {
        drop(self.stdin);
        if tokio::time::timeout(Duration::from_secs(2), self.child.wait())
            .await
            .is_err()
        {
            let _ = self.child.kill().await;
        }
    }
}

pub struct ProcessStepExecutor {
    config: DriverConfig,
    process: Mutex<Option<DriverProcess>>,
}

impl ProcessStepExecutor {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            process: Mutex::new(None),
        }
    }
}

#[async_trait]
impl StepExecutor for ProcessStepExecutor {
    async fn open_page(&self, viewport: Option<Viewport>) -> E2eResult<()> {
        let mut process = self.process.lock().await;
        if let Some(old) = process.take() {
            old.shutdown().await;
        }
        *process = Some(DriverProcess::spawn(&self.config, viewport).await?);
        Ok(())
    }

    async fn execute(&self, action: &ActionStep, ctx: &ExecutionContext) -> E2eResult<StepOutcome> {
        let mut process = self.process.lock().await;
        if process.is_none() {
            *process = Some(DriverProcess::spawn(&self.config, None).await?);
        }
        match process.as_mut() {
            Some(driver) => driver.call(action, ctx.variables()).await,
            None => Err(E2eError::StepExecutor("driver not running".into())),
        }
    }

    async fn close(&self) -> E2eResult<()> {
        if let Some(process) = self.process.lock().await.take() {
            process.shutdown().await;
        }
        Ok(())
    }
}
