//! Dev server lifecycle - starting, health checking and stopping the
//! application under test

use axum::Router;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use tidyrun_common::ServerSection;

use crate::error::{E2eError, E2eResult};

/// Interval between readiness probes
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Grace period between SIGTERM and a hard kill
const STOP_GRACE: Duration = Duration::from_secs(5);

enum Backend {
    Process(Child),
    Static {
        shutdown: Option<oneshot::Sender<()>>,
        task: JoinHandle<()>,
    },
}

/// Handle to a server this run started
pub struct DevServer {
    url: String,
    backend: Backend,
}

impl DevServer {
    /// Start the configured server and wait until its URL responds.
    ///
    /// Returns `None` when no URL is configured, or when `reuse_existing` is
    /// set and something is already serving the URL. `env` is added to the
    /// server process environment (the resource-reporting endpoint).
    pub async fn start(
        config: &ServerSection,
        cwd: &Path,
        env: &[(String, String)],
    ) -> E2eResult<Option<DevServer>> {
        let Some(url) = config.url.clone() else {
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;

        if config.reuse_existing && is_ready(&client, &url).await {
            info!("Reusing server already running at {}", url);
            return Ok(None);
        }

        let dir = config.cwd.as_ref().map_or_else(|| cwd.to_path_buf(), |d| cwd.join(d));

        let mut server = if let Some(root) = static_root(config, cwd) {
            Self::serve_static(&url, &root).await?
        } else {
            let command = match &config.command {
                Some(command) => command.clone(),
                None => detect_command(&dir).ok_or_else(|| {
                    E2eError::ServerStartup(format!(
                        "no start command configured and no dev/start script in {}",
                        dir.join("package.json").display()
                    ))
                })?,
            };
            Self::spawn(&url, &command, &dir, env)?
        };

        let last_output = match &mut server.backend {
            Backend::Process(child) => Some(watch_output(child)),
            Backend::Static { .. } => None,
        };

        if let Err(e) = server.wait_ready(&client, config, last_output).await {
            server.stop().await;
            return Err(e);
        }

        info!("Server is ready at {}", server.url);
        Ok(Some(server))
    }

    fn spawn(url: &str, command: &str, dir: &Path, env: &[(String, String)]) -> E2eResult<Self> {
        info!("Starting server: {} (in {})", command, dir.display());

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(dir)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .map_err(|e| E2eError::ServerStartup(format!("failed to spawn '{}': {}", command, e)))?;

        Ok(Self {
            url: url.to_string(),
            backend: Backend::Process(child),
        })
    }

    async fn serve_static(url: &str, root: &Path) -> E2eResult<Self> {
        if !root.is_dir() {
            return Err(E2eError::ServerStartup(format!(
                "static directory {} does not exist",
                root.display()
            )));
        }
        let port = reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.port_or_known_default())
            .ok_or_else(|| E2eError::ServerStartup(format!("cannot determine port from {}", url)))?;

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| E2eError::ServerStartup(format!("failed to bind port {}: {}", port, e)))?;

        let app = Router::new().fallback_service(ServeDir::new(root));
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = rx.await;
            });
            if let Err(e) = server.await {
                warn!(error = %e, "Static server stopped");
            }
        });

        info!("Serving {} on port {}", root.display(), port);
        Ok(Self {
            url: url.to_string(),
            backend: Backend::Static {
                shutdown: Some(tx),
                task,
            },
        })
    }

    /// Poll the URL until it responds, the process exits, output stalls or
    /// the startup timeout passes.
    async fn wait_ready(
        &mut self,
        client: &reqwest::Client,
        config: &ServerSection,
        last_output: Option<Arc<Mutex<Instant>>>,
    ) -> E2eResult<()> {
        let started = Instant::now();
        let startup_timeout = Duration::from_secs(config.startup_timeout_secs);
        let stall_timeout = Duration::from_secs(config.stall_timeout_secs);
        let mut attempts = 0;

        loop {
            attempts += 1;

            if let Backend::Process(child) = &mut self.backend {
                if let Some(status) = child.try_wait()? {
                    return Err(E2eError::ServerStartup(format!(
                        "server exited with {} before {} was ready",
                        status, self.url
                    )));
                }
            }

            if is_ready(client, &self.url).await {
                return Ok(());
            }
            if attempts == 1 {
                info!("Waiting for {} ...", self.url);
            }

            if let Some(last) = &last_output {
                let idle = last.lock().elapsed();
                if idle >= stall_timeout {
                    return Err(E2eError::ServerStalled(config.stall_timeout_secs));
                }
            }
            if started.elapsed() >= startup_timeout {
                return Err(E2eError::ServerHealthCheck(attempts));
            }

            sleep(POLL_INTERVAL).await;
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stop the server: SIGTERM to the process group, then a hard kill.
    pub async fn stop(mut self) {
        match &mut self.backend {
            Backend::Process(child) => {
                let Some(pid) = child.id() else {
                    return;
                };
                info!("Stopping server (pid: {})", pid);

                #[cfg(unix)]
                {
                    use nix::sys::signal::{killpg, Signal};
                    use nix::unistd::Pid;

                    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                        debug!("SIGTERM failed: {}", e);
                    }
                }

                if timeout(STOP_GRACE, child.wait()).await.is_err() {
                    warn!("Server did not exit after SIGTERM, killing");
                    let _ = child.kill().await;
                }
            }
            Backend::Static { shutdown, task } => {
                if let Some(tx) = shutdown.take() {
                    let _ = tx.send(());
                }
                let _ = task.await;
            }
        }
    }
}

impl Drop for DevServer {
    fn drop(&mut self) {
        if let Backend::Static { shutdown, .. } = &mut self.backend {
            if let Some(tx) = shutdown.take() {
                let _ = tx.send(());
            }
        }
    }
}

async fn is_ready(client: &reqwest::Client, url: &str) -> bool {
    match client.get(url).send().await {
        Ok(resp) => !resp.status().is_server_error(),
        Err(e) => {
            // Connection refused is expected while the server is starting
            if !e.is_connect() && !e.is_timeout() {
                debug!("Readiness probe error: {}", e);
            }
            false
        }
    }
}

/// Forward the child's output to the log, returning the time of the most
/// recent line.
fn watch_output(child: &mut Child) -> Arc<Mutex<Instant>> {
    let last = Arc::new(Mutex::new(Instant::now()));
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, Arc::clone(&last)));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, Arc::clone(&last)));
    }
    last
}

async fn pump<R: AsyncRead + Unpin>(stream: R, last: Arc<Mutex<Instant>>) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        *last.lock() = Instant::now();
        debug!(target: "server", "{}", line);
    }
}

/// Start command derived from `package.json`: the `dev` script, else
/// `start`, run with the package manager whose lockfile is present.
pub fn detect_command(dir: &Path) -> Option<String> {
    let manifest = std::fs::read_to_string(dir.join("package.json")).ok()?;
    let manifest: serde_json::Value = serde_json::from_str(&manifest).ok()?;
    let scripts = manifest.get("scripts")?.as_object()?;

    let script = ["dev", "start"].into_iter().find(|s| scripts.contains_key(*s))?;
    Some(format!("{} run {}", package_manager(dir), script))
}

fn package_manager(dir: &Path) -> &'static str {
    let lockfiles: [(&str, &str); 2] = [("pnpm-lock.yaml", "pnpm"), ("yarn.lock", "yarn")];
    lockfiles
        .iter()
        .find(|(file, _)| dir.join(file).exists())
        .map(|(_, manager)| *manager)
        .unwrap_or("npm")
}

/// Static directory resolved against the working directory
pub fn static_root(config: &ServerSection, cwd: &Path) -> Option<PathBuf> {
    let static_dir = config.static_dir.as_ref()?;
    let base = config.cwd.as_ref().map_or_else(|| cwd.to_path_buf(), |d| cwd.join(d));
    Some(base.join(static_dir))
}
