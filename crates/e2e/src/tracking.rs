//! Resource-reporting channel
//!
//! The application under test reports resources it creates server-side,
//! either with `POST /track` or by appending JSON lines to a file. Delivery
//! is at-least-once; the ledger deduplicates on merge.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tidyrun_common::{ResourceLedger, SessionId, TrackedResource};

use crate::error::{E2eError, E2eResult};

pub const SESSION_ID_ENV: &str = "TIDYRUN_SESSION_ID";
pub const TRACK_URL_ENV: &str = "TIDYRUN_TRACK_URL";
pub const TRACK_FILE_ENV: &str = "TIDYRUN_TRACK_FILE";

/// Where the application under test should send reports
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingEndpoint {
    pub session_id: SessionId,
    pub url: Option<String>,
    pub file: Option<PathBuf>,
}

impl TrackingEndpoint {
    /// Environment to inject into the application's process
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env = vec![(SESSION_ID_ENV.to_string(), self.session_id.to_string())];
        if let Some(url) = &self.url {
            env.push((TRACK_URL_ENV.to_string(), url.clone()));
        }
        if let Some(file) = &self.file {
            env.push((TRACK_FILE_ENV.to_string(), file.display().to_string()));
        }
        env
    }
}

/// Turn one report into a resource, checking the session id if present.
fn parse_report(body: &Value, session: &SessionId, require_session: bool) -> Result<TrackedResource, (StatusCode, String)> {
    let obj = body
        .as_object()
        .ok_or((StatusCode::BAD_REQUEST, "report must be a JSON object".to_string()))?;

    match obj.get("sessionId").and_then(Value::as_str) {
        Some(s) if s != session.as_str() => {
            return Err((StatusCode::CONFLICT, format!("session mismatch: {}", s)));
        }
        None if require_session => {
            return Err((StatusCode::BAD_REQUEST, "missing sessionId".to_string()));
        }
        _ => {}
    }

    let field = |name: &str| {
        obj.get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or((StatusCode::BAD_REQUEST, format!("missing '{}'", name)))
    };
    let resource_type = field("type")?;
    let id = field("id")?;

    let mut metadata = Map::new();
    if let Some(Value::Object(explicit)) = obj.get("metadata") {
        metadata.extend(explicit.clone());
    }
    for (k, v) in obj {
        if !matches!(k.as_str(), "sessionId" | "type" | "id" | "metadata" | "createdAt" | "deleted") {
            metadata.insert(k.clone(), v.clone());
        }
    }

    let mut resource = TrackedResource::new(resource_type, id);
    resource.metadata = metadata;
    resource.created_at = obj
        .get("createdAt")
        .and_then(Value::as_str)
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&chrono::Utc));
    resource.deleted = obj.get("deleted").and_then(Value::as_bool);
    Ok(resource)
}

#[derive(Clone)]
struct TrackState {
    session: SessionId,
    ledger: Arc<Mutex<ResourceLedger>>,
}

async fn track(State(state): State<TrackState>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    match parse_report(&body, &state.session, true) {
        Ok(resource) => {
            let label = resource.label();
            let added = state.ledger.lock().push(resource);
            debug!(resource = %label, added, "Resource reported");
            (StatusCode::OK, Json(json!({"ok": true, "new": added})))
        }
        Err((status, message)) => {
            warn!(%status, error = %message, "Rejected resource report");
            (status, Json(json!({"ok": false, "error": message})))
        }
    }
}

async fn health() -> &'static str {
    "ok"
}

/// In-process `/track` endpoint
pub struct TrackingServer {
    addr: SocketAddr,
    ledger: Arc<Mutex<ResourceLedger>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TrackingServer {
    /// Bind on 127.0.0.1 (`port` 0 picks a free port) and start serving.
    pub async fn start(session: SessionId, port: u16) -> E2eResult<Self> {
        let ledger = Arc::new(Mutex::new(ResourceLedger::new()));
        let app = Router::new()
            .route("/track", post(track))
            .route("/health", get(health))
            .with_state(TrackState {
                session,
                ledger: Arc::clone(&ledger),
            });

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| E2eError::Tracking(format!("failed to bind tracking port {}: {}", port, e)))?;
        let addr = listener.local_addr()?;
        let (tx, rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = rx.await;
            });
            if let Err(e) = server.await {
                warn!(error = %e, "Tracking server stopped");
            }
        });

        info!("Resource tracking listening on http://{}/track", addr);
        Ok(Self {
            addr,
            ledger,
            shutdown: Some(tx),
            task: Some(task),
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}/track", self.addr)
    }

    /// Move everything reported so far into `target`, returning how many
    /// entries were new there.
    pub fn drain_into(&self, target: &mut ResourceLedger) -> usize {
        let drained = std::mem::take(&mut *self.ledger.lock());
        target.extend(drained.into_vec())
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for TrackingServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Read an append-only report file.
///
/// Malformed lines and lines for another session are logged and skipped.
/// A missing file reads as empty.
pub fn read_track_file(path: &Path, session: &SessionId) -> E2eResult<Vec<TrackedResource>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut resources = Vec::new();
    for (n, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!(file = %path.display(), line = n + 1, error = %e, "Skipping malformed report line");
                continue;
            }
        };
        match parse_report(&value, session, false) {
            Ok(resource) => resources.push(resource),
            Err((_, message)) => {
                warn!(file = %path.display(), line = n + 1, error = %message, "Skipping report line")
            }
        }
    }
    Ok(resources)
}

/// Both reporting channels of one session
pub struct TrackingCollector {
    session: SessionId,
    server: Option<TrackingServer>,
    file: Option<PathBuf>,
}

impl TrackingCollector {
    pub fn new(session: SessionId, server: Option<TrackingServer>, file: Option<PathBuf>) -> Self {
        Self { session, server, file }
    }

    pub fn endpoint(&self) -> TrackingEndpoint {
        TrackingEndpoint {
            session_id: self.session.clone(),
            url: self.server.as_ref().map(TrackingServer::url),
            file: self.file.clone(),
        }
    }

    /// Merge everything reported so far into `ledger`.
    pub fn drain_into(&self, ledger: &mut ResourceLedger) -> usize {
        let mut added = self.server.as_ref().map_or(0, |s| s.drain_into(ledger));
        if let Some(file) = &self.file {
            match read_track_file(file, &self.session) {
                Ok(resources) => added += ledger.extend(resources),
                Err(e) => warn!(file = %file.display(), error = %e, "Failed to read report file"),
            }
        }
        if added > 0 {
            debug!(added, "Merged reported resources");
        }
        added
    }

    pub async fn stop(self) {
        if let Some(server) = self.server {
            server.stop().await;
        }
    }
}
