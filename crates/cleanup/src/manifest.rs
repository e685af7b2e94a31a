//! Handler files
//!
//! A handler file is YAML describing deletion methods for resource types no
//! built-in provider covers:
//!
//! ```yaml
//! provider: billing
//! defaults:
//!   region: eu
//! handlers:
//!   deleteInvoice:
//!     http:
//!       method: DELETE
//!       url: "http://localhost:9000/${metadata.region}/invoices/${id}"
//!       headers:
//!         Authorization: "Bearer ${env.BILLING_TOKEN}"
//!   purgeExport:
//!     command: "rm -rf ./exports/${id}"
//! types:
//!   invoice: deleteInvoice
//!   export: purgeExport
//! ```

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, warn};
use walkdir::WalkDir;

use tidyrun_common::{DiscoverConfig, TrackedResource};

use crate::error::{CleanupError, CleanupResult, DeleteError};
use crate::handler::{classify_status, DeleteHandler};
use crate::template;

/// Parsed handler file
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HandlerFile {
    /// Namespace for the file's handlers; defaults to the configured provider
    #[serde(default)]
    pub provider: Option<String>,

    /// Fallback values for `${metadata.KEY}` placeholders
    #[serde(default)]
    pub defaults: BTreeMap<String, String>,

    #[serde(default)]
    pub handlers: BTreeMap<String, HandlerSpec>,

    /// Resource type -> handler name within this file
    #[serde(default)]
    pub types: BTreeMap<String, String>,

    #[serde(skip)]
    pub source: PathBuf,
}

/// One deletion method: exactly one of `http` or `command`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandlerSpec {
    #[serde(default)]
    pub http: Option<HttpAction>,
    #[serde(default)]
    pub command: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HttpAction {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_method() -> String {
    "DELETE".to_string()
}

impl HandlerFile {
    pub fn load(path: &Path) -> CleanupResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| CleanupError::HandlerLoad {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let mut file: HandlerFile =
            serde_yaml::from_str(&raw).map_err(|e| CleanupError::HandlerLoad {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        for (name, spec) in &file.handlers {
            if spec.http.is_some() == spec.command.is_some() {
                return Err(CleanupError::HandlerLoad {
                    path: path.to_path_buf(),
                    message: format!("handler '{}' needs exactly one of 'http' or 'command'", name),
                });
            }
        }
        for (resource_type, method) in &file.types {
            if !file.handlers.contains_key(method) {
                return Err(CleanupError::HandlerLoad {
                    path: path.to_path_buf(),
                    message: format!("type '{}' maps to unknown handler '{}'", resource_type, method),
                });
            }
        }
        file.source = path.to_path_buf();
        Ok(file)
    }

    /// Build runnable handlers, keyed by method name.
    pub fn build(&self, client: &Client) -> BTreeMap<String, Arc<dyn DeleteHandler>> {
        let defaults = Arc::new(self.defaults.clone());
        self.handlers
            .iter()
            .filter_map(|(name, spec)| {
                let handler: Arc<dyn DeleteHandler> = match (&spec.http, &spec.command) {
                    (Some(action), _) => Arc::new(HttpHandler {
                        client: client.clone(),
                        action: action.clone(),
                        defaults: Arc::clone(&defaults),
                    }),
                    (None, Some(command)) => Arc::new(CommandHandler {
                        command: command.clone(),
                        cwd: self.source.parent().map(Path::to_path_buf),
                        defaults: Arc::clone(&defaults),
                    }),
                    (None, None) => return None,
                };
                Some((name.clone(), handler))
            })
            .collect()
    }
}

/// Find handler files under the configured directories, sorted by path.
///
/// Relative directories resolve against `base`. Missing directories are
/// skipped with a warning.
pub fn discover(config: &DiscoverConfig, base: &Path) -> CleanupResult<Vec<PathBuf>> {
    let pattern = glob::Pattern::new(&config.pattern).map_err(|e| CleanupError::InvalidPattern {
        pattern: config.pattern.clone(),
        message: e.to_string(),
    })?;

    let mut found = Vec::new();
    for dir in &config.paths {
        let dir = if dir.is_absolute() {
            dir.clone()
        } else {
            base.join(dir)
        };
        if !dir.is_dir() {
            warn!(path = %dir.display(), "Handler discovery directory does not exist");
            continue;
        }

        for entry in WalkDir::new(&dir).follow_links(false).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            if pattern.matches(&entry.file_name().to_string_lossy()) {
                found.push(entry.into_path());
            }
        }
    }

    found.sort();
    found.dedup();
    debug!(count = found.len(), "Discovered handler files");
    Ok(found)
}

struct HttpHandler {
    client: Client,
    action: HttpAction,
    defaults: Arc<BTreeMap<String, String>>,
}

#[async_trait]
impl DeleteHandler for HttpHandler {
    async fn delete(&self, resource: &TrackedResource) -> Result<(), DeleteError> {
        let url = template::render(&self.action.url, resource, &self.defaults)?;
        let method = reqwest::Method::from_bytes(self.action.method.to_uppercase().as_bytes())
            .map_err(|e| DeleteError::permanent(format!("invalid method '{}': {}", self.action.method, e)))?;

        let mut req = self.client.request(method.clone(), &url);
        for (name, value) in &self.action.headers {
            req = req.header(name.as_str(), template::render(value, resource, &self.defaults)?);
        }
        let response = req.send().await?;
        classify_status(response.status(), &format!("{} {}", method, url))
    }
}

struct CommandHandler {
    command: String,
    cwd: Option<PathBuf>,
    defaults: Arc<BTreeMap<String, String>>,
}

#[async_trait]
impl DeleteHandler for CommandHandler {
    async fn delete(&self, resource: &TrackedResource) -> Result<(), DeleteError> {
        let command = template::render(&self.command, resource, &self.defaults)?;
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&command);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| DeleteError::permanent(format!("failed to spawn '{}': {}", command, e)))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(DeleteError::transient(format!(
                "'{}' exited with {}: {}",
                command,
                output.status,
                stderr.trim()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
provider: billing
defaults:
  region: eu
handlers:
  deleteInvoice:
    http:
      url: "http://localhost:1/${metadata.region}/invoices/${id}"
  touch:
    command: "touch removed-${id}"
types:
  invoice: deleteInvoice
  marker: touch
"#;

    #[test]
    fn parses_http_and_command_handlers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("billing.handlers.yaml");
        fs::write(&path, SAMPLE).unwrap();

        let file = HandlerFile::load(&path).unwrap();
        assert_eq!(file.provider.as_deref(), Some("billing"));
        assert_eq!(file.types.get("invoice").map(String::as_str), Some("deleteInvoice"));
        let invoice = file.handlers["deleteInvoice"].http.as_ref().unwrap();
        assert_eq!(invoice.method, "DELETE");
        assert!(file.handlers["touch"].command.is_some());
    }

    #[test]
    fn type_mapping_to_unknown_handler_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.handlers.yaml");
        fs::write(&path, "handlers: {}\ntypes:\n  row: nope\n").unwrap();
        assert!(matches!(
            HandlerFile::load(&path),
            Err(CleanupError::HandlerLoad { .. })
        ));
    }

    #[test]
    fn handler_with_both_actions_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("both.handlers.yaml");
        fs::write(
            &path,
            "handlers:\n  x:\n    command: \"true\"\n    http:\n      url: http://x/\n",
        )
        .unwrap();
        assert!(HandlerFile::load(&path).is_err());
    }

    #[tokio::test]
    async fn command_handler_runs_in_file_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cmd.handlers.yaml");
        fs::write(&path, SAMPLE).unwrap();

        let file = HandlerFile::load(&path).unwrap();
        let handlers = file.build(&Client::new());
        handlers["touch"]
            .delete(&TrackedResource::new("marker", "m1"))
            .await
            .unwrap();
        assert!(dir.path().join("removed-m1").exists());
    }

    #[tokio::test]
    async fn failing_command_is_transient() {
        let handler = CommandHandler {
            command: "exit 3".into(),
            cwd: None,
            defaults: Arc::new(BTreeMap::new()),
        };
        let err = handler.delete(&TrackedResource::new("x", "1")).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn discovery_walks_nested_directories() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("cleanup/nested")).unwrap();
        fs::write(dir.path().join("cleanup/a.handlers.yaml"), "").unwrap();
        fs::write(dir.path().join("cleanup/nested/b.handlers.yaml"), "").unwrap();
        fs::write(dir.path().join("cleanup/readme.md"), "").unwrap();

        let found = discover(&DiscoverConfig::default(), dir.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.handlers.yaml", "b.handlers.yaml"]);
    }

    #[test]
    fn discovery_skips_missing_directories() {
        let dir = TempDir::new().unwrap();
        let config = DiscoverConfig {
            paths: vec![PathBuf::from("nope")],
            ..DiscoverConfig::default()
        };
        assert!(discover(&config, dir.path()).unwrap().is_empty());
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let config = DiscoverConfig {
            paths: vec![],
            pattern: "[".into(),
        };
        assert!(matches!(
            discover(&config, Path::new(".")),
            Err(CleanupError::InvalidPattern { .. })
        ));
    }
}
