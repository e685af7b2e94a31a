//! Error types for workflow and pipeline execution

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Dependency cycle detected between: {}", nodes.join(", "))]
    CycleDetected { nodes: Vec<String> },

    #[error("Node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },

    #[error("Duplicate node id '{0}'")]
    DuplicateNodeId(String),

    #[error("Failed to load {path}: {message}")]
    DefinitionLoad { path: PathBuf, message: String },

    #[error("Server failed to start: {0}")]
    ServerStartup(String),

    #[error("Server stalled: no output and not ready for {0}s")]
    ServerStalled(u64),

    #[error("Server health check failed after {0} attempts")]
    ServerHealthCheck(usize),

    #[error("Timeout waiting for: {0}")]
    Timeout(String),

    #[error("Step executor error: {0}")]
    StepExecutor(String),

    #[error("Resource tracking error: {0}")]
    Tracking(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Common(#[from] tidyrun_common::Error),

    #[error(transparent)]
    Cleanup(#[from] tidyrun_cleanup::CleanupError),
}

impl E2eError {
    /// Graph-construction and startup errors abort a run before or instead
    /// of producing a result.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            E2eError::CycleDetected { .. }
                | E2eError::UnknownDependency { .. }
                | E2eError::DuplicateNodeId(_)
                | E2eError::ServerStartup(_)
                | E2eError::ServerStalled(_)
                | E2eError::ServerHealthCheck(_)
        )
    }
}

pub type E2eResult<T> = Result<T, E2eError>;
