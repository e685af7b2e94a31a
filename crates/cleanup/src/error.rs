//! Error types for the cleanup engine

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while building a registry or persisting records.
///
/// Per-resource deletion failures are not errors at this level; they end
/// up in the [`CleanupReport`](crate::CleanupReport).
#[derive(Error, Debug)]
pub enum CleanupError {
    #[error("Failed to load handler file {path}: {message}")]
    HandlerLoad { path: PathBuf, message: String },

    #[error("Invalid discovery pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Provider '{0}' is not configured")]
    NotConfigured(String),

    #[error("Failed cleanup store error: {0}")]
    Store(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Common(#[from] tidyrun_common::Error),
}

pub type CleanupResult<T> = Result<T, CleanupError>;

/// Outcome of a single deletion attempt that did not succeed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeleteError {
    /// Network trouble, rate limiting, server errors: worth retrying
    #[error("{0}")]
    Transient(String),

    /// The provider rejected the request in a way retrying cannot fix
    #[error("{0}")]
    Permanent(String),
}

impl DeleteError {
    pub fn transient(message: impl std::fmt::Display) -> Self {
        DeleteError::Transient(message.to_string())
    }

    pub fn permanent(message: impl std::fmt::Display) -> Self {
        DeleteError::Permanent(message.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, DeleteError::Transient(_))
    }
}

impl From<reqwest::Error> for DeleteError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) if status.is_client_error() && status.as_u16() != 429 => {
                DeleteError::Permanent(e.to_string())
            }
            _ => DeleteError::Transient(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(DeleteError::transient("timeout").is_retryable());
        assert!(!DeleteError::permanent("forbidden").is_retryable());
    }

    #[test]
    fn delete_error_displays_bare_message() {
        assert_eq!(DeleteError::transient("boom").to_string(), "boom");
    }
}
