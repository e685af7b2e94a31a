//! Cleanup Commands - inspect and retry cleanups left unfinished

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use std::path::PathBuf;

use tidyrun_cleanup::{retry_failed_cleanups, retry_session, FailedCleanupRecord, FailedCleanupStore, RetryOutcome};
use tidyrun_common::{GlobalConfig, SessionId};

use crate::output::{print_info, print_list, print_success, OutputFormat, TableDisplay};
use crate::{EXIT_CLEANUP_FAILED, EXIT_OK};

#[derive(Subcommand)]
pub enum CleanupCommands {
    /// List sessions with resources left behind
    List,

    /// Retry stored cleanups, for every session or just one
    Retry {
        /// Session id
        session: Option<String>,
    },

    /// Forget a stored cleanup without retrying it
    Remove {
        /// Session id
        session: String,
    },
}

/// Record display wrapper for serialization
#[derive(Serialize)]
pub struct RecordDisplay {
    pub session_id: String,
    pub timestamp: String,
    pub provider: String,
    pub resources: Vec<String>,
    pub last_error: Option<String>,
}

impl From<&FailedCleanupRecord> for RecordDisplay {
    fn from(record: &FailedCleanupRecord) -> Self {
        Self {
            session_id: record.session_id.to_string(),
            timestamp: record.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            provider: record
                .provider_config
                .as_ref()
                .map(|p| p.name().to_string())
                .unwrap_or_else(|| "-".to_string()),
            resources: record.resources.iter().map(|r| r.label()).collect(),
            last_error: record.errors.last().cloned(),
        }
    }
}

impl TableDisplay for RecordDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Session", "Recorded", "Provider", "Resources", "Last Error"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.session_id.clone(),
            self.timestamp.clone(),
            self.provider.clone(),
            self.resources.join("\n"),
            self.last_error.clone().unwrap_or_default(),
        ]
    }
}

#[derive(Serialize)]
pub struct RetryDisplay {
    pub session_id: String,
    pub deleted: usize,
    pub still_failing: Vec<String>,
    pub removed: bool,
}

impl From<&RetryOutcome> for RetryDisplay {
    fn from(outcome: &RetryOutcome) -> Self {
        Self {
            session_id: outcome.session_id.to_string(),
            deleted: outcome.report.deleted.len(),
            still_failing: outcome.report.failed.clone(),
            removed: outcome.removed,
        }
    }
}

impl TableDisplay for RetryDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Session", "Deleted", "Still Failing", "Record"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.session_id.clone(),
            self.deleted.to_string(),
            self.still_failing.join("\n"),
            if self.removed { "removed" } else { "kept" }.to_string(),
        ]
    }
}

pub async fn execute(cmd: CleanupCommands, config: GlobalConfig, cwd: PathBuf, format: OutputFormat) -> Result<i32> {
    let store = FailedCleanupStore::new(config.failed_cleanup_dir());

    match cmd {
        CleanupCommands::List => {
            let records: Vec<RecordDisplay> = store.list()?.iter().map(RecordDisplay::from).collect();
            print_list(&records, format);
            Ok(EXIT_OK)
        }
        CleanupCommands::Retry { session } => {
            let live = config.effective_cleanup();
            let outcomes = match session {
                Some(id) => vec![retry_session(&store, &SessionId::from(id), live.as_ref(), &cwd).await?],
                None => retry_failed_cleanups(&store, live.as_ref(), &cwd).await?,
            };
            if outcomes.is_empty() {
                print_info("Nothing to retry");
                return Ok(EXIT_OK);
            }

            let rows: Vec<RetryDisplay> = outcomes.iter().map(RetryDisplay::from).collect();
            print_list(&rows, format);

            if outcomes.iter().all(|o| o.report.success) {
                Ok(EXIT_OK)
            } else {
                Ok(EXIT_CLEANUP_FAILED)
            }
        }
        CleanupCommands::Remove { session } => {
            let id = SessionId::from(session);
            if store.remove(&id)? {
                print_success(&format!("Removed cleanup record for {}", id));
            } else {
                print_info(&format!("No cleanup record for {}", id));
            }
            Ok(EXIT_OK)
        }
    }
}
