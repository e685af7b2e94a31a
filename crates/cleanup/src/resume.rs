//! Out-of-band retry of persisted cleanup failures

use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use tidyrun_common::{CleanupConfig, ProviderConfig, SessionId};

use crate::error::CleanupResult;
use crate::executor::{CleanupExecutor, CleanupOptions, CleanupReport};
use crate::registry::HandlerRegistry;
use crate::store::{FailedCleanupRecord, FailedCleanupStore};

/// Outcome of retrying one record
#[derive(Debug, Clone)]
pub struct RetryOutcome {
    pub session_id: SessionId,
    pub report: CleanupReport,
    /// The record was fully cleaned and removed from the store
    pub removed: bool,
}

/// Retry every stored record.
///
/// `live` is the current cleanup configuration; it supplies secrets that
/// were redacted from the record, plus handler files and type mappings.
/// Fully cleaned records are removed, the rest are rewritten with what is
/// still failing. A record that cannot be retried at all is logged, kept in
/// the store and reported as failing; the remaining records still run.
pub async fn retry_failed_cleanups(
    store: &FailedCleanupStore,
    live: Option<&CleanupConfig>,
    cwd: &Path,
) -> CleanupResult<Vec<RetryOutcome>> {
    let records = store.list()?;
    info!(records = records.len(), "Retrying failed cleanups");

    let mut outcomes = Vec::with_capacity(records.len());
    for record in records {
        let outcome = match retry_record(store, &record, live, cwd).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(session = %record.session_id, error = %e, "Skipping failed cleanup record");
                not_attempted(&record, &e.to_string())
            }
        };
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

fn not_attempted(record: &FailedCleanupRecord, reason: &str) -> RetryOutcome {
    RetryOutcome {
        session_id: record.session_id.clone(),
        report: CleanupReport {
            success: false,
            failed: record
                .resources
                .iter()
                .map(|r| format!("{} (not retried: {})", r.label(), reason))
                .collect(),
            failed_resources: record.resources.clone(),
            ..CleanupReport::default()
        },
        removed: false,
    }
}

/// Retry the record stored for one session.
pub async fn retry_session(
    store: &FailedCleanupStore,
    session_id: &SessionId,
    live: Option<&CleanupConfig>,
    cwd: &Path,
) -> CleanupResult<RetryOutcome> {
    let record = store.load(session_id)?;
    retry_record(store, &record, live, cwd).await
}

async fn retry_record(
    store: &FailedCleanupStore,
    record: &FailedCleanupRecord,
    live: Option<&CleanupConfig>,
    cwd: &Path,
) -> CleanupResult<RetryOutcome> {
    let live_provider = live.and_then(|c| c.provider_config().ok());
    let provider_config = match (&record.provider_config, &live_provider) {
        (Some(saved), Some(current)) => saved.with_secrets_from(current),
        (Some(saved), None) => saved.clone(),
        (None, Some(current)) => current.clone(),
        (None, None) => ProviderConfig::Other {
            name: "custom".to_string(),
            settings: Default::default(),
        },
    }
    .with_env_secrets();

    let mut config = live.cloned().unwrap_or_default();
    if config.provider != provider_config.name() {
        // Type mappings belong to a different provider; keep only handler files.
        warn!(
            session = %record.session_id,
            recorded = provider_config.name(),
            configured = %config.provider,
            "Recorded provider differs from configuration"
        );
        config.types.clear();
        config.provider = provider_config.name().to_string();
    }

    let registry = HandlerRegistry::from_parts(&config, &provider_config, cwd)?;
    let executor = CleanupExecutor::new(Arc::new(registry)).with_store(store.clone());
    let opts = CleanupOptions {
        provider_config: Some(provider_config),
        scan_untracked: false,
        ..CleanupOptions::from_config(&config)
    }
    .with_session(record.session_id.clone());

    let report = executor.run(&record.resources, &opts).await;
    let removed = if report.success {
        store.remove(&record.session_id)?
    } else {
        false
    };

    info!(
        session = %record.session_id,
        deleted = report.deleted.len(),
        failed = report.failed.len(),
        removed,
        "Retried failed cleanup"
    );
    Ok(RetryOutcome {
        session_id: record.session_id.clone(),
        report,
        removed,
    })
}
