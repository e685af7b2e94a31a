//! Cleanup executor
//!
//! Deletes a batch of tracked resources newest first, with retry and
//! backoff, optionally in parallel, followed by an optional untracked scan.
//! Anything left behind is written to the failed-cleanup store.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use tidyrun_common::{sort_newest_first, CleanupConfig, ProviderConfig, SessionId, TrackedResource};

use crate::handler::DeleteHandler;
use crate::provider::{TestIdentity, UntrackedScanOptions};
use crate::registry::HandlerRegistry;
use crate::retry::RetryPolicy;
use crate::scan::effective_start_time;
use crate::store::{FailedCleanupRecord, FailedCleanupStore};

/// Options for one cleanup pass
#[derive(Debug, Clone, Default)]
pub struct CleanupOptions {
    pub parallel: bool,
    pub retry: RetryPolicy,
    pub scan_untracked: bool,
    /// Snapshot stored (redacted) with a failure record
    pub provider_config: Option<ProviderConfig>,
    pub session_id: Option<SessionId>,
    /// Lower bound for the untracked scan; inferred from the test user if unset
    pub test_start_time: Option<DateTime<Utc>>,
    pub identity: TestIdentity,
}

impl CleanupOptions {
    pub fn from_config(config: &CleanupConfig) -> Self {
        Self {
            parallel: config.parallel,
            retry: RetryPolicy::new(config.attempts()),
            scan_untracked: config.scan_untracked,
            provider_config: config.provider_config().ok(),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

/// Result of a cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub success: bool,
    /// `type:id` labels, possibly annotated
    pub deleted: Vec<String>,
    /// `type:id (reason)` labels
    pub failed: Vec<String>,
    #[serde(skip)]
    pub failed_resources: Vec<TrackedResource>,
    #[serde(skip)]
    pub record_path: Option<PathBuf>,
}

impl CleanupReport {
    fn fail(&mut self, resource: &TrackedResource, reason: &str) {
        self.failed.push(format!("{} ({})", resource.label(), reason));
        self.failed_resources.push(resource.clone());
    }
}

enum Plan {
    AlreadyDeleted(TrackedResource),
    NoHandler(TrackedResource),
    Delete(TrackedResource, Arc<dyn DeleteHandler>),
}

pub struct CleanupExecutor {
    registry: Arc<HandlerRegistry>,
    store: Option<FailedCleanupStore>,
}

impl CleanupExecutor {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self {
            registry,
            store: None,
        }
    }

    /// Persist unresolved failures to `store`.
    pub fn with_store(mut self, store: FailedCleanupStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub async fn run(&self, resources: &[TrackedResource], opts: &CleanupOptions) -> CleanupReport {
        let mut ordered = resources.to_vec();
        sort_newest_first(&mut ordered);

        let session = opts.session_id.clone().unwrap_or_else(SessionId::fallback);
        info!(
            session = %session,
            resources = ordered.len(),
            parallel = opts.parallel,
            attempts = opts.retry.attempts,
            "Starting cleanup"
        );

        let plans: Vec<Plan> = ordered
            .into_iter()
            .map(|r| {
                if r.is_deleted() {
                    Plan::AlreadyDeleted(r)
                } else {
                    match self.registry.resolve(&r.resource_type) {
                        Some(handler) => Plan::Delete(r, handler),
                        None => Plan::NoHandler(r),
                    }
                }
            })
            .collect();

        let mut report = CleanupReport::default();
        let mut work = Vec::new();
        for plan in plans {
            match plan {
                Plan::AlreadyDeleted(r) => {
                    debug!(resource = %r.label(), "Already deleted during run");
                    report.deleted.push(format!("{} (already deleted)", r.label()));
                }
                Plan::NoHandler(r) => {
                    warn!(resource = %r.label(), "No cleanup handler for resource type");
                    let reason = format!("no handler for type {}", r.resource_type);
                    report.fail(&r, &reason);
                }
                Plan::Delete(r, handler) => work.push((r, handler)),
            }
        }

        let outcomes = if opts.parallel {
            join_all(work.iter().map(|(r, h)| delete_one(r, h.as_ref(), opts.retry))).await
        } else {
            let mut outcomes = Vec::with_capacity(work.len());
            for (r, h) in &work {
                outcomes.push(delete_one(r, h.as_ref(), opts.retry).await);
            }
            outcomes
        };

        for ((resource, _), outcome) in work.iter().zip(outcomes) {
            match outcome {
                Ok(()) => report.deleted.push(resource.label()),
                Err(message) => report.fail(resource, &message),
            }
        }

        if opts.scan_untracked {
            self.scan_untracked(resources, opts, &session, &mut report).await;
        }

        report.success = report.failed.is_empty();
        if !report.success {
            report.record_path = self.persist(&session, &report, opts);
        }

        info!(
            session = %session,
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "Cleanup finished"
        );
        report
    }

    async fn scan_untracked(
        &self,
        resources: &[TrackedResource],
        opts: &CleanupOptions,
        session: &SessionId,
        report: &mut CleanupReport,
    ) {
        let Some(provider) = self.registry.provider().filter(|p| p.supports_untracked()) else {
            debug!("Provider does not support untracked scans");
            return;
        };
        let Some(start_time) = effective_start_time(opts.test_start_time, &opts.identity) else {
            warn!(session = %session, "Skipping untracked scan: no start time and no test user creation time");
            return;
        };

        let scan = UntrackedScanOptions {
            session_id: session.clone(),
            identity: opts.identity.clone(),
            start_time,
            tracked: resources.iter().map(TrackedResource::key).collect::<HashSet<_>>(),
            retry: opts.retry,
        };
        match provider.cleanup_untracked(&scan).await {
            Ok(outcome) => {
                report.deleted.extend(outcome.deleted);
                for (resource, message) in outcome.failed {
                    report.fail(&resource, &message);
                }
            }
            Err(e) => warn!(session = %session, error = %e, "Untracked scan failed"),
        }
    }

    fn persist(&self, session: &SessionId, report: &CleanupReport, opts: &CleanupOptions) -> Option<PathBuf> {
        let store = self.store.as_ref()?;
        let record = FailedCleanupRecord::new(
            session.clone(),
            report.failed_resources.clone(),
            opts.provider_config.as_ref(),
            report.failed.clone(),
        );
        match store.save(&record) {
            Ok(path) => {
                warn!(
                    session = %session,
                    path = %path.display(),
                    "Cleanup incomplete; failures recorded for retry"
                );
                Some(path)
            }
            Err(e) => {
                error!(session = %session, error = %e, "Failed to persist cleanup failures");
                None
            }
        }
    }
}

async fn delete_one(
    resource: &TrackedResource,
    handler: &dyn DeleteHandler,
    retry: RetryPolicy,
) -> Result<(), String> {
    let label = resource.label();
    match retry.run(&label, || handler.delete(resource)).await {
        Ok(attempts) => {
            debug!(resource = %label, attempts, "Deleted");
            Ok(())
        }
        Err((e, attempts)) => {
            warn!(resource = %label, attempts, error = %e, "Deletion failed");
            Err(e.to_string())
        }
    }
}
