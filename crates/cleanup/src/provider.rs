//! Cleanup provider capability interface

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tidyrun_common::{ProviderConfig, ResourceKey, SessionId, TrackedResource};

use crate::error::CleanupResult;
use crate::handler::DeleteHandler;
use crate::retry::RetryPolicy;

/// A backend that knows how to delete its own resource types.
#[async_trait]
pub trait CleanupProvider: Send + Sync {
    /// Provider name, used as the handler namespace
    fn name(&self) -> &str;

    /// Apply provider-specific configuration.
    fn configure(&mut self, config: &ProviderConfig) -> CleanupResult<()>;

    /// Method name -> deletion handler. Method names double as the default
    /// resource type mapping.
    fn methods(&self) -> HashMap<String, Arc<dyn DeleteHandler>>;

    fn supports_untracked(&self) -> bool {
        false
    }

    /// Find and delete resources belonging to the session that were never
    /// reported.
    async fn cleanup_untracked(&self, _opts: &UntrackedScanOptions) -> CleanupResult<UntrackedOutcome> {
        Ok(UntrackedOutcome::default())
    }
}

/// Who the test ran as, used to correlate untracked resources
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestIdentity {
    pub user_id: Option<String>,
    pub email: Option<String>,
    /// Teams created by (and therefore exclusively owned by) the test user
    pub team_ids: Vec<String>,
    /// When the test user itself was created
    pub created_at: Option<DateTime<Utc>>,
}

impl TestIdentity {
    pub fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.email.is_none() && self.team_ids.is_empty()
    }
}

/// Inputs to an untracked scan
#[derive(Debug, Clone)]
pub struct UntrackedScanOptions {
    pub session_id: SessionId,
    pub identity: TestIdentity,
    /// Only resources created at or after this instant are candidates
    pub start_time: DateTime<Utc>,
    /// Keys already handled by the tracked pass
    pub tracked: HashSet<ResourceKey>,
    pub retry: RetryPolicy,
}

/// What an untracked scan deleted or failed to delete
#[derive(Debug, Clone, Default)]
pub struct UntrackedOutcome {
    pub deleted: Vec<String>,
    pub failed: Vec<(TrackedResource, String)>,
}
