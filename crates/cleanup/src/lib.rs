//! tidyrun Cleanup Engine
//!
//! Deletes the resources a test session created. The pieces:
//!
//! - [`HandlerRegistry`] resolves a resource type to a [`DeleteHandler`],
//!   from a built-in provider, handler files, or explicit mappings.
//! - [`CleanupExecutor`] deletes a batch newest first with retry and
//!   backoff, optionally in parallel, then optionally scans the provider
//!   for resources that were never reported.
//! - [`FailedCleanupStore`] keeps what could not be deleted so that
//!   [`retry_failed_cleanups`] can finish the job later.

pub mod error;
pub mod executor;
pub mod handler;
pub mod manifest;
pub mod provider;
pub mod providers;
pub mod registry;
pub mod resume;
pub mod retry;
pub mod scan;
pub mod store;
pub mod template;

pub use error::{CleanupError, CleanupResult, DeleteError};
pub use executor::{CleanupExecutor, CleanupOptions, CleanupReport};
pub use handler::{handler_fn, DeleteHandler};
pub use provider::{CleanupProvider, TestIdentity, UntrackedOutcome, UntrackedScanOptions};
pub use registry::HandlerRegistry;
pub use resume::{retry_failed_cleanups, retry_session, RetryOutcome};
pub use retry::RetryPolicy;
pub use store::{FailedCleanupRecord, FailedCleanupStore};
