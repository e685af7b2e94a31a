//! tidyrun Common Library
//!
//! Shared vocabulary for the tidyrun crates: tracked resources and the
//! resource ledger, session identifiers, and the layered cleanup
//! configuration consumed by the scheduler and the cleanup engine.

pub mod config;
pub mod error;
pub mod session;
pub mod types;

pub use config::{
    infer_cleanup, AppwriteConfig, CleanupConfig, DiscoverConfig, GlobalConfig,
    HttpProviderConfig, Layered, LegacyAppwriteSection, ProviderConfig, ProviderKind,
    RunSection, ScanSource, ServerSection, TrackingSection,
};
pub use error::{Error, Result};
pub use session::{short_id, SessionId};
pub use types::{sort_newest_first, ResourceKey, ResourceLedger, TrackedResource};

/// Environment variable overriding the state directory
pub const STATE_DIR_ENV: &str = "TIDYRUN_STATE_DIR";

/// Default state directory (`$TIDYRUN_STATE_DIR`, else `~/.tidyrun`)
pub fn default_state_dir() -> std::path::PathBuf {
    if let Some(dir) = std::env::var_os(STATE_DIR_ENV) {
        return std::path::PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".tidyrun")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
