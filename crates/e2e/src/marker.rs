//! Per-session marker file
//!
//! A marker under `<state>/sessions/<id>.lock` records that a session is in
//! progress. It is removed when the run ends, including on interrupt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use tidyrun_common::SessionId;

use crate::error::E2eResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerInfo {
    pub session_id: SessionId,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

pub struct SessionMarker {
    path: PathBuf,
    removed: bool,
}

impl SessionMarker {
    /// Write the marker for `session` into `sessions_dir`.
    pub fn create(sessions_dir: &Path, session: &SessionId) -> E2eResult<Self> {
        fs::create_dir_all(sessions_dir)?;
        let path = sessions_dir.join(format!("{}.lock", session.file_stem()));
        let info = MarkerInfo {
            session_id: session.clone(),
            pid: std::process::id(),
            started_at: Utc::now(),
        };
        fs::write(&path, serde_json::to_vec_pretty(&info)?)?;
        debug!("Session marker written to {}", path.display());
        Ok(Self { path, removed: false })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> E2eResult<MarkerInfo> {
        Ok(serde_json::from_slice(&fs::read(&self.path)?)?)
    }

    pub fn remove(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Session marker removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove session marker {}: {}", self.path.display(), e),
        }
    }
}

impl Drop for SessionMarker {
    fn drop(&mut self) {
        self.remove();
    }
}
