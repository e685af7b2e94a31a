//! Persisted records of cleanups that did not finish
//!
//! One JSON file per session under `<state_dir>/failed-cleanups/`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use tidyrun_common::{ProviderConfig, SessionId, TrackedResource};

use crate::error::{CleanupError, CleanupResult};

/// Resources a cleanup pass could not delete.
///
/// `provider_config` is always stored redacted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedCleanupRecord {
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub resources: Vec<TrackedResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<ProviderConfig>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl FailedCleanupRecord {
    pub fn new(
        session_id: SessionId,
        resources: Vec<TrackedResource>,
        provider_config: Option<&ProviderConfig>,
        errors: Vec<String>,
    ) -> Self {
        Self {
            session_id,
            timestamp: Utc::now(),
            resources,
            provider_config: provider_config.map(ProviderConfig::redacted),
            errors,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailedCleanupStore {
    dir: PathBuf,
}

impl FailedCleanupStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, session_id: &SessionId) -> PathBuf {
        self.dir.join(format!("{}.json", session_id.file_stem()))
    }

    /// Write a record, replacing any previous one for the same session.
    pub fn save(&self, record: &FailedCleanupRecord) -> CleanupResult<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&record.session_id);
        let tmp = path.with_extension("json.tmp");

        // Redact again in case the caller built the record by hand.
        let mut record = record.clone();
        record.provider_config = record.provider_config.as_ref().map(ProviderConfig::redacted);

        let json = serde_json::to_vec_pretty(&record)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), "Saved failed cleanup record");
        Ok(path)
    }

    pub fn load(&self, session_id: &SessionId) -> CleanupResult<FailedCleanupRecord> {
        let path = self.path_for(session_id);
        if !path.exists() {
            return Err(CleanupError::Store(format!(
                "no failed cleanup record for session {}",
                session_id
            )));
        }
        Self::read(&path)
    }

    fn read(path: &Path) -> CleanupResult<FailedCleanupRecord> {
        let raw = fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// All readable records, oldest first.
    pub fn list(&self) -> CleanupResult<Vec<FailedCleanupRecord>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable cleanup record"),
            }
        }
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(records)
    }

    /// Remove a record. Returns `false` if there was none.
    pub fn remove(&self, session_id: &SessionId) -> CleanupResult<bool> {
        let path = self.path_for(session_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tidyrun_common::AppwriteConfig;

    fn record(session: &str) -> FailedCleanupRecord {
        FailedCleanupRecord::new(
            SessionId::from(session),
            vec![TrackedResource::new("row", "r1")],
            Some(&ProviderConfig::Appwrite(AppwriteConfig {
                endpoint: "http://localhost/v1".into(),
                project_id: "p".into(),
                api_key: Some("top-secret".into()),
                database_id: None,
            })),
            vec!["row:r1 (boom)".into()],
        )
    }

    #[test]
    fn save_load_remove() {
        let dir = TempDir::new().unwrap();
        let store = FailedCleanupStore::new(dir.path());

        let path = store.save(&record("sess_a")).unwrap();
        assert!(path.ends_with("sess_a.json"));

        let loaded = store.load(&SessionId::from("sess_a")).unwrap();
        assert_eq!(loaded.resources.len(), 1);
        assert_eq!(loaded.errors, vec!["row:r1 (boom)"]);

        assert!(store.remove(&SessionId::from("sess_a")).unwrap());
        assert!(!store.remove(&SessionId::from("sess_a")).unwrap());
        assert!(store.load(&SessionId::from("sess_a")).is_err());
    }

    #[test]
    fn secrets_never_reach_disk() {
        let dir = TempDir::new().unwrap();
        let store = FailedCleanupStore::new(dir.path());
        let path = store.save(&record("sess_b")).unwrap();

        let raw = fs::read_to_string(path).unwrap();
        assert!(!raw.contains("top-secret"));
        assert!(raw.contains("\"sessionId\""));
        assert!(raw.contains("\"providerConfig\""));
    }

    #[test]
    fn list_skips_garbage_files() {
        let dir = TempDir::new().unwrap();
        let store = FailedCleanupStore::new(dir.path());
        store.save(&record("sess_1")).unwrap();
        store.save(&record("sess_2")).unwrap();
        fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let records = store.list().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].timestamp <= records[1].timestamp);
    }

    #[test]
    fn list_of_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = FailedCleanupStore::new(dir.path().join("absent"));
        assert!(store.list().unwrap().is_empty());
    }
}
