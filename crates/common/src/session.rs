//! Session identifiers
//!
//! A session is one end-to-end run: possibly many workflows and tests, one
//! resource ledger and one cleanup pass.

use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A unique session identifier.
///
/// Generated ids look like `sess_20240102030405_1a2b3c4d`; ids supplied by a
/// caller (for example an out-of-band retry) are accepted verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new session id.
    pub fn generate() -> Self {
        let mut random = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut random);
        Self(format!(
            "sess_{}_{}",
            Utc::now().format("%Y%m%d%H%M%S"),
            hex::encode(random)
        ))
    }

    /// Key used when a record has no session id.
    pub fn fallback() -> Self {
        Self(format!("unknown_{}", Utc::now().timestamp_millis()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-name-safe form of the id.
    pub fn file_stem(&self) -> String {
        let stem: String = self
            .0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if stem.is_empty() {
            "_".to_string()
        } else {
            stem
        }
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Short unique identifier for use in generated test data (`${uid}`).
pub fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
