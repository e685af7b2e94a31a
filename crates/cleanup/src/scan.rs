//! Correlating untracked resources with a test session
//!
//! A candidate belongs to the session when it was created at or after the
//! effective start time and one of the following holds, strongest first:
//! its access-control list names only the test user or teams the user
//! exclusively owns; its id is the user's or one of those teams'; or one of
//! its values contains the user's id or email.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::provider::TestIdentity;

/// A resource listed by a provider during an untracked scan
#[derive(Debug, Clone, PartialEq)]
pub struct ScanCandidate {
    pub resource_type: String,
    pub id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub fields: Value,
    pub permissions: Vec<String>,
}

/// Why a candidate was attributed to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchReason {
    AccessControl,
    ExactId,
    ContainsIdentity,
}

impl std::fmt::Display for MatchReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchReason::AccessControl => write!(f, "access control"),
            MatchReason::ExactId => write!(f, "exact id"),
            MatchReason::ContainsIdentity => write!(f, "identity reference"),
        }
    }
}

/// Explicit start time, else the test user's creation time.
pub fn effective_start_time(
    explicit: Option<DateTime<Utc>>,
    identity: &TestIdentity,
) -> Option<DateTime<Utc>> {
    explicit.or(identity.created_at)
}

/// Decide whether `candidate` belongs to the session.
pub fn correlate(
    candidate: &ScanCandidate,
    identity: &TestIdentity,
    start_time: DateTime<Utc>,
) -> Option<MatchReason> {
    // Candidates without a creation time cannot be proven recent.
    let created = candidate.created_at?;
    if created < start_time || identity.is_empty() {
        return None;
    }

    if owned_by_acl(&candidate.permissions, identity) {
        return Some(MatchReason::AccessControl);
    }

    let exact = identity.user_id.as_deref() == Some(candidate.id.as_str())
        || identity.team_ids.iter().any(|t| t == &candidate.id);
    if exact {
        return Some(MatchReason::ExactId);
    }

    if contains_identity(&candidate.fields, identity) {
        return Some(MatchReason::ContainsIdentity);
    }

    None
}

fn owned_by_acl(permissions: &[String], identity: &TestIdentity) -> bool {
    if permissions.is_empty() {
        return false;
    }
    permissions.iter().all(|p| {
        let role = permission_role(p);
        if let Some(user) = role.strip_prefix("user:") {
            let user = user.split('/').next().unwrap_or(user);
            identity.user_id.as_deref() == Some(user)
        } else if let Some(team) = role.strip_prefix("team:") {
            let team = team.split('/').next().unwrap_or(team);
            identity.team_ids.iter().any(|t| t == team)
        } else {
            false
        }
    })
}

/// Extract the role from `read("user:abc")`-style entries.
fn permission_role(permission: &str) -> &str {
    match (permission.find("(\""), permission.rfind("\")")) {
        (Some(start), Some(end)) if end > start + 2 => &permission[start + 2..end],
        _ => permission,
    }
}

fn contains_identity(value: &Value, identity: &TestIdentity) -> bool {
    match value {
        Value::String(s) => {
            identity
                .user_id
                .as_deref()
                .is_some_and(|id| !id.is_empty() && s.contains(id))
                || identity
                    .email
                    .as_deref()
                    .is_some_and(|e| !e.is_empty() && s.to_lowercase().contains(&e.to_lowercase()))
        }
        Value::Array(items) => items.iter().any(|v| contains_identity(v, identity)),
        Value::Object(map) => map.values().any(|v| contains_identity(v, identity)),
        _ => false,
    }
}
