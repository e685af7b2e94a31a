//! Core types for tidyrun

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// A backend resource created during a test run and recorded for deletion.
///
/// `resource_type` + `id` form the natural key. `deleted` is the only field
/// that may change after the resource is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedResource {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub id: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default, alias = "created_at", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
}

impl TrackedResource {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            metadata: serde_json::Map::new(),
            created_at: None,
            deleted: None,
        }
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.resource_type, &self.id)
    }

    /// `"<type>:<id>"`
    pub fn label(&self) -> String {
        format!("{}:{}", self.resource_type, self.id)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.unwrap_or(false)
    }

    /// Metadata value rendered as a plain string (strings unquoted).
    pub fn metadata_str(&self, key: &str) -> Option<String> {
        self.metadata.get(key).map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Creation time in epoch milliseconds; missing timestamps count as zero.
    fn created_millis(&self) -> i64 {
        self.created_at.map(|t| t.timestamp_millis()).unwrap_or(0)
    }
}

/// Sort resources newest first.
///
/// The sort is stable: resources with equal (or missing) timestamps keep
/// their tracking order, and missing timestamps sort last.
pub fn sort_newest_first(resources: &mut [TrackedResource]) {
    resources.sort_by(|a, b| b.created_millis().cmp(&a.created_millis()));
}

/// Natural key of a tracked resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub resource_type: String,
    pub id: String,
}

impl ResourceKey {
    pub fn new(resource_type: &str, id: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource_type, self.id)
    }
}

/// Ordered, append-only record of the resources a session created.
///
/// Reports arrive at-least-once, so inserting a resource whose key is
/// already present is a no-op apart from propagating a `deleted` flag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<TrackedResource>", into = "Vec<TrackedResource>")]
pub struct ResourceLedger {
    entries: Vec<TrackedResource>,
    keys: HashSet<ResourceKey>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a resource. Returns `true` if it was not already present.
    pub fn push(&mut self, resource: TrackedResource) -> bool {
        let key = resource.key();
        if self.keys.contains(&key) {
            if resource.is_deleted() {
                self.mark_deleted(&key.resource_type, &key.id);
            }
            return false;
        }
        self.keys.insert(key);
        self.entries.push(resource);
        true
    }

    /// Record many resources, returning how many were new.
    pub fn extend<I>(&mut self, resources: I) -> usize
    where
        I: IntoIterator<Item = TrackedResource>,
    {
        resources
            .into_iter()
            .map(|r| self.push(r))
            .filter(|added| *added)
            .count()
    }

    /// Merge another ledger into this one, returning how many entries were new.
    pub fn merge(&mut self, other: &ResourceLedger) -> usize {
        self.extend(other.entries.iter().cloned())
    }

    /// Flag a resource as already removed. Returns `false` if it is unknown.
    pub fn mark_deleted(&mut self, resource_type: &str, id: &str) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|r| r.resource_type == resource_type && r.id == id)
        {
            Some(entry) => {
                entry.deleted = Some(true);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, resource_type: &str, id: &str) -> bool {
        self.keys.contains(&ResourceKey::new(resource_type, id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedResource> {
        self.entries.iter()
    }

    /// Resources not yet flagged as deleted
    pub fn pending(&self) -> impl Iterator<Item = &TrackedResource> {
        self.entries.iter().filter(|r| !r.is_deleted())
    }

    pub fn as_slice(&self) -> &[TrackedResource] {
        &self.entries
    }

    pub fn into_vec(self) -> Vec<TrackedResource> {
        self.entries
    }
}

impl From<Vec<TrackedResource>> for ResourceLedger {
    fn from(resources: Vec<TrackedResource>) -> Self {
        let mut ledger = Self::new();
        ledger.extend(resources);
        ledger
    }
}

impl From<ResourceLedger> for Vec<TrackedResource> {
    fn from(ledger: ResourceLedger) -> Self {
        ledger.entries
    }
}

impl FromIterator<TrackedResource> for ResourceLedger {
    fn from_iter<I: IntoIterator<Item = TrackedResource>>(iter: I) -> Self {
        let mut ledger = Self::new();
        ledger.extend(iter);
        ledger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn label_joins_type_and_id() {
        let r = TrackedResource::new("row", "abc");
        assert_eq!(r.label(), "row:abc");
        assert_eq!(r.key().to_string(), "row:abc");
    }

    #[test]
    fn deserializes_wire_shape() {
        let json = r#"{"type":"file","id":"f1","metadata":{"bucketId":"b1"},"createdAt":"2024-01-02T03:04:05Z"}"#;
        let r: TrackedResource = serde_json::from_str(json).unwrap();
        assert_eq!(r.resource_type, "file");
        assert_eq!(r.metadata_str("bucketId").as_deref(), Some("b1"));
        assert!(r.created_at.is_some());
        assert!(!r.is_deleted());
    }

    #[test]
    fn sort_is_newest_first_with_missing_last() {
        let mut resources = vec![
            TrackedResource::new("row", "old").with_created_at(at(100)),
            TrackedResource::new("row", "none-a"),
            TrackedResource::new("row", "new").with_created_at(at(300)),
            TrackedResource::new("row", "none-b"),
            TrackedResource::new("row", "mid").with_created_at(at(200)),
        ];
        sort_newest_first(&mut resources);
        let ids: Vec<_> = resources.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid", "old", "none-a", "none-b"]);
    }

    #[test]
    fn sort_keeps_tracking_order_for_ties() {
        let mut resources = vec![
            TrackedResource::new("row", "first").with_created_at(at(50)),
            TrackedResource::new("row", "second").with_created_at(at(50)),
            TrackedResource::new("row", "third").with_created_at(at(50)),
        ];
        sort_newest_first(&mut resources);
        let ids: Vec<_> = resources.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }

    #[test]
    fn ledger_deduplicates_overlapping_batches() {
        let mut ledger = ResourceLedger::new();
        let first = vec![TrackedResource::new("row", "1"), TrackedResource::new("file", "2")];
        let second = vec![TrackedResource::new("file", "2"), TrackedResource::new("user", "3")];

        assert_eq!(ledger.extend(first), 2);
        assert_eq!(ledger.extend(second), 1);
        assert_eq!(ledger.len(), 3);
        assert_eq!(
            ledger.iter().filter(|r| r.label() == "file:2").count(),
            1
        );
    }

    #[test]
    fn duplicate_report_propagates_deleted_flag() {
        let mut ledger = ResourceLedger::new();
        ledger.push(TrackedResource::new("row", "1"));

        let mut again = TrackedResource::new("row", "1");
        again.deleted = Some(true);
        assert!(!ledger.push(again));

        assert!(ledger.as_slice()[0].is_deleted());
        assert_eq!(ledger.pending().count(), 0);
    }

    #[test]
    fn duplicate_report_never_reverts_deleted() {
        let mut ledger = ResourceLedger::new();
        ledger.push(TrackedResource::new("row", "1"));
        ledger.mark_deleted("row", "1");
        ledger.push(TrackedResource::new("row", "1"));
        assert!(ledger.as_slice()[0].is_deleted());
    }

    #[test]
    fn mark_deleted_unknown_returns_false() {
        let mut ledger = ResourceLedger::new();
        assert!(!ledger.mark_deleted("row", "missing"));
    }

    #[test]
    fn ledger_roundtrips_as_plain_list() {
        let ledger: ResourceLedger = vec![
            TrackedResource::new("row", "1"),
            TrackedResource::new("row", "1"),
        ]
        .into();
        let json = serde_json::to_value(&ledger).unwrap();
        assert!(json.is_array());
        assert_eq!(json.as_array().unwrap().len(), 1);

        let back: ResourceLedger = serde_json::from_value(json).unwrap();
        assert!(back.contains("row", "1"));
    }
}
