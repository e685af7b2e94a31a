//! REST provider
//!
//! Deletes resources with `DELETE {endpoint}{path}` where the path comes
//! from a per-type template. The Appwrite preset is the same provider with
//! Appwrite's paths, headers and listing endpoints filled in.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use tidyrun_common::{
    sort_newest_first, AppwriteConfig, HttpProviderConfig, ProviderConfig, ScanSource,
    TrackedResource,
};

use crate::error::{CleanupError, CleanupResult, DeleteError};
use crate::handler::{classify_status, DeleteHandler};
use crate::provider::{CleanupProvider, UntrackedOutcome, UntrackedScanOptions};
use crate::scan::{correlate, ScanCandidate};
use crate::template;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Preset {
    Http,
    Appwrite,
}

/// Connection state shared by every handler the provider hands out
#[derive(Debug)]
struct Endpoint {
    client: Client,
    base: String,
    headers: BTreeMap<String, String>,
    defaults: BTreeMap<String, String>,
}

impl Endpoint {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base.trim_end_matches('/'), path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, self.url(path));
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        req
    }
}

pub struct RestProvider {
    preset: Preset,
    endpoint: Option<Arc<Endpoint>>,
    paths: BTreeMap<String, String>,
    scan: Vec<ScanSource>,
}

impl RestProvider {
    /// Generic REST provider, configured from an `http` section.
    pub fn http() -> Self {
        Self {
            preset: Preset::Http,
            endpoint: None,
            paths: BTreeMap::new(),
            scan: Vec::new(),
        }
    }

    /// REST provider preset for Appwrite.
    pub fn appwrite() -> Self {
        Self {
            preset: Preset::Appwrite,
            ..Self::http()
        }
    }

    fn configure_http(&mut self, cfg: &HttpProviderConfig, defaults: BTreeMap<String, String>) -> CleanupResult<()> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let mut headers = cfg.headers.clone();
        headers.extend(cfg.secret_headers.clone());

        self.endpoint = Some(Arc::new(Endpoint {
            client,
            base: cfg.endpoint.clone(),
            headers,
            defaults,
        }));
        self.paths = cfg.paths.clone();
        self.scan = cfg.scan.clone();
        Ok(())
    }

    async fn list_candidates(&self, endpoint: &Endpoint, source: &ScanSource) -> Result<Vec<ScanCandidate>, DeleteError> {
        let response = endpoint.request(reqwest::Method::GET, &source.list_path).send().await?;
        let body: Value = response.error_for_status()?.json().await?;

        let items = if source.items_pointer.is_empty() {
            Some(&body)
        } else {
            body.pointer(&source.items_pointer)
        };
        let Some(Value::Array(items)) = items else {
            return Err(DeleteError::permanent(format!(
                "listing {} did not return an array at '{}'",
                source.list_path, source.items_pointer
            )));
        };

        Ok(items
            .iter()
            .filter_map(|item| {
                let id = item.get(&source.id_field)?.as_str()?.to_string();
                let created_at = item.get(&source.created_field).and_then(parse_timestamp);
                let permissions = item
                    .get(&source.permissions_field)
                    .and_then(Value::as_array)
                    .map(|perms| {
                        perms
                            .iter()
                            .filter_map(|p| p.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                Some(ScanCandidate {
                    resource_type: source.resource_type.clone(),
                    id,
                    created_at,
                    fields: item.clone(),
                    permissions,
                })
            })
            .collect())
    }
}

fn appwrite_http_config(cfg: &AppwriteConfig) -> HttpProviderConfig {
    let paths = [
        ("row", "/tablesdb/${metadata.databaseId}/tables/${metadata.tableId}/rows/${id}"),
        (
            "document",
            "/databases/${metadata.databaseId}/collections/${metadata.collectionId}/documents/${id}",
        ),
        ("file", "/storage/buckets/${metadata.bucketId}/files/${id}"),
        ("bucket", "/storage/buckets/${id}"),
        ("membership", "/teams/${metadata.teamId}/memberships/${id}"),
        ("team", "/teams/${id}"),
        ("user", "/users/${id}"),
    ];
    let listing = |resource_type: &str, list_path: &str, pointer: &str| ScanSource {
        resource_type: resource_type.to_string(),
        list_path: list_path.to_string(),
        items_pointer: pointer.to_string(),
        id_field: "$id".to_string(),
        created_field: "$createdAt".to_string(),
        permissions_field: "$permissions".to_string(),
    };

    let mut headers = BTreeMap::new();
    headers.insert("X-Appwrite-Project".to_string(), cfg.project_id.clone());
    let mut secret_headers = BTreeMap::new();
    if let Some(key) = &cfg.api_key {
        secret_headers.insert("X-Appwrite-Key".to_string(), key.clone());
    }

    HttpProviderConfig {
        endpoint: cfg.endpoint.clone(),
        headers,
        secret_headers,
        paths: paths
            .iter()
            .map(|(t, p)| (t.to_string(), p.to_string()))
            .collect(),
        scan: vec![
            listing("team", "/teams", "/teams"),
            listing("user", "/users", "/users"),
        ],
    }
}

/// RFC 3339 strings or epoch milliseconds.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

#[async_trait]
impl CleanupProvider for RestProvider {
    fn name(&self) -> &str {
        match self.preset {
            Preset::Http => "http",
            Preset::Appwrite => "appwrite",
        }
    }

    fn configure(&mut self, config: &ProviderConfig) -> CleanupResult<()> {
        match (self.preset, config) {
            (Preset::Http, ProviderConfig::Http(cfg)) => self.configure_http(cfg, BTreeMap::new()),
            (Preset::Appwrite, ProviderConfig::Appwrite(cfg)) => {
                let mut defaults = BTreeMap::new();
                if let Some(db) = &cfg.database_id {
                    defaults.insert("databaseId".to_string(), db.clone());
                }
                if cfg.api_key.is_none() {
                    warn!("Appwrite cleanup has no API key; deletions will likely be rejected");
                }
                self.configure_http(&appwrite_http_config(cfg), defaults)
            }
            (_, other) => Err(CleanupError::NotConfigured(format!(
                "{} (got configuration for '{}')",
                self.name(),
                other.name()
            ))),
        }
    }

    fn methods(&self) -> HashMap<String, Arc<dyn DeleteHandler>> {
        let Some(endpoint) = &self.endpoint else {
            return HashMap::new();
        };
        self.paths
            .iter()
            .map(|(resource_type, path)| {
                let handler: Arc<dyn DeleteHandler> = Arc::new(RestDeleteHandler {
                    endpoint: Arc::clone(endpoint),
                    path: path.clone(),
                });
                (resource_type.clone(), handler)
            })
            .collect()
    }

    fn supports_untracked(&self) -> bool {
        !self.scan.is_empty()
    }

    async fn cleanup_untracked(&self, opts: &UntrackedScanOptions) -> CleanupResult<UntrackedOutcome> {
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or_else(|| CleanupError::NotConfigured(self.name().to_string()))?;
        let handlers = self.methods();
        let mut matches = Vec::new();

        for source in &self.scan {
            let candidates = match self.list_candidates(endpoint, source).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(source = %source.list_path, error = %e, "Untracked scan listing failed");
                    continue;
                }
            };
            for candidate in candidates {
                let resource = TrackedResource {
                    resource_type: candidate.resource_type.clone(),
                    id: candidate.id.clone(),
                    metadata: serde_json::Map::new(),
                    created_at: candidate.created_at,
                    deleted: None,
                };
                if opts.tracked.contains(&resource.key()) {
                    continue;
                }
                if let Some(reason) = correlate(&candidate, &opts.identity, opts.start_time) {
                    debug!(resource = %resource.label(), %reason, "Untracked resource matched session");
                    matches.push(resource);
                }
            }
        }

        sort_newest_first(&mut matches);
        let mut outcome = UntrackedOutcome::default();
        for resource in matches {
            let label = resource.label();
            let Some(handler) = handlers.get(&resource.resource_type) else {
                continue;
            };
            match opts.retry.run(&label, || handler.delete(&resource)).await {
                Ok(_) => {
                    info!(resource = %label, session = %opts.session_id, "Deleted untracked resource");
                    outcome.deleted.push(label);
                }
                Err((e, _)) => outcome.failed.push((resource, e.to_string())),
            }
        }
        Ok(outcome)
    }
}

struct RestDeleteHandler {
    endpoint: Arc<Endpoint>,
    path: String,
}

#[async_trait]
impl DeleteHandler for RestDeleteHandler {
    async fn delete(&self, resource: &TrackedResource) -> Result<(), DeleteError> {
        let path = template::render(&self.path, resource, &self.endpoint.defaults)?;
        let response = self
            .endpoint
            .request(reqwest::Method::DELETE, &path)
            .send()
            .await?;
        classify_status(response.status(), &format!("DELETE {}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn appwrite_preset_builds_paths_and_headers() {
        let mut provider = RestProvider::appwrite();
        provider
            .configure(&ProviderConfig::Appwrite(AppwriteConfig {
                endpoint: "http://localhost/v1".into(),
                project_id: "proj".into(),
                api_key: Some("secret".into()),
                database_id: Some("main".into()),
            }))
            .unwrap();

        let methods = provider.methods();
        for t in ["row", "file", "user", "team", "membership", "bucket", "document"] {
            assert!(methods.contains_key(t), "missing {}", t);
        }
        let endpoint = provider.endpoint.as_ref().unwrap();
        assert_eq!(endpoint.headers.get("X-Appwrite-Project").map(String::as_str), Some("proj"));
        assert_eq!(endpoint.headers.get("X-Appwrite-Key").map(String::as_str), Some("secret"));
        assert_eq!(endpoint.defaults.get("databaseId").map(String::as_str), Some("main"));
        assert!(provider.supports_untracked());
    }

    #[test]
    fn mismatched_config_is_rejected() {
        let mut provider = RestProvider::http();
        let err = provider
            .configure(&ProviderConfig::Other {
                name: "custom".into(),
                settings: BTreeMap::new(),
            })
            .unwrap_err();
        assert!(matches!(err, CleanupError::NotConfigured(_)));
    }

    #[test]
    fn unconfigured_provider_has_no_methods() {
        assert!(RestProvider::http().methods().is_empty());
    }

    #[test]
    fn timestamps_parse_from_strings_and_millis() {
        assert!(parse_timestamp(&json!("2024-05-01T12:00:00.000+00:00")).is_some());
        assert_eq!(
            parse_timestamp(&json!(1_700_000_000_000i64)).map(|t| t.timestamp()),
            Some(1_700_000_000)
        );
        assert!(parse_timestamp(&json!(null)).is_none());
    }
}
