//! Placeholder rendering for handler URLs and commands
//!
//! Supported placeholders: `${id}`, `${type}`, `${metadata.KEY}` and
//! `${env.NAME}`. Metadata keys fall back to provider defaults.

use std::collections::BTreeMap;

use tidyrun_common::TrackedResource;

use crate::error::DeleteError;

/// Render `template` for `resource`.
///
/// A placeholder that cannot be resolved is a permanent failure: retrying
/// will not make the value appear.
pub fn render(
    template: &str,
    resource: &TrackedResource,
    defaults: &BTreeMap<String, String>,
) -> Result<String, DeleteError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            DeleteError::permanent(format!("unterminated placeholder in '{}'", template))
        })?;
        let name = after[..end].trim();
        out.push_str(&resolve(name, resource, defaults)?);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn resolve(
    name: &str,
    resource: &TrackedResource,
    defaults: &BTreeMap<String, String>,
) -> Result<String, DeleteError> {
    match name {
        "id" => Ok(resource.id.clone()),
        "type" => Ok(resource.resource_type.clone()),
        _ => {
            if let Some(key) = name.strip_prefix("metadata.") {
                resource
                    .metadata_str(key)
                    .or_else(|| defaults.get(key).cloned())
                    .ok_or_else(|| {
                        DeleteError::permanent(format!(
                            "missing metadata '{}' for {}",
                            key,
                            resource.label()
                        ))
                    })
            } else if let Some(var) = name.strip_prefix("env.") {
                std::env::var(var).map_err(|_| {
                    DeleteError::permanent(format!("environment variable '{}' is not set", var))
                })
            } else {
                Err(DeleteError::permanent(format!("unknown placeholder '{}'", name)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_id_type_and_metadata() {
        let r = TrackedResource::new("file", "f1").with_metadata("bucketId", json!("b1"));
        let out = render("/buckets/${metadata.bucketId}/${type}s/${id}", &r, &BTreeMap::new()).unwrap();
        assert_eq!(out, "/buckets/b1/files/f1");
    }

    #[test]
    fn falls_back_to_defaults() {
        let r = TrackedResource::new("row", "r1");
        let mut defaults = BTreeMap::new();
        defaults.insert("databaseId".to_string(), "main".to_string());
        let out = render("/db/${metadata.databaseId}/rows/${id}", &r, &defaults).unwrap();
        assert_eq!(out, "/db/main/rows/r1");
    }

    #[test]
    fn missing_metadata_is_permanent() {
        let r = TrackedResource::new("row", "r1");
        let err = render("/t/${metadata.tableId}", &r, &BTreeMap::new()).unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("tableId"));
    }

    #[test]
    fn numeric_metadata_is_rendered_plain() {
        let r = TrackedResource::new("row", "r1").with_metadata("shard", json!(3));
        assert_eq!(render("${metadata.shard}", &r, &BTreeMap::new()).unwrap(), "3");
    }

    #[test]
    fn text_without_placeholders_is_unchanged() {
        let r = TrackedResource::new("row", "r1");
        assert_eq!(render("/plain", &r, &BTreeMap::new()).unwrap(), "/plain");
    }
}
