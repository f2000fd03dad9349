//! Replay manifests: ordered resource changes for `bundlectl run`.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use bundlectl_reconciler::ResourceKey;

/// One change to apply to the in-memory cluster.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestStep {
    /// Create or replace a resource document.
    Apply(Value),
    /// Remove a resource.
    Delete(ResourceRef),
}

/// Names a resource to delete.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResourceRef {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

impl ResourceRef {
    pub fn key(&self, default_namespace: &str) -> ResourceKey {
        ResourceKey::new(
            self.namespace.as_deref().unwrap_or(default_namespace),
            self.name.clone(),
        )
    }
}

/// Parse a manifest from YAML text.
pub fn parse(input: &str) -> Result<Vec<ManifestStep>> {
    if input.trim().is_empty() {
        return Ok(Vec::new());
    }
    // Steps are single-key maps; decode them from a JSON value.
    let raw: Value = serde_yaml::from_str(input).context("manifest is not valid YAML")?;
    serde_json::from_value(raw).context("manifest must be a list of apply/delete steps")
}

/// Read and parse a manifest file.
pub fn load(path: &Path) -> Result<Vec<ManifestStep>> {
    let input = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest '{}'", path.display()))?;
    parse(&input).with_context(|| format!("invalid manifest '{}'", path.display()))
}

/// Read a single resource document, YAML or JSON.
pub fn load_document(path: &Path) -> Result<Value> {
    let input = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read '{}'", path.display()))?;
    serde_yaml::from_str(&input)
        .with_context(|| format!("'{}' is not valid YAML or JSON", path.display()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::unreachable, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::io::Write;

    const MANIFEST: &str = r"
- apply:
    apiVersion: automationbroker.io/v1
    kind: Bundle
    metadata:
      name: r1
    spec:
      replicas: 1
- delete:
    name: r1
    namespace: staging
";

    #[test]
    fn test_parse_apply_and_delete() {
        let steps = parse(MANIFEST).unwrap();
        assert_eq!(steps.len(), 2);

        let ManifestStep::Apply(doc) = &steps[0] else {
            unreachable!("first step is an apply");
        };
        assert_eq!(doc["spec"]["replicas"], 1);

        assert_eq!(
            steps[1],
            ManifestStep::Delete(ResourceRef {
                name: "r1".to_string(),
                namespace: Some("staging".to_string()),
            })
        );
    }

    #[test]
    fn test_delete_without_namespace_uses_default() {
        let target = ResourceRef {
            name: "r1".to_string(),
            namespace: None,
        };
        assert_eq!(target.key("default"), ResourceKey::new("default", "r1"));
    }

    #[test]
    fn test_empty_manifest_has_no_steps() {
        assert!(parse("").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_step_is_rejected() {
        assert!(parse("- patch: {name: r1}").is_err());
    }

    #[test]
    fn test_load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MANIFEST.as_bytes()).unwrap();

        let steps = load(file.path()).unwrap();
        assert_eq!(steps.len(), 2);
    }

    #[test]
    fn test_load_document_accepts_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"metadata": {"name": "r1"}, "spec": {"a": 1}}"#)
            .unwrap();

        let doc = load_document(file.path()).unwrap();
        assert_eq!(doc["spec"]["a"], 1);
    }
}
