//! Core types for the reconciler.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::config::{BundleSpec, ControllerConfig};
use crate::error::{Error, Result};
use crate::hash::ParameterHash;

/// Status key holding the generated service instance id.
pub const SERVICE_INSTANCE_ID_KEY: &str = "serviceInstanceID";
/// Status key holding the fingerprint of the last acted-upon spec.
pub const PARAMETER_HASH_KEY: &str = "parameterHash";
/// Status key holding the cumulative progress log.
pub const MESSAGES_KEY: &str = "messages";
/// Parameter injected into every descriptor to select the bundle plan.
pub const PLAN_PARAMETER_KEY: &str = "_apb_plan_id";

/// Desired-state payload: parameter name to value, ordered by name.
pub type Parameters = BTreeMap<String, Value>;

/// Namespaced identity of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    /// Create a new resource key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Generic structured document as delivered by the watch and stored by the
/// cluster: `apiVersion`, `kind`, `metadata`, `spec`, `status`, and anything else.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceDocument(Map<String, Value>);

impl ResourceDocument {
    /// Build a document with the given identity and spec and no status.
    pub fn new(api_version: &str, kind: &str, key: &ResourceKey, spec: Value) -> Self {
        let mut object = Map::new();
        object.insert("apiVersion".to_string(), Value::String(api_version.to_string()));
        object.insert("kind".to_string(), Value::String(kind.to_string()));
        object.insert(
            "metadata".to_string(),
            json!({ "name": key.name, "namespace": key.namespace }),
        );
        object.insert("spec".to_string(), spec);
        Self(object)
    }

    /// Wrap an arbitrary JSON value, which must be an object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if `value` is not a JSON object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(object) => Ok(Self(object)),
            other => Err(Error::decode(format!(
                "resource document must be an object, found {}",
                json_type(&other)
            ))),
        }
    }

    /// Consume the document into a plain JSON value.
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    fn metadata_str(&self, field: &str) -> Option<&str> {
        self.0
            .get("metadata")
            .and_then(|m| m.get(field))
            .and_then(Value::as_str)
    }

    /// The `apiVersion` field, if present and a string.
    ///
    /// ```
    /// use bundlectl_reconciler::{ResourceDocument, ResourceKey};
    /// use serde_json::json;
    ///
    /// let key = ResourceKey::new("default", "r1");
    /// let doc = ResourceDocument::new("automationbroker.io/v1", "Bundle", &key, json!({}));
    /// assert_eq!(doc.api_version(), Some("automationbroker.io/v1"));
    /// assert_eq!(doc.kind(), Some("Bundle"));
    /// assert_eq!(doc.name(), Some("r1"));
    /// assert_eq!(doc.namespace(), Some("default"));
    /// assert_eq!(doc.spec(), Some(&json!({})));
    /// assert!(doc.status().is_none());
    /// ```
    pub fn api_version(&self) -> Option<&str> {
        self.0.get("apiVersion").and_then(Value::as_str)
    }

    /// The `kind` field, if present and a string.
    pub fn kind(&self) -> Option<&str> {
        self.0.get("kind").and_then(Value::as_str)
    }

    /// `metadata.name`, if present.
    pub fn name(&self) -> Option<&str> {
        self.metadata_str("name")
    }

    /// `metadata.namespace`, if present. May be absent for cluster defaults.
    pub fn namespace(&self) -> Option<&str> {
        self.metadata_str("namespace")
    }

    /// Optimistic-concurrency token assigned by the store.
    pub fn resource_version(&self) -> Option<&str> {
        self.metadata_str("resourceVersion")
    }

    /// Resolve the document's identity, falling back to `default_namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if `metadata.name` is missing or empty.
    pub fn key(&self, default_namespace: &str) -> Result<ResourceKey> {
        let name = self
            .name()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::decode("metadata.name is missing"))?;
        let namespace = self
            .namespace()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(default_namespace);
        Ok(ResourceKey::new(namespace, name))
    }

    /// The raw `spec` field. Not yet checked to be an object.
    pub fn spec(&self) -> Option<&Value> {
        self.0.get("spec")
    }

    /// The raw `status` field, absent until the first status write.
    pub fn status(&self) -> Option<&Value> {
        self.0.get("status")
    }

    /// Replace the whole status field, leaving spec and metadata untouched.
    pub fn set_status(&mut self, status: Value) {
        self.0.insert("status".to_string(), status);
    }

    /// Replace the whole spec field.
    pub fn set_spec(&mut self, spec: Value) {
        self.0.insert("spec".to_string(), spec);
    }

    /// Stamp a new resourceVersion into metadata.
    pub fn set_resource_version(&mut self, version: impl Into<String>) {
        let mut metadata = match self.0.remove("metadata") {
            Some(Value::Object(metadata)) => metadata,
            _ => Map::new(),
        };
        metadata.insert("resourceVersion".to_string(), Value::String(version.into()));
        self.0.insert("metadata".to_string(), Value::Object(metadata));
    }
}

const fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Opaque unit of operation progress. Accumulated and persisted, never interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgressMessage(Value);

impl ProgressMessage {
    /// Wrap any JSON value as a message.
    pub const fn new(value: Value) -> Self {
        Self(value)
    }

    /// Message in the executor's usual `{state, description}` shape.
    pub fn step(state: impl Into<String>, description: impl Into<String>) -> Self {
        Self(json!({ "state": state.into(), "description": description.into() }))
    }

    /// The message exactly as the executor produced it.
    ///
    /// ```
    /// use bundlectl_reconciler::ProgressMessage;
    /// use serde_json::json;
    ///
    /// let message = ProgressMessage::new(json!({"state": "succeeded"}));
    /// assert_eq!(message.as_value()["state"], "succeeded");
    /// ```
    pub const fn as_value(&self) -> &Value {
        &self.0
    }
}

/// Controller-owned status record.
///
/// Keys the controller does not own are carried in `extra`. Status writes
/// take those keys from the stored resource, not from this record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BundleStatus {
    #[serde(
        rename = "serviceInstanceID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub service_instance_id: Option<Uuid>,

    #[serde(
        rename = "parameterHash",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub parameter_hash: Option<ParameterHash>,

    #[serde(default)]
    pub messages: Vec<ProgressMessage>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Typed view of a bundle resource: identity, desired spec, controller status.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleResource {
    pub key: ResourceKey,
    pub spec: Parameters,
    pub status: BundleStatus,
}

impl BundleResource {
    /// Decode a watch document, validating the status fields this crate owns.
    ///
    /// A missing or null spec decodes as empty parameters; a missing or null
    /// status decodes as the default status.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] on a missing name, a non-object spec, or a
    /// status whose `serviceInstanceID` / `parameterHash` / `messages` are malformed.
    pub fn decode(doc: &ResourceDocument, default_namespace: &str) -> Result<Self> {
        let key = doc.key(default_namespace)?;

        let spec = match doc.spec() {
            None | Some(Value::Null) => Parameters::new(),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            Some(other) => {
                return Err(Error::decode(format!(
                    "spec of '{key}' must be an object, found {}",
                    json_type(other)
                )));
            }
        };

        let status = match doc.status() {
            None | Some(Value::Null) => BundleStatus::default(),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| Error::decode(format!("status of '{key}': {e}")))?,
        };

        Ok(Self { key, spec, status })
    }
}

/// Which executor entry point an operation uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Provision,
    Update,
    Deprovision,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provision => write!(f, "provision"),
            Self::Update => write!(f, "update"),
            Self::Deprovision => write!(f, "deprovision"),
        }
    }
}

/// Where and how the executor should run an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceContext {
    pub platform: String,
    pub namespace: String,
    pub sandbox_role: String,
    pub not_sandboxed: bool,
}

/// Descriptor handed to the executor for a single operation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: Uuid,
    pub bundle: BundleSpec,
    pub context: InstanceContext,
    pub parameters: Parameters,
}

impl ServiceInstance {
    /// Build the descriptor for `spec`, injecting the configured plan.
    ///
    /// Built after fingerprinting, so the plan key never reaches the hash.
    pub fn for_spec(id: Uuid, config: &ControllerConfig, spec: &Parameters) -> Self {
        let mut parameters = spec.clone();
        parameters.insert(
            PLAN_PARAMETER_KEY.to_string(),
            Value::String(config.plan.clone()),
        );
        Self {
            id,
            bundle: config.bundle.clone(),
            context: InstanceContext {
                platform: config.platform.clone(),
                namespace: config.namespace.clone(),
                sandbox_role: config.sandbox_role.clone(),
                not_sandboxed: true,
            },
            parameters,
        }
    }
}

/// What a handler invocation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// First convergence: hash and instance id recorded, provision streamed.
    Provisioned { instance_id: Uuid, messages: usize },
    /// Spec changed: new hash recorded, update streamed.
    Updated { instance_id: Uuid, messages: usize },
    /// Spec fingerprint matches the recorded hash.
    Unchanged,
    /// No recorded hash, so prior state cannot be determined.
    MissingHash,
    /// Deletion seen, nothing to do.
    Observed,
    /// Deletion seen and the decommission hook ran.
    Deprovisioned { instance_id: Uuid, messages: usize },
}

impl ReconcileOutcome {
    /// Whether an operation was started.
    pub const fn started_operation(&self) -> bool {
        matches!(
            self,
            Self::Provisioned { .. } | Self::Updated { .. } | Self::Deprovisioned { .. }
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::hash::fingerprint;

    fn doc(spec: Value) -> ResourceDocument {
        ResourceDocument::new(
            "automationbroker.io/v1",
            "Bundle",
            &ResourceKey::new("default", "r1"),
            spec,
        )
    }

    #[test]
    fn test_decode_without_status_uses_defaults() {
        let resource = BundleResource::decode(&doc(json!({"replicas": 1})), "default").unwrap();
        assert_eq!(resource.key, ResourceKey::new("default", "r1"));
        assert_eq!(resource.spec.get("replicas"), Some(&json!(1)));
        assert_eq!(resource.status, BundleStatus::default());
    }

    #[test]
    fn test_decode_missing_namespace_falls_back() {
        let value = json!({"metadata": {"name": "r2"}, "spec": {}});
        let document = ResourceDocument::from_value(value).unwrap();
        let resource = BundleResource::decode(&document, "bundles").unwrap();
        assert_eq!(resource.key, ResourceKey::new("bundles", "r2"));
    }

    #[test]
    fn test_decode_rejects_missing_name() {
        let document = ResourceDocument::from_value(json!({"spec": {}})).unwrap();
        let err = BundleResource::decode(&document, "default").unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn test_decode_rejects_non_object_spec() {
        let err = BundleResource::decode(&doc(json!([1, 2])), "default").unwrap_err();
        assert!(err.to_string().contains("array"));
    }

    #[test]
    fn test_decode_rejects_malformed_instance_id() {
        let mut document = doc(json!({}));
        document.set_status(json!({ SERVICE_INSTANCE_ID_KEY: "not-a-uuid" }));
        let err = BundleResource::decode(&document, "default").unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn test_decode_rejects_malformed_hash() {
        let mut document = doc(json!({}));
        document.set_status(json!({ PARAMETER_HASH_KEY: "zz-not-hex" }));
        assert!(BundleResource::decode(&document, "default").is_err());
    }

    #[test]
    fn test_status_round_trip_keeps_foreign_keys() {
        let id = Uuid::new_v4();
        let hash = fingerprint(&Parameters::new()).unwrap();
        let mut document = doc(json!({}));
        document.set_status(json!({
            SERVICE_INSTANCE_ID_KEY: id.to_string(),
            PARAMETER_HASH_KEY: hash.as_str(),
            MESSAGES_KEY: [{"state": "in progress", "description": "pulling"}],
            "observedBy": "someone-else",
        }));

        let resource = BundleResource::decode(&document, "default").unwrap();
        assert_eq!(resource.status.service_instance_id, Some(id));
        assert_eq!(resource.status.parameter_hash.as_ref(), Some(&hash));
        assert_eq!(resource.status.messages.len(), 1);

        let encoded = serde_json::to_value(&resource.status).unwrap();
        assert_eq!(encoded["observedBy"], json!("someone-else"));
        assert_eq!(encoded[SERVICE_INSTANCE_ID_KEY], json!(id.to_string()));
    }

    #[test]
    fn test_set_resource_version_preserves_metadata() {
        let mut document = doc(json!({}));
        document.set_resource_version("7");
        assert_eq!(document.resource_version(), Some("7"));
        assert_eq!(document.name(), Some("r1"));
        assert_eq!(document.namespace(), Some("default"));
    }

    #[test]
    fn test_descriptor_injects_plan_without_touching_spec() {
        let config = ControllerConfig {
            plan: "dev".to_string(),
            namespace: "target".to_string(),
            ..ControllerConfig::default()
        };
        let mut spec = Parameters::new();
        spec.insert("replicas".to_string(), json!(1));

        let instance = ServiceInstance::for_spec(Uuid::new_v4(), &config, &spec);

        assert_eq!(instance.parameters.get(PLAN_PARAMETER_KEY), Some(&json!("dev")));
        assert_eq!(instance.parameters.get("replicas"), Some(&json!(1)));
        assert!(!spec.contains_key(PLAN_PARAMETER_KEY));
        assert_eq!(instance.context.namespace, "target");
        assert_eq!(instance.context.platform, "kubernetes");
        assert!(instance.context.not_sandboxed);
    }

    #[test]
    fn test_outcome_started_operation() {
        assert!(!ReconcileOutcome::Unchanged.started_operation());
        assert!(!ReconcileOutcome::MissingHash.started_operation());
        assert!(
            ReconcileOutcome::Provisioned {
                instance_id: Uuid::new_v4(),
                messages: 0
            }
            .started_operation()
        );
    }
}
