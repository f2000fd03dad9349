//! Controller configuration.
//!
//! Loaded from TOML, optionally overridden from the environment, and handed
//! to the [`Controller`](crate::Controller) constructor. Nothing here is global.

use std::path::Path;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable overriding [`ControllerConfig::namespace`].
pub const ENV_NAMESPACE: &str = "BUNDLECTL_NAMESPACE";
/// Environment variable overriding [`ControllerConfig::sandbox_role`].
pub const ENV_SANDBOX_ROLE: &str = "BUNDLECTL_SANDBOX_ROLE";
/// Environment variable overriding [`ControllerConfig::plan`].
pub const ENV_PLAN: &str = "BUNDLECTL_PLAN";
/// Environment variable holding a base64-encoded YAML bundle spec.
pub const ENV_BUNDLE_SPEC: &str = "BUNDLECTL_BUNDLE_SPEC";

/// A plan offered by a bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundlePlan {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// The bundle this controller drives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleSpec {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub runtime: u32,
    #[serde(default)]
    pub bindable: bool,
    #[serde(default)]
    pub plans: Vec<BundlePlan>,
}

impl BundleSpec {
    /// Decode a base64-encoded YAML bundle definition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the input is not base64 or the
    /// decoded bytes are not a YAML bundle spec.
    pub fn from_base64_yaml(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::invalid_config(format!("bundle spec is not base64: {e}")))?;
        serde_yaml::from_slice(&bytes)
            .map_err(|e| Error::invalid_config(format!("bundle spec is not valid YAML: {e}")))
    }
}

/// Identity of the watched custom resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceType {
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
}

impl Default for ResourceType {
    fn default() -> Self {
        Self {
            group: default_group(),
            version: default_version(),
            kind: default_kind(),
        }
    }
}

impl ResourceType {
    /// `group/version`, as it appears in a document's `apiVersion`.
    pub fn api_version(&self) -> String {
        format!("{}/{}", self.group, self.version)
    }
}

/// Configuration injected into the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Namespace provisioned instances run in; also the fallback resource namespace.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Sandbox role passed to the executor.
    #[serde(default = "default_sandbox_role")]
    pub sandbox_role: String,

    /// Platform identifier passed to the executor.
    #[serde(default = "default_platform")]
    pub platform: String,

    /// Plan name injected into every descriptor.
    #[serde(default = "default_plan")]
    pub plan: String,

    /// Coalescing window for progress writes. Zero writes once per message.
    #[serde(
        rename = "status_flush_interval_ms",
        with = "duration_ms",
        default
    )]
    pub status_flush_interval: Duration,

    /// Deadline for consuming a progress stream.
    #[serde(
        rename = "operation_timeout_secs",
        with = "opt_duration_secs",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub operation_timeout: Option<Duration>,

    /// How many times a status write re-reads after a version conflict.
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,

    /// Run the executor's deprovision hook when a resource is deleted.
    #[serde(default)]
    pub deprovision_on_delete: bool,

    /// Bundle being driven.
    #[serde(default)]
    pub bundle: BundleSpec,

    /// Watched resource type.
    #[serde(default)]
    pub resource: ResourceType,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            sandbox_role: default_sandbox_role(),
            platform: default_platform(),
            plan: default_plan(),
            status_flush_interval: Duration::ZERO,
            operation_timeout: None,
            max_conflict_retries: default_max_conflict_retries(),
            deprovision_on_delete: false,
            bundle: BundleSpec::default(),
            resource: ResourceType::default(),
        }
    }
}

impl ControllerConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] on malformed TOML.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).map_err(|e| Error::invalid_config(e.to_string()))
    }

    /// Read and parse a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|e| {
            Error::invalid_config(format!("failed to read '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&input)
    }

    /// Serialize back to TOML.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if encoding fails.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Apply overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `BUNDLECTL_BUNDLE_SPEC` is set but malformed.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the bundle spec variable is malformed.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(namespace) = lookup(ENV_NAMESPACE) {
            self.namespace = namespace;
        }
        if let Some(role) = lookup(ENV_SANDBOX_ROLE) {
            self.sandbox_role = role;
        }
        if let Some(plan) = lookup(ENV_PLAN) {
            self.plan = plan;
        }
        if let Some(encoded) = lookup(ENV_BUNDLE_SPEC) {
            self.bundle = BundleSpec::from_base64_yaml(&encoded)?;
        }
        Ok(self)
    }

    /// Set the bundle.
    #[must_use]
    pub fn bundle(mut self, bundle: BundleSpec) -> Self {
        self.bundle = bundle;
        self
    }

    /// Set the coalescing window.
    #[must_use]
    pub const fn status_flush_interval(mut self, interval: Duration) -> Self {
        self.status_flush_interval = interval;
        self
    }

    /// Set the operation deadline.
    #[must_use]
    pub const fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Enable the decommission hook.
    #[must_use]
    pub const fn deprovision_on_delete(mut self, enabled: bool) -> Self {
        self.deprovision_on_delete = enabled;
        self
    }

    /// Check the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("namespace", &self.namespace),
            ("plan", &self.plan),
            ("resource.group", &self.resource.group),
            ("resource.version", &self.resource.version),
            ("resource.kind", &self.resource.kind),
            ("bundle.image", &self.bundle.image),
        ];
        match required.iter().find(|(_, value)| value.trim().is_empty()) {
            Some((field, _)) => Err(Error::invalid_config(format!("{field} must not be empty"))),
            None => Ok(()),
        }
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_sandbox_role() -> String {
    "edit".to_string()
}

fn default_platform() -> String {
    "kubernetes".to_string()
}

fn default_plan() -> String {
    "default".to_string()
}

fn default_group() -> String {
    "automationbroker.io".to_string()
}

fn default_version() -> String {
    "v1".to_string()
}

fn default_kind() -> String {
    "Bundle".to_string()
}

const fn default_max_conflict_retries() -> u32 {
    5
}

/// Serde helper for `Duration` as milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde helper for `Option<Duration>` as whole seconds.
mod opt_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(d) => serializer.serialize_u64(d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}
