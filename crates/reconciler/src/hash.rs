//! SHA-256 fingerprinting of a resource's desired-state parameters.
//!
//! The fingerprint is what makes the loop idempotent: an update event only
//! triggers an operation when the spec fingerprint differs from the one
//! recorded in status. It is computed over the spec alone, so the
//! controller's own status writes never look like a parameter change.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::types::Parameters;

/// Hex-encoded fingerprint of a spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParameterHash(String);

impl ParameterHash {
    /// Validate a hex digest read back from status.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] unless `value` is non-empty, even-length, and
    /// consists only of hex digits.
    pub fn parse(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let is_hex = !value.is_empty()
            && value.len() % 2 == 0
            && value.chars().all(|c| c.is_ascii_hexdigit());
        if is_hex {
            Ok(Self(value.to_ascii_lowercase()))
        } else {
            Err(Error::decode(format!(
                "parameterHash '{value}' is not a hex digest"
            )))
        }
    }

    /// Lowercase hex digest, as stored in status.
    ///
    /// ```
    /// use bundlectl_reconciler::ParameterHash;
    ///
    /// let hash = ParameterHash::parse("AB12").unwrap();
    /// assert_eq!(hash.as_str(), "ab12");
    /// ```
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ParameterHash {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<ParameterHash> for String {
    fn from(hash: ParameterHash) -> Self {
        hash.0
    }
}

impl fmt::Display for ParameterHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint a spec.
///
/// Object keys are sorted at every depth before serializing, so the digest
/// depends only on content and never on map insertion order.
///
/// # Errors
///
/// Returns [`Error::Serialization`] if the canonical form cannot be encoded.
///
/// # Examples
///
/// ```
/// use bundlectl_reconciler::{fingerprint, Parameters};
/// use serde_json::json;
///
/// let mut spec = Parameters::new();
/// spec.insert("replicas".to_string(), json!(1));
///
/// let h1 = fingerprint(&spec).unwrap();
/// let h2 = fingerprint(&spec).unwrap();
/// assert_eq!(h1, h2);
/// assert_eq!(h1.as_str().len(), 64);
/// ```
pub fn fingerprint(spec: &Parameters) -> Result<ParameterHash> {
    let canonical: Map<String, Value> = spec
        .iter()
        .map(|(k, v)| (k.clone(), canonicalize(v)))
        .collect();
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(ParameterHash(format!("{:x}", Sha256::digest(&bytes))))
}

/// Rebuild a value with every object's keys in sorted order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            Value::Object(
                keys.into_iter()
                    .filter_map(|k| map.get(k).map(|v| (k.clone(), canonicalize(v))))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
