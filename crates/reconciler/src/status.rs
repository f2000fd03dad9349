//! Read-modify-write access to a resource's status.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::hash::{ParameterHash, fingerprint};
use crate::store::ResourceStore;
use crate::types::{
    BundleResource, BundleStatus, MESSAGES_KEY, PARAMETER_HASH_KEY, ProgressMessage,
    ResourceDocument, ResourceKey, SERVICE_INSTANCE_ID_KEY,
};

/// Status keys written by the controller. Everything else belongs to others.
const OWNED_KEYS: [&str; 3] = [SERVICE_INSTANCE_ID_KEY, PARAMETER_HASH_KEY, MESSAGES_KEY];

/// Overlays controller-owned status fields onto the stored resource.
///
/// Each attempt is one full read and one full write, and every attempt
/// builds the new status from what that read returned. A version conflict
/// re-reads and re-overlays, up to `max_conflict_retries` extra attempts.
pub struct StatusStore {
    store: Arc<dyn ResourceStore>,
    max_conflict_retries: u32,
    writes: AtomicU64,
}

impl StatusStore {
    /// Create a status store over `store`.
    pub fn new(store: Arc<dyn ResourceStore>, max_conflict_retries: u32) -> Self {
        Self {
            store,
            max_conflict_retries,
            writes: AtomicU64::new(0),
        }
    }

    /// Record `status` as the controller's claim on `key`.
    ///
    /// `serviceInstanceID`, `parameterHash` and `messages` are set from
    /// `status` (or removed when absent there). Other status keys, the spec
    /// and metadata come from the fresh read and are left as they are.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the resource has been deleted.
    /// - [`Error::Conflict`] if every attempt lost a version race.
    /// - [`Error::Serialization`] if the status cannot be encoded.
    /// - Any other store error, unchanged.
    pub async fn write(&self, key: &ResourceKey, status: &BundleStatus) -> Result<()> {
        let encoded = match serde_json::to_value(status)? {
            Value::Object(fields) => fields,
            _ => return Err(Error::serialization("status did not encode as an object")),
        };

        self.commit(key, status.messages.len(), |doc| {
            let mut fresh = current_fields(doc);
            for owned in OWNED_KEYS {
                match encoded.get(owned) {
                    Some(value) => {
                        fresh.insert(owned.to_string(), value.clone());
                    }
                    None => {
                        fresh.remove(owned);
                    }
                }
            }
            Ok(Value::Object(fresh))
        })
        .await
    }

    /// Replace the progress log of an operation started for `owner`.
    ///
    /// Only `messages` is written. The write goes through only while the
    /// stored `parameterHash` is still `owner` and the stored spec still
    /// fingerprints to it.
    ///
    /// # Errors
    ///
    /// - [`Error::Superseded`] once a newer spec or claim has replaced `owner`.
    ///   Nothing is written.
    /// - [`Error::Decode`] if the stored resource no longer decodes.
    /// - Otherwise as for [`Self::write`].
    pub async fn write_progress(
        &self,
        key: &ResourceKey,
        owner: &ParameterHash,
        messages: &[ProgressMessage],
    ) -> Result<()> {
        let encoded = serde_json::to_value(messages)?;

        self.commit(key, messages.len(), |doc| {
            let current = BundleResource::decode(doc, &key.namespace)?;
            if current.status.parameter_hash.as_ref() != Some(owner)
                || fingerprint(&current.spec)? != *owner
            {
                return Err(Error::superseded(key));
            }
            let mut fresh = current_fields(doc);
            fresh.insert(MESSAGES_KEY.to_string(), encoded.clone());
            Ok(Value::Object(fresh))
        })
        .await
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    async fn commit<F>(&self, key: &ResourceKey, messages: usize, status_for: F) -> Result<()>
    where
        F: Fn(&ResourceDocument) -> Result<Value>,
    {
        let mut attempt = 0u32;

        loop {
            let mut doc = self.store.get(key).await?;
            let status = status_for(&doc)?;
            doc.set_status(status);

            match self.store.update(doc).await {
                Ok(_) => {
                    self.writes.fetch_add(1, Ordering::Relaxed);
                    debug!(resource = %key, messages, "Status written");
                    return Ok(());
                }
                Err(e) if e.is_conflict() && attempt < self.max_conflict_retries => {
                    attempt = attempt.saturating_add(1);
                    warn!(
                        resource = %key,
                        attempt,
                        max = self.max_conflict_retries,
                        "Status write conflicted, retrying with fresh read"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn current_fields(doc: &ResourceDocument) -> Map<String, Value> {
    doc.status()
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}
