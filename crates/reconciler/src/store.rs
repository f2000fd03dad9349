//! Resource store trait and implementations.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};

use crate::error::{Error, Result};
use crate::types::{ResourceDocument, ResourceKey};
use crate::watch::WatchEvent;

/// Capacity of the in-memory watch channel.
const WATCH_CAPACITY: usize = 1024;

/// Backing store for custom resources.
///
/// Writes are whole-document overwrites guarded by `metadata.resourceVersion`.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch the current document.
    async fn get(&self, key: &ResourceKey) -> Result<ResourceDocument>;

    /// Overwrite a document. Fails with `Conflict` if its resourceVersion is stale.
    async fn update(&self, doc: ResourceDocument) -> Result<ResourceDocument>;

    /// List documents, optionally restricted to one namespace.
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<ResourceDocument>>;
}

/// In-process cluster: stores documents and emits watch events for every change.
pub struct InMemoryResourceStore {
    objects: RwLock<BTreeMap<ResourceKey, ResourceDocument>>,
    events: broadcast::Sender<WatchEvent>,
    next_version: AtomicU64,
    updates: AtomicU64,
    default_namespace: String,
}

impl Default for InMemoryResourceStore {
    fn default() -> Self {
        Self::with_namespace("default")
    }
}

impl InMemoryResourceStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new in-memory store wrapped in an Arc.
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Create a store that places namespace-less documents in `namespace`.
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            objects: RwLock::new(BTreeMap::new()),
            events,
            next_version: AtomicU64::new(1),
            updates: AtomicU64::new(0),
            default_namespace: namespace.into(),
        }
    }

    /// Subscribe to watch events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    /// Number of successful `update` calls so far.
    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    fn stamp(&self, doc: &mut ResourceDocument) {
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        doc.set_resource_version(version.to_string());
    }

    /// Create or replace a document as its author would.
    ///
    /// A document without a `status` keeps the stored one, like an apply
    /// against a resource with a status subresource.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the document has no name.
    pub async fn apply(&self, mut doc: ResourceDocument) -> Result<ResourceDocument> {
        let key = doc.key(&self.default_namespace)?;
        let mut objects = self.objects.write().await;
        let previous = objects.get(&key).cloned();

        if doc.status().is_none() {
            if let Some(status) = previous.as_ref().and_then(ResourceDocument::status) {
                doc.set_status(status.clone());
            }
        }
        self.stamp(&mut doc);
        objects.insert(key, doc.clone());

        let event = match previous {
            Some(old) => WatchEvent::Updated {
                old,
                new: doc.clone(),
            },
            None => WatchEvent::Added(doc.clone()),
        };
        let _ = self.events.send(event);
        Ok(doc)
    }

    /// Remove a document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if nothing is stored under `key`.
    pub async fn delete(&self, key: &ResourceKey) -> Result<ResourceDocument> {
        let mut objects = self.objects.write().await;
        let removed = objects.remove(key).ok_or_else(|| Error::not_found(key))?;
        let _ = self.events.send(WatchEvent::Deleted(removed.clone()));
        Ok(removed)
    }
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore {
    async fn get(&self, key: &ResourceKey) -> Result<ResourceDocument> {
        let objects = self.objects.read().await;
        objects.get(key).cloned().ok_or_else(|| Error::not_found(key))
    }

    async fn update(&self, mut doc: ResourceDocument) -> Result<ResourceDocument> {
        let key = doc.key(&self.default_namespace)?;
        let mut objects = self.objects.write().await;
        let current = objects.get(&key).ok_or_else(|| Error::not_found(&key))?;

        let expected = doc.resource_version().unwrap_or("<none>");
        let actual = current.resource_version().unwrap_or("<none>");
        if expected != actual {
            return Err(Error::conflict(&key, expected, actual));
        }

        let old = current.clone();
        self.stamp(&mut doc);
        objects.insert(key, doc.clone());
        self.updates.fetch_add(1, Ordering::Relaxed);

        let _ = self.events.send(WatchEvent::Updated {
            old,
            new: doc.clone(),
        });
        Ok(doc)
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<ResourceDocument>> {
        let objects = self.objects.read().await;
        Ok(objects
            .iter()
            .filter(|(key, _)| namespace.is_none_or(|ns| key.namespace == ns))
            .map(|(_, doc)| doc.clone())
            .collect())
    }
}

/// A wrapper that adds tracing to a resource store.
pub struct TracingResourceStore<S: ResourceStore> {
    inner: S,
}

impl<S: ResourceStore> TracingResourceStore<S> {
    /// Create a new tracing resource store.
    pub const fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: ResourceStore> ResourceStore for TracingResourceStore<S> {
    async fn get(&self, key: &ResourceKey) -> Result<ResourceDocument> {
        tracing::debug!(resource = %key, "Fetching resource");
        self.inner.get(key).await
    }

    async fn update(&self, doc: ResourceDocument) -> Result<ResourceDocument> {
        tracing::debug!(
            name = doc.name().unwrap_or_default(),
            resource_version = doc.resource_version().unwrap_or_default(),
            "Updating resource"
        );
        let result = self.inner.update(doc).await;
        match &result {
            Ok(stored) => tracing::trace!(
                resource_version = stored.resource_version().unwrap_or_default(),
                "Resource updated"
            ),
            Err(e) => tracing::debug!(error = %e, "Resource update rejected"),
        }
        result
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<ResourceDocument>> {
        tracing::debug!(namespace = ?namespace, "Listing resources");
        self.inner.list(namespace).await
    }
}

#[async_trait]
impl<S: ResourceStore + ?Sized> ResourceStore for Arc<S> {
    async fn get(&self, key: &ResourceKey) -> Result<ResourceDocument> {
        (**self).get(key).await
    }

    async fn update(&self, doc: ResourceDocument) -> Result<ResourceDocument> {
        (**self).update(doc).await
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<ResourceDocument>> {
        (**self).list(namespace).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(name: &str) -> ResourceDocument {
        ResourceDocument::new(
            "automationbroker.io/v1",
            "Bundle",
            &ResourceKey::new("default", name),
            json!({"replicas": 1}),
        )
    }

    #[tokio::test]
    async fn test_apply_then_get() {
        let store = InMemoryResourceStore::new();
        let stored = store.apply(doc("r1")).await.unwrap();
        assert!(stored.resource_version().is_some());

        let fetched = store.get(&ResourceKey::new("default", "r1")).await.unwrap();
        assert_eq!(fetched, stored);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = InMemoryResourceStore::new();
        let err = store.get(&ResourceKey::new("default", "nope")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_with_current_version_succeeds() {
        let store = InMemoryResourceStore::new();
        let mut stored = store.apply(doc("r1")).await.unwrap();
        stored.set_status(json!({"parameterHash": "ab"}));

        let updated = store.update(stored.clone()).await.unwrap();
        assert_ne!(updated.resource_version(), stored.resource_version());
        assert_eq!(updated.status(), Some(&json!({"parameterHash": "ab"})));
        assert_eq!(store.update_count(), 1);
    }

    #[tokio::test]
    async fn test_update_with_stale_version_conflicts() {
        let store = InMemoryResourceStore::new();
        let stale = store.apply(doc("r1")).await.unwrap();
        store.apply(doc("r1")).await.unwrap();

        let err = store.update(stale).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.update_count(), 0);
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let store = InMemoryResourceStore::new();
        let err = store.update(doc("ghost")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_apply_without_status_keeps_stored_status() {
        let store = InMemoryResourceStore::new();
        let mut stored = store.apply(doc("r1")).await.unwrap();
        stored.set_status(json!({"parameterHash": "ab"}));
        store.update(stored).await.unwrap();

        let mut changed = doc("r1");
        changed.set_spec(json!({"replicas": 2}));
        let reapplied = store.apply(changed).await.unwrap();

        assert_eq!(reapplied.spec(), Some(&json!({"replicas": 2})));
        assert_eq!(reapplied.status(), Some(&json!({"parameterHash": "ab"})));
    }

    #[tokio::test]
    async fn test_changes_emit_watch_events() {
        let store = InMemoryResourceStore::new();
        let mut rx = store.subscribe();

        let stored = store.apply(doc("r1")).await.unwrap();
        store.update(stored).await.unwrap();
        store.delete(&ResourceKey::new("default", "r1")).await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), WatchEvent::Added(_)));
        assert!(matches!(rx.recv().await.unwrap(), WatchEvent::Updated { .. }));
        assert!(matches!(rx.recv().await.unwrap(), WatchEvent::Deleted(_)));
    }

    #[tokio::test]
    async fn test_list_filters_by_namespace() {
        let store = InMemoryResourceStore::new();
        store.apply(doc("r1")).await.unwrap();
        store
            .apply(ResourceDocument::new(
                "automationbroker.io/v1",
                "Bundle",
                &ResourceKey::new("other", "r2"),
                json!({}),
            ))
            .await
            .unwrap();

        assert_eq!(store.list(None).await.unwrap().len(), 2);
        assert_eq!(store.list(Some("other")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tracing_store_delegates() {
        let inner = InMemoryResourceStore::new_arc();
        inner.apply(doc("r1")).await.unwrap();
        let store = TracingResourceStore::new(inner.clone());

        let fetched = store.get(&ResourceKey::new("default", "r1")).await.unwrap();
        store.update(fetched).await.unwrap();
        assert_eq!(inner.update_count(), 1);
    }
}
