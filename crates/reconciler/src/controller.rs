//! The bundle controller: reacts to resource events and drives operations.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::executor::{OperationDriver, OperationExecutor, ProgressStream};
use crate::hash::{ParameterHash, fingerprint};
use crate::status::StatusStore;
use crate::store::ResourceStore;
use crate::types::{
    BundleResource, OperationKind, ProgressMessage, ReconcileOutcome, ResourceDocument,
    ResourceKey, ServiceInstance,
};
use crate::watch::ResourceEventHandler;

/// Counters kept by a [`Controller`].
#[derive(Debug, Default)]
pub struct ControllerStats {
    events: AtomicU64,
    operations_started: AtomicU64,
    skipped_unchanged: AtomicU64,
    cancelled: AtomicU64,
    superseded: AtomicU64,
}

impl ControllerStats {
    /// Events received by any handler.
    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    /// Operations the executor accepted.
    pub fn operations_started(&self) -> u64 {
        self.operations_started.load(Ordering::Relaxed)
    }

    /// Updates skipped because the spec fingerprint was unchanged.
    pub fn skipped_unchanged(&self) -> u64 {
        self.skipped_unchanged.load(Ordering::Relaxed)
    }

    /// Operations abandoned because their resource was deleted.
    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Operations abandoned because a newer spec took over the resource.
    pub fn superseded(&self) -> u64 {
        self.superseded.load(Ordering::Relaxed)
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Reconciles bundle resources against an operation executor.
///
/// Convergence is tracked entirely in the resource status: `parameterHash`
/// records the spec fingerprint last acted upon, `serviceInstanceID` the
/// instance created for it. Events whose spec still matches the recorded
/// hash are ignored, which includes every event caused by the controller's
/// own status writes.
pub struct Controller {
    config: Arc<ControllerConfig>,
    status: StatusStore,
    driver: OperationDriver,
    inflight: Mutex<HashMap<ResourceKey, watch::Sender<bool>>>,
    stats: ControllerStats,
}

impl Controller {
    /// Create a controller. Prefer [`ControllerBuilder`], which validates the config.
    pub fn new(
        config: Arc<ControllerConfig>,
        store: Arc<dyn ResourceStore>,
        executor: Arc<dyn OperationExecutor>,
    ) -> Self {
        let status = StatusStore::new(store, config.max_conflict_retries);
        Self {
            config,
            status,
            driver: OperationDriver::new(executor),
            inflight: Mutex::new(HashMap::new()),
            stats: ControllerStats::default(),
        }
    }

    /// Create a builder.
    pub fn builder() -> ControllerBuilder {
        ControllerBuilder::new()
    }

    /// The configuration in use.
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Counters for this controller.
    pub const fn stats(&self) -> &ControllerStats {
        &self.stats
    }

    /// Successful status writes so far.
    pub fn status_writes(&self) -> u64 {
        self.status.write_count()
    }

    /// Provision a newly observed resource.
    ///
    /// The hash and instance id are persisted before the operation starts,
    /// then every progress message is appended to the status. An id already
    /// in the status is kept. A resource that already records both an id and
    /// a hash (seen again after a re-list) is treated like an update.
    ///
    /// # Errors
    ///
    /// Decode, store and executor errors abort the handler. Writes already
    /// made are not rolled back.
    pub async fn reconcile_added(&self, doc: &ResourceDocument) -> Result<ReconcileOutcome> {
        ControllerStats::bump(&self.stats.events);
        let resource = BundleResource::decode(doc, &self.config.namespace)?;
        let hash = fingerprint(&resource.spec)?;

        let recorded = resource.status.parameter_hash.clone();
        let existing = resource.status.service_instance_id;
        if let (Some(instance_id), Some(recorded)) = (existing, recorded) {
            if recorded == hash {
                ControllerStats::bump(&self.stats.skipped_unchanged);
                debug!(resource = %resource.key, %hash, "Already converged");
                return Ok(ReconcileOutcome::Unchanged);
            }
            info!(
                resource = %resource.key,
                %instance_id,
                previous = %recorded,
                %hash,
                "Spec changed while unobserved, updating instance"
            );
            return self.update_instance(resource, hash, instance_id).await;
        }

        let instance_id = existing.unwrap_or_else(Uuid::new_v4);
        let key = resource.key;

        let mut status = resource.status;
        status.parameter_hash = Some(hash.clone());
        status.service_instance_id = Some(instance_id);
        status.messages.clear();

        info!(
            resource = %key,
            %hash,
            %instance_id,
            reused_id = existing.is_some(),
            "Provisioning new resource"
        );
        self.status.write(&key, &status).await?;

        let instance = ServiceInstance::for_spec(instance_id, &self.config, &resource.spec);
        let messages = self
            .run_operation(OperationKind::Provision, &key, &instance, hash)
            .await?;
        Ok(ReconcileOutcome::Provisioned {
            instance_id,
            messages,
        })
    }

    /// React to a changed resource.
    ///
    /// Only the spec of `new` is compared, against the hash recorded in
    /// `new`'s own status. The resource is not re-read.
    ///
    /// # Errors
    ///
    /// [`Error::MissingInstanceId`] if an update is needed but no instance was
    /// ever recorded; decode, store and executor errors as for
    /// [`Self::reconcile_added`].
    pub async fn reconcile_updated(
        &self,
        old: &ResourceDocument,
        new: &ResourceDocument,
    ) -> Result<ReconcileOutcome> {
        ControllerStats::bump(&self.stats.events);
        let resource = BundleResource::decode(new, &self.config.namespace)?;
        let hash = fingerprint(&resource.spec)?;

        let Some(recorded) = resource.status.parameter_hash.as_ref() else {
            info!(
                resource = %resource.key,
                "No parameter hash recorded, cannot tell whether the spec changed"
            );
            return Ok(ReconcileOutcome::MissingHash);
        };

        if *recorded == hash {
            ControllerStats::bump(&self.stats.skipped_unchanged);
            debug!(resource = %resource.key, %hash, "Spec unchanged");
            return Ok(ReconcileOutcome::Unchanged);
        }

        let instance_id = resource
            .status
            .service_instance_id
            .ok_or_else(|| Error::MissingInstanceId {
                key: resource.key.clone(),
            })?;

        info!(
            resource = %resource.key,
            %instance_id,
            previous = %recorded,
            %hash,
            old_version = old.resource_version().unwrap_or_default(),
            new_version = new.resource_version().unwrap_or_default(),
            "Spec changed, updating instance"
        );
        self.update_instance(resource, hash, instance_id).await
    }

    /// Claim `resource` for `hash` and stream an update of `instance_id`.
    async fn update_instance(
        &self,
        resource: BundleResource,
        hash: ParameterHash,
        instance_id: Uuid,
    ) -> Result<ReconcileOutcome> {
        let key = resource.key;
        let mut status = resource.status;
        status.parameter_hash = Some(hash.clone());
        status.service_instance_id = Some(instance_id);
        status.messages.clear();
        self.status.write(&key, &status).await?;

        let instance = ServiceInstance::for_spec(instance_id, &self.config, &resource.spec);
        let messages = self
            .run_operation(OperationKind::Update, &key, &instance, hash)
            .await?;
        Ok(ReconcileOutcome::Updated {
            instance_id,
            messages,
        })
    }

    /// Observe a deletion.
    ///
    /// Any operation still streaming for the resource is cancelled. With
    /// `deprovision_on_delete`, a recorded instance is also torn down; its
    /// messages are only logged since the resource is gone.
    ///
    /// # Errors
    ///
    /// Decode errors, and executor errors other than `Unsupported`.
    pub async fn reconcile_deleted(&self, doc: &ResourceDocument) -> Result<ReconcileOutcome> {
        ControllerStats::bump(&self.stats.events);
        let key = doc.key(&self.config.namespace)?;
        let cancelled = self.cancel_inflight(&key).await;
        info!(resource = %key, cancelled, "Resource deleted");

        if !self.config.deprovision_on_delete {
            return Ok(ReconcileOutcome::Observed);
        }

        let resource = BundleResource::decode(doc, &self.config.namespace)?;
        let Some(instance_id) = resource.status.service_instance_id else {
            debug!(resource = %key, "No instance recorded, nothing to deprovision");
            return Ok(ReconcileOutcome::Observed);
        };

        let instance = ServiceInstance::for_spec(instance_id, &self.config, &resource.spec);
        let stream = match self.driver.start(OperationKind::Deprovision, &instance).await {
            Ok(stream) => stream,
            Err(Error::Unsupported { operation }) => {
                warn!(resource = %key, %operation, "Executor cannot deprovision, instance left running");
                return Ok(ReconcileOutcome::Observed);
            }
            Err(e) => return Err(e),
        };
        ControllerStats::bump(&self.stats.operations_started);

        let messages = self.log_progress(&key, stream).await?;
        Ok(ReconcileOutcome::Deprovisioned {
            instance_id,
            messages,
        })
    }

    async fn run_operation(
        &self,
        kind: OperationKind,
        key: &ResourceKey,
        instance: &ServiceInstance,
        owner: ParameterHash,
    ) -> Result<usize> {
        let mut cancel = self.register(key).await;
        let result = match self.driver.start(kind, instance).await {
            Ok(stream) => {
                ControllerStats::bump(&self.stats.operations_started);
                self.persist_progress(key, stream, &owner, &mut cancel).await
            }
            Err(e) => Err(e),
        };
        self.release(key, cancel).await;
        result
    }

    /// Append each message to the progress log and write it, until the
    /// stream ends, the resource is deleted, a newer spec takes over from
    /// `owner` or the deadline passes.
    async fn persist_progress(
        &self,
        key: &ResourceKey,
        mut stream: ProgressStream,
        owner: &ParameterHash,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<usize> {
        let flush_every = self.config.status_flush_interval;
        let timeout = self.config.operation_timeout;
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut messages: Vec<ProgressMessage> = Vec::new();
        let mut pending = false;
        let mut flush_at: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                () = cancelled(cancel) => {
                    ControllerStats::bump(&self.stats.cancelled);
                    info!(
                        resource = %key,
                        received = messages.len(),
                        "Resource deleted, abandoning operation"
                    );
                    return Err(Error::Cancelled { key: key.clone() });
                }
                () = sleep_until(deadline) => {
                    if pending {
                        self.flush(key, owner, &messages).await?;
                    }
                    let after_secs = timeout.map_or(0, |t| t.as_secs());
                    warn!(
                        resource = %key,
                        received = messages.len(),
                        after_secs,
                        "Operation timed out"
                    );
                    return Err(Error::TimedOut { key: key.clone(), after_secs });
                }
                () = sleep_until(flush_at) => {
                    self.flush(key, owner, &messages).await?;
                    pending = false;
                    flush_at = None;
                }
                next = stream.next() => match next {
                    Some(message) => {
                        info!(resource = %key, message = %message.as_value(), "Operation progress");
                        messages.push(message);
                        if flush_every.is_zero() {
                            self.flush(key, owner, &messages).await?;
                        } else {
                            pending = true;
                            if flush_at.is_none() {
                                flush_at = Instant::now().checked_add(flush_every);
                            }
                        }
                    }
                    None => {
                        if pending {
                            self.flush(key, owner, &messages).await?;
                        }
                        info!(resource = %key, messages = messages.len(), "Operation stream ended");
                        return Ok(messages.len());
                    }
                }
            }
        }
    }

    async fn flush(
        &self,
        key: &ResourceKey,
        owner: &ParameterHash,
        messages: &[ProgressMessage],
    ) -> Result<()> {
        let result = self.status.write_progress(key, owner, messages).await;
        if matches!(result, Err(Error::Superseded { .. })) {
            ControllerStats::bump(&self.stats.superseded);
            info!(
                resource = %key,
                hash = %owner,
                received = messages.len(),
                "Newer spec took over, abandoning operation"
            );
        }
        result
    }

    async fn log_progress(&self, key: &ResourceKey, mut stream: ProgressStream) -> Result<usize> {
        let timeout = self.config.operation_timeout;
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut received = 0usize;

        loop {
            tokio::select! {
                biased;
                () = sleep_until(deadline) => {
                    let after_secs = timeout.map_or(0, |t| t.as_secs());
                    warn!(resource = %key, received, after_secs, "Deprovision timed out");
                    return Err(Error::TimedOut { key: key.clone(), after_secs });
                }
                next = stream.next() => match next {
                    Some(message) => {
                        info!(resource = %key, message = %message.as_value(), "Deprovision progress");
                        received = received.saturating_add(1);
                    }
                    None => {
                        info!(resource = %key, messages = received, "Deprovision stream ended");
                        return Ok(received);
                    }
                }
            }
        }
    }

    async fn register(&self, key: &ResourceKey) -> watch::Receiver<bool> {
        let mut inflight = self.inflight.lock().await;
        inflight
            .entry(key.clone())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    async fn release(&self, key: &ResourceKey, cancel: watch::Receiver<bool>) {
        drop(cancel);
        let mut inflight = self.inflight.lock().await;
        if inflight
            .get(key)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            inflight.remove(key);
        }
    }

    async fn cancel_inflight(&self, key: &ResourceKey) -> bool {
        let removed = self.inflight.lock().await.remove(key);
        match removed {
            Some(tx) => {
                tx.send_replace(true);
                true
            }
            None => false,
        }
    }
}

/// Resolves once `rx` reads true; never, if the sender is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let closed = rx.wait_for(|stop| *stop).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

fn log_failure(event: &str, doc: &ResourceDocument, err: &Error) {
    let name = doc.name().unwrap_or_default();
    match err {
        Error::Cancelled { .. } | Error::Superseded { .. } => {
            info!(event, name, "Handler stopped: {err}");
        }
        Error::Unsupported { .. } => warn!(event, name, error = %err, "Handler failed"),
        _ => error!(event, name, error = %err, "Handler failed"),
    }
}

#[async_trait]
impl ResourceEventHandler for Controller {
    async fn on_added(&self, doc: ResourceDocument) {
        match self.reconcile_added(&doc).await {
            Ok(outcome) => debug!(
                ?outcome,
                started = outcome.started_operation(),
                "Added event handled"
            ),
            Err(e) => log_failure("added", &doc, &e),
        }
    }

    async fn on_updated(&self, old: ResourceDocument, new: ResourceDocument) {
        match self.reconcile_updated(&old, &new).await {
            Ok(outcome) => debug!(
                ?outcome,
                started = outcome.started_operation(),
                "Updated event handled"
            ),
            Err(e) => log_failure("updated", &new, &e),
        }
    }

    async fn on_deleted(&self, doc: ResourceDocument) {
        match self.reconcile_deleted(&doc).await {
            Ok(outcome) => debug!(
                ?outcome,
                started = outcome.started_operation(),
                "Deleted event handled"
            ),
            Err(e) => log_failure("deleted", &doc, &e),
        }
    }
}

/// Builder for [`Controller`].
pub struct ControllerBuilder {
    config: ControllerConfig,
    store: Option<Arc<dyn ResourceStore>>,
    executor: Option<Arc<dyn OperationExecutor>>,
}

impl ControllerBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: ControllerConfig::default(),
            store: None,
            executor: None,
        }
    }

    /// Set the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the resource store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ResourceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the operation executor.
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn OperationExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Build the controller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the store or executor is missing,
    /// or the configuration does not validate.
    pub fn build(self) -> Result<Controller> {
        let store = self
            .store
            .ok_or_else(|| Error::invalid_config("resource store is required"))?;
        let executor = self
            .executor
            .ok_or_else(|| Error::invalid_config("operation executor is required"))?;
        self.config.validate()?;

        Ok(Controller::new(Arc::new(self.config), store, executor))
    }
}

impl Default for ControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::config::BundleSpec;
    use crate::executor::ScriptedExecutor;
    use crate::store::InMemoryResourceStore;
    use crate::types::{BundleStatus, PLAN_PARAMETER_KEY};
    use serde_json::{Value, json};
    use std::time::Duration;

    fn config() -> ControllerConfig {
        ControllerConfig::default().bundle(BundleSpec {
            name: "postgresql-apb".to_string(),
            image: "docker.io/ansibleplaybookbundle/postgresql-apb".to_string(),
            ..BundleSpec::default()
        })
    }

    fn key() -> ResourceKey {
        ResourceKey::new("default", "r1")
    }

    fn doc(spec: Value) -> ResourceDocument {
        ResourceDocument::new("automationbroker.io/v1", "Bundle", &key(), spec)
    }

    fn script(n: usize) -> Vec<ProgressMessage> {
        (0..n)
            .map(|i| ProgressMessage::step("in progress", format!("step {i}")))
            .collect()
    }

    struct Harness {
        store: Arc<InMemoryResourceStore>,
        executor: Arc<ScriptedExecutor>,
        controller: Arc<Controller>,
    }

    async fn harness(config: ControllerConfig, executor: ScriptedExecutor) -> Harness {
        let store = InMemoryResourceStore::new_arc();
        let executor = Arc::new(executor);
        let controller = Controller::builder()
            .with_config(config)
            .with_store(store.clone())
            .with_executor(executor.clone())
            .build()
            .unwrap();
        Harness {
            store,
            executor,
            controller: Arc::new(controller),
        }
    }

    async fn stored_status(store: &InMemoryResourceStore) -> BundleStatus {
        let doc = store.get(&key()).await.unwrap();
        serde_json::from_value(doc.status().cloned().unwrap_or(Value::Null)).unwrap_or_default()
    }

    #[tokio::test]
    async fn test_added_records_hash_and_streams_messages() {
        let h = harness(config(), ScriptedExecutor::new(script(3))).await;
        let stored = h.store.apply(doc(json!({"replicas": 1}))).await.unwrap();

        let outcome = h.controller.reconcile_added(&stored).await.unwrap();

        let ReconcileOutcome::Provisioned {
            instance_id,
            messages,
        } = outcome
        else {
            panic!("expected Provisioned, got {outcome:?}");
        };
        assert_eq!(messages, 3);

        let status = stored_status(&h.store).await;
        let spec = BundleResource::decode(&stored, "default").unwrap().spec;
        assert_eq!(status.parameter_hash, Some(fingerprint(&spec).unwrap()));
        assert_eq!(status.service_instance_id, Some(instance_id));
        assert_eq!(status.messages, script(3));

        // One write for the hash, one per message.
        assert_eq!(h.controller.status_writes(), 4);
        assert_eq!(h.controller.stats().operations_started(), 1);
    }

    #[tokio::test]
    async fn test_provision_descriptor_carries_plan_and_spec() {
        let h = harness(config(), ScriptedExecutor::default()).await;
        let stored = h.store.apply(doc(json!({"replicas": 1}))).await.unwrap();
        h.controller.reconcile_added(&stored).await.unwrap();

        let calls = h.executor.invocations().await;
        assert_eq!(calls.len(), 1);
        let instance = &calls[0].instance;
        assert_eq!(calls[0].kind, OperationKind::Provision);
        assert_eq!(instance.parameters["replicas"], json!(1));
        assert_eq!(instance.parameters[PLAN_PARAMETER_KEY], json!("default"));
        assert_eq!(instance.bundle.name, "postgresql-apb");
        assert!(instance.context.not_sandboxed);
        assert_eq!(instance.context.namespace, "default");
    }

    #[tokio::test]
    async fn test_updated_with_same_spec_is_unchanged() {
        let h = harness(config(), ScriptedExecutor::default()).await;
        let stored = h.store.apply(doc(json!({"replicas": 1}))).await.unwrap();
        h.controller.reconcile_added(&stored).await.unwrap();
        let writes = h.controller.status_writes();

        let current = h.store.get(&key()).await.unwrap();
        let outcome = h
            .controller
            .reconcile_updated(&stored, &current)
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Unchanged);
        assert_eq!(h.controller.status_writes(), writes);
        assert_eq!(h.executor.invocations().await.len(), 1);
        assert_eq!(h.controller.stats().skipped_unchanged(), 1);
    }

    #[tokio::test]
    async fn test_updated_without_hash_does_nothing() {
        let h = harness(config(), ScriptedExecutor::default()).await;
        let old = h.store.apply(doc(json!({"replicas": 1}))).await.unwrap();
        let new = h.store.apply(doc(json!({"replicas": 2}))).await.unwrap();

        let outcome = h.controller.reconcile_updated(&old, &new).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::MissingHash);
        assert_eq!(h.controller.status_writes(), 0);
        assert!(h.executor.invocations().await.is_empty());
    }

    #[tokio::test]
    async fn test_updated_spec_reuses_instance_id() {
        let h = harness(config(), ScriptedExecutor::default()).await;
        let stored = h.store.apply(doc(json!({"replicas": 1}))).await.unwrap();
        let ReconcileOutcome::Provisioned { instance_id, .. } =
            h.controller.reconcile_added(&stored).await.unwrap()
        else {
            panic!("expected Provisioned");
        };

        let old = h.store.get(&key()).await.unwrap();
        let new = h.store.apply(doc(json!({"replicas": 2}))).await.unwrap();
        let outcome = h.controller.reconcile_updated(&old, &new).await.unwrap();

        assert!(matches!(
            outcome,
            ReconcileOutcome::Updated { instance_id: id, messages: 2 } if id == instance_id
        ));
        let calls = h.executor.invocations().await;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].kind, OperationKind::Update);
        assert_eq!(calls[1].instance.id, instance_id);
        assert_eq!(calls[1].instance.parameters["replicas"], json!(2));

        let status = stored_status(&h.store).await;
        let mut expected = crate::types::Parameters::new();
        expected.insert("replicas".to_string(), json!(2));
        assert_eq!(status.parameter_hash, Some(fingerprint(&expected).unwrap()));
        assert_eq!(status.service_instance_id, Some(instance_id));
        assert_eq!(status.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_updated_without_instance_id_fails_before_writing() {
        let h = harness(config(), ScriptedExecutor::default()).await;
        let mut stored = h.store.apply(doc(json!({"replicas": 1}))).await.unwrap();
        stored.set_status(json!({
            "parameterHash": fingerprint(&crate::types::Parameters::new()).unwrap().as_str()
        }));
        let stored = h.store.update(stored).await.unwrap();
        let before = h.store.update_count();

        let err = h
            .controller
            .reconcile_updated(&stored, &stored)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::MissingInstanceId { .. }));
        assert_eq!(h.store.update_count(), before);
        assert!(h.executor.invocations().await.is_empty());
    }

    #[tokio::test]
    async fn test_refused_operation_keeps_hash_write() {
        let h = harness(
            config(),
            ScriptedExecutor::default().refusing(OperationKind::Provision),
        )
        .await;
        let stored = h.store.apply(doc(json!({"replicas": 1}))).await.unwrap();

        let err = h.controller.reconcile_added(&stored).await.unwrap_err();

        assert!(matches!(err, Error::Executor { .. }));
        let status = stored_status(&h.store).await;
        assert!(status.parameter_hash.is_some());
        assert!(status.messages.is_empty());
        assert!(h.controller.inflight.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_non_object_spec_is_decode_error() {
        let h = harness(config(), ScriptedExecutor::default()).await;
        let stored = h.store.apply(doc(json!([1, 2, 3]))).await.unwrap();

        let err = h.controller.reconcile_added(&stored).await.unwrap_err();

        assert!(matches!(err, Error::Decode { .. }));
        assert_eq!(h.controller.status_writes(), 0);
    }

    #[tokio::test]
    async fn test_delete_cancels_streaming_operation() {
        let h = harness(
            config(),
            ScriptedExecutor::new(script(50)).with_step_delay(Duration::from_millis(20)),
        )
        .await;
        let stored = h.store.apply(doc(json!({"replicas": 1}))).await.unwrap();

        let controller = h.controller.clone();
        let added = stored.clone();
        let task = tokio::spawn(async move { controller.reconcile_added(&added).await });

        // Hash write plus at least one message write.
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.store.update_count() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Deliver the deletion before the next message can hit the store.
        let current = h.store.get(&key()).await.unwrap();
        let outcome = h.controller.reconcile_deleted(&current).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Observed);
        h.store.delete(&key()).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled { .. })));
        assert_eq!(h.controller.stats().cancelled(), 1);
        assert!(h.controller.inflight.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_stops_consumption() {
        let h = harness(
            config().operation_timeout(Duration::from_secs(15)),
            ScriptedExecutor::new(script(3)).with_step_delay(Duration::from_secs(10)),
        )
        .await;
        let stored = h.store.apply(doc(json!({"replicas": 1}))).await.unwrap();

        let err = h.controller.reconcile_added(&stored).await.unwrap_err();

        assert!(matches!(err, Error::TimedOut { after_secs: 15, .. }));
        let status = stored_status(&h.store).await;
        assert_eq!(status.messages, script(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalesced_writes_keep_order() {
        let h = harness(
            config().status_flush_interval(Duration::from_millis(100)),
            ScriptedExecutor::new(script(5)),
        )
        .await;
        let stored = h.store.apply(doc(json!({"replicas": 1}))).await.unwrap();

        let outcome = h.controller.reconcile_added(&stored).await.unwrap();

        assert!(matches!(
            outcome,
            ReconcileOutcome::Provisioned { messages: 5, .. }
        ));
        let status = stored_status(&h.store).await;
        assert_eq!(status.messages, script(5));
        assert!(h.controller.status_writes() < 6);
    }

    #[tokio::test]
    async fn test_spec_change_mid_stream_supersedes_operation() {
        let h = harness(
            config(),
            ScriptedExecutor::new(script(50)).with_step_delay(Duration::from_millis(20)),
        )
        .await;
        let stored = h.store.apply(doc(json!({"replicas": 1}))).await.unwrap();
        let owner = fingerprint(&BundleResource::decode(&stored, "default").unwrap().spec).unwrap();

        let controller = h.controller.clone();
        let task = tokio::spawn(async move { controller.reconcile_added(&stored).await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.store.update_count() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        h.store.apply(doc(json!({"replicas": 2}))).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Superseded { .. })));
        assert_eq!(h.controller.stats().superseded(), 1);
        assert!(h.controller.inflight.lock().await.is_empty());

        // The old operation never wrote over the newer spec.
        let status = stored_status(&h.store).await;
        assert_eq!(status.parameter_hash, Some(owner));
        let current = h.store.get(&key()).await.unwrap();
        assert_eq!(current.spec(), Some(&json!({"replicas": 2})));

        tokio::time::timeout(Duration::from_secs(5), h.executor.join_producers())
            .await
            .unwrap();
        assert!(h.executor.sent() < 50);
    }

    #[tokio::test]
    async fn test_added_reuses_recorded_instance_id() {
        let h = harness(config(), ScriptedExecutor::default()).await;
        let id = Uuid::new_v4();
        let mut document = doc(json!({"replicas": 1}));
        document.set_status(json!({ "serviceInstanceID": id.to_string() }));
        let stored = h.store.apply(document).await.unwrap();

        let outcome = h.controller.reconcile_added(&stored).await.unwrap();

        assert!(matches!(
            outcome,
            ReconcileOutcome::Provisioned { instance_id, .. } if instance_id == id
        ));
        let calls = h.executor.invocations().await;
        assert_eq!(calls[0].kind, OperationKind::Provision);
        assert_eq!(calls[0].instance.id, id);
        assert_eq!(stored_status(&h.store).await.service_instance_id, Some(id));
    }

    #[tokio::test]
    async fn test_relisted_converged_resource_is_unchanged() {
        let h = harness(config(), ScriptedExecutor::default()).await;
        let first = h.store.apply(doc(json!({"replicas": 1}))).await.unwrap();
        h.controller.reconcile_added(&first).await.unwrap();
        let writes = h.controller.status_writes();

        // A restarted watch lists the resource again as Added.
        let relisted = h.store.get(&key()).await.unwrap();
        let outcome = h.controller.reconcile_added(&relisted).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Unchanged);
        assert_eq!(h.controller.status_writes(), writes);
        assert_eq!(h.executor.invocations().await.len(), 1);
    }

    #[tokio::test]
    async fn test_relisted_changed_resource_updates_same_instance() {
        let h = harness(config(), ScriptedExecutor::default()).await;
        let first = h.store.apply(doc(json!({"replicas": 1}))).await.unwrap();
        let ReconcileOutcome::Provisioned { instance_id, .. } =
            h.controller.reconcile_added(&first).await.unwrap()
        else {
            panic!("expected Provisioned");
        };

        let relisted = h.store.apply(doc(json!({"replicas": 3}))).await.unwrap();
        let outcome = h.controller.reconcile_added(&relisted).await.unwrap();

        assert!(matches!(
            outcome,
            ReconcileOutcome::Updated { instance_id: id, .. } if id == instance_id
        ));
        assert_eq!(h.executor.count(OperationKind::Update).await, 1);
        assert_eq!(h.executor.count(OperationKind::Provision).await, 1);
    }

    #[tokio::test]
    async fn test_delete_deprovisions_when_enabled() {
        let h = harness(
            config().deprovision_on_delete(true),
            ScriptedExecutor::default(),
        )
        .await;
        let stored = h.store.apply(doc(json!({"replicas": 1}))).await.unwrap();
        h.controller.reconcile_added(&stored).await.unwrap();

        let removed = h.store.delete(&key()).await.unwrap();
        let outcome = h.controller.reconcile_deleted(&removed).await.unwrap();

        assert!(matches!(
            outcome,
            ReconcileOutcome::Deprovisioned { messages: 2, .. }
        ));
        assert_eq!(h.executor.count(OperationKind::Deprovision).await, 1);
    }

    #[tokio::test]
    async fn test_delete_without_deprovision_only_observes() {
        let h = harness(config(), ScriptedExecutor::default()).await;
        let stored = h.store.apply(doc(json!({"replicas": 1}))).await.unwrap();
        h.controller.reconcile_added(&stored).await.unwrap();

        let removed = h.store.delete(&key()).await.unwrap();
        let outcome = h.controller.reconcile_deleted(&removed).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Observed);
        assert_eq!(h.executor.count(OperationKind::Deprovision).await, 0);
    }

    struct NoDeprovision;

    #[async_trait]
    impl OperationExecutor for NoDeprovision {
        async fn provision(&self, _instance: &ServiceInstance) -> Result<ProgressStream> {
            Ok(Box::pin(futures::stream::empty::<ProgressMessage>()))
        }

        async fn update(&self, _instance: &ServiceInstance) -> Result<ProgressStream> {
            Ok(Box::pin(futures::stream::empty::<ProgressMessage>()))
        }
    }

    #[tokio::test]
    async fn test_unsupported_deprovision_is_observed() {
        let store = InMemoryResourceStore::new_arc();
        let controller = Controller::builder()
            .with_config(config().deprovision_on_delete(true))
            .with_store(store.clone())
            .with_executor(Arc::new(NoDeprovision))
            .build()
            .unwrap();
        let stored = store.apply(doc(json!({}))).await.unwrap();
        controller.reconcile_added(&stored).await.unwrap();

        let removed = store.delete(&key()).await.unwrap();
        let outcome = controller.reconcile_deleted(&removed).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Observed);
    }

    #[test]
    fn test_builder_requires_store_and_executor() {
        let missing_store = Controller::builder()
            .with_config(config())
            .with_executor(Arc::new(ScriptedExecutor::default()))
            .build();
        assert!(matches!(missing_store, Err(Error::InvalidConfig { .. })));

        let missing_executor = Controller::builder()
            .with_config(config())
            .with_store(InMemoryResourceStore::new_arc())
            .build();
        assert!(matches!(missing_executor, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_builder_validates_config() {
        let result = Controller::builder()
            .with_store(InMemoryResourceStore::new_arc())
            .with_executor(Arc::new(ScriptedExecutor::default()))
            .build();
        // Default config has no bundle image.
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }
}
