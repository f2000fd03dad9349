//! Operation executor seam and the driver that wraps it.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::{OperationKind, ProgressMessage, ServiceInstance};

/// Live sequence of progress messages from a running operation.
///
/// Ends when the operation completes or its transport closes. Dropping it
/// stops consumption; the executor sees a closed receiver.
pub type ProgressStream = Pin<Box<dyn Stream<Item = ProgressMessage> + Send>>;

/// External engine that performs provision / update work.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    /// Start provisioning a new instance.
    async fn provision(&self, instance: &ServiceInstance) -> Result<ProgressStream>;

    /// Start updating an existing instance with new parameters.
    async fn update(&self, instance: &ServiceInstance) -> Result<ProgressStream>;

    /// Start tearing an instance down.
    ///
    /// Executors without a decommission path keep this default.
    async fn deprovision(&self, _instance: &ServiceInstance) -> Result<ProgressStream> {
        Err(Error::unsupported(OperationKind::Deprovision.to_string()))
    }
}

/// Starts operations on an executor. No cancellation is exposed here; the
/// caller owns the returned stream and stops by dropping it.
#[derive(Clone)]
pub struct OperationDriver {
    executor: Arc<dyn OperationExecutor>,
}

impl OperationDriver {
    /// Create a new driver.
    pub fn new(executor: Arc<dyn OperationExecutor>) -> Self {
        Self { executor }
    }

    /// Start an operation of `kind` for `instance`.
    ///
    /// # Errors
    ///
    /// Propagates whatever the executor returns when it refuses to start.
    pub async fn start(
        &self,
        kind: OperationKind,
        instance: &ServiceInstance,
    ) -> Result<ProgressStream> {
        info!(
            operation = %kind,
            instance_id = %instance.id,
            namespace = %instance.context.namespace,
            "Starting operation"
        );
        match kind {
            OperationKind::Provision => self.executor.provision(instance).await,
            OperationKind::Update => self.executor.update(instance).await,
            OperationKind::Deprovision => self.executor.deprovision(instance).await,
        }
    }
}

/// One recorded call on a [`ScriptedExecutor`].
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub kind: OperationKind,
    pub instance: ServiceInstance,
}

/// Executor that replays a fixed message script per operation.
///
/// Messages are sent from a spawned task through a bounded channel, so the
/// consumer sees a live stream rather than a snapshot. A producer stops at
/// the first send that finds the stream dropped.
pub struct ScriptedExecutor {
    default_script: Vec<ProgressMessage>,
    scripts: HashMap<OperationKind, Vec<ProgressMessage>>,
    refused: Vec<OperationKind>,
    step_delay: Duration,
    calls: Mutex<Vec<Invocation>>,
    sent: Arc<AtomicUsize>,
    producers: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new(Self::default_script())
    }
}

impl ScriptedExecutor {
    /// The two-step script used by [`ScriptedExecutor::default`].
    pub fn default_script() -> Vec<ProgressMessage> {
        vec![
            ProgressMessage::step("in progress", "operation started"),
            ProgressMessage::step("succeeded", "operation finished"),
        ]
    }

    /// Create an executor that emits `script` for every operation.
    pub fn new(script: Vec<ProgressMessage>) -> Self {
        Self {
            default_script: script,
            scripts: HashMap::new(),
            refused: Vec::new(),
            step_delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            sent: Arc::new(AtomicUsize::new(0)),
            producers: Mutex::new(Vec::new()),
        }
    }

    /// Use a specific script for one kind of operation.
    #[must_use]
    pub fn with_script(mut self, kind: OperationKind, script: Vec<ProgressMessage>) -> Self {
        self.scripts.insert(kind, script);
        self
    }

    /// Pause between messages.
    #[must_use]
    pub const fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Refuse to start operations of `kind`.
    #[must_use]
    pub fn refusing(mut self, kind: OperationKind) -> Self {
        self.refused.push(kind);
        self
    }

    /// Every call made so far, in order.
    pub async fn invocations(&self) -> Vec<Invocation> {
        self.calls.lock().await.clone()
    }

    /// Number of calls of `kind` made so far.
    pub async fn count(&self, kind: OperationKind) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| call.kind == kind)
            .count()
    }

    /// Messages handed to a consumer so far, across all operations.
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }

    /// Wait until every producer task spawned so far has exited.
    pub async fn join_producers(&self) {
        let producers: Vec<_> = self.producers.lock().await.drain(..).collect();
        for producer in producers {
            if let Err(e) = producer.await {
                debug!(error = %e, "Progress producer ended abnormally");
            }
        }
    }

    async fn run(&self, kind: OperationKind, instance: &ServiceInstance) -> Result<ProgressStream> {
        self.calls.lock().await.push(Invocation {
            kind,
            instance: instance.clone(),
        });

        if self.refused.contains(&kind) {
            return Err(Error::executor(kind.to_string(), "refused by script"));
        }

        let script = self
            .scripts
            .get(&kind)
            .unwrap_or(&self.default_script)
            .clone();
        let delay = self.step_delay;
        let sent = Arc::clone(&self.sent);
        let (tx, rx) = mpsc::channel::<ProgressMessage>(16);

        let producer = tokio::spawn(async move {
            for message in script {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(message).await.is_err() {
                    debug!(%kind, "Progress receiver dropped");
                    break;
                }
                sent.fetch_add(1, Ordering::Relaxed);
            }
        });
        self.producers.lock().await.push(producer);

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }
}

#[async_trait]
impl OperationExecutor for ScriptedExecutor {
    async fn provision(&self, instance: &ServiceInstance) -> Result<ProgressStream> {
        self.run(OperationKind::Provision, instance).await
    }

    async fn update(&self, instance: &ServiceInstance) -> Result<ProgressStream> {
        self.run(OperationKind::Update, instance).await
    }

    async fn deprovision(&self, instance: &ServiceInstance) -> Result<ProgressStream> {
        self.run(OperationKind::Deprovision, instance).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::types::Parameters;
    use futures::StreamExt;
    use uuid::Uuid;

    fn instance() -> ServiceInstance {
        ServiceInstance::for_spec(Uuid::new_v4(), &ControllerConfig::default(), &Parameters::new())
    }

    struct ProvisionOnly;

    #[async_trait]
    impl OperationExecutor for ProvisionOnly {
        async fn provision(&self, _instance: &ServiceInstance) -> Result<ProgressStream> {
            Ok(Box::pin(futures::stream::empty::<ProgressMessage>()))
        }

        async fn update(&self, _instance: &ServiceInstance) -> Result<ProgressStream> {
            Ok(Box::pin(futures::stream::empty::<ProgressMessage>()))
        }
    }

    #[tokio::test]
    async fn test_driver_streams_script_in_order() {
        let script = vec![
            ProgressMessage::step("in progress", "one"),
            ProgressMessage::step("in progress", "two"),
            ProgressMessage::step("succeeded", "three"),
        ];
        let executor = Arc::new(ScriptedExecutor::new(script.clone()));
        let driver = OperationDriver::new(executor.clone());

        let stream = driver
            .start(OperationKind::Provision, &instance())
            .await
            .unwrap();
        let received: Vec<ProgressMessage> = stream.collect().await;

        assert_eq!(received, script);
        assert_eq!(executor.count(OperationKind::Provision).await, 1);
        assert_eq!(executor.count(OperationKind::Update).await, 0);
    }

    #[tokio::test]
    async fn test_per_kind_script_overrides_default() {
        let executor = Arc::new(
            ScriptedExecutor::default()
                .with_script(OperationKind::Update, vec![ProgressMessage::step("ok", "u")]),
        );
        let driver = OperationDriver::new(executor);

        let update: Vec<_> = driver
            .start(OperationKind::Update, &instance())
            .await
            .unwrap()
            .collect()
            .await;
        let provision: Vec<_> = driver
            .start(OperationKind::Provision, &instance())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(update.len(), 1);
        assert_eq!(provision.len(), 2);
    }

    #[tokio::test]
    async fn test_refused_kind_is_executor_error() {
        let executor = Arc::new(ScriptedExecutor::default().refusing(OperationKind::Update));
        let driver = OperationDriver::new(executor.clone());

        let result = driver.start(OperationKind::Update, &instance()).await;
        assert!(matches!(result, Err(Error::Executor { .. })));
        assert_eq!(executor.invocations().await.len(), 1);
    }

    #[tokio::test]
    async fn test_default_deprovision_is_unsupported() {
        let driver = OperationDriver::new(Arc::new(ProvisionOnly));
        let result = driver.start(OperationKind::Deprovision, &instance()).await;
        assert!(matches!(result, Err(Error::Unsupported { .. })));
    }

    #[tokio::test]
    async fn test_dropping_stream_stops_producer() {
        let script = (0..100)
            .map(|i| ProgressMessage::step("in progress", format!("step {i}")))
            .collect();
        let executor = Arc::new(ScriptedExecutor::new(script));
        let driver = OperationDriver::new(executor.clone());

        let mut stream = driver
            .start(OperationKind::Provision, &instance())
            .await
            .unwrap();
        assert!(stream.next().await.is_some());
        drop(stream);

        tokio::time::timeout(Duration::from_secs(5), executor.join_producers())
            .await
            .unwrap();
        // One message taken plus at most a full channel buffer.
        assert!(executor.sent() <= 17, "sent {}", executor.sent());
    }

    #[tokio::test]
    async fn test_finished_producer_counts_whole_script() {
        let executor = Arc::new(ScriptedExecutor::default());
        let driver = OperationDriver::new(executor.clone());

        let received: Vec<_> = driver
            .start(OperationKind::Provision, &instance())
            .await
            .unwrap()
            .collect()
            .await;
        executor.join_producers().await;

        assert_eq!(received.len(), 2);
        assert_eq!(executor.sent(), 2);
    }
}
