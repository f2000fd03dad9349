//! Watch events and their dispatch to handlers.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::types::ResourceDocument;

/// A change to a watched resource.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(ResourceDocument),
    Updated {
        old: ResourceDocument,
        new: ResourceDocument,
    },
    Deleted(ResourceDocument),
}

impl WatchEvent {
    /// Short name of the event kind.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Updated { .. } => "updated",
            Self::Deleted(_) => "deleted",
        }
    }

    /// The document the event is about; the new one for updates.
    pub const fn object(&self) -> &ResourceDocument {
        match self {
            Self::Added(doc) | Self::Deleted(doc) | Self::Updated { new: doc, .. } => doc,
        }
    }
}

/// Callbacks a watch delivers resource changes to.
///
/// Handlers own their failures: they log and return, and never report back
/// to the dispatcher.
#[async_trait]
pub trait ResourceEventHandler: Send + Sync {
    async fn on_added(&self, doc: ResourceDocument);

    async fn on_updated(&self, old: ResourceDocument, new: ResourceDocument);

    async fn on_deleted(&self, doc: ResourceDocument);
}

/// Run the handler callback matching `event`, inside a span naming it.
pub async fn dispatch(handler: &dyn ResourceEventHandler, event: WatchEvent) {
    let name = event.object().name().unwrap_or_default().to_string();
    let namespace = event.object().namespace().unwrap_or_default().to_string();
    let span = info_span!("watch_event", kind = event.kind(), %namespace, %name);

    async move {
        debug!("Dispatching watch event");
        match event {
            WatchEvent::Added(doc) => handler.on_added(doc).await,
            WatchEvent::Updated { old, new } => handler.on_updated(old, new).await,
            WatchEvent::Deleted(doc) => handler.on_deleted(doc).await,
        }
    }
    .instrument(span)
    .await;
}

/// Feeds watch events from a broadcast channel into a handler.
pub struct WatchDispatcher {
    handler: Arc<dyn ResourceEventHandler>,
    events: broadcast::Receiver<WatchEvent>,
    stop_rx: watch::Receiver<bool>,
    stop_tx: watch::Sender<bool>,
}

impl WatchDispatcher {
    /// Create a new dispatcher.
    pub fn new(
        handler: Arc<dyn ResourceEventHandler>,
        events: broadcast::Receiver<WatchEvent>,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            handler,
            events,
            stop_rx,
            stop_tx,
        }
    }

    /// Handle queued events one at a time until the queue is empty.
    ///
    /// Events raised by the handlers themselves (status writes) are queued
    /// behind the current one and handled in the same call.
    pub async fn drain(&mut self) -> usize {
        let mut handled = 0usize;
        loop {
            match self.events.try_recv() {
                Ok(event) => {
                    dispatch(self.handler.as_ref(), event).await;
                    handled = handled.saturating_add(1);
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Watch receiver lagged, events dropped");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return handled,
            }
        }
    }

    /// Handle events concurrently, one task per event, until stopped.
    ///
    /// On stop, events already queued are still handled and every in-flight
    /// handler is awaited before returning.
    pub async fn run(&mut self) -> usize {
        info!("Starting watch dispatcher");
        let mut tasks = JoinSet::new();
        let mut handled = 0usize;

        loop {
            if *self.stop_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = self.stop_rx.changed() => {
                    if *self.stop_rx.borrow() {
                        break;
                    }
                }
                received = self.events.recv() => match received {
                    Ok(event) => {
                        let handler = Arc::clone(&self.handler);
                        tasks.spawn(async move { dispatch(handler.as_ref(), event).await });
                        handled = handled.saturating_add(1);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Watch receiver lagged, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Watch handler task failed");
                    }
                }
            }
        }

        info!(in_flight = tasks.len(), "Stopping watch dispatcher");
        loop {
            loop {
                match self.events.try_recv() {
                    Ok(event) => {
                        let handler = Arc::clone(&self.handler);
                        tasks.spawn(async move { dispatch(handler.as_ref(), event).await });
                        handled = handled.saturating_add(1);
                    }
                    Err(TryRecvError::Lagged(skipped)) => {
                        warn!(skipped, "Watch receiver lagged, events dropped");
                    }
                    Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                }
            }
            match tasks.join_next().await {
                Some(Err(e)) => error!(error = %e, "Watch handler task failed"),
                Some(Ok(())) => {}
                None => break,
            }
        }

        info!(handled, "Watch dispatcher stopped");
        handled
    }

    /// Get a stopper handle.
    pub fn stopper(&self) -> DispatcherStopper {
        DispatcherStopper {
            stop_tx: self.stop_tx.clone(),
        }
    }
}

/// Handle to stop a running [`WatchDispatcher`].
#[derive(Clone)]
pub struct DispatcherStopper {
    stop_tx: watch::Sender<bool>,
}

impl DispatcherStopper {
    /// Stop the dispatcher.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::ResourceKey;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ResourceEventHandler for Recorder {
        async fn on_added(&self, doc: ResourceDocument) {
            self.seen
                .lock()
                .await
                .push(format!("added:{}", doc.name().unwrap_or_default()));
        }

        async fn on_updated(&self, _old: ResourceDocument, new: ResourceDocument) {
            self.seen
                .lock()
                .await
                .push(format!("updated:{}", new.name().unwrap_or_default()));
        }

        async fn on_deleted(&self, doc: ResourceDocument) {
            self.seen
                .lock()
                .await
                .push(format!("deleted:{}", doc.name().unwrap_or_default()));
        }
    }

    fn doc(name: &str) -> ResourceDocument {
        ResourceDocument::new(
            "automationbroker.io/v1",
            "Bundle",
            &ResourceKey::new("default", name),
            json!({}),
        )
    }

    #[test]
    fn test_event_object_is_new_document_for_updates() {
        let event = WatchEvent::Updated {
            old: doc("old"),
            new: doc("new"),
        };
        assert_eq!(event.kind(), "updated");
        assert_eq!(event.object().name(), Some("new"));
    }

    /// Given three queued events
    /// When the dispatcher drains
    /// Then each reaches the handler in order
    #[tokio::test]
    async fn drain_delivers_in_order() {
        let (tx, rx) = broadcast::channel(16);
        let recorder = Arc::new(Recorder::default());
        let mut dispatcher = WatchDispatcher::new(recorder.clone(), rx);

        tx.send(WatchEvent::Added(doc("a"))).unwrap();
        tx.send(WatchEvent::Updated {
            old: doc("a"),
            new: doc("a"),
        })
        .unwrap();
        tx.send(WatchEvent::Deleted(doc("a"))).unwrap();

        assert_eq!(dispatcher.drain().await, 3);
        assert_eq!(
            *recorder.seen.lock().await,
            vec!["added:a", "updated:a", "deleted:a"]
        );
    }

    /// Given a running dispatcher
    /// When events are sent and the dispatcher is stopped
    /// Then every event is handled before run returns
    #[tokio::test]
    async fn stop_finishes_queued_events() {
        let (tx, rx) = broadcast::channel(16);
        let recorder = Arc::new(Recorder::default());
        let mut dispatcher = WatchDispatcher::new(recorder.clone(), rx);
        let stopper = dispatcher.stopper();

        let handle = tokio::spawn(async move { dispatcher.run().await });
        tx.send(WatchEvent::Added(doc("a"))).unwrap();
        tx.send(WatchEvent::Added(doc("b"))).unwrap();
        stopper.stop();

        let handled = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handled, 2);
        assert_eq!(recorder.seen.lock().await.len(), 2);
    }
}
