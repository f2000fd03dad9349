//! Hash-driven reconciliation of bundle resources.
//!
//! A [`Controller`] watches custom resources describing desired service
//! bundles and drives an external [`OperationExecutor`] toward them:
//!
//! - **Added**: record the spec fingerprint and a new instance id in the
//!   resource status, then provision.
//! - **Updated**: compare the spec fingerprint to the recorded one. Equal
//!   means nothing to do; different means update the same instance.
//! - **Deleted**: observe, cancel any operation still streaming, and
//!   optionally deprovision.
//!
//! Progress messages from the executor are appended to the status as they
//! arrive, so the resource itself is the progress log.
//!
//! # Key Concepts
//!
//! ## Drift suppression
//!
//! The fingerprint covers the spec only. Status writes made by the controller
//! raise update events of their own, and those always compare equal.
//!
//! ## Seams
//!
//! - [`ResourceStore`] - where resources live ([`InMemoryResourceStore`] in-process)
//! - [`OperationExecutor`] - what performs provision / update ([`ScriptedExecutor`] for tests and demos)
//! - [`ResourceEventHandler`] - what a watch feeds ([`WatchDispatcher`] drives it)
//!
//! # Example
//!
//! ```no_run
//! use bundlectl_reconciler::{
//!     BundleSpec, Controller, ControllerConfig, InMemoryResourceStore, ScriptedExecutor,
//!     WatchDispatcher,
//! };
//! use std::sync::Arc;
//!
//! # async fn demo() -> bundlectl_reconciler::Result<()> {
//! let store = InMemoryResourceStore::new_arc();
//! let config = ControllerConfig::default().bundle(BundleSpec {
//!     image: "docker.io/example/bundle".to_string(),
//!     ..BundleSpec::default()
//! });
//! let controller = Controller::builder()
//!     .with_config(config)
//!     .with_store(store.clone())
//!     .with_executor(Arc::new(ScriptedExecutor::default()))
//!     .build()?;
//!
//! let mut dispatcher = WatchDispatcher::new(Arc::new(controller), store.subscribe());
//! dispatcher.run().await;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod hash;
pub mod status;
pub mod store;
pub mod types;
pub mod watch;

pub use config::{BundlePlan, BundleSpec, ControllerConfig, ResourceType};
pub use controller::{Controller, ControllerBuilder, ControllerStats};
pub use error::{Error, Result};
pub use executor::{Invocation, OperationDriver, OperationExecutor, ProgressStream, ScriptedExecutor};
pub use hash::{ParameterHash, fingerprint};
pub use status::StatusStore;
pub use store::{InMemoryResourceStore, ResourceStore, TracingResourceStore};
pub use types::{
    BundleResource, BundleStatus, InstanceContext, OperationKind, Parameters, ProgressMessage,
    ReconcileOutcome, ResourceDocument, ResourceKey, ServiceInstance,
};
pub use watch::{DispatcherStopper, ResourceEventHandler, WatchDispatcher, WatchEvent, dispatch};
