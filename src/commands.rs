//! CLI command handlers.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use bundlectl_reconciler::{
    BundleResource, Controller, ControllerConfig, InMemoryResourceStore, ResourceDocument,
    ResourceStore, ScriptedExecutor, TracingResourceStore, WatchDispatcher, fingerprint,
};

use crate::cli::{Cli, Commands};
use crate::manifest::{self, ManifestStep};

/// Execute a CLI command.
///
/// This is the main command dispatcher that routes to the appropriate handler.
pub async fn execute_command(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { manifest } => cmd_run(config, manifest).await,
        Commands::Hash { file } => cmd_hash(&config, &file),
        Commands::Config => cmd_config(&config),
    }
}

/// Load the config file if given, then apply environment overrides.
fn load_config(path: Option<&Path>) -> Result<ControllerConfig> {
    let config = match path {
        Some(path) => ControllerConfig::from_file(path)
            .with_context(|| format!("failed to load config '{}'", path.display()))?,
        None => ControllerConfig::default(),
    };
    config
        .with_env_overrides()
        .context("invalid environment override")
}

async fn cmd_run(config: ControllerConfig, manifest_path: PathBuf) -> Result<()> {
    let steps = manifest::load(&manifest_path)?;
    let namespace = config.namespace.clone();
    let api_version = config.resource.api_version();
    let kind = config.resource.kind.clone();

    let store = Arc::new(InMemoryResourceStore::with_namespace(namespace.clone()));
    let executor = Arc::new(ScriptedExecutor::default());
    let controller = Arc::new(
        Controller::builder()
            .with_config(config)
            .with_store(Arc::new(TracingResourceStore::new(store.clone())))
            .with_executor(executor.clone())
            .build()
            .context("failed to build controller")?,
    );

    let existing = store
        .list(Some(&namespace))
        .await
        .context("failed to list resources")?;
    info!(
        count = existing.len(),
        namespace = %namespace,
        resource = %format!("{api_version}/{kind}"),
        "Watching resources"
    );

    let mut dispatcher = WatchDispatcher::new(controller.clone(), store.subscribe());

    for (index, step) in steps.into_iter().enumerate() {
        let number = index.saturating_add(1);
        match step {
            ManifestStep::Apply(value) => {
                let doc = ResourceDocument::from_value(value)
                    .with_context(|| format!("step {number}: invalid document"))?;
                let watched = doc.api_version() == Some(api_version.as_str())
                    && doc.kind() == Some(kind.as_str());
                if !watched {
                    warn!(
                        step = number,
                        api_version = doc.api_version().unwrap_or_default(),
                        kind = doc.kind().unwrap_or_default(),
                        "Skipping document of an unwatched type"
                    );
                    continue;
                }
                store
                    .apply(doc)
                    .await
                    .with_context(|| format!("step {number}: apply failed"))?;
            }
            ManifestStep::Delete(target) => {
                let key = target.key(&namespace);
                store
                    .delete(&key)
                    .await
                    .with_context(|| format!("step {number}: delete of '{key}' failed"))?;
            }
        }
        let handled = dispatcher.drain().await;
        info!(step = number, handled, "Step reconciled");
    }

    let stats = controller.stats();
    info!(
        events = stats.events(),
        operations = stats.operations_started(),
        status_writes = controller.status_writes(),
        skipped_unchanged = stats.skipped_unchanged(),
        cancelled = stats.cancelled(),
        superseded = stats.superseded(),
        messages = executor.sent(),
        "Replay finished"
    );

    let documents: Vec<Value> = store
        .list(None)
        .await
        .context("failed to list resources")?
        .into_iter()
        .map(ResourceDocument::into_value)
        .collect();
    print!(
        "{}",
        serde_yaml::to_string(&documents).context("failed to render resources")?
    );
    Ok(())
}

fn cmd_hash(config: &ControllerConfig, file: &Path) -> Result<()> {
    let value = manifest::load_document(file)?;
    let doc = ResourceDocument::from_value(value)
        .with_context(|| format!("'{}' is not a resource document", file.display()))?;
    let resource = BundleResource::decode(&doc, &config.namespace)
        .with_context(|| format!("failed to decode '{}'", file.display()))?;
    let hash = fingerprint(&resource.spec).context("failed to fingerprint spec")?;

    println!("{hash}");
    Ok(())
}

fn cmd_config(config: &ControllerConfig) -> Result<()> {
    let rendered = config
        .to_toml_string()
        .context("failed to render configuration")?;
    print!("{rendered}");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_defaults_without_file() {
        let config = load_config(None).unwrap();
        assert_eq!(config.plan, ControllerConfig::default().plan);
    }

    #[test]
    fn test_load_config_reads_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"plan = \"prod\"\n[bundle]\nimage = \"docker.io/x/y\"\n")
            .unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.plan, "prod");
        assert_eq!(config.bundle.image, "docker.io/x/y");
    }

    #[test]
    fn test_load_config_missing_file_fails() {
        assert!(load_config(Some(Path::new("/nonexistent/bundlectl.toml"))).is_err());
    }

    #[test]
    fn test_hash_rejects_non_object_spec() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"metadata: {name: r1}\nspec: [1, 2]\n").unwrap();

        assert!(cmd_hash(&ControllerConfig::default(), file.path()).is_err());
    }

    #[tokio::test]
    async fn test_run_replays_manifest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            b"- apply:\n    apiVersion: automationbroker.io/v1\n    kind: Bundle\n    metadata: {name: r1}\n    spec: {replicas: 1}\n",
        )
        .unwrap();
        let mut config = ControllerConfig::default();
        config.bundle.image = "docker.io/x/y".to_string();

        cmd_run(config, file.path().to_path_buf()).await.unwrap();
    }
}
