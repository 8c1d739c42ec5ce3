//! Process-backed source preprocessor
//!
//! Runs `node <cli.js> -l <source>` once per source file and captures the
//! preprocessed text, `#line` directives included, from stdout.

use async_trait::async_trait;
use impcloud_core::settings::BuilderSettings;
use impcloud_core::{BuildOutput, Builder, CoreError, SettingsStore};
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

/// Longest a single preprocessor run may take
const PREPROCESS_TIMEOUT: Duration = Duration::from_secs(120);

pub struct NodeBuilder {
    store: SettingsStore,
    timeout: Duration,
}

impl NodeBuilder {
    pub fn new(store: SettingsStore) -> Self {
        Self {
            store,
            timeout: PREPROCESS_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn preprocess(&self, paths: &BuilderSettings, source: &Path) -> impcloud_core::Result<String> {
        let node = paths
            .node_path
            .as_deref()
            .ok_or(CoreError::MissingSetting("builder.node_path"))?;
        let cli = paths
            .cli_path
            .as_deref()
            .ok_or(CoreError::MissingSetting("builder.cli_path"))?;

        tracing::debug!("Preprocessing {}", source.display());
        let run = Command::new(node)
            .current_dir(self.store.root())
            .arg(cli)
            .arg("-l")
            .arg(source)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| CoreError::Timeout(self.timeout.as_millis() as u64))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CoreError::Build(format!(
                "preprocessor exited with {} for {}: {}",
                output.status,
                source.display(),
                stderr.trim()
            )));
        }

        String::from_utf8(output.stdout)
            .map_err(|e| CoreError::Build(format!("preprocessor output is not UTF-8: {e}")))
    }
}

#[async_trait]
impl Builder for NodeBuilder {
    async fn build(&self, agent_source: &Path, device_source: &Path) -> impcloud_core::Result<BuildOutput> {
        let paths = self.store.load()?.builder;
        Ok(BuildOutput {
            agent_code: self.preprocess(&paths, agent_source).await?,
            device_code: self.preprocess(&paths, device_source).await?,
        })
    }
}
