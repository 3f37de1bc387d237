//! TOML configuration with environment overrides.
//!
//! Configuration, CLI entry points, and logging are ambient concerns kept
//! out of the core transit pipelines (spec §1); this crate owns the
//! "recognised configuration" list from spec §6 plus the supplementary
//! fields the binary needs (dispatch timeout, worker temp-dir prefix). It
//! uses `anyhow` rather than `cmdproxy-error` deliberately — config failures
//! are operator mistakes, not protocol error kinds.

#![warn(missing_docs)]

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Blob-store connection settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BlobStoreConfig {
    /// Network endpoint of the underlying content store.
    #[serde(default)]
    pub endpoint: String,
    /// Logical database/bucket name within that store.
    #[serde(default)]
    pub database: String,
}

/// Worker-only settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct WorkerConfig {
    /// The default worker queue set, beyond the command-palette-derived
    /// per-command queues.
    #[serde(default)]
    pub queues: Vec<String>,
    /// Prefix for worker-side temp directories, before the per-request
    /// hostname hint (spec §4.5).
    #[serde(default = "default_temp_dir_prefix")]
    pub temp_dir_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { queues: Vec::new(), temp_dir_prefix: default_temp_dir_prefix() }
    }
}

fn default_temp_dir_prefix() -> String {
    "cmdproxy".to_string()
}

fn default_dispatch_timeout_secs() -> u64 {
    30
}

/// Top-level configuration recognised by the cmdproxy binaries.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Config {
    /// Message broker URL.
    pub broker_url: String,
    /// Backend URL used for broker response storage.
    pub backend_url: String,
    /// Blob-store connection settings.
    #[serde(default)]
    pub blobstore: BlobStoreConfig,
    /// Server-side command palette: logical name to executable path.
    #[serde(default)]
    pub command_palette: BTreeMap<String, String>,
    /// Worker-only settings.
    #[serde(default)]
    pub worker: WorkerConfig,
    /// How long the dispatcher waits for a broker response before treating
    /// it as a `DispatchFailure`.
    #[serde(default = "default_dispatch_timeout_secs")]
    pub dispatch_timeout_secs: u64,
}

impl Config {
    /// `dispatch_timeout_secs` as a [`Duration`].
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }
}

/// Parse a TOML document into a [`Config`].
pub fn parse_toml(input: &str) -> Result<Config> {
    toml::from_str(input).context("parsing configuration TOML")
}

/// Overlay `CMDPROXY_*` environment variables onto an already-parsed config.
/// Unset variables leave the corresponding field untouched.
pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(v) = std::env::var("CMDPROXY_BROKER_URL") {
        config.broker_url = v;
    }
    if let Ok(v) = std::env::var("CMDPROXY_BACKEND_URL") {
        config.backend_url = v;
    }
    if let Ok(v) = std::env::var("CMDPROXY_BLOBSTORE_ENDPOINT") {
        config.blobstore.endpoint = v;
    }
    if let Ok(v) = std::env::var("CMDPROXY_BLOBSTORE_DATABASE") {
        config.blobstore.database = v;
    }
    if let Ok(v) = std::env::var("CMDPROXY_WORKER_TEMP_DIR_PREFIX") {
        config.worker.temp_dir_prefix = v;
    }
    if let Ok(v) = std::env::var("CMDPROXY_DISPATCH_TIMEOUT_SECS") {
        if let Ok(secs) = v.parse() {
            config.dispatch_timeout_secs = secs;
        } else {
            debug!(value = %v, "ignoring unparsable CMDPROXY_DISPATCH_TIMEOUT_SECS");
        }
    }
}

/// Reject configurations missing the fields the core actually needs.
pub fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(!config.broker_url.is_empty(), "broker_url must not be empty");
    anyhow::ensure!(!config.backend_url.is_empty(), "backend_url must not be empty");
    anyhow::ensure!(!config.blobstore.endpoint.is_empty(), "blobstore.endpoint must not be empty");
    anyhow::ensure!(config.dispatch_timeout_secs > 0, "dispatch_timeout_secs must be positive");
    Ok(())
}

/// Load, override, and validate configuration from a TOML file on disk.
pub async fn load_config(path: &Path) -> Result<Config> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading configuration file {}", path.display()))?;
    let mut config = parse_toml(&raw)?;
    apply_env_overrides(&mut config);
    validate_config(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        broker_url = "amqp://localhost"
        backend_url = "redis://localhost"

        [blobstore]
        endpoint = "http://localhost:9000"
        database = "cmdproxy"

        [command_palette]
        sh = "/bin/sh"

        [worker]
        queues = ["default"]
    "#;

    #[test]
    fn parses_sample_config() {
        let config = parse_toml(SAMPLE).unwrap();
        assert_eq!(config.broker_url, "amqp://localhost");
        assert_eq!(config.command_palette.get("sh").unwrap(), "/bin/sh");
        assert_eq!(config.dispatch_timeout_secs, 30);
        assert_eq!(config.worker.temp_dir_prefix, "cmdproxy");
    }

    #[test]
    fn env_overrides_take_precedence() {
        let mut config = parse_toml(SAMPLE).unwrap();
        std::env::set_var("CMDPROXY_BROKER_URL", "amqp://overridden");
        std::env::set_var("CMDPROXY_DISPATCH_TIMEOUT_SECS", "5");
        apply_env_overrides(&mut config);
        std::env::remove_var("CMDPROXY_BROKER_URL");
        std::env::remove_var("CMDPROXY_DISPATCH_TIMEOUT_SECS");
        assert_eq!(config.broker_url, "amqp://overridden");
        assert_eq!(config.dispatch_timeout_secs, 5);
    }

    #[test]
    fn validate_rejects_empty_broker_url() {
        let mut config = parse_toml(SAMPLE).unwrap();
        config.broker_url.clear();
        assert!(validate_config(&config).is_err());
    }

    #[tokio::test]
    async fn load_config_reads_file_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmdproxy.toml");
        tokio::fs::write(&path, SAMPLE).await.unwrap();
        let config = load_config(&path).await.unwrap();
        assert_eq!(config.backend_url, "redis://localhost");
    }
}
