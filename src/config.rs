//! TOML configuration.
//!
//! Every section is optional; an empty file yields [`Config::minimal`].
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8000"
//!
//! [transfer]
//! fragment_size = 2000
//! session_max_age_secs = 300
//!
//! [channel]
//! url = "ws://127.0.0.1:8000/ws/import"
//! max_retries = 8
//!
//! [pipeline]
//! splitter = "token"
//! embed_batch_size = 32
//!
//! [sqlite]
//! path = "./data/relay.sqlite"
//! ```

use anyhow::{Context, Result};
use ingest_relay_core::models::{PipelineConfig, StageSelection};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channel::{BackoffPolicy, ChannelOptions};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub pipeline: PipelineDefaults,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub sqlite: SqliteConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransferConfig {
    /// Upper bound on the `chunk` bytes carried by one wire fragment.
    #[serde(default = "default_fragment_size")]
    pub fragment_size: usize,
    /// Transfers still incomplete this long after their first fragment are
    /// discarded.
    #[serde(default = "default_session_max_age_secs")]
    pub session_max_age_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            fragment_size: default_fragment_size(),
            session_max_age_secs: default_session_max_age_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl TransferConfig {
    pub fn session_max_age(&self) -> Duration {
        Duration::from_secs(self.session_max_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_fragment_size() -> usize {
    2000
}
fn default_session_max_age_secs() -> u64 {
    300
}
fn default_sweep_interval_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChannelConfig {
    /// Server endpoint the uploader connects to.
    #[serde(default = "default_channel_url")]
    pub url: String,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    #[serde(default = "default_channel_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: default_channel_url(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
            max_retries: default_channel_max_retries(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl ChannelConfig {
    pub fn options(&self) -> ChannelOptions {
        ChannelOptions {
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(self.base_delay_ms),
                max_delay: Duration::from_millis(self.max_delay_ms),
                jitter_max: Duration::from_millis(self.jitter_ms),
                max_retries: self.max_retries,
            },
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            queue_capacity: self.queue_capacity,
        }
    }
}

fn default_channel_url() -> String {
    "ws://127.0.0.1:8000/ws/import".to_string()
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_jitter_ms() -> u64 {
    250
}
fn default_channel_max_retries() -> u32 {
    8
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_heartbeat_timeout_secs() -> u64 {
    10
}
fn default_queue_capacity() -> usize {
    1024
}

/// Server-side stage choices applied to files that do not pick their own.
#[derive(Debug, Deserialize, Clone)]
pub struct PipelineDefaults {
    #[serde(default = "default_loader")]
    pub loader: String,
    #[serde(default = "default_splitter")]
    pub splitter: String,
    #[serde(default = "default_vectorizer")]
    pub vectorizer: String,
    #[serde(default = "default_sink")]
    pub sink: String,
    /// Chunks per `Vectorizer::embed` call.
    #[serde(default = "default_embed_batch_size")]
    pub embed_batch_size: usize,
}

impl Default for PipelineDefaults {
    fn default() -> Self {
        Self {
            loader: default_loader(),
            splitter: default_splitter(),
            vectorizer: default_vectorizer(),
            sink: default_sink(),
            embed_batch_size: default_embed_batch_size(),
        }
    }
}

impl PipelineDefaults {
    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            loader: Some(StageSelection::new(&self.loader)),
            splitter: Some(StageSelection::new(&self.splitter)),
            vectorizer: Some(StageSelection::new(&self.vectorizer)),
            sink: Some(StageSelection::new(&self.sink)),
        }
    }
}

fn default_loader() -> String {
    "basic".to_string()
}
fn default_splitter() -> String {
    "paragraph".to_string()
}
fn default_vectorizer() -> String {
    "hashing".to_string()
}
fn default_sink() -> String {
    "memory".to_string()
}
fn default_embed_batch_size() -> usize {
    64
}

/// Settings for the `openai` vectorizer stage.
#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_embedding_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: default_embedding_endpoint(),
            model: None,
            api_key_env: default_api_key_env(),
            max_retries: default_embedding_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_endpoint() -> String {
    "https://api.openai.com/v1/embeddings".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_embedding_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

/// The `sqlite` sink is registered only when `path` is set.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SqliteConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Config {
    /// Defaults for every section. Used by client-only commands when no
    /// config file is present.
    pub fn minimal() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.transfer.fragment_size == 0 {
            anyhow::bail!("transfer.fragment_size must be > 0");
        }
        if self.transfer.session_max_age_secs == 0 {
            anyhow::bail!("transfer.session_max_age_secs must be > 0");
        }
        if self.transfer.sweep_interval_secs == 0 {
            anyhow::bail!("transfer.sweep_interval_secs must be > 0");
        }

        let ch = &self.channel;
        if ch.base_delay_ms == 0 {
            anyhow::bail!("channel.base_delay_ms must be > 0");
        }
        if ch.base_delay_ms > ch.max_delay_ms {
            anyhow::bail!(
                "channel.base_delay_ms ({}) must not exceed channel.max_delay_ms ({})",
                ch.base_delay_ms,
                ch.max_delay_ms
            );
        }
        if ch.heartbeat_interval_secs == 0 || ch.heartbeat_timeout_secs == 0 {
            anyhow::bail!("channel heartbeat interval and timeout must be > 0");
        }
        if ch.queue_capacity == 0 {
            anyhow::bail!("channel.queue_capacity must be > 0");
        }

        if self.pipeline.embed_batch_size == 0 {
            anyhow::bail!("pipeline.embed_batch_size must be > 0");
        }
        if self.pipeline.sink == "sqlite" && self.sqlite.path.is_none() {
            anyhow::bail!("pipeline.sink is 'sqlite' but [sqlite].path is not set");
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_minimal() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.transfer.fragment_size, 2000);
        assert_eq!(cfg.pipeline.splitter, "paragraph");
        assert_eq!(cfg.channel.max_retries, 8);
        assert!(cfg.sqlite.path.is_none());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_partial_sections() {
        let cfg: Config = toml::from_str(
            r#"
[transfer]
fragment_size = 512

[pipeline]
splitter = "token"
embed_batch_size = 8
"#,
        )
        .unwrap();
        assert_eq!(cfg.transfer.fragment_size, 512);
        assert_eq!(cfg.transfer.session_max_age_secs, 300);
        let defaults = cfg.pipeline.to_pipeline_config();
        assert_eq!(defaults.splitter.unwrap().name, "token");
        assert_eq!(defaults.loader.unwrap().name, "basic");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut cfg = Config::minimal();
        cfg.channel.base_delay_ms = 60_000;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::minimal();
        cfg.transfer.fragment_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::minimal();
        cfg.pipeline.sink = "sqlite".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_channel_options() {
        let opts = Config::minimal().channel.options();
        assert_eq!(opts.backoff.base_delay, Duration::from_millis(500));
        assert_eq!(opts.backoff.max_retries, 8);
        assert_eq!(opts.queue_capacity, 1024);
        assert_eq!(opts.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(
            opts.heartbeat_interval,
            crate::channel::ChannelOptions::default().heartbeat_interval
        );
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "[server]\nbind = \"0.0.0.0:9000\"\n").unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.server.bind, "0.0.0.0:9000");
        assert!(load_config(&dir.path().join("missing.toml")).is_err());
    }
}
