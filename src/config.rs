use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Namespace for checkpoints and sync leases.
    #[serde(default = "default_dataset")]
    pub dataset: String,
    #[serde(default = "default_sync_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: usize,
    #[serde(default)]
    pub detect_deletions: bool,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            dataset: default_dataset(),
            batch_size: default_sync_batch_size(),
            max_consecutive_failures: default_max_consecutive_failures(),
            detect_deletions: false,
            workers: default_workers(),
            lock_ttl_secs: default_lock_ttl_secs(),
        }
    }
}

fn default_dataset() -> String {
    "default".to_string()
}
fn default_sync_batch_size() -> usize {
    100
}
fn default_max_consecutive_failures() -> usize {
    5
}
fn default_workers() -> usize {
    4
}
fn default_lock_ttl_secs() -> u64 {
    3600
}

/// Longest accepted sync lease TTL (30 days).
pub const MAX_LOCK_TTL_SECS: u64 = 30 * 24 * 3600;

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// Configured source instances, keyed by instance name per source type.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourcesConfig {
    #[serde(default)]
    pub filesystem: BTreeMap<String, FilesystemSourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemSourceConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Tags attached to every record from this source.
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate sync
    if config.sync.batch_size == 0 {
        anyhow::bail!("sync.batch_size must be > 0");
    }
    if config.sync.workers == 0 {
        anyhow::bail!("sync.workers must be > 0");
    }
    if config.sync.max_consecutive_failures == 0 {
        anyhow::bail!("sync.max_consecutive_failures must be > 0");
    }
    if config.sync.dataset.trim().is_empty() {
        anyhow::bail!("sync.dataset must not be empty");
    }
    if config.sync.lock_ttl_secs == 0 || config.sync.lock_ttl_secs > MAX_LOCK_TTL_SECS {
        anyhow::bail!(
            "sync.lock_ttl_secs must be between 1 and {}",
            MAX_LOCK_TTL_SECS
        );
    }

    // Validate embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(())
}
