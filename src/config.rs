//! TOML configuration for the ragsync service.
//!
//! Only `[db]` is required; every other section falls back to the defaults
//! of the production deployment.
//!
//! ```toml
//! [db]
//! path = "./data/ragsync.sqlite"
//!
//! [partitions]
//! ttl_minutes = 30
//! memory_threshold_percent = 80.0
//!
//! [flush]
//! delay_seconds = 0.5
//! max_wait_seconds = 5.0
//!
//! [metadata]
//! vector_fields = ["content_type", "tags"]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ragsync_core::metadata::{MetadataAllowList, DEFAULT_VECTOR_FIELDS};
use ragsync_core::naming::{Naming, DEFAULT_COLLECTION_PREFIX};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub partitions: PartitionConfig,
    #[serde(default)]
    pub flush: FlushConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub naming: NamingConfig,
    #[serde(default)]
    pub service: ServiceConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PartitionConfig {
    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: u64,
    #[serde(default = "default_memory_threshold_percent")]
    pub memory_threshold_percent: f64,
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
    #[serde(default = "default_max_concurrent_loads")]
    pub max_concurrent_loads: usize,
    /// Lifetime of a tracking record in the key-value store. Refreshed on
    /// every access. Must outlive the idle TTL plus one cleanup interval,
    /// or a record can vanish before the TTL pass sees its partition.
    #[serde(default = "default_state_ttl_seconds")]
    pub state_ttl_seconds: u64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_true")]
    pub resync_on_start: bool,
    #[serde(default)]
    pub reload_on_start: bool,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: default_ttl_minutes(),
            memory_threshold_percent: default_memory_threshold_percent(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
            max_concurrent_loads: default_max_concurrent_loads(),
            state_ttl_seconds: default_state_ttl_seconds(),
            key_prefix: default_key_prefix(),
            resync_on_start: true,
            reload_on_start: false,
        }
    }
}

impl PartitionConfig {
    /// Record lifetime actually used, never shorter than the idle TTL plus
    /// two cleanup intervals.
    pub fn record_ttl(&self) -> Duration {
        let floor = self
            .idle_horizon_seconds()
            .saturating_add(self.cleanup_interval_seconds);
        Duration::from_secs(self.state_ttl_seconds.max(floor))
    }

    /// Idle TTL plus one cleanup interval, in seconds.
    fn idle_horizon_seconds(&self) -> u64 {
        self.ttl_minutes
            .saturating_mul(60)
            .saturating_add(self.cleanup_interval_seconds)
    }
}

fn default_ttl_minutes() -> u64 {
    30
}
fn default_memory_threshold_percent() -> f64 {
    80.0
}
fn default_cleanup_interval_seconds() -> u64 {
    300
}
fn default_max_concurrent_loads() -> usize {
    10
}
fn default_state_ttl_seconds() -> u64 {
    3600
}
fn default_key_prefix() -> String {
    "ragsync:partitions".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FlushConfig {
    #[serde(default = "default_flush_delay")]
    pub delay_seconds: f64,
    #[serde(default = "default_flush_max_wait")]
    pub max_wait_seconds: f64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            delay_seconds: default_flush_delay(),
            max_wait_seconds: default_flush_max_wait(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_flush_delay() -> f64 {
    0.5
}
fn default_flush_max_wait() -> f64 {
    5.0
}
fn default_poll_interval_ms() -> u64 {
    100
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_seconds: default_backoff_seconds(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_backoff_seconds() -> f64 {
    2.0
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// OpenAI-compatible embeddings URL. Defaults to the OpenAI API.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            endpoint: None,
            dims: default_dims(),
            max_batch_size: default_max_batch_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_dims() -> usize {
    1536
}
fn default_max_batch_size() -> usize {
    100
}
fn default_timeout_secs() -> u64 {
    30
}

pub const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_deref().unwrap_or(OPENAI_EMBEDDINGS_URL)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MetadataConfig {
    /// Metadata keys mirrored into vector rows.
    #[serde(default = "default_vector_fields")]
    pub vector_fields: Vec<String>,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            vector_fields: default_vector_fields(),
        }
    }
}

fn default_vector_fields() -> Vec<String> {
    DEFAULT_VECTOR_FIELDS.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NamingConfig {
    #[serde(default = "default_collection_prefix")]
    pub collection_prefix: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            collection_prefix: default_collection_prefix(),
        }
    }
}

fn default_collection_prefix() -> String {
    DEFAULT_COLLECTION_PREFIX.to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
    /// Upper bound on the post-commit phase of a single insert.
    #[serde(default)]
    pub request_timeout_seconds: Option<f64>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_seconds: default_shutdown_timeout(),
            request_timeout_seconds: None,
        }
    }
}

fn default_shutdown_timeout() -> u64 {
    10
}

impl Config {
    /// A config with every section at its default, backed by `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            partitions: PartitionConfig::default(),
            flush: FlushConfig::default(),
            retry: RetryConfig::default(),
            embedding: EmbeddingConfig::default(),
            metadata: MetadataConfig::default(),
            naming: NamingConfig::default(),
            service: ServiceConfig::default(),
        }
    }

    pub fn allow_list(&self) -> MetadataAllowList {
        MetadataAllowList::new(self.metadata.vector_fields.iter().cloned())
    }

    pub fn naming(&self) -> Naming {
        Naming::new(&self.naming.collection_prefix)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.service.shutdown_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.service
            .request_timeout_seconds
            .map(Duration::from_secs_f64)
    }
}

/// Read, parse, and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate config text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let p = &config.partitions;
    if p.ttl_minutes == 0 {
        anyhow::bail!("partitions.ttl_minutes must be > 0");
    }
    if !(p.memory_threshold_percent > 0.0 && p.memory_threshold_percent <= 100.0) {
        anyhow::bail!("partitions.memory_threshold_percent must be in (0, 100]");
    }
    if p.cleanup_interval_seconds == 0 {
        anyhow::bail!("partitions.cleanup_interval_seconds must be > 0");
    }
    if p.max_concurrent_loads == 0 {
        anyhow::bail!("partitions.max_concurrent_loads must be > 0");
    }
    if p.state_ttl_seconds <= p.idle_horizon_seconds() {
        anyhow::bail!(
            "partitions.state_ttl_seconds must be > ttl_minutes * 60 + cleanup_interval_seconds ({})",
            p.idle_horizon_seconds()
        );
    }

    let f = &config.flush;
    if !(f.delay_seconds >= 0.0 && f.delay_seconds.is_finite()) {
        anyhow::bail!("flush.delay_seconds must be >= 0");
    }
    if !(f.max_wait_seconds >= f.delay_seconds && f.max_wait_seconds.is_finite()) {
        anyhow::bail!("flush.max_wait_seconds must be >= flush.delay_seconds");
    }
    if f.poll_interval_ms == 0 {
        anyhow::bail!("flush.poll_interval_ms must be > 0");
    }

    if !(config.retry.backoff_seconds >= 0.0 && config.retry.backoff_seconds.is_finite()) {
        anyhow::bail!("retry.backoff_seconds must be >= 0");
    }

    let e = &config.embedding;
    if e.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if e.max_batch_size == 0 {
        anyhow::bail!("embedding.max_batch_size must be > 0");
    }
    match e.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if e.model.is_none() {
                anyhow::bail!("embedding.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if let Some(t) = config.service.request_timeout_seconds {
        if !(t > 0.0 && t.is_finite()) {
            anyhow::bail!("service.request_timeout_seconds must be > 0");
        }
    }

    Ok(())
}
