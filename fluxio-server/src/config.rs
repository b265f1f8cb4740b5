use fluxio_core::{FluxError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bind_addr: String,
    pub registry: RegistryConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub intervals: IntervalConfig,
    /// Optional collaborator REST endpoint that receives registry
    /// snapshots alongside the local registry.
    #[serde(default)]
    pub mirror: Option<MirrorConfig>,
}

/// Registry backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub backend: RegistryBackend,
    #[serde(default)]
    pub namespace: Option<String>,
    pub redis: Option<RedisConfig>,
}

impl RegistryConfig {
    pub fn namespace_or_default(&self) -> &str {
        self.namespace
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or("fluxio")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    Memory,
    Redis,
}

impl RegistryBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryBackend::Memory => "memory",
            RegistryBackend::Redis => "redis",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold_bytes: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            flush_threshold_bytes: default_flush_threshold(),
        }
    }
}

fn default_chunk_size() -> usize {
    fluxio_core::DEFAULT_CHUNK_SIZE
}

fn default_flush_threshold() -> u64 {
    fluxio_core::FLUSH_THRESHOLD_BYTES
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/fluxio/pending.db")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalConfig {
    #[serde(default = "default_health_sweep_secs")]
    pub health_sweep_secs: u64,
    #[serde(default = "default_cache_sweep_secs")]
    pub cache_sweep_secs: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            health_sweep_secs: default_health_sweep_secs(),
            cache_sweep_secs: default_cache_sweep_secs(),
        }
    }
}

fn default_health_sweep_secs() -> u64 {
    fluxio_core::SWEEP_INTERVAL.as_secs()
}

fn default_cache_sweep_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    pub base_url: String,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("FLUXIO"))
            .build()
            .map_err(|e| FluxError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| FluxError::Config(e.to_string()))?;

        Ok(config)
    }
}
