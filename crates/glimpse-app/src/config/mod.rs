//! Configuration loading.
//!
//! Layers, lowest precedence first: built-in defaults, `config/settings.*`
//! relative to the working directory, the file named by `GLIMPSE_CONFIG_FILE`,
//! then `GLIMPSE__SECTION__KEY` environment variables.

use config::{Config, Environment, File};
use glimpse_server::ServerConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::constants::{
    DEFAULT_CALL_TIMEOUT_MS, DEFAULT_MATCH_FUNCTION, DEFAULT_SIGN_TTL_SECS,
    DEFAULT_STORAGE_BUCKET, EMBEDDING_DIM,
};

const CONFIG_FILE: &str = "config/settings";
const CONFIG_FILE_ENV: &str = "GLIMPSE_CONFIG_FILE";
const ENV_PREFIX: &str = "GLIMPSE";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error(transparent)]
    Build(#[from] config::ConfigError),
    #[error("embedding.dim must be {expected}, got {actual}")]
    EmbeddingDim { expected: usize, actual: usize },
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub embedding: EmbeddingConfig,
    pub backend: BackendConfig,
    pub cache: CacheConfig,
    pub analytics: AnalyticsConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    pub endpoint: String,
    #[serde(default)]
    pub token: String,
    pub dim: usize,
}

/// Managed store exposing the KNN function, object storage and tables.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    pub url: String,
    #[serde(default)]
    pub service_key: String,
    pub match_function: String,
    pub storage_bucket: String,
    pub sign_ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Rest,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    pub backend: StoreBackend,
    pub max_capacity: u64,
    pub ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalyticsConfig {
    pub backend: StoreBackend,
    pub memory_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    pub call_timeout_ms: u64,
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    let mut builder = Config::builder()
        .set_default("server.listen_addr", "127.0.0.1:8080")?
        .set_default("embedding.endpoint", "")?
        .set_default("embedding.dim", EMBEDDING_DIM as u64)?
        .set_default("backend.url", "")?
        .set_default("backend.match_function", DEFAULT_MATCH_FUNCTION)?
        .set_default("backend.storage_bucket", DEFAULT_STORAGE_BUCKET)?
        .set_default("backend.sign_ttl_secs", DEFAULT_SIGN_TTL_SECS)?
        .set_default("cache.backend", "memory")?
        .set_default("cache.max_capacity", 10_000_u64)?
        .set_default("cache.ttl_secs", 86_400_u64)?
        .set_default("analytics.backend", "memory")?
        .set_default("analytics.memory_capacity", 1_000_u64)?
        .set_default("pipeline.call_timeout_ms", DEFAULT_CALL_TIMEOUT_MS)?
        .add_source(File::with_name(CONFIG_FILE).required(false));

    if let Ok(path) = std::env::var(CONFIG_FILE_ENV)
        && !path.trim().is_empty()
    {
        builder = builder.add_source(File::with_name(path.trim()).required(false));
    }

    let cfg: AppConfig = builder
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        )
        .build()?
        .try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}

impl AppConfig {
    fn validate(&self) -> Result<(), AppConfigError> {
        if self.embedding.dim != EMBEDDING_DIM {
            return Err(AppConfigError::EmbeddingDim {
                expected: EMBEDDING_DIM,
                actual: self.embedding.dim,
            });
        }
        Ok(())
    }
}
