//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Seed API keys are loaded from the TAVILY_API_KEYS env var, never stored
//! in the TOML directly to avoid leaking secrets.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use dispatch::RetryConfig;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub retry: RetryTuning,
    /// Default search parameters merged into every search call for fields
    /// the caller leaves unset.
    #[serde(default)]
    pub search_defaults: Map<String, Value>,
    /// Seed keys from TAVILY_API_KEYS, imported into the store at startup.
    #[serde(skip)]
    pub seed_keys: Vec<Secret<String>>,
}

/// Service settings
#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    /// Key store location; created on first run.
    pub store_path: PathBuf,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: i64,
    #[serde(default = "default_log_flush_threshold")]
    pub log_flush_threshold: usize,
    #[serde(default = "default_log_flush_interval_secs")]
    pub log_flush_interval_secs: u64,
}

/// Provider endpoint settings
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Backoff tuning for the dispatch retry loop
#[derive(Debug, Deserialize)]
pub struct RetryTuning {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_concurrent() -> usize {
    10
}

fn default_log_retention_days() -> i64 {
    30
}

fn default_log_flush_threshold() -> usize {
    200
}

fn default_log_flush_interval_secs() -> u64 {
    5
}

fn default_base_url() -> String {
    dispatch::DEFAULT_BASE_URL.to_string()
}

fn default_timeout() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_exponential_base() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout(),
        }
    }
}

impl Default for RetryTuning {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            exponential_base: default_exponential_base(),
            jitter: default_jitter(),
        }
    }
}

impl RetryTuning {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            exponential_base: self.exponential_base,
            jitter: self.jitter,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment
    /// variables. Seed keys come from TAVILY_API_KEYS (comma-separated).
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if !config.upstream.base_url.starts_with("http://")
            && !config.upstream.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                config.upstream.base_url
            )));
        }

        if config.upstream.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.gateway.max_concurrent == 0 {
            return Err(common::Error::Config(
                "max_concurrent must be greater than 0".into(),
            ));
        }

        if config.retry.max_delay_ms < config.retry.base_delay_ms {
            return Err(common::Error::Config(
                "max_delay_ms must be at least base_delay_ms".into(),
            ));
        }

        if let Ok(raw) = std::env::var("TAVILY_API_KEYS") {
            config.seed_keys = raw
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(|k| Secret::new(k.to_string()))
                .collect();
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("tavily-gateway.toml")
    }
}
