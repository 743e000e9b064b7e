use crate::comparison::binning::{MAX_BINS, MIN_BINS};
use crate::comparison::sampling::{
    SamplingThresholds, ADAPTIVE_FINAL_THRESHOLD, PREFLIGHT_SAMPLE_PERCENT, TARGET_SAMPLE_SIZE,
};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    5340
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            pool_size: default_pool_size(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("scorecmp.db")
}
fn default_pool_size() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

fn default_max_batch_size() -> usize {
    500
}
fn default_max_payload_bytes() -> usize {
    1_048_576
}

/// What explicit-range requests without any timestamps resolve to.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmptyRangePolicy {
    /// Use the last `default_range_days` with one-week buckets.
    DefaultWindow,
    /// Reject the request with an invalid filter error.
    Reject,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalyticsConfig {
    #[serde(default = "default_adaptive_final_threshold")]
    pub adaptive_final_threshold: u64,
    #[serde(default = "default_target_sample_size")]
    pub target_sample_size: u64,
    #[serde(default = "default_preflight_sample_percent")]
    pub preflight_sample_percent: u64,
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
    #[serde(default = "default_preflight_timeout")]
    pub preflight_timeout_secs: u64,
    #[serde(default = "default_n_bins")]
    pub default_n_bins: u32,
    #[serde(default = "default_empty_range_policy")]
    pub empty_range_policy: EmptyRangePolicy,
    #[serde(default = "default_range_days")]
    pub default_range_days: i64,
    /// Upper bound on matched pairs loaded per request, applied on top of
    /// any caller-supplied limit.
    #[serde(default = "default_max_matched_pairs")]
    pub max_matched_pairs: u64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            adaptive_final_threshold: default_adaptive_final_threshold(),
            target_sample_size: default_target_sample_size(),
            preflight_sample_percent: default_preflight_sample_percent(),
            query_timeout_secs: default_query_timeout(),
            preflight_timeout_secs: default_preflight_timeout(),
            default_n_bins: default_n_bins(),
            empty_range_policy: default_empty_range_policy(),
            default_range_days: default_range_days(),
            max_matched_pairs: default_max_matched_pairs(),
        }
    }
}

impl AnalyticsConfig {
    pub fn sampling_thresholds(&self) -> SamplingThresholds {
        SamplingThresholds {
            adaptive_final_threshold: self.adaptive_final_threshold,
            target_sample_size: self.target_sample_size,
            preflight_sample_percent: self.preflight_sample_percent,
        }
    }
}

fn default_adaptive_final_threshold() -> u64 {
    ADAPTIVE_FINAL_THRESHOLD
}
fn default_target_sample_size() -> u64 {
    TARGET_SAMPLE_SIZE
}
fn default_preflight_sample_percent() -> u64 {
    PREFLIGHT_SAMPLE_PERCENT
}
fn default_query_timeout() -> u64 {
    30
}
fn default_preflight_timeout() -> u64 {
    5
}
fn default_n_bins() -> u32 {
    10
}
fn default_empty_range_policy() -> EmptyRangePolicy {
    EmptyRangePolicy::DefaultWindow
}
fn default_range_days() -> i64 {
    365
}
fn default_max_matched_pairs() -> u64 {
    250_000
}

impl AppConfig {
    /// Validate configuration ranges.
    pub fn validate(&self) -> Result<(), String> {
        let a = &self.analytics;
        if a.target_sample_size == 0 {
            return Err("analytics.target_sample_size must be greater than 0".to_string());
        }
        if !(1..=100).contains(&a.preflight_sample_percent) {
            return Err("analytics.preflight_sample_percent must be between 1 and 100".to_string());
        }
        if a.query_timeout_secs == 0 || a.preflight_timeout_secs == 0 {
            return Err("analytics query timeouts must be at least 1 second".to_string());
        }
        if !(MIN_BINS..=MAX_BINS).contains(&a.default_n_bins) {
            return Err(format!(
                "analytics.default_n_bins must be between {MIN_BINS} and {MAX_BINS}"
            ));
        }
        if a.default_range_days <= 0 {
            return Err("analytics.default_range_days must be positive".to_string());
        }
        if a.max_matched_pairs == 0 {
            return Err("analytics.max_matched_pairs must be greater than 0".to_string());
        }
        if self.ingest.max_batch_size == 0 {
            return Err("ingest.max_batch_size must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn load(config_path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder();

        let path = config_path.unwrap_or("config.toml");
        builder = builder.add_source(File::with_name(path).required(false));

        // Overlay with environment variables (SCORECMP__SERVER__PORT=3001, etc.)
        builder = builder.add_source(
            Environment::with_prefix("SCORECMP")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
