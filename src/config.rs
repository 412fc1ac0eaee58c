//! Resolver configuration.
//!
//! Loaded once at startup (YAML file, then `CAPLINK_*` environment
//! overrides) and handed to the resolver, which keeps an immutable copy.
//!
//! ```yaml
//! cache:
//!   max_size: 1000
//!   capability_ttl_ms: 300000
//! selection:
//!   default_algorithm: round_robin
//! scoring:
//!   weights: { performance: 0.4, compatibility: 0.3, stability: 0.2, load: 0.1 }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capabilities::SelectionAlgorithm;
use crate::errors::ConfigError;

/// Top-level resolver configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub cache: CacheConfig,
    pub selection: SelectionConfig,
    pub scoring: ScoringConfig,
    pub cycles: CycleConfig,
    pub store: StoreConfig,
    pub gap: GapConfig,
    pub file_paths: FilePathConfig,
    pub monitoring: MonitoringConfig,
    pub targets: PerformanceTargets,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_size: usize,
    pub capability_ttl_ms: u64,
    /// File locations change rarely, so they live longer.
    pub file_path_ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            capability_ttl_ms: 300_000,
            file_path_ttl_ms: 600_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub default_algorithm: SelectionAlgorithm,
    pub load_balancing: bool,
    /// Candidates within this fraction of the best score share the pick.
    pub near_best_tolerance: f64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            default_algorithm: SelectionAlgorithm::WeightedPerformance,
            load_balancing: true,
            near_best_tolerance: 0.05,
        }
    }
}

/// Composite score weights. Must be non-negative and sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub performance: f64,
    pub compatibility: f64,
    pub stability: f64,
    pub load: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            performance: 0.4,
            compatibility: 0.3,
            stability: 0.2,
            load: 0.1,
        }
    }
}

impl ScoreWeights {
    pub fn sum(&self) -> f64 {
        self.performance + self.compatibility + self.stability + self.load
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: ScoreWeights,
    pub stats_window_days: i64,
    /// Uptime below this floors the stability score toward 0.
    pub min_uptime: f64,
    /// Width of the band below `min_uptime` over which stability reaches 0.
    pub uptime_falloff: f64,
    pub target_response_ms: f64,
    pub target_throughput_per_min: f64,
    pub default_capacity: u32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            stats_window_days: 7,
            min_uptime: 0.95,
            uptime_falloff: 0.10,
            target_response_ms: 1000.0,
            target_throughput_per_min: 60.0,
            default_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    pub max_depth: usize,
    pub lazy_initialization: bool,
    pub interface_injection: bool,
    pub provider_reorganization: bool,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            lazy_initialization: true,
            interface_injection: true,
            provider_reorganization: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Latency a store call is expected to stay under; slower calls are logged.
    pub target_latency_ms: u64,
    /// Hard cap after which a store call counts as timed out.
    pub timeout_ms: u64,
    pub retry_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            target_latency_ms: 50,
            timeout_ms: 2000,
            retry_backoff_ms: 25,
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GapConfig {
    /// Delay before a known-but-providerless capability is re-checked.
    pub recovery_retry_ms: u64,
    pub auto_generation: bool,
    /// Capability name patterns forwarded to the generation queue.
    pub generation_patterns: Vec<String>,
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            recovery_retry_ms: 30_000,
            auto_generation: true,
            generation_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilePathConfig {
    /// Directories searched when constructing candidate paths.
    pub roots: Vec<PathBuf>,
    /// Extensions tried for each candidate, in order (`""` means as-is).
    pub extensions: Vec<String>,
}

impl Default for FilePathConfig {
    fn default() -> Self {
        Self {
            roots: vec![PathBuf::from(".")],
            extensions: vec![
                String::new(),
                ".yaml".to_string(),
                ".yml".to_string(),
                ".json".to_string(),
                ".md".to_string(),
            ],
        }
    }
}

/// Verbosity of binding monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitoringLevel {
    Basic,
    #[default]
    Standard,
    Detailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enabled: bool,
    pub level: MonitoringLevel,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: MonitoringLevel::Standard,
        }
    }
}

/// Service-level targets the metrics snapshot is checked against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceTargets {
    pub max_resolution_ms: f64,
    pub min_cache_hit_rate: f64,
    pub max_failure_rate: f64,
}

impl Default for PerformanceTargets {
    fn default() -> Self {
        Self {
            max_resolution_ms: 50.0,
            min_cache_hit_rate: 0.8,
            max_failure_rate: 0.01,
        }
    }
}

impl ResolverConfig {
    /// Parse a YAML document; missing fields keep their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: ResolverConfig =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_yaml_str(&content)
    }

    /// Apply `CAPLINK_*` environment variables on top of the current values.
    pub fn apply_env_overrides(mut self) -> Result<Self, ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(self)
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CAPLINK_CACHE_MAX_SIZE") {
            self.cache.max_size = parse_env("CAPLINK_CACHE_MAX_SIZE", &v)?;
        }
        if let Some(v) = lookup("CAPLINK_CACHE_TTL_MS") {
            self.cache.capability_ttl_ms = parse_env("CAPLINK_CACHE_TTL_MS", &v)?;
        }
        if let Some(v) = lookup("CAPLINK_FILE_PATH_TTL_MS") {
            self.cache.file_path_ttl_ms = parse_env("CAPLINK_FILE_PATH_TTL_MS", &v)?;
        }
        if let Some(v) = lookup("CAPLINK_ALGORITHM") {
            self.selection.default_algorithm =
                serde_yaml::from_str(&v).map_err(|_| ConfigError::Invalid {
                    field: "CAPLINK_ALGORITHM".to_string(),
                    message: format!("unknown selection algorithm '{}'", v),
                })?;
        }
        if let Some(v) = lookup("CAPLINK_LOAD_BALANCING") {
            self.selection.load_balancing = parse_env("CAPLINK_LOAD_BALANCING", &v)?;
        }
        if let Some(v) = lookup("CAPLINK_STORE_TIMEOUT_MS") {
            self.store.timeout_ms = parse_env("CAPLINK_STORE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("CAPLINK_MAX_DEPTH") {
            self.cycles.max_depth = parse_env("CAPLINK_MAX_DEPTH", &v)?;
        }
        self.validate()
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.scoring.weights;
        for (field, value) in [
            ("scoring.weights.performance", w.performance),
            ("scoring.weights.compatibility", w.compatibility),
            ("scoring.weights.stability", w.stability),
            ("scoring.weights.load", w.load),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(field, format!("{} outside [0,1]", value)));
            }
        }
        if (w.sum() - 1.0).abs() > 1e-6 {
            return Err(invalid(
                "scoring.weights",
                format!("weights sum to {}, expected 1.0", w.sum()),
            ));
        }
        if self.cache.max_size == 0 {
            return Err(invalid("cache.max_size", "must be positive".to_string()));
        }
        if self.store.timeout_ms == 0 {
            return Err(invalid("store.timeout_ms", "must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.selection.near_best_tolerance) {
            return Err(invalid(
                "selection.near_best_tolerance",
                "must be within [0,1]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.scoring.min_uptime) || self.scoring.uptime_falloff <= 0.0 {
            return Err(invalid(
                "scoring.min_uptime",
                "min_uptime must be within [0,1] and uptime_falloff positive".to_string(),
            ));
        }
        if self.scoring.target_response_ms <= 0.0 || self.scoring.target_throughput_per_min <= 0.0
        {
            return Err(invalid("scoring", "targets must be positive".to_string()));
        }
        Ok(())
    }
}

fn invalid(field: &str, message: String) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        message,
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        field: key.to_string(),
        message: format!("cannot parse '{}'", value),
    })
}
