//! Configuration for campus-recommender

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::RecommendError;

/// Default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("campus-recommender")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the SQLite database and config file
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Seconds between refresh ticks of the trigger-driven regenerator
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    #[serde(default)]
    pub scoring: ScoringConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

/// Baseline scorer weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Weight added when a shared feature key matches exactly
    #[serde(default = "default_key_weight")]
    pub key_weight: f64,

    /// Fraction of `key_weight` awarded for a set intersection
    #[serde(default = "default_partial_factor")]
    pub partial_factor: f64,

    /// Multiplier applied to decayed behavior weights
    #[serde(default = "default_affinity_scale")]
    pub affinity_scale: f64,

    /// Half-life of behavior signals in days
    #[serde(default = "default_half_life_days")]
    pub half_life_days: f64,
}

/// Generation run limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Candidates scoring at or below this are dropped
    #[serde(default = "default_min_relevance")]
    pub min_relevance: f64,

    /// Maximum ranked recommendations per subject
    #[serde(default = "default_max_recommendations")]
    pub max_recommendations: usize,

    /// Timeout for the candidate pool call in milliseconds
    #[serde(default = "default_candidate_timeout_ms")]
    pub candidate_timeout_ms: u64,

    /// Concurrent subjects in a batch regeneration
    #[serde(default = "default_max_parallel")]
    pub max_parallel_generations: usize,
}

/// Recommendation store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,

    /// Enable the in-process page cache
    #[serde(default = "default_true")]
    pub cache_enabled: bool,

    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

fn default_refresh_interval() -> u64 {
    30
}

fn default_key_weight() -> f64 {
    20.0
}

fn default_partial_factor() -> f64 {
    0.5
}

fn default_affinity_scale() -> f64 {
    10.0
}

fn default_half_life_days() -> f64 {
    14.0
}

fn default_min_relevance() -> f64 {
    5.0
}

fn default_max_recommendations() -> usize {
    50
}

fn default_candidate_timeout_ms() -> u64 {
    5000
}

fn default_max_parallel() -> usize {
    4
}

fn default_max_page_size() -> u32 {
    100
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl() -> u64 {
    300
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            key_weight: default_key_weight(),
            partial_factor: default_partial_factor(),
            affinity_scale: default_affinity_scale(),
            half_life_days: default_half_life_days(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            min_relevance: default_min_relevance(),
            max_recommendations: default_max_recommendations(),
            candidate_timeout_ms: default_candidate_timeout_ms(),
            max_parallel_generations: default_max_parallel(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_page_size: default_max_page_size(),
            cache_enabled: true,
            cache_ttl_secs: default_cache_ttl(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            refresh_interval_secs: default_refresh_interval(),
            scoring: ScoringConfig::default(),
            generation: GenerationConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RecommendError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| RecommendError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), RecommendError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| RecommendError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), RecommendError> {
        if !(self.scoring.half_life_days > 0.0) {
            return Err(RecommendError::Config(
                "scoring.half_life_days must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.scoring.partial_factor) {
            return Err(RecommendError::Config(
                "scoring.partial_factor must be between 0.0 and 1.0".into(),
            ));
        }
        if self.generation.max_recommendations == 0 {
            return Err(RecommendError::Config(
                "generation.max_recommendations must be at least 1".into(),
            ));
        }
        if self.generation.max_parallel_generations == 0 {
            return Err(RecommendError::Config(
                "generation.max_parallel_generations must be at least 1".into(),
            ));
        }
        if self.store.max_page_size == 0 {
            return Err(RecommendError::Config("store.max_page_size must be at least 1".into()));
        }
        Ok(())
    }

    /// Get database path
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("recommendations.db")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}
