//! Engine configuration.
//!
//! Every tunable of the ensemble lives here so that one [`Engine`] instance
//! owns its own weights, thresholds and cache sizing. Presets cover the
//! usual deployment tiers; [`EngineConfig::from_env`] overlays `HALO_*`
//! environment variables on top of the defaults.
//!
//! [`Engine`]: crate::engine::Engine

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// How the sampler picks one explanation out of K samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplanationSelection {
    /// Most frequently repeated explanation, ties broken by first occurrence
    MostFrequent,
    /// Most frequent, falling back to the longest when no explanation repeats
    PreferLongest,
}

/// Self-consistency sampling for stochastic judges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Number of samples K per stochastic judge (1 disables sampling)
    pub samples: usize,
    /// Sampling temperature passed to stochastic backends
    pub temperature: f64,
    /// Explanation folding strategy
    pub explanation: ExplanationSelection,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            samples: 5,
            temperature: 0.7,
            explanation: ExplanationSelection::MostFrequent,
        }
    }
}

/// Alternate weighting used when the primary LLM judge is confident and no
/// auxiliary judges are deployed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidentPrimaryConfig {
    /// Minimum primary confidence that triggers the mode
    pub threshold: f64,
    /// Weight given to the primary judge in this mode
    pub primary_weight: f64,
}

impl Default for ConfidentPrimaryConfig {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            primary_weight: 0.85,
        }
    }
}

/// Aggregation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Confident-primary weighting; `None` disables the mode
    pub confident_primary: Option<ConfidentPrimaryConfig>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            confident_primary: Some(ConfidentPrimaryConfig::default()),
        }
    }
}

/// Bootstrap uncertainty settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UncertaintyConfig {
    /// Number of bootstrap draws B
    pub bootstrap_samples: usize,
    /// Two-sided interval level, e.g. 0.95
    pub confidence_level: f64,
    /// Lower bound on the reported uncertainty score
    pub uncertainty_floor: f64,
    /// Fixed RNG seed for reproducible intervals
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for UncertaintyConfig {
    fn default() -> Self {
        Self {
            bootstrap_samples: 1000,
            confidence_level: 0.95,
            uncertainty_floor: 0.05,
            seed: None,
        }
    }
}

/// Decision policy thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Uncertainty strictly above this escalates to human review
    pub uncertainty_threshold: f64,
    /// Risk strictly above this rejects the output
    pub reject_risk: f64,
    /// Risk strictly above this flags the output
    pub flag_risk: f64,
    /// Consensus strictly below this escalates to human review
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_agreement: Option<f64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            uncertainty_threshold: 0.3,
            reject_risk: 0.7,
            flag_risk: 0.3,
            min_agreement: None,
        }
    }
}

/// Router heuristics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Outputs with at least this many words count as long
    pub long_input_words: usize,
    /// Extra technical keywords on top of the built-in set
    #[serde(default)]
    pub technical_keywords: Vec<String>,
    /// Extra hedge/causal keywords on top of the built-in set
    #[serde(default)]
    pub reasoning_keywords: Vec<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            long_input_words: 150,
            technical_keywords: Vec::new(),
            reasoning_keywords: Vec::new(),
        }
    }
}

/// Result cache sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Maximum number of entries before FIFO eviction
    pub capacity: usize,
    /// Optional time-to-live in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 1000,
            ttl_secs: None,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-judge timeout in milliseconds
    pub judge_timeout_ms: u64,
    /// Overall request budget in milliseconds
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub uncertainty: UncertaintyConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            judge_timeout_ms: 10_000,
            request_timeout_ms: 15_000,
            sampling: SamplingConfig::default(),
            aggregation: AggregationConfig::default(),
            uncertainty: UncertaintyConfig::default(),
            policy: PolicyConfig::default(),
            routing: RoutingConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Configuration for latency-critical deployments.
    pub fn fast() -> Self {
        Self {
            judge_timeout_ms: 300,
            request_timeout_ms: 500,
            sampling: SamplingConfig {
                samples: 3,
                temperature: 0.8,
                ..SamplingConfig::default()
            },
            uncertainty: UncertaintyConfig {
                bootstrap_samples: 200,
                ..UncertaintyConfig::default()
            },
            ..Self::default()
        }
    }

    /// Configuration optimized for accuracy.
    pub fn thorough() -> Self {
        Self {
            judge_timeout_ms: 30_000,
            request_timeout_ms: 45_000,
            sampling: SamplingConfig {
                samples: 10,
                temperature: 0.5,
                explanation: ExplanationSelection::PreferLongest,
            },
            uncertainty: UncertaintyConfig {
                bootstrap_samples: 2000,
                ..UncertaintyConfig::default()
            },
            ..Self::default()
        }
    }

    /// Default configuration overlaid with `HALO_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse("HALO_JUDGE_TIMEOUT_MS") {
            config.judge_timeout_ms = v;
        }
        if let Some(v) = env_parse("HALO_REQUEST_TIMEOUT_MS") {
            config.request_timeout_ms = v;
        }
        if let Some(v) = env_parse("HALO_SAMPLES") {
            config.sampling.samples = v;
        }
        if let Some(v) = env_parse("HALO_BOOTSTRAP_SAMPLES") {
            config.uncertainty.bootstrap_samples = v;
        }
        if let Some(v) = env_parse("HALO_UNCERTAINTY_THRESHOLD") {
            config.policy.uncertainty_threshold = v;
        }
        if let Some(v) = env_parse("HALO_CACHE_CAPACITY") {
            config.cache.capacity = v;
        }
        if let Some(v) = env_parse("HALO_CACHE_TTL_SECS") {
            config.cache.ttl_secs = Some(v);
        }

        config
    }

    /// Load a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn judge_timeout(&self) -> Duration {
        Duration::from_millis(self.judge_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.judge_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(Error::Config("timeouts must be positive".to_string()));
        }
        if self.sampling.samples == 0 {
            return Err(Error::Config("sampling.samples must be at least 1".to_string()));
        }
        if self.uncertainty.bootstrap_samples == 0 {
            return Err(Error::Config(
                "uncertainty.bootstrap_samples must be at least 1".to_string(),
            ));
        }
        let level = self.uncertainty.confidence_level;
        if !(level > 0.0 && level < 1.0) {
            return Err(Error::Config(format!(
                "uncertainty.confidence_level must be in (0, 1), got {}",
                level
            )));
        }
        for (name, value) in [
            ("uncertainty.uncertainty_floor", self.uncertainty.uncertainty_floor),
            ("policy.uncertainty_threshold", self.policy.uncertainty_threshold),
            ("policy.reject_risk", self.policy.reject_risk),
            ("policy.flag_risk", self.policy.flag_risk),
        ] {
            check_unit(name, value)?;
        }
        if self.policy.flag_risk > self.policy.reject_risk {
            return Err(Error::Config(
                "policy.flag_risk must not exceed policy.reject_risk".to_string(),
            ));
        }
        if let Some(min) = self.policy.min_agreement {
            check_unit("policy.min_agreement", min)?;
        }
        if let Some(cp) = &self.aggregation.confident_primary {
            check_unit("aggregation.confident_primary.threshold", cp.threshold)?;
            check_unit("aggregation.confident_primary.primary_weight", cp.primary_weight)?;
        }
        if self.cache.enabled && self.cache.capacity == 0 {
            return Err(Error::Config(
                "cache.capacity must be positive when the cache is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::Config(format!("{} must be in [0, 1], got {}", name, value)))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}
