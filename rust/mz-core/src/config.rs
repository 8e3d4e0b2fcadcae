//! Unified configuration schema.
//!
//! Every section carries serde defaults so a partial YAML file (or an empty
//! one) loads into a usable configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Tree policy constants.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchConfig {
    /// PUCT exploration constant.
    #[serde(default = "default_c_puct")]
    pub c_puct: f32,
    /// Per-edge decay applied to a value each time it moves one edge upward.
    #[serde(default = "default_discount")]
    pub discount: f32,
    /// Provisional loss applied along a path while its leaf evaluation is in flight.
    #[serde(default = "default_virtual_loss")]
    pub virtual_loss: f32,
    /// Softmax temperature used when turning policy logits into priors.
    #[serde(default = "default_one")]
    pub policy_temperature: f32,
    /// Dirichlet noise alpha (root only).
    #[serde(default = "default_dirichlet_alpha")]
    pub dirichlet_alpha: f32,
    /// Dirichlet noise mix-in fraction (root only). `0` disables noise.
    #[serde(default = "default_dirichlet_epsilon")]
    pub dirichlet_epsilon: f32,
    /// Seed for root noise. `None` disables root noise entirely.
    #[serde(default)]
    pub noise_seed: Option<u64>,
    /// Maximum outstanding asynchronous evaluations per worker.
    #[serde(default = "default_max_inflight_per_worker")]
    pub max_inflight_per_worker: usize,
    /// Temperature reached by `best_child` when the root value is fully decided.
    #[serde(default = "default_one")]
    pub best_child_temperature: f32,
    /// |Q(root)| above which `best_child` starts sampling instead of taking the argmax.
    #[serde(default = "default_best_child_temperature_onset")]
    pub best_child_temperature_onset: f32,
}

fn default_c_puct() -> f32 {
    1.4
}

fn default_discount() -> f32 {
    0.99
}

fn default_virtual_loss() -> f32 {
    1.0
}

fn default_one() -> f32 {
    1.0
}

fn default_dirichlet_alpha() -> f32 {
    0.3
}

fn default_dirichlet_epsilon() -> f32 {
    0.25
}

fn default_max_inflight_per_worker() -> usize {
    8
}

fn default_best_child_temperature_onset() -> f32 {
    0.9
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            c_puct: default_c_puct(),
            discount: default_discount(),
            virtual_loss: default_virtual_loss(),
            policy_temperature: default_one(),
            dirichlet_alpha: default_dirichlet_alpha(),
            dirichlet_epsilon: default_dirichlet_epsilon(),
            noise_seed: None,
            max_inflight_per_worker: default_max_inflight_per_worker(),
            best_child_temperature: default_one(),
            best_child_temperature_onset: default_best_child_temperature_onset(),
        }
    }
}

/// Worker pool and think-time policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoordinatorConfig {
    /// Number of parallel search workers (and pool threads).
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Think time before visit-ratio and decision-kind adjustments.
    #[serde(default = "default_base_think_ms")]
    pub base_think_ms: u64,
    #[serde(default)]
    pub min_think_ms: u64,
    #[serde(default = "default_max_think_ms")]
    pub max_think_ms: u64,
    /// Below this many root visits per child the tree counts as under-explored.
    #[serde(default = "default_low_water")]
    pub low_water_visits_per_child: f32,
    /// Above this many root visits per child the budget shrinks toward zero.
    #[serde(default = "default_high_water")]
    pub high_water_visits_per_child: f32,
    #[serde(default = "default_under_explored_multiplier")]
    pub under_explored_multiplier: f32,
    /// Budget multiplier for attacker/blocker declarations.
    #[serde(default = "default_combat_multiplier")]
    pub combat_multiplier: f32,
    /// Extra wait past the deadline for workers to hand their trees back.
    #[serde(default = "default_join_grace_ms")]
    pub join_grace_ms: u64,
    /// Treat oracle inconsistencies inside a worker as fatal.
    #[serde(default)]
    pub strict: bool,
}

fn default_workers() -> usize {
    4
}

fn default_base_think_ms() -> u64 {
    500
}

fn default_max_think_ms() -> u64 {
    5000
}

fn default_low_water() -> f32 {
    20.0
}

fn default_high_water() -> f32 {
    400.0
}

fn default_under_explored_multiplier() -> f32 {
    1.5
}

fn default_combat_multiplier() -> f32 {
    2.0
}

fn default_join_grace_ms() -> u64 {
    50
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            base_think_ms: default_base_think_ms(),
            min_think_ms: 0,
            max_think_ms: default_max_think_ms(),
            low_water_visits_per_child: default_low_water(),
            high_water_visits_per_child: default_high_water(),
            under_explored_multiplier: default_under_explored_multiplier(),
            combat_multiplier: default_combat_multiplier(),
            join_grace_ms: default_join_grace_ms(),
            strict: false,
        }
    }
}

/// Remote inference settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InferenceConfig {
    /// Server address ("host:port"). `None` runs offline.
    #[serde(default)]
    pub addr: Option<String>,
    /// Micro-batch requests (default) or issue one call per request.
    #[serde(default = "default_true")]
    pub batching: bool,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Period of the background flush task.
    #[serde(default = "default_flush_interval_us")]
    pub flush_interval_us: u64,
    /// Maximum simultaneous in-flight network calls.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Cap on queued, not yet dispatched requests.
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_batch_size() -> usize {
    32
}

fn default_flush_interval_us() -> u64 {
    2500
}

fn default_max_concurrency() -> usize {
    2
}

fn default_request_timeout_ms() -> u64 {
    2000
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

fn default_max_queue() -> usize {
    4096
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            addr: None,
            batching: true,
            max_batch_size: default_max_batch_size(),
            flush_interval_us: default_flush_interval_us(),
            max_concurrency: default_max_concurrency(),
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_queue: default_max_queue(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Append decision events as NDJSON to this file.
    #[serde(default)]
    pub events_path: Option<String>,
    /// Terminal log level ("error", "warn", "info", "debug", "trace").
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            events_path: None,
            level: default_level(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = if yaml.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.search;
        if !(s.c_puct.is_finite() && s.c_puct > 0.0) {
            return Err(invalid("search.c_puct must be finite and > 0"));
        }
        if !(s.discount.is_finite() && s.discount > 0.0 && s.discount <= 1.0) {
            return Err(invalid("search.discount must be in (0, 1]"));
        }
        if !(s.virtual_loss.is_finite() && s.virtual_loss >= 0.0) {
            return Err(invalid("search.virtual_loss must be finite and >= 0"));
        }
        if !(s.policy_temperature.is_finite() && s.policy_temperature > 0.0) {
            return Err(invalid("search.policy_temperature must be finite and > 0"));
        }
        if !(s.dirichlet_epsilon.is_finite() && (0.0..=1.0).contains(&s.dirichlet_epsilon)) {
            return Err(invalid("search.dirichlet_epsilon must be in [0, 1]"));
        }
        if !(s.dirichlet_alpha.is_finite() && s.dirichlet_alpha > 0.0) {
            return Err(invalid("search.dirichlet_alpha must be finite and > 0"));
        }
        if s.max_inflight_per_worker == 0 {
            return Err(invalid("search.max_inflight_per_worker must be > 0"));
        }
        if !(s.best_child_temperature.is_finite() && s.best_child_temperature >= 0.0) {
            return Err(invalid("search.best_child_temperature must be finite and >= 0"));
        }
        if !(0.0..1.0).contains(&s.best_child_temperature_onset) {
            return Err(invalid("search.best_child_temperature_onset must be in [0, 1)"));
        }

        let c = &self.coordinator;
        if c.workers == 0 {
            return Err(invalid("coordinator.workers must be > 0"));
        }
        if c.min_think_ms > c.max_think_ms {
            return Err(invalid("coordinator.min_think_ms must be <= max_think_ms"));
        }
        if !(c.low_water_visits_per_child >= 0.0
            && c.high_water_visits_per_child > c.low_water_visits_per_child)
        {
            return Err(invalid(
                "coordinator water marks must satisfy 0 <= low_water < high_water",
            ));
        }
        if !(c.under_explored_multiplier.is_finite() && c.under_explored_multiplier >= 1.0) {
            return Err(invalid("coordinator.under_explored_multiplier must be >= 1"));
        }
        if !(c.combat_multiplier.is_finite() && c.combat_multiplier > 0.0) {
            return Err(invalid("coordinator.combat_multiplier must be > 0"));
        }

        let i = &self.inference;
        if i.max_batch_size == 0 {
            return Err(invalid("inference.max_batch_size must be > 0"));
        }
        if i.max_concurrency == 0 {
            return Err(invalid("inference.max_concurrency must be > 0"));
        }
        if i.flush_interval_us == 0 {
            return Err(invalid("inference.flush_interval_us must be > 0"));
        }
        if i.max_queue == 0 {
            return Err(invalid("inference.max_queue must be > 0"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Invalid(msg.to_string())
}
