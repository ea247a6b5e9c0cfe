//! Configuration management for the racedraw engine
//!
//! Centralized configuration with validation, defaults, TOML files and
//! environment variable overrides.

use crate::common::types::BasisPoints;
use crate::errors::{ConfigurationError, EngineResult};
use crate::games::types::MarketType;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub draw: DrawConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub rebate: RebateConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Weight shaping and force detection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DrawConfig {
    /// Weight given to numbers a win directive targets
    pub high_weight: f64,
    /// Weight given to numbers a loss directive suppresses
    pub low_weight: f64,
    /// At or above this a weight counts as extremely high
    pub high_threshold: f64,
    /// At or below this a weight counts as extremely low
    pub low_threshold: f64,
    /// Untargeted suppression is forced only with at least this many low numbers
    pub loss_force_min_low: usize,
    /// Exposure ratio above which auto-risk engages
    pub auto_risk_high: f64,
    /// Exposure ratio below which auto-risk disengages
    pub auto_risk_low: f64,
    /// Weight applied to over-exposed numbers while auto-risk is engaged
    pub auto_risk_suppressed_weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettlementConfig {
    /// First-plus-second sums at or above this are "big"
    pub sum_big_threshold: u8,
    pub lease_ttl_ms: u64,
    /// Bets processed between lease validity checks
    pub lease_check_every: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RebateConfig {
    pub market_a_cap_bps: u32,
    pub market_d_cap_bps: u32,
    pub lease_ttl_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SweepConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    /// A drawn period with unsettled bets older than this is re-settled
    pub settle_deadline_ms: u64,
    /// A period still betting, or drawing without a published draw, this
    /// long after it opened is closed and drawn by the sweep
    #[serde(default = "default_stalled_period_ms")]
    pub stalled_period_ms: u64,
}

fn default_stalled_period_ms() -> u64 {
    150_000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    pub period_interval_ms: u64,
    pub betting_window_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Rocksdb,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_dir: String,
    pub clear_on_start: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            draw: DrawConfig::default(),
            settlement: SettlementConfig::default(),
            rebate: RebateConfig::default(),
            sweep: SweepConfig::default(),
            scheduler: SchedulerConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for DrawConfig {
    fn default() -> Self {
        Self {
            high_weight: 1_000.0,
            low_weight: 0.0,
            high_threshold: 100.0,
            low_threshold: 0.01,
            loss_force_min_low: 3,
            auto_risk_high: 3.0,
            auto_risk_low: 1.0,
            auto_risk_suppressed_weight: 0.3,
        }
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            sum_big_threshold: 12,
            lease_ttl_ms: 30_000,
            lease_check_every: 64,
        }
    }
}

impl Default for RebateConfig {
    fn default() -> Self {
        Self {
            market_a_cap_bps: MarketType::A.default_cap().0,
            market_d_cap_bps: MarketType::D.default_cap().0,
            lease_ttl_ms: 30_000,
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 15_000,
            settle_deadline_ms: 60_000,
            stalled_period_ms: default_stalled_period_ms(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            period_interval_ms: 75_000,
            betting_window_ms: 60_000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            data_dir: "./DB/racedraw_data".to_string(),
            clear_on_start: false,
        }
    }
}

impl RebateConfig {
    pub fn cap_for(&self, market: MarketType) -> BasisPoints {
        match market {
            MarketType::A => BasisPoints(self.market_a_cap_bps),
            MarketType::D => BasisPoints(self.market_d_cap_bps),
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }
}

impl SettlementConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }
}

impl EngineConfig {
    /// Short cadence for tests and local runs
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        config.scheduler.period_interval_ms = 200;
        config.scheduler.betting_window_ms = 100;
        config.sweep.interval_ms = 100;
        config.sweep.settle_deadline_ms = 0;
        config.sweep.stalled_period_ms = 1_000;
        config.settlement.lease_ttl_ms = 2_000;
        config.rebate.lease_ttl_ms = 2_000;
        config
    }
}

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    config_path: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file and environment variables
    pub fn load(&self) -> EngineResult<EngineConfig> {
        let mut config = if let Some(ref path) = self.config_path {
            self.load_from_file(path)?
        } else {
            EngineConfig::default()
        };

        self.apply_env_overrides(&mut config)?;
        self.validate(&config)?;

        Ok(config)
    }

    fn load_from_file(&self, path: &str) -> EngineResult<EngineConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to read {}: {}", path, e)))?;

        toml::from_str(&content)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to parse TOML: {}", e)).into())
    }

    fn apply_env_overrides(&self, config: &mut EngineConfig) -> EngineResult<()> {
        if let Ok(dir) = env::var("RACEDRAW_DATA_DIR") {
            config.storage.data_dir = dir;
        }
        if let Ok(backend) = env::var("RACEDRAW_STORAGE_BACKEND") {
            config.storage.backend = match backend.to_lowercase().as_str() {
                "memory" => StorageBackend::Memory,
                "rocksdb" => StorageBackend::Rocksdb,
                _ => {
                    return Err(ConfigurationError::InvalidValue {
                        field: "RACEDRAW_STORAGE_BACKEND".to_string(),
                        value: backend,
                        reason: "Expected memory or rocksdb".to_string(),
                    }
                    .into())
                }
            };
        }
        if let Ok(threshold) = env::var("RACEDRAW_SUM_BIG_THRESHOLD") {
            config.settlement.sum_big_threshold = parse_env("RACEDRAW_SUM_BIG_THRESHOLD", threshold)?;
        }
        if let Ok(ttl) = env::var("RACEDRAW_LEASE_TTL_MS") {
            let ttl: u64 = parse_env("RACEDRAW_LEASE_TTL_MS", ttl)?;
            config.settlement.lease_ttl_ms = ttl;
            config.rebate.lease_ttl_ms = ttl;
        }
        if let Ok(interval) = env::var("RACEDRAW_PERIOD_INTERVAL_MS") {
            config.scheduler.period_interval_ms = parse_env("RACEDRAW_PERIOD_INTERVAL_MS", interval)?;
        }
        if let Ok(enabled) = env::var("RACEDRAW_SWEEP_ENABLED") {
            config.sweep.enabled = parse_env("RACEDRAW_SWEEP_ENABLED", enabled)?;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self, config: &EngineConfig) -> EngineResult<()> {
        let draw = &config.draw;
        if !(draw.low_threshold < 1.0 && 1.0 < draw.high_threshold) {
            return Err(invalid(
                "draw.low_threshold/high_threshold",
                format!("{}/{}", draw.low_threshold, draw.high_threshold),
                "Neutral weight 1.0 must lie strictly between the thresholds",
            ));
        }
        if draw.high_weight < draw.high_threshold {
            return Err(invalid(
                "draw.high_weight",
                draw.high_weight.to_string(),
                "Must reach high_threshold",
            ));
        }
        if draw.low_weight < 0.0 || draw.low_weight > draw.low_threshold {
            return Err(invalid(
                "draw.low_weight",
                draw.low_weight.to_string(),
                "Must be non-negative and within low_threshold",
            ));
        }
        if draw.auto_risk_low >= draw.auto_risk_high {
            return Err(invalid(
                "draw.auto_risk_low",
                draw.auto_risk_low.to_string(),
                "Must be below auto_risk_high",
            ));
        }
        if draw.auto_risk_suppressed_weight <= draw.low_threshold {
            return Err(invalid(
                "draw.auto_risk_suppressed_weight",
                draw.auto_risk_suppressed_weight.to_string(),
                "Auto-risk suppression is statistical and must stay above low_threshold",
            ));
        }
        if draw.loss_force_min_low == 0 {
            return Err(invalid("draw.loss_force_min_low", "0".to_string(), "Must be at least 1"));
        }

        let threshold = config.settlement.sum_big_threshold;
        if !(4..=19).contains(&threshold) {
            return Err(invalid(
                "settlement.sum_big_threshold",
                threshold.to_string(),
                "Sum splits must leave both sides reachable (4..=19)",
            ));
        }
        if config.settlement.lease_ttl_ms < 100 || config.rebate.lease_ttl_ms < 100 {
            return Err(invalid(
                "lease_ttl_ms",
                config.settlement.lease_ttl_ms.min(config.rebate.lease_ttl_ms).to_string(),
                "Lease TTL must be at least 100ms",
            ));
        }
        if config.settlement.lease_check_every == 0 {
            return Err(invalid("settlement.lease_check_every", "0".to_string(), "Cannot be zero"));
        }

        if config.rebate.market_a_cap_bps == 0 || config.rebate.market_d_cap_bps == 0 {
            return Err(ConfigurationError::ValidationFailed("Market rebate caps cannot be zero".to_string()).into());
        }
        if config.rebate.market_a_cap_bps > 10_000 || config.rebate.market_d_cap_bps > 10_000 {
            return Err(ConfigurationError::ValidationFailed("Market rebate caps cannot exceed 100%".to_string()).into());
        }

        if config.scheduler.betting_window_ms >= config.scheduler.period_interval_ms {
            return Err(invalid(
                "scheduler.betting_window_ms",
                config.scheduler.betting_window_ms.to_string(),
                "Betting window must close before the period ends",
            ));
        }
        if config.sweep.enabled && config.sweep.interval_ms == 0 {
            return Err(invalid("sweep.interval_ms", "0".to_string(), "Cannot be zero when sweep is enabled"));
        }
        if config.sweep.enabled && config.sweep.stalled_period_ms <= config.scheduler.betting_window_ms {
            return Err(invalid(
                "sweep.stalled_period_ms",
                config.sweep.stalled_period_ms.to_string(),
                "Must outlast the betting window",
            ));
        }

        if config.storage.backend == StorageBackend::Rocksdb && config.storage.data_dir.is_empty() {
            return Err(ConfigurationError::MissingRequired("storage.data_dir".to_string()).into());
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self, config: &EngineConfig, path: &str) -> EngineResult<()> {
        let toml_string = toml::to_string_pretty(config)
            .map_err(|e| ConfigurationError::SaveFailed(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, toml_string)
            .map_err(|e| ConfigurationError::SaveFailed(format!("Failed to write to {}: {}", path, e)).into())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_env<T: std::str::FromStr>(field: &str, value: String) -> EngineResult<T> {
    value.parse().map_err(|_| {
        ConfigurationError::InvalidValue {
            field: field.to_string(),
            value,
            reason: "Could not parse value".to_string(),
        }
        .into()
    })
}

fn invalid(field: &str, value: String, reason: &str) -> crate::errors::EngineError {
    ConfigurationError::InvalidValue {
        field: field.to_string(),
        value,
        reason: reason.to_string(),
    }
    .into()
}

/// Builder pattern for creating configurations
pub struct ConfigBuilder {
    config: EngineConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn draw(mut self, draw: DrawConfig) -> Self {
        self.config.draw = draw;
        self
    }

    pub fn settlement(mut self, settlement: SettlementConfig) -> Self {
        self.config.settlement = settlement;
        self
    }

    pub fn rebate(mut self, rebate: RebateConfig) -> Self {
        self.config.rebate = rebate;
        self
    }

    pub fn sweep(mut self, sweep: SweepConfig) -> Self {
        self.config.sweep = sweep;
        self
    }

    pub fn scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.config.scheduler = scheduler;
        self
    }

    pub fn storage(mut self, storage: StorageConfig) -> Self {
        self.config.storage = storage;
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config(path: &str) -> EngineResult<()> {
    let config = EngineConfig::default();
    ConfigLoader::new().save(&config, path)
}
