use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::margin::{Action, MarginPolicy, MarginThreshold, MarginType};
use crate::types::{Severity, SignalSourceType, SignalType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionThresholds {
    /// Minimum accepted strength (0-100)
    pub min_strength: f64,
    /// Maximum accepted signals per second for one (type, asset) key
    pub max_frequency: f64,
}

impl Default for DetectionThresholds {
    fn default() -> Self {
        Self {
            min_strength: 0.0,
            max_frequency: 10.0,
        }
    }
}

impl DetectionThresholds {
    /// Minimum spacing between accepted signals of one key
    pub fn min_interval_ms(&self) -> f64 {
        1000.0 / self.max_frequency
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalFilters {
    /// When non-empty, only these types pass
    #[serde(default)]
    pub include_types: Vec<SignalType>,
    /// Always rejected, even when also included
    #[serde(default)]
    pub exclude_types: Vec<SignalType>,
    #[serde(default)]
    pub min_severity: Option<Severity>,
    /// When non-empty, the signal's asset category must be listed
    #[serde(default)]
    pub asset_categories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingOptions {
    pub real_time_processing: bool,
    pub batch_interval_ms: u64,
    pub max_batch_size: usize,
    pub enable_correlation: bool,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            real_time_processing: true,
            batch_interval_ms: 1_000,
            max_batch_size: 100,
            enable_correlation: true,
        }
    }
}

impl ProcessingOptions {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    pub fn mode(&self) -> ProcessingMode {
        if self.real_time_processing {
            ProcessingMode::RealTime
        } else {
            ProcessingMode::Batch
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingMode {
    RealTime,
    Batch,
}

/// Options recognised by `initialize`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDetectionConfig {
    pub sources: Vec<SignalSourceType>,
    #[serde(default)]
    pub thresholds: DetectionThresholds,
    #[serde(default)]
    pub filters: SignalFilters,
    #[serde(default)]
    pub processing: ProcessingOptions,
}

impl Default for SignalDetectionConfig {
    fn default() -> Self {
        Self {
            sources: vec![
                SignalSourceType::Sensor,
                SignalSourceType::Asset,
                SignalSourceType::Manual,
                SignalSourceType::System,
                SignalSourceType::External,
            ],
            thresholds: DetectionThresholds::default(),
            filters: SignalFilters::default(),
            processing: ProcessingOptions::default(),
        }
    }
}

impl SignalDetectionConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.sources.is_empty() {
            return Err(EngineError::Configuration(
                "at least one signal source is required".to_string(),
            ));
        }

        let min_strength = self.thresholds.min_strength;
        if !min_strength.is_finite() || !(0.0..=100.0).contains(&min_strength) {
            return Err(EngineError::Configuration(format!(
                "min_strength must be within 0-100, got {}",
                min_strength
            )));
        }

        let max_frequency = self.thresholds.max_frequency;
        if !max_frequency.is_finite() || max_frequency <= 0.0 {
            return Err(EngineError::Configuration(format!(
                "max_frequency must be positive, got {}",
                max_frequency
            )));
        }

        if !self.processing.real_time_processing {
            if self.processing.batch_interval_ms == 0 {
                return Err(EngineError::Configuration(
                    "batch_interval_ms must be positive in batch mode".to_string(),
                ));
            }
            if self.processing.max_batch_size == 0 {
                return Err(EngineError::Configuration(
                    "max_batch_size must be positive in batch mode".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub margin_type: MarginType,
    /// Margin available before any allocation
    pub base_capacity: f64,
    pub max_concurrent_allocations: usize,
    /// Lifetime of an allocation before the sweep recovers it
    pub default_allocation_ttl_secs: i64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            margin_type: MarginType::Time,
            base_capacity: 120.0,
            max_concurrent_allocations: 10,
            default_allocation_ttl_secs: 3_600,
        }
    }
}

/// Full engine configuration: detection options plus ledger, thresholds and policies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub detection: SignalDetectionConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub thresholds: Vec<MarginThreshold>,
    #[serde(default)]
    pub policies: Vec<MarginPolicy>,
    #[serde(default = "default_history_window")]
    pub history_window_secs: i64,
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_event_retention")]
    pub event_retention: usize,
}

fn default_history_window() -> i64 {
    3_600
}

fn default_health_interval() -> u64 {
    30
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_event_retention() -> usize {
    10_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            detection: SignalDetectionConfig::default(),
            ledger: LedgerConfig::default(),
            thresholds: Vec::new(),
            policies: Vec::new(),
            history_window_secs: default_history_window(),
            health_interval_secs: default_health_interval(),
            sweep_interval_secs: default_sweep_interval(),
            event_retention: default_event_retention(),
        }
    }
}

impl EngineConfig {
    /// Validates the static parts (ledger, thresholds, policies). Detection
    /// options are validated separately at `initialize`.
    pub fn validate(&self) -> EngineResult<()> {
        let ledger = &self.ledger;
        if !ledger.base_capacity.is_finite() || ledger.base_capacity < 0.0 {
            return Err(EngineError::Configuration(format!(
                "base_capacity must be a non-negative number, got {}",
                ledger.base_capacity
            )));
        }
        if ledger.max_concurrent_allocations == 0 {
            return Err(EngineError::Configuration(
                "max_concurrent_allocations must be positive".to_string(),
            ));
        }
        if ledger.default_allocation_ttl_secs <= 0 {
            return Err(EngineError::Configuration(
                "default_allocation_ttl_secs must be positive".to_string(),
            ));
        }
        if self.history_window_secs <= 0 {
            return Err(EngineError::Configuration(
                "history_window_secs must be positive".to_string(),
            ));
        }
        if self.health_interval_secs == 0 || self.sweep_interval_secs == 0 {
            return Err(EngineError::Configuration(
                "health and sweep intervals must be positive".to_string(),
            ));
        }

        for threshold in &self.thresholds {
            if !threshold.is_well_formed() {
                return Err(EngineError::Configuration(format!(
                    "threshold {} must satisfy 0 < warning < critical < emergency < auto_deploy <= 1",
                    threshold.id
                )));
            }
        }

        let mut seen = HashSet::new();
        for policy in &self.policies {
            if !seen.insert(policy.id.as_str()) {
                return Err(EngineError::Configuration(format!(
                    "duplicate policy id {}",
                    policy.id
                )));
            }
            for action in &policy.actions {
                let amount = match action {
                    Action::Allocate { amount, .. } | Action::Deploy { amount, .. } => *amount,
                    Action::Alert { .. } | Action::Escalate { .. } => continue,
                };
                if !amount.is_finite() || amount <= 0.0 {
                    return Err(EngineError::Configuration(format!(
                        "policy {} has a non-positive action amount {}",
                        policy.id, amount
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}
