use anyhow::{Context, Result};
use resilience_core::{
    EngineConfig, LedgerConfig, MarginPolicy, MarginThreshold, MarginType, SignalSourceType,
};
use serde::Deserialize;
use std::env;

/// Thresholds and policies loaded from `POLICY_FILE`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PolicyFile {
    pub thresholds: Vec<MarginThreshold>,
    pub policies: Vec<MarginPolicy>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub engine: EngineConfig,
    pub policy_file: Option<String>,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key/value source; unset keys fall
    /// back to the engine defaults.
    pub fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let mut engine = EngineConfig::default();

        let detection = &mut engine.detection;
        if let Some(sources) = get("SIGNAL_SOURCES") {
            detection.sources = parse_sources(&sources)?;
        }
        detection.thresholds.min_strength = var("MIN_STRENGTH", "0")
            .parse()
            .context("MIN_STRENGTH must be a number")?;
        detection.thresholds.max_frequency = var("MAX_FREQUENCY", "10")
            .parse()
            .context("MAX_FREQUENCY must be a number")?;
        detection.processing.real_time_processing = var("REAL_TIME_PROCESSING", "true")
            .parse()
            .context("REAL_TIME_PROCESSING must be true or false")?;
        detection.processing.batch_interval_ms = var("BATCH_INTERVAL_MS", "1000")
            .parse()
            .context("BATCH_INTERVAL_MS must be an integer")?;
        detection.processing.max_batch_size = var("MAX_BATCH_SIZE", "100")
            .parse()
            .context("MAX_BATCH_SIZE must be an integer")?;
        detection.processing.enable_correlation = var("ENABLE_CORRELATION", "true")
            .parse()
            .context("ENABLE_CORRELATION must be true or false")?;

        engine.ledger = LedgerConfig {
            margin_type: match get("MARGIN_TYPE") {
                Some(raw) => parse_enum::<MarginType>(&raw).context("invalid MARGIN_TYPE")?,
                None => MarginType::Time,
            },
            base_capacity: var("MARGIN_BASE_CAPACITY", "120")
                .parse()
                .context("MARGIN_BASE_CAPACITY must be a number")?,
            max_concurrent_allocations: var("MAX_CONCURRENT_ALLOCATIONS", "10")
                .parse()
                .context("MAX_CONCURRENT_ALLOCATIONS must be an integer")?,
            default_allocation_ttl_secs: var("ALLOCATION_TTL_SECS", "3600")
                .parse()
                .context("ALLOCATION_TTL_SECS must be an integer")?,
        };

        engine.health_interval_secs = var("HEALTH_INTERVAL_SECS", "30")
            .parse()
            .context("HEALTH_INTERVAL_SECS must be an integer")?;
        engine.sweep_interval_secs = var("SWEEP_INTERVAL_SECS", "60")
            .parse()
            .context("SWEEP_INTERVAL_SECS must be an integer")?;

        let policy_file = get("POLICY_FILE").filter(|p| !p.trim().is_empty());
        if let Some(path) = &policy_file {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read POLICY_FILE {}", path))?;
            let file = parse_policy_file(&raw)
                .with_context(|| format!("failed to parse POLICY_FILE {}", path))?;
            engine.thresholds = file.thresholds;
            engine.policies = file.policies;
        }

        engine.validate().context("invalid engine configuration")?;
        engine
            .detection
            .validate()
            .context("invalid detection configuration")?;

        Ok(Self {
            engine,
            policy_file,
        })
    }
}

pub fn parse_policy_file(raw: &str) -> Result<PolicyFile> {
    Ok(serde_json::from_str(raw)?)
}

fn parse_sources(raw: &str) -> Result<Vec<SignalSourceType>> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| parse_enum(s).with_context(|| format!("unknown signal source {}", s)))
        .collect()
}

/// Parse a SCREAMING_SNAKE_CASE enum name, case-insensitively
fn parse_enum<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    let name = serde_json::Value::String(raw.trim().to_uppercase());
    Ok(serde_json::from_value(name)?)
}
