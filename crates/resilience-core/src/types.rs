use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Category of an incoming risk/condition observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalType {
    Maintenance,
    Emergency,
    Weather,
    Performance,
    Capacity,
    Compliance,
    Security,
    SupplyChain,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Maintenance => "MAINTENANCE",
            SignalType::Emergency => "EMERGENCY",
            SignalType::Weather => "WEATHER",
            SignalType::Performance => "PERFORMANCE",
            SignalType::Capacity => "CAPACITY",
            SignalType::Compliance => "COMPLIANCE",
            SignalType::Security => "SECURITY",
            SignalType::SupplyChain => "SUPPLY_CHAIN",
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signal severity. Variant order is the ordinal order, so `Ord` compares by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Ordinal position, 1 (LOW) through 4 (CRITICAL)
    pub fn ordinal(&self) -> u8 {
        match self {
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 3,
            Severity::Critical => 4,
        }
    }

    /// Numeric risk score used by RISK policy conditions
    pub fn risk_score(&self) -> f64 {
        match self {
            Severity::Low => 0.2,
            Severity::Medium => 0.5,
            Severity::High => 0.8,
            Severity::Critical => 1.0,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// Where a signal originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalSourceType {
    Sensor,
    Asset,
    Manual,
    System,
    External,
}

/// Enrichment block appended to a signal once it has been processed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionMetadata {
    pub detected_at: DateTime<Utc>,
    /// Mean correlation against other active keys (0-1)
    pub correlation_score: f64,
    /// Detection confidence (0-1)
    pub confidence: f64,
}

/// A timestamped observation of risk or condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    pub severity: Severity,
    pub source: SignalSourceType,
    #[serde(default)]
    pub asset_id: Option<String>,
    #[serde(default)]
    pub asset_category: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    /// Signal strength (0-100)
    pub strength: f64,
    pub timestamp: DateTime<Utc>,
    /// Opaque provenance data supplied by the caller
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub detection: Option<DetectionMetadata>,
}

impl Signal {
    pub fn new(
        id: impl Into<String>,
        signal_type: SignalType,
        severity: Severity,
        source: SignalSourceType,
        strength: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            signal_type,
            severity,
            source,
            asset_id: None,
            asset_category: None,
            location: None,
            strength,
            timestamp,
            metadata: HashMap::new(),
            detection: None,
        }
    }

    pub fn with_asset(mut self, asset_id: impl Into<String>) -> Self {
        self.asset_id = Some(asset_id.into());
        self
    }

    pub fn with_asset_category(mut self, category: impl Into<String>) -> Self {
        self.asset_category = Some(category.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn key(&self) -> SignalKey {
        SignalKey::for_signal(self)
    }

    pub fn confidence(&self) -> Option<f64> {
        self.detection.as_ref().map(|d| d.confidence)
    }
}

/// History/rate-limit key: (signal type, asset id or "global")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignalKey {
    pub signal_type: SignalType,
    pub asset: String,
}

pub const GLOBAL_ASSET: &str = "global";

impl SignalKey {
    pub fn new(signal_type: SignalType, asset: impl Into<String>) -> Self {
        Self {
            signal_type,
            asset: asset.into(),
        }
    }

    pub fn for_signal(signal: &Signal) -> Self {
        Self {
            signal_type: signal.signal_type,
            asset: signal
                .asset_id
                .clone()
                .unwrap_or_else(|| GLOBAL_ASSET.to_string()),
        }
    }
}

impl fmt::Display for SignalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.signal_type, self.asset)
    }
}

/// Lifecycle state of the detection engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
    Inactive,
    Active,
    Error,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Inactive => "INACTIVE",
            EngineState::Active => "ACTIVE",
            EngineState::Error => "ERROR",
        };
        f.write_str(s)
    }
}
