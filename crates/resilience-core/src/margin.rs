use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::SignalType;

/// Kind of buffer resource a ledger manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarginType {
    #[default]
    Time,
    Capacity,
    Budget,
    Resource,
}

impl fmt::Display for MarginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MarginType::Time => "TIME",
            MarginType::Capacity => "CAPACITY",
            MarginType::Budget => "BUDGET",
            MarginType::Resource => "RESOURCE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationMetadata {
    pub operation_id: String,
    pub priority: Priority,
    pub reason: String,
}

/// A reservation of margin for a named operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginAllocation {
    pub id: String,
    pub margin_type: MarginType,
    pub amount: f64,
    /// Deployed share of `amount` (0-1)
    pub utilization_rate: f64,
    pub allocated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub metadata: AllocationMetadata,
}

impl MarginAllocation {
    pub fn operation_id(&self) -> &str {
        &self.metadata.operation_id
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Active,
    Closed,
}

/// Active consumption of part of an allocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginDeployment {
    pub id: String,
    pub allocation_id: String,
    pub deployed_at: DateTime<Utc>,
    pub amount: f64,
    pub reason: String,
    pub status: DeploymentStatus,
}

/// Point-in-time utilization record taken when an allocation is recovered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginUtilization {
    pub allocation_id: String,
    pub margin_type: MarginType,
    pub utilization_rate: f64,
    /// Highest utilization the allocation reached
    pub peak_utilization: f64,
    /// Mean of the utilization samples taken at allocation and after each deployment
    pub average_utilization: f64,
    pub timestamp: DateTime<Utc>,
    /// Lifetime of the allocation in seconds
    pub duration_secs: i64,
}

/// Threshold levels, lowest to highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThresholdLevel {
    Warning,
    Critical,
    Emergency,
    AutoDeploy,
}

/// Static utilization thresholds for a margin type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginThreshold {
    pub id: String,
    pub margin_type: MarginType,
    pub warning: f64,
    pub critical: f64,
    pub emergency: f64,
    pub auto_deploy: f64,
}

impl MarginThreshold {
    /// warning < critical < emergency < auto_deploy, all within (0, 1]
    pub fn is_well_formed(&self) -> bool {
        let levels = [self.warning, self.critical, self.emergency, self.auto_deploy];
        levels.iter().all(|v| *v > 0.0 && *v <= 1.0)
            && levels.windows(2).all(|w| w[0] < w[1])
    }

    /// Highest level the given utilization has reached, if any
    pub fn level_for(&self, utilization: f64) -> Option<ThresholdLevel> {
        if utilization >= self.auto_deploy {
            Some(ThresholdLevel::AutoDeploy)
        } else if utilization >= self.emergency {
            Some(ThresholdLevel::Emergency)
        } else if utilization >= self.critical {
            Some(ThresholdLevel::Critical)
        } else if utilization >= self.warning {
            Some(ThresholdLevel::Warning)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
}

impl Operator {
    pub fn is_equality(&self) -> bool {
        matches!(self, Operator::Eq | Operator::Ne)
    }

    pub fn compare<T: PartialOrd>(&self, lhs: &T, rhs: &T) -> bool {
        match self {
            Operator::Eq => lhs == rhs,
            Operator::Ne => lhs != rhs,
            Operator::Gt => lhs > rhs,
            Operator::Lt => lhs < rhs,
            Operator::Gte => lhs >= rhs,
            Operator::Lte => lhs <= rhs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Condition {
    /// Compares the triggering signal's type (EQ/NE only)
    Signal { operator: Operator, value: SignalType },
    /// Compares current ledger utilization (0-1)
    Utilization { operator: Operator, value: f64 },
    /// Compares wall-clock now against a timestamp
    Time { operator: Operator, value: DateTime<Utc> },
    /// Compares the severity-derived risk score of the triggering signal
    Risk { operator: Operator, value: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Allocate {
        amount: f64,
        #[serde(default)]
        priority: Priority,
        #[serde(default)]
        reason: Option<String>,
    },
    Deploy {
        amount: f64,
        #[serde(default)]
        reason: Option<String>,
    },
    Alert { message: String },
    Escalate { message: String },
}

/// Condition/action rule evaluated against processed signals and ledger state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginPolicy {
    pub id: String,
    pub margin_type: MarginType,
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
    /// Lower number runs first
    pub priority: u32,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl MarginPolicy {
    /// Operation id used for allocations this policy creates
    pub fn operation_id(&self) -> String {
        format!("policy-{}", self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarginEventType {
    Allocation,
    Deployment,
    Recovery,
    ThresholdBreach,
    PolicyTrigger,
    Optimization,
    Exhaustion,
}

/// Immutable audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: MarginEventType,
    pub margin_type: MarginType,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    /// Relative impact (0-1)
    pub impact: f64,
    #[serde(default)]
    pub allocation_id: Option<String>,
    #[serde(default)]
    pub policy_id: Option<String>,
}

impl MarginEvent {
    pub fn new(
        event_type: MarginEventType,
        margin_type: MarginType,
        timestamp: DateTime<Utc>,
        description: impl Into<String>,
        impact: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            margin_type,
            timestamp,
            description: description.into(),
            impact: if impact.is_finite() { impact.clamp(0.0, 1.0) } else { 0.0 },
            allocation_id: None,
            policy_id: None,
        }
    }

    pub fn with_allocation(mut self, allocation_id: impl Into<String>) -> Self {
        self.allocation_id = Some(allocation_id.into());
        self
    }

    pub fn with_policy(mut self, policy_id: impl Into<String>) -> Self {
        self.policy_id = Some(policy_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn threshold() -> MarginThreshold {
        MarginThreshold {
            id: "t-time".to_string(),
            margin_type: MarginType::Time,
            warning: 0.6,
            critical: 0.75,
            emergency: 0.9,
            auto_deploy: 0.95,
        }
    }

    #[test]
    fn test_threshold_levels() {
        let t = threshold();
        assert!(t.is_well_formed());
        assert_eq!(t.level_for(0.5), None);
        assert_eq!(t.level_for(0.6), Some(ThresholdLevel::Warning));
        assert_eq!(t.level_for(0.8), Some(ThresholdLevel::Critical));
        assert_eq!(t.level_for(0.92), Some(ThresholdLevel::Emergency));
        assert_eq!(t.level_for(1.0), Some(ThresholdLevel::AutoDeploy));
    }

    #[test]
    fn test_malformed_threshold_detected() {
        let mut t = threshold();
        t.critical = 0.5; // below warning
        assert!(!t.is_well_formed());

        let mut t = threshold();
        t.auto_deploy = 1.2;
        assert!(!t.is_well_formed());
    }

    #[test]
    fn test_operator_compare() {
        assert!(Operator::Gte.compare(&0.5, &0.5));
        assert!(!Operator::Gt.compare(&0.5, &0.5));
        assert!(Operator::Ne.compare(&SignalType::Emergency, &SignalType::Weather));
        assert!(Operator::Eq.is_equality());
        assert!(!Operator::Lt.is_equality());
    }

    #[test]
    fn test_policy_deserializes_tagged_conditions() {
        let json = r#"{
            "id": "emergency-buffer",
            "margin_type": "TIME",
            "priority": 1,
            "conditions": [
                {"type": "SIGNAL", "operator": "EQ", "value": "EMERGENCY"},
                {"type": "RISK", "operator": "GTE", "value": 0.5}
            ],
            "actions": [
                {"type": "ALLOCATE", "amount": 15.0},
                {"type": "ALERT", "message": "emergency buffer reserved"}
            ]
        }"#;
        let policy: MarginPolicy = serde_json::from_str(json).unwrap();
        assert!(policy.active);
        assert_eq!(policy.conditions.len(), 2);
        assert_eq!(
            policy.actions[0],
            Action::Allocate {
                amount: 15.0,
                priority: Priority::Medium,
                reason: None
            }
        );
        assert_eq!(policy.operation_id(), "policy-emergency-buffer");
    }

    #[test]
    fn test_event_impact_clamped() {
        let e = MarginEvent::new(
            MarginEventType::ThresholdBreach,
            MarginType::Time,
            Utc::now(),
            "over",
            1.7,
        );
        assert_eq!(e.impact, 1.0);
        let e = MarginEvent::new(
            MarginEventType::ThresholdBreach,
            MarginType::Time,
            Utc::now(),
            "nan",
            f64::NAN,
        );
        assert_eq!(e.impact, 0.0);
    }
}
