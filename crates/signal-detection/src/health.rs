//! Health Monitor
//!
//! Samples resource metrics from a pluggable source and flags any metric at or
//! above the high-water mark. Only the latest snapshot is retained.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Percent usage at which a metric produces a warning
pub const HIGH_WATER_MARK: f64 = 90.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub network_latency_ms: f64,
}

/// Source of resource metrics; the host supplies a real one
pub trait MetricsSource: Send + Sync {
    fn sample(&self) -> ResourceSample;
}

/// Reports an idle machine. Used when the host plugs in nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetricsSource;

impl MetricsSource for NullMetricsSource {
    fn sample(&self) -> ResourceSample {
        ResourceSample::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthWarning {
    pub timestamp: DateTime<Utc>,
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
}

/// Engine-side counters reported alongside resource metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineLoad {
    pub history_size: usize,
    pub queue_depth: usize,
    pub active_allocations: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    pub resources: ResourceSample,
    pub load: EngineLoad,
    pub warnings: Vec<HealthWarning>,
}

pub struct HealthMonitor {
    source: Arc<dyn MetricsSource>,
    high_water_mark: f64,
    latest: Mutex<Option<HealthSnapshot>>,
}

impl HealthMonitor {
    pub fn new(source: Arc<dyn MetricsSource>) -> Self {
        Self {
            source,
            high_water_mark: HIGH_WATER_MARK,
            latest: Mutex::new(None),
        }
    }

    /// Take a sample, replace the latest snapshot and return it
    pub fn check(&self, now: DateTime<Utc>, load: EngineLoad) -> HealthSnapshot {
        let resources = self.source.sample();

        let warnings: Vec<HealthWarning> = [
            ("cpu", resources.cpu_percent),
            ("memory", resources.memory_percent),
            ("disk", resources.disk_percent),
        ]
        .into_iter()
        .filter(|(_, value)| *value >= self.high_water_mark)
        .map(|(metric, value)| HealthWarning {
            timestamp: now,
            metric: metric.to_string(),
            value,
            threshold: self.high_water_mark,
        })
        .collect();

        for warning in &warnings {
            tracing::warn!(
                metric = %warning.metric,
                value = warning.value,
                threshold = warning.threshold,
                "Resource usage above high-water mark"
            );
        }

        let snapshot = HealthSnapshot {
            timestamp: now,
            status: if warnings.is_empty() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            resources,
            load,
            warnings,
        };

        *self.latest.lock() = Some(snapshot.clone());
        snapshot
    }

    pub fn latest(&self) -> Option<HealthSnapshot> {
        self.latest.lock().clone()
    }
}
