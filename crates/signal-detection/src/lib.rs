//! Signal Detection
//!
//! Filtering, rate limiting, correlation and history for incoming signals,
//! plus the resource health monitor the orchestrator runs on a timer.

pub mod correlation;
pub mod filter;
pub mod health;
pub mod history;

pub use correlation::{
    detection_confidence, pairwise_correlation, CorrelationMatrix, CORRELATION_WINDOW_SECS,
    MAX_CORRELATED_KEYS,
};
pub use filter::{FilterOutcome, FilterReason, RateLimiter, SignalFilter};
pub use health::{
    EngineLoad, HealthMonitor, HealthSnapshot, HealthStatus, HealthWarning, MetricsSource,
    NullMetricsSource, ResourceSample,
};
pub use history::SignalHistory;
