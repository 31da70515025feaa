//! Policy filtering and per-key rate limiting of incoming signals.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use resilience_core::{Signal, SignalDetectionConfig, SignalKey};
use serde::{Deserialize, Serialize};

/// Why a signal did not pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterReason {
    UnknownSource,
    ExcludedType,
    NotIncludedType,
    BelowMinSeverity,
    AssetCategory,
    BelowMinStrength,
    RateLimited,
}

/// Stateless type/severity/category/strength checks
pub struct SignalFilter;

impl SignalFilter {
    pub fn check(signal: &Signal, config: &SignalDetectionConfig) -> Result<(), FilterReason> {
        if !config.sources.contains(&signal.source) {
            return Err(FilterReason::UnknownSource);
        }

        let filters = &config.filters;
        // Exclude wins over include
        if filters.exclude_types.contains(&signal.signal_type) {
            return Err(FilterReason::ExcludedType);
        }
        if !filters.include_types.is_empty() && !filters.include_types.contains(&signal.signal_type)
        {
            return Err(FilterReason::NotIncludedType);
        }

        if let Some(min_severity) = filters.min_severity {
            if signal.severity < min_severity {
                return Err(FilterReason::BelowMinSeverity);
            }
        }

        if !filters.asset_categories.is_empty() {
            let allowed = signal
                .asset_category
                .as_ref()
                .map(|c| filters.asset_categories.iter().any(|a| a == c))
                .unwrap_or(false);
            if !allowed {
                return Err(FilterReason::AssetCategory);
            }
        }

        if signal.strength.is_nan() || signal.strength < config.thresholds.min_strength {
            return Err(FilterReason::BelowMinStrength);
        }

        Ok(())
    }
}

/// Minimum inter-arrival spacing per (type, asset) key
#[derive(Default)]
pub struct RateLimiter {
    last_signal_time: DashMap<SignalKey, DateTime<Utc>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts the signal and records its timestamp when at least
    /// `min_interval_ms` has elapsed since the last accepted signal of `key`.
    pub fn try_acquire(&self, key: SignalKey, at: DateTime<Utc>, min_interval_ms: f64) -> bool {
        match self.last_signal_time.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let elapsed = at - *entry.get();
                let elapsed_ms = elapsed
                    .num_microseconds()
                    .map(|us| us as f64 / 1000.0)
                    .unwrap_or(elapsed.num_milliseconds() as f64);
                if elapsed_ms < min_interval_ms {
                    return false;
                }
                entry.insert(at);
                true
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(at);
                true
            }
        }
    }

    #[cfg(test)]
    fn last_accepted(&self, key: &SignalKey) -> Option<DateTime<Utc>> {
        self.last_signal_time.get(key).map(|t| *t)
    }

    /// Forget keys whose last accepted signal is older than `cutoff`.
    /// Callers keep `cutoff` at least one minimum interval behind the newest
    /// signal so no pending spacing decision is lost.
    pub fn evict_before(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.last_signal_time.len();
        self.last_signal_time.retain(|_, last| *last >= cutoff);
        before.saturating_sub(self.last_signal_time.len())
    }

    pub fn tracked_keys(&self) -> usize {
        self.last_signal_time.len()
    }
}

/// Result of running a batch through the filter and the rate limiter
#[derive(Debug, Default)]
pub struct FilterOutcome {
    pub accepted: Vec<Signal>,
    pub rejected: Vec<(String, FilterReason)>,
}

impl FilterOutcome {
    pub fn filtered(&self) -> usize {
        self.rejected.len()
    }
}

impl RateLimiter {
    /// Filter a batch in arrival order. Only signals that pass the policy
    /// checks consume a rate-limit slot.
    pub fn filter_batch(
        &self,
        signals: Vec<Signal>,
        config: &SignalDetectionConfig,
    ) -> FilterOutcome {
        let min_interval_ms = config.thresholds.min_interval_ms();
        let mut outcome = FilterOutcome::default();

        for signal in signals {
            let verdict = SignalFilter::check(&signal, config).and_then(|_| {
                if self.try_acquire(signal.key(), signal.timestamp, min_interval_ms) {
                    Ok(())
                } else {
                    Err(FilterReason::RateLimited)
                }
            });

            match verdict {
                Ok(()) => outcome.accepted.push(signal),
                Err(reason) => {
                    tracing::debug!(
                        signal_id = %signal.id,
                        key = %signal.key(),
                        ?reason,
                        "Signal filtered"
                    );
                    outcome.rejected.push((signal.id, reason));
                }
            }
        }

        outcome
    }
}
