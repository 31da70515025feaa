//! Correlation Analyzer
//!
//! Each key owns one row of the correlation matrix. An accepted signal is
//! compared against the nearest signal of up to `MAX_CORRELATED_KEYS` other
//! keys active within the correlation window, those cells are refreshed, and
//! the signal's score is the mean of the row's cells that are still inside
//! the window. Cells older than the window are evicted.

use chrono::{DateTime, Duration, Utc};
use resilience_core::{Signal, SignalKey};
use std::collections::{HashMap, HashSet};

use crate::history::SignalHistory;

/// Other keys count as active when they have a signal this close in time
pub const CORRELATION_WINDOW_SECS: i64 = 300;
/// Time-proximity term decays linearly to zero over this span
pub const PROXIMITY_DECAY_SECS: i64 = 600;
/// Upper bound on the cells held in one key's row
pub const MAX_CORRELATED_KEYS: usize = 32;

const SAME_TYPE_WEIGHT: f64 = 0.3;
const SAME_ASSET_WEIGHT: f64 = 0.4;
const SEVERITY_WEIGHT: f64 = 0.2;
const PROXIMITY_WEIGHT: f64 = 0.1;

/// Weighted similarity of two signals in [0, 1]
pub fn pairwise_correlation(a: &Signal, b: &Signal) -> f64 {
    let mut score = 0.0;

    if a.signal_type == b.signal_type {
        score += SAME_TYPE_WEIGHT;
    }

    if let (Some(asset_a), Some(asset_b)) = (&a.asset_id, &b.asset_id) {
        if asset_a == asset_b {
            score += SAME_ASSET_WEIGHT;
        }
    }

    let severity_gap = (a.severity.ordinal() as f64 - b.severity.ordinal() as f64).abs();
    score += SEVERITY_WEIGHT * (1.0 - severity_gap / 4.0);

    let gap_ms = (a.timestamp - b.timestamp).num_milliseconds().abs() as f64;
    let decay_ms = (PROXIMITY_DECAY_SECS * 1000) as f64;
    score += PROXIMITY_WEIGHT * (1.0 - gap_ms / decay_ms).max(0.0);

    score.clamp(0.0, 1.0)
}

/// 0.5 + 0.3*strength/100 + 0.2*severity/4 + 0.2*correlation, clamped to [0, 1]
pub fn detection_confidence(signal: &Signal, correlation_score: f64) -> f64 {
    let confidence = 0.5
        + 0.3 * (signal.strength / 100.0)
        + 0.2 * (signal.severity.ordinal() as f64 / 4.0)
        + 0.2 * correlation_score;
    confidence.clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Cell {
    value: f64,
    /// Timestamp of the signal that last refreshed the cell
    seen_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct CorrelationMatrix {
    rows: HashMap<SignalKey, HashMap<SignalKey, Cell>>,
}

impl CorrelationMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refresh `signal`'s row against the nearest other active keys in
    /// `history` and return the mean of the row's in-window cells.
    pub fn correlate(&mut self, signal: &Signal, history: &SignalHistory) -> f64 {
        let key = signal.key();
        let window = Duration::seconds(CORRELATION_WINDOW_SECS);

        let mut active = history.nearest_per_key(signal.timestamp, window, &key);
        // closest in time first; ties keep key order
        active.sort_by_key(|(_, other)| (other.timestamp - signal.timestamp).abs());
        active.truncate(MAX_CORRELATED_KEYS);

        let row = self.rows.entry(key.clone()).or_default();
        for (other_key, other) in &active {
            let cell = Cell {
                value: pairwise_correlation(signal, other),
                seen_at: signal.timestamp,
            };
            row.insert((*other_key).clone(), cell);
        }

        row.retain(|_, cell| (signal.timestamp - cell.seen_at).abs() <= window);
        if row.len() > MAX_CORRELATED_KEYS {
            let mut by_age: Vec<(SignalKey, DateTime<Utc>)> =
                row.iter().map(|(k, c)| (k.clone(), c.seen_at)).collect();
            by_age.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            for (stale, _) in by_age.into_iter().skip(MAX_CORRELATED_KEYS) {
                row.remove(&stale);
            }
        }

        if row.is_empty() {
            self.rows.remove(&key);
        }
        self.score(&key).unwrap_or(0.0)
    }

    /// Mean of `key`'s row, if it has any cells
    pub fn score(&self, key: &SignalKey) -> Option<f64> {
        self.rows
            .get(key)
            .filter(|row| !row.is_empty())
            .map(|row| row.values().map(|c| c.value).sum::<f64>() / row.len() as f64)
    }

    #[cfg(test)]
    fn get(&self, a: &SignalKey, b: &SignalKey) -> Option<f64> {
        self.rows.get(a).and_then(|row| row.get(b)).map(|c| c.value)
    }

    /// Drop cells last refreshed before `cutoff`. Returns how many went.
    pub fn evict_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for row in self.rows.values_mut() {
            let before = row.len();
            row.retain(|_, cell| cell.seen_at >= cutoff);
            removed += before - row.len();
        }
        self.rows.retain(|_, row| !row.is_empty());
        removed
    }

    /// Drop rows and cells for keys that are no longer retained
    pub fn retain_keys(&mut self, live: &HashSet<SignalKey>) {
        self.rows.retain(|key, _| live.contains(key));
        for row in self.rows.values_mut() {
            row.retain(|key, _| live.contains(key));
        }
        self.rows.retain(|_, row| !row.is_empty());
    }

    /// Number of populated cells across all rows
    pub fn len(&self) -> usize {
        self.rows.values().map(|row| row.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use resilience_core::{Severity, SignalSourceType, SignalType};

    fn signal(
        id: &str,
        signal_type: SignalType,
        severity: Severity,
        asset: &str,
        at: DateTime<Utc>,
    ) -> Signal {
        Signal::new(id, signal_type, severity, SignalSourceType::Sensor, 50.0, at).with_asset(asset)
    }

    #[test]
    fn test_identical_signals_fully_correlated() {
        let now = Utc::now();
        let a = signal("a", SignalType::Weather, Severity::High, "x", now);
        let b = signal("b", SignalType::Weather, Severity::High, "x", now);
        assert!((pairwise_correlation(&a, &b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_pairwise_weights() {
        let now = Utc::now();
        // different type and asset, severity gap 3, 5 minutes apart
        let a = signal("a", SignalType::Weather, Severity::Low, "x", now);
        let b = signal(
            "b",
            SignalType::Security,
            Severity::Critical,
            "y",
            now + Duration::minutes(5),
        );
        let expected = 0.2 * (1.0 - 3.0 / 4.0) + 0.1 * 0.5;
        assert!((pairwise_correlation(&a, &b) - expected).abs() < 1e-9);

        // same asset only, beyond the decay window
        let c = signal("c", SignalType::Security, Severity::Low, "x", now + Duration::minutes(15));
        let expected = 0.4 + 0.2;
        assert!((pairwise_correlation(&a, &c) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_formula() {
        let now = Utc::now();
        let mut s = signal("a", SignalType::Weather, Severity::Medium, "x", now);
        s.strength = 50.0;
        let expected = 0.5 + 0.15 + 0.1 + 0.2 * 0.25;
        assert!((detection_confidence(&s, 0.25) - expected).abs() < 1e-9);

        s.strength = 100.0;
        s.severity = Severity::Critical;
        assert_eq!(detection_confidence(&s, 1.0), 1.0);
    }

    #[test]
    fn test_correlate_with_no_active_keys() {
        let mut matrix = CorrelationMatrix::new();
        let history = SignalHistory::new(Duration::hours(1));
        let s = signal("a", SignalType::Weather, Severity::Low, "x", Utc::now());
        assert_eq!(matrix.correlate(&s, &history), 0.0);
        assert!(matrix.is_empty());
    }

    #[test]
    fn test_correlate_is_mean_over_active_keys() {
        let now = Utc::now();
        let mut history = SignalHistory::new(Duration::hours(1));
        let same_asset = signal("p", SignalType::Weather, Severity::High, "pump", now);
        let unrelated = signal("q", SignalType::Security, Severity::High, "valve", now);
        history.insert(same_asset.clone());
        history.insert(unrelated.clone());

        let incoming = signal("n", SignalType::Maintenance, Severity::High, "pump", now);
        let mut matrix = CorrelationMatrix::new();
        let score = matrix.correlate(&incoming, &history);

        let expected = (pairwise_correlation(&incoming, &same_asset)
            + pairwise_correlation(&incoming, &unrelated))
            / 2.0;
        assert!((score - expected).abs() < 1e-9);
        assert_eq!(matrix.score(&incoming.key()), Some(score));
        assert_eq!(
            matrix.get(&incoming.key(), &same_asset.key()),
            Some(pairwise_correlation(&incoming, &same_asset))
        );
        // only the incoming key's row is written
        assert_eq!(matrix.get(&same_asset.key(), &incoming.key()), None);
        assert_eq!(matrix.len(), 2);

        // deterministic for the same state
        let again = matrix.correlate(&incoming, &history);
        assert_eq!(score, again);
    }

    #[test]
    fn test_retain_keys_drops_dead_rows() {
        let now = Utc::now();
        let mut history = SignalHistory::new(Duration::hours(1));
        let kept = signal("k", SignalType::Weather, Severity::Low, "a", now);
        history.insert(kept.clone());
        let incoming = signal("n", SignalType::Security, Severity::Low, "b", now);

        let mut matrix = CorrelationMatrix::new();
        matrix.correlate(&incoming, &history);
        assert_eq!(matrix.len(), 1);

        let live: HashSet<SignalKey> = [kept.key()].into_iter().collect();
        matrix.retain_keys(&live);
        assert!(matrix.is_empty());
    }

    #[test]
    fn test_row_keeps_cells_refreshed_inside_window() {
        let t0 = Utc::now();
        let mut history = SignalHistory::new(Duration::hours(1));
        let pump = signal(
            "p",
            SignalType::Weather,
            Severity::High,
            "pump",
            t0 - Duration::minutes(4),
        );
        history.insert(pump.clone());

        let mut matrix = CorrelationMatrix::new();
        let first = signal("n1", SignalType::Maintenance, Severity::High, "pump", t0);
        let first_score = matrix.correlate(&first, &history);
        history.insert(first.clone());
        assert!(first_score > 0.0);

        // pump is six minutes from this one, so not active, but its cell was
        // refreshed two minutes ago and still counts
        let second = signal(
            "n2",
            SignalType::Maintenance,
            Severity::High,
            "pump",
            t0 + Duration::minutes(2),
        );
        let second_score = matrix.correlate(&second, &history);
        assert!((second_score - first_score).abs() < 1e-9);
        assert_eq!(matrix.score(&first.key()), Some(second_score));

        // ten minutes on, the cell is outside the window
        let third = signal(
            "n3",
            SignalType::Maintenance,
            Severity::High,
            "pump",
            t0 + Duration::minutes(10),
        );
        assert_eq!(matrix.correlate(&third, &history), 0.0);
        assert!(matrix.is_empty());
    }

    #[test]
    fn test_row_size_is_bounded() {
        let now = Utc::now();
        let mut history = SignalHistory::new(Duration::hours(1));
        for i in 0..(MAX_CORRELATED_KEYS * 3) {
            let at = now - Duration::seconds(i as i64);
            history.insert(signal(
                &format!("s{}", i),
                SignalType::Weather,
                Severity::Low,
                &format!("a{}", i),
                at,
            ));
        }

        let mut matrix = CorrelationMatrix::new();
        let incoming = signal("n", SignalType::Security, Severity::Low, "hub", now);
        matrix.correlate(&incoming, &history);
        assert_eq!(matrix.len(), MAX_CORRELATED_KEYS);
        // the nearest keys in time are the ones kept
        assert!(matrix
            .get(&incoming.key(), &SignalKey::new(SignalType::Weather, "a0"))
            .is_some());
    }

    #[test]
    fn test_cell_count_bounded_after_window_passes() {
        let t0 = Utc::now();
        let mut history = SignalHistory::new(Duration::hours(1));
        let mut matrix = CorrelationMatrix::new();

        for i in 0..200 {
            let s = signal(
                &format!("s{}", i),
                SignalType::Capacity,
                Severity::Medium,
                &format!("bay-{}", i),
                t0,
            );
            matrix.correlate(&s, &history);
            history.insert(s);
        }
        assert!(matrix.len() <= 200 * MAX_CORRELATED_KEYS);

        let later = t0 + Duration::seconds(CORRELATION_WINDOW_SECS + 1);
        let evicted = matrix.evict_before(later - Duration::seconds(CORRELATION_WINDOW_SECS));
        assert!(evicted > 0);
        assert!(matrix.is_empty());
    }
}
