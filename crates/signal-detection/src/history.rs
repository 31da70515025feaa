//! Rolling per-key signal log, pruned by age.

use chrono::{DateTime, Duration, Utc};
use resilience_core::{Signal, SignalKey};
use std::collections::{HashMap, VecDeque};

pub struct SignalHistory {
    entries: HashMap<SignalKey, VecDeque<Signal>>,
    window: Duration,
}

impl SignalHistory {
    pub fn new(window: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn insert(&mut self, signal: Signal) {
        self.entries.entry(signal.key()).or_default().push_back(signal);
    }

    /// Drop signals older than the retention window. Returns how many were removed.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.window;
        let mut removed = 0;
        for signals in self.entries.values_mut() {
            let before = signals.len();
            signals.retain(|s| s.timestamp >= cutoff);
            removed += before - signals.len();
        }
        self.entries.retain(|_, signals| !signals.is_empty());
        removed
    }

    /// Signals of `key`, oldest first
    pub fn for_key(&self, key: &SignalKey) -> Vec<Signal> {
        self.entries
            .get(key)
            .map(|signals| signals.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every retained signal ordered by timestamp
    pub fn all(&self) -> Vec<Signal> {
        let mut all: Vec<Signal> = self.entries.values().flatten().cloned().collect();
        all.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// For every key other than `exclude`, the signal closest in time to `at`
    /// that lies within `within` of it.
    pub fn nearest_per_key(
        &self,
        at: DateTime<Utc>,
        within: Duration,
        exclude: &SignalKey,
    ) -> Vec<(&SignalKey, &Signal)> {
        let mut nearest: Vec<(&SignalKey, &Signal)> = self
            .entries
            .iter()
            .filter(|(key, _)| *key != exclude)
            .filter_map(|(key, signals)| {
                signals
                    .iter()
                    .filter(|s| (s.timestamp - at).abs() <= within)
                    .min_by_key(|s| (s.timestamp - at).abs())
                    .map(|s| (key, s))
            })
            .collect();
        nearest.sort_by(|a, b| a.0.cmp(b.0));
        nearest
    }

    pub fn keys(&self) -> impl Iterator<Item = &SignalKey> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn key_count(&self) -> usize {
        self.entries.len()
    }
}
