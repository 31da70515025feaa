use chrono::{DateTime, Utc};
use resilience_core::{EngineState, ProcessingMode, Signal};
use serde::Serialize;
use signal_detection::HealthSnapshot;

use crate::bus::ProcessingFailure;

/// Outcome of one `detect_signals` call or one batch drain
#[derive(Debug, Clone, Default)]
pub struct DetectionResult {
    pub processed: usize,
    pub filtered: usize,
    /// Accepted signals parked for the next batch tick (batch mode only)
    pub queued: usize,
    pub errors: Vec<ProcessingFailure>,
    /// Enriched signals, in processing order
    pub results: Vec<Signal>,
}

impl DetectionResult {
    pub(crate) fn absorb(&mut self, other: DetectionResult) {
        self.processed += other.processed;
        self.filtered += other.filtered;
        self.queued += other.queued;
        self.errors.extend(other.errors);
        self.results.extend(other.results);
    }
}

/// Rolling counters since engine construction
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionStatistics {
    pub total_received: u64,
    pub total_processed: u64,
    pub total_filtered: u64,
    pub total_queued: u64,
    pub total_errors: u64,
    pub batches_processed: u64,
    /// Running mean confidence of processed signals
    pub average_confidence: f64,
    pub last_signal_at: Option<DateTime<Utc>>,
}

impl DetectionStatistics {
    pub(crate) fn record_processed(&mut self, signal: &Signal) {
        self.total_processed += 1;
        if let Some(confidence) = signal.confidence() {
            let n = self.total_processed as f64;
            self.average_confidence += (confidence - self.average_confidence) / n;
        }
        self.last_signal_at = Some(match self.last_signal_at {
            Some(last) if last > signal.timestamp => last,
            _ => signal.timestamp,
        });
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SignalDetectionStatus {
    pub engine_id: String,
    pub state: EngineState,
    pub mode: Option<ProcessingMode>,
    pub initialized_at: Option<DateTime<Utc>>,
    pub statistics: DetectionStatistics,
    pub queue_depth: usize,
    pub history_size: usize,
    pub correlation_cells: usize,
    /// Keys the rate limiter still remembers
    pub rate_limited_keys: usize,
    pub active_allocations: usize,
    pub available_margin: f64,
    pub utilization_rate: f64,
    pub event_count: usize,
    pub last_health_check: Option<HealthSnapshot>,
}
