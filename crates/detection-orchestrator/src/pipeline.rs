//! Shared engine state and the per-signal processing pipeline.
//!
//! Lock order, for any path holding more than one:
//! queue -> history -> correlation -> ledger -> events -> statistics.

use chrono::{DateTime, Duration, Utc};
use margin_manager::{MarginLedger, PolicyEngine};
use parking_lot::{Mutex, RwLock};
use resilience_core::{
    Clock, DetectionMetadata, EngineConfig, EngineError, EngineResult, EngineState,
    EventRecorder, Signal, SignalDetectionConfig, SignalKey,
};
use signal_detection::{
    detection_confidence, CorrelationMatrix, EngineLoad, HealthMonitor, HealthSnapshot,
    MetricsSource, RateLimiter, SignalHistory, CORRELATION_WINDOW_SECS,
};
use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::bus::{EventBus, ProcessingFailure};
use crate::status::{DetectionResult, DetectionStatistics};

/// An uncaught panic inside the pipeline
#[derive(Debug)]
pub(crate) struct InternalFault(pub String);

pub(crate) struct EngineInner {
    pub engine_id: String,
    pub settings: EngineConfig,
    pub clock: Arc<dyn Clock>,
    pub state: RwLock<EngineState>,
    /// Set while initialized; cleared first thing on shutdown
    pub accepting: AtomicBool,
    pub detection: RwLock<Option<Arc<SignalDetectionConfig>>>,
    pub initialized_at: RwLock<Option<DateTime<Utc>>>,
    pub rate_limiter: RateLimiter,
    pub queue: Mutex<VecDeque<Signal>>,
    pub history: RwLock<SignalHistory>,
    pub correlation: Mutex<CorrelationMatrix>,
    pub ledger: MarginLedger,
    pub policies: PolicyEngine,
    pub events: Arc<EventRecorder>,
    pub health: HealthMonitor,
    pub statistics: Mutex<DetectionStatistics>,
    pub bus: EventBus,
}

impl EngineInner {
    pub fn new(
        settings: EngineConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSource>,
    ) -> Self {
        let events = Arc::new(EventRecorder::new(settings.event_retention));
        let ledger = MarginLedger::new(settings.ledger.clone(), events.clone(), clock.clone());
        let policies = PolicyEngine::new(settings.policies.clone(), settings.thresholds.clone());
        let history = SignalHistory::new(Duration::seconds(settings.history_window_secs));

        Self {
            engine_id: uuid::Uuid::new_v4().to_string(),
            settings,
            clock,
            state: RwLock::new(EngineState::Inactive),
            accepting: AtomicBool::new(false),
            detection: RwLock::new(None),
            initialized_at: RwLock::new(None),
            rate_limiter: RateLimiter::new(),
            queue: Mutex::new(VecDeque::new()),
            history: RwLock::new(history),
            correlation: Mutex::new(CorrelationMatrix::new()),
            ledger,
            policies,
            events,
            health: HealthMonitor::new(metrics),
            statistics: Mutex::new(DetectionStatistics::default()),
            bus: EventBus::new(),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    pub fn ensure_active(&self) -> EngineResult<()> {
        let state = self.state();
        if state != EngineState::Active || !self.accepting.load(Ordering::SeqCst) {
            return Err(EngineError::NotActive(state));
        }
        Ok(())
    }

    pub fn active_config(&self) -> EngineResult<Arc<SignalDetectionConfig>> {
        self.detection
            .read()
            .clone()
            .ok_or(EngineError::NotActive(self.state()))
    }

    /// Move to ERROR; every later call fails fast until re-initialized
    pub fn fault(&self, reason: &str) {
        tracing::error!(engine_id = %self.engine_id, reason, "Engine fault, entering ERROR state");
        self.accepting.store(false, Ordering::SeqCst);
        *self.state.write() = EngineState::Error;
    }

    /// Enrich, store and evaluate policies for one accepted signal
    pub fn process_signal(
        &self,
        mut signal: Signal,
        config: &SignalDetectionConfig,
    ) -> EngineResult<Signal> {
        if signal.id.trim().is_empty() {
            return Err(EngineError::Processing("signal id must not be empty".to_string()));
        }
        if !signal.strength.is_finite() || !(0.0..=100.0).contains(&signal.strength) {
            return Err(EngineError::Processing(format!(
                "signal {} strength {} outside 0-100",
                signal.id, signal.strength
            )));
        }

        let now = self.clock.now();
        let pruned = {
            let mut history = self.history.write();
            let mut matrix = self.correlation.lock();

            let correlation_score = if config.processing.enable_correlation {
                matrix.correlate(&signal, &history)
            } else {
                0.0
            };
            signal.detection = Some(DetectionMetadata {
                detected_at: now,
                correlation_score,
                confidence: detection_confidence(&signal, correlation_score),
            });

            history.insert(signal.clone());
            let pruned = history.prune(now);
            if pruned > 0 {
                let live: HashSet<SignalKey> = history.keys().cloned().collect();
                matrix.retain_keys(&live);
                let evicted = evict_stale_cells(&mut matrix, signal.timestamp);
                tracing::debug!(pruned, evicted, keys = history.key_count(), "History pruned");
            }
            pruned
        };
        if pruned > 0 {
            self.evict_idle_keys(signal.timestamp, config);
        }

        let report = self.policies.evaluate_signal(&signal, &self.ledger, &self.events, now);
        if !report.failures.is_empty() {
            tracing::debug!(
                signal_id = %signal.id,
                failures = report.failures.len(),
                "Policy actions failed for signal"
            );
        }

        tracing::debug!(
            signal_id = %signal.id,
            key = %signal.key(),
            confidence = signal.confidence().unwrap_or_default(),
            policies_triggered = report.triggered.len(),
            "Signal processed"
        );
        self.statistics.lock().record_processed(&signal);
        self.bus.publish_signal(&signal);
        Ok(signal)
    }

    /// Process accepted signals one by one. Per-signal errors are collected;
    /// a panic stops the batch and is reported as an internal fault.
    pub fn process_batch(
        &self,
        batch: Vec<Signal>,
        config: &SignalDetectionConfig,
    ) -> Result<DetectionResult, InternalFault> {
        let mut result = DetectionResult::default();

        for signal in batch {
            let signal_id = signal.id.clone();
            let outcome = catch_unwind(AssertUnwindSafe(|| self.process_signal(signal, config)));

            match outcome {
                Ok(Ok(processed)) => {
                    result.processed += 1;
                    result.results.push(processed);
                }
                Ok(Err(error)) => {
                    tracing::warn!(signal_id = %signal_id, %error, "Signal processing failed");
                    let failure = ProcessingFailure {
                        signal_id,
                        error,
                        timestamp: self.clock.now(),
                    };
                    self.statistics.lock().total_errors += 1;
                    self.bus.publish_processing_error(&failure);
                    result.errors.push(failure);
                }
                Err(payload) => {
                    return Err(InternalFault(format!(
                        "panic while processing signal {}: {}",
                        signal_id,
                        panic_message(payload.as_ref())
                    )));
                }
            }
        }

        Ok(result)
    }

    /// Pop up to `max_batch_size` queued signals and process them
    pub fn drain_once(
        &self,
        config: &SignalDetectionConfig,
    ) -> Result<DetectionResult, InternalFault> {
        let batch: Vec<Signal> = {
            let mut queue = self.queue.lock();
            let take = queue.len().min(config.processing.max_batch_size.max(1));
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return Ok(DetectionResult::default());
        }

        let size = batch.len();
        let result = self.process_batch(batch, config)?;
        self.statistics.lock().batches_processed += 1;
        tracing::debug!(
            batch_size = size,
            processed = result.processed,
            errors = result.errors.len(),
            "Batch drained"
        );
        Ok(result)
    }

    /// Each counter is read under its own lock, one at a time
    pub fn load(&self) -> EngineLoad {
        let queue_depth = self.queue.lock().len();
        let history_size = self.history.read().len();
        let active_allocations = self.ledger.active_allocation_count();
        EngineLoad {
            history_size,
            queue_depth,
            active_allocations,
        }
    }

    /// Sample resource metrics and publish any warnings. A panicking metrics
    /// source is an internal fault.
    pub fn health_check(&self) -> Result<HealthSnapshot, InternalFault> {
        let load = self.load();
        let now = self.clock.now();
        let snapshot = catch_unwind(AssertUnwindSafe(|| self.health.check(now, load)))
            .map_err(|payload| {
                InternalFault(format!(
                    "panic during health check: {}",
                    panic_message(payload.as_ref())
                ))
            })?;

        for warning in &snapshot.warnings {
            self.bus.publish_health_warning(warning);
        }
        Ok(snapshot)
    }

    /// Forget rate-limit keys idle for longer than both the history window
    /// and the minimum spacing, measured back from `reference`.
    fn evict_idle_keys(&self, reference: DateTime<Utc>, config: &SignalDetectionConfig) {
        let window = self.history.read().window();
        let min_interval =
            Duration::microseconds((config.thresholds.min_interval_ms() * 1000.0) as i64);
        let Some(cutoff) = reference.checked_sub_signed(window.max(min_interval)) else {
            return;
        };
        let evicted = self.rate_limiter.evict_before(cutoff);
        if evicted > 0 {
            tracing::debug!(
                evicted,
                tracked = self.rate_limiter.tracked_keys(),
                "Idle rate-limit keys evicted"
            );
        }
    }

    /// Drop idle rate-limit keys and stale correlation cells, measured back
    /// from the newest processed signal
    pub fn evict_idle(&self) {
        let newest = self.statistics.lock().last_signal_at;
        let config = self.detection.read().clone();
        if let (Some(newest), Some(config)) = (newest, config) {
            evict_stale_cells(&mut self.correlation.lock(), newest);
            self.evict_idle_keys(newest, &config);
        }
    }

    /// Recover expired allocations, evaluate ledger-only policies, then drop
    /// idle rate-limit keys and stale correlation cells
    pub fn sweep(&self) -> Result<usize, InternalFault> {
        catch_unwind(AssertUnwindSafe(|| {
            let recovered = self.ledger.sweep_expired();
            if !recovered.is_empty() {
                tracing::info!(recovered = recovered.len(), "Expired allocations recovered");
            }
            self.policies
                .evaluate_ledger(&self.ledger, &self.events, self.clock.now());
            self.evict_idle();
            recovered.len()
        }))
        .map_err(|payload| {
            InternalFault(format!(
                "panic during expiry sweep: {}",
                panic_message(payload.as_ref())
            ))
        })
    }
}

/// Cells last refreshed more than one correlation window before `newest`
fn evict_stale_cells(matrix: &mut CorrelationMatrix, newest: DateTime<Utc>) -> usize {
    match newest.checked_sub_signed(Duration::seconds(CORRELATION_WINDOW_SECS)) {
        Some(cutoff) => matrix.evict_before(cutoff),
        None => 0,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
