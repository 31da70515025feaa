//! Signal Detection Engine
//!
//! Owns the lifecycle state machine (INACTIVE -> ACTIVE -> INACTIVE, with
//! ERROR on internal faults) and fronts the filter, history, correlation,
//! ledger and policy components. One value is shared by all callers; every
//! public call is synchronous except `initialize` and `shutdown`, which
//! start and join the periodic workers.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use margin_manager::MarginLedger;
use resilience_core::{
    Clock, EngineConfig, EngineError, EngineResult, EngineState, MarginAllocation,
    MarginDeployment, MarginEvent, MarginUtilization, Priority, Signal, SignalDetectionConfig,
    SignalKey, SystemClock,
};
use signal_detection::{HealthSnapshot, HealthWarning, MetricsSource, NullMetricsSource};
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::bus::ProcessingFailure;
use crate::pipeline::{EngineInner, InternalFault};
use crate::status::{DetectionResult, SignalDetectionStatus};
use crate::workers;

#[derive(Default)]
struct Lifecycle {
    workers: Vec<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

pub struct SignalDetectionEngine {
    inner: Arc<EngineInner>,
    lifecycle: AsyncMutex<Lifecycle>,
}

impl SignalDetectionEngine {
    /// Engine with the system clock and no resource metrics
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        Self::with_dependencies(config, Arc::new(SystemClock), Arc::new(NullMetricsSource))
    }

    pub fn with_dependencies(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSource>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let inner = Arc::new(EngineInner::new(config, clock, metrics));
        tracing::info!(
            engine_id = %inner.engine_id,
            margin_type = %inner.ledger.margin_type(),
            base_capacity = inner.ledger.config().base_capacity,
            policies = inner.policies.policies().len(),
            thresholds = inner.policies.thresholds().len(),
            "Signal detection engine created"
        );
        Ok(Self {
            inner,
            lifecycle: AsyncMutex::new(Lifecycle::default()),
        })
    }

    pub fn engine_id(&self) -> &str {
        &self.inner.engine_id
    }

    pub fn state(&self) -> EngineState {
        self.inner.state()
    }

    /// Validate `config`, start the workers and move to ACTIVE.
    ///
    /// Also the way out of ERROR. Calling it on an ACTIVE engine stops the
    /// current workers, processes anything still queued under the previous
    /// configuration, then applies the new one. An invalid configuration
    /// leaves the engine untouched.
    pub async fn initialize(&self, config: SignalDetectionConfig) -> EngineResult<()> {
        config.validate()?;

        let mut lifecycle = self.lifecycle.lock().await;
        Self::stop_workers(&mut lifecycle).await;

        let previous = self.inner.detection.read().clone();
        if let Some(previous) = previous {
            self.drain_queue(&previous)
                .map_err(|fault| self.escalate(fault))?;
        }

        let config = Arc::new(config);
        *self.inner.detection.write() = Some(config.clone());
        *self.inner.initialized_at.write() = Some(self.inner.clock.now());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        lifecycle.workers = workers::spawn_all(&self.inner, config.clone(), shutdown_rx);
        lifecycle.shutdown_tx = Some(shutdown_tx);

        *self.inner.state.write() = EngineState::Active;
        self.inner.accepting.store(true, Ordering::SeqCst);

        tracing::info!(
            engine_id = %self.inner.engine_id,
            mode = ?config.processing.mode(),
            sources = config.sources.len(),
            min_strength = config.thresholds.min_strength,
            max_frequency = config.thresholds.max_frequency,
            "Signal detection engine initialized"
        );
        Ok(())
    }

    /// Stop accepting signals, cancel the workers and wait for them, process
    /// whatever is still queued, then move to INACTIVE. Safe to call twice.
    pub async fn shutdown(&self) -> EngineResult<DetectionResult> {
        self.inner.accepting.store(false, Ordering::SeqCst);

        let mut lifecycle = self.lifecycle.lock().await;
        Self::stop_workers(&mut lifecycle).await;

        let mut drained = DetectionResult::default();
        let config = self.inner.detection.read().clone();
        if let Some(config) = config {
            drained = self
                .drain_queue(&config)
                .map_err(|fault| self.escalate(fault))?;
        }

        *self.inner.state.write() = EngineState::Inactive;
        tracing::info!(
            engine_id = %self.inner.engine_id,
            drained = drained.processed,
            errors = drained.errors.len(),
            "Signal detection engine shut down"
        );
        Ok(drained)
    }

    async fn stop_workers(lifecycle: &mut Lifecycle) {
        if let Some(tx) = lifecycle.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        for handle in lifecycle.workers.drain(..) {
            if let Err(e) = handle.await {
                tracing::warn!("Worker task ended abnormally: {}", e);
            }
        }
    }

    /// Process the whole queue in `max_batch_size` chunks
    fn drain_queue(
        &self,
        config: &SignalDetectionConfig,
    ) -> Result<DetectionResult, InternalFault> {
        let mut total = DetectionResult::default();
        while !self.inner.queue.lock().is_empty() {
            total.absorb(self.inner.drain_once(config)?);
        }
        Ok(total)
    }

    fn escalate(&self, fault: InternalFault) -> EngineError {
        self.inner.fault(&fault.0);
        EngineError::Processing(fault.0)
    }

    /// Filter a batch, then either process it now (real-time) or queue the
    /// accepted signals for the batch worker.
    pub fn detect_signals(&self, signals: Vec<Signal>) -> EngineResult<DetectionResult> {
        self.inner.ensure_active()?;
        let config = self.inner.active_config()?;

        let received = signals.len();
        let outcome = self.inner.rate_limiter.filter_batch(signals, &config);
        let filtered = outcome.filtered();
        {
            let mut stats = self.inner.statistics.lock();
            stats.total_received += received as u64;
            stats.total_filtered += filtered as u64;
        }

        if config.processing.real_time_processing {
            let mut result = self
                .inner
                .process_batch(outcome.accepted, &config)
                .map_err(|fault| self.escalate(fault))?;
            result.filtered = filtered;
            return Ok(result);
        }

        let queued = outcome.accepted.len();
        {
            let mut queue = self.inner.queue.lock();
            // shutdown may have started after the entry check
            if !self.inner.accepting.load(Ordering::SeqCst) {
                return Err(EngineError::NotActive(self.inner.state()));
            }
            queue.extend(outcome.accepted);
        }
        self.inner.statistics.lock().total_queued += queued as u64;

        tracing::debug!(received, filtered, queued, "Signals queued for batch processing");
        Ok(DetectionResult {
            filtered,
            queued,
            ..Default::default()
        })
    }

    /// Drain one batch now instead of waiting for the next tick
    pub fn process_pending_batch(&self) -> EngineResult<DetectionResult> {
        self.inner.ensure_active()?;
        let config = self.inner.active_config()?;
        self.inner
            .drain_once(&config)
            .map_err(|fault| self.escalate(fault))
    }

    pub fn allocate_margin(
        &self,
        operation_id: &str,
        amount: f64,
        priority: Priority,
        reason: &str,
    ) -> EngineResult<MarginAllocation> {
        self.inner.ensure_active()?;
        self.inner.ledger.allocate(operation_id, amount, priority, reason)
    }

    pub fn deploy_margin(
        &self,
        allocation_id: &str,
        amount: f64,
        reason: &str,
    ) -> EngineResult<MarginDeployment> {
        self.inner.ensure_active()?;
        self.inner.ledger.deploy(allocation_id, amount, reason)
    }

    pub fn recover_margin(
        &self,
        allocation_id: &str,
        reason: &str,
    ) -> EngineResult<MarginUtilization> {
        self.inner.ensure_active()?;
        self.inner.ledger.recover(allocation_id, reason)
    }

    /// Run the expiry sweep now. Returns one utilization record per
    /// recovered allocation.
    pub fn sweep_expired(&self) -> EngineResult<Vec<MarginUtilization>> {
        self.inner.ensure_active()?;
        let recovered = self.inner.ledger.sweep_expired();
        self.inner
            .policies
            .evaluate_ledger(&self.inner.ledger, &self.inner.events, self.inner.clock.now());
        self.inner.evict_idle();
        Ok(recovered)
    }

    /// Sample resource metrics now; warnings go to health subscribers
    pub fn run_health_check(&self) -> EngineResult<HealthSnapshot> {
        self.inner.ensure_active()?;
        self.inner
            .health_check()
            .map_err(|fault| self.escalate(fault))
    }

    /// Point-in-time view. Fields are read one lock at a time, so the
    /// snapshot is not atomic across components.
    pub fn status(&self) -> SignalDetectionStatus {
        let inner = &self.inner;
        let mode = inner
            .detection
            .read()
            .as_ref()
            .map(|config| config.processing.mode());
        let initialized_at = *inner.initialized_at.read();
        let queue_depth = inner.queue.lock().len();
        let history_size = inner.history.read().len();
        let correlation_cells = inner.correlation.lock().len();
        let rate_limited_keys = inner.rate_limiter.tracked_keys();
        let statistics = inner.statistics.lock().clone();

        SignalDetectionStatus {
            engine_id: inner.engine_id.clone(),
            state: inner.state(),
            mode,
            initialized_at,
            statistics,
            queue_depth,
            history_size,
            correlation_cells,
            rate_limited_keys,
            active_allocations: inner.ledger.active_allocation_count(),
            available_margin: inner.ledger.available_margin(),
            utilization_rate: inner.ledger.utilization_rate(),
            event_count: inner.events.len(),
            last_health_check: inner.health.latest(),
        }
    }

    pub fn available_margin(&self) -> f64 {
        self.inner.ledger.available_margin()
    }

    pub fn utilization_rate(&self) -> f64 {
        self.inner.ledger.utilization_rate()
    }

    /// Signals still inside the history window, oldest first; all keys when
    /// `key` is `None`.
    pub fn history(&self, key: Option<&SignalKey>) -> Vec<Signal> {
        let history = self.inner.history.read();
        match key {
            Some(key) => history.for_key(key),
            None => history.all(),
        }
    }

    /// The most recent `limit` margin events, oldest first
    pub fn events(&self, limit: usize) -> Vec<MarginEvent> {
        self.inner.events.recent(limit)
    }

    pub fn ledger(&self) -> &MarginLedger {
        &self.inner.ledger
    }

    pub fn subscribe_signals(&self) -> broadcast::Receiver<Signal> {
        self.inner.bus.subscribe_signals()
    }

    pub fn subscribe_margin_events(&self) -> broadcast::Receiver<MarginEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscribe_health_warnings(&self) -> broadcast::Receiver<HealthWarning> {
        self.inner.bus.subscribe_health_warnings()
    }

    pub fn subscribe_processing_errors(&self) -> broadcast::Receiver<ProcessingFailure> {
        self.inner.bus.subscribe_processing_errors()
    }
}
