//! Margin Ledger
//!
//! Owns allocations and their deployments for one margin type. All state sits
//! behind a single lock; events are recorded while it is held so the audit log
//! order matches the order of ledger mutations.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use resilience_core::{
    AllocationMetadata, Clock, DeploymentStatus, EngineError, EngineResult, EventRecorder,
    LedgerConfig, MarginAllocation, MarginDeployment, MarginEvent, MarginEventType, MarginType,
    MarginUtilization, Priority,
};
use std::collections::HashMap;
use std::sync::Arc;

const EPSILON: f64 = 1e-9;

struct AllocationRecord {
    allocation: MarginAllocation,
    deployments: Vec<MarginDeployment>,
    /// Utilization after allocation and after each deployment
    samples: Vec<f64>,
    /// Insertion order, used to find the most recent allocation of an operation
    seq: u64,
}

impl AllocationRecord {
    fn deployed(&self) -> f64 {
        self.deployments
            .iter()
            .filter(|d| d.status == DeploymentStatus::Active)
            .map(|d| d.amount)
            .sum()
    }

    fn remaining(&self) -> f64 {
        self.allocation.amount - self.deployed()
    }
}

#[derive(Default)]
struct LedgerState {
    allocations: HashMap<String, AllocationRecord>,
    utilization_history: Vec<MarginUtilization>,
    next_seq: u64,
}

impl LedgerState {
    fn total_allocated(&self) -> f64 {
        self.allocations.values().map(|r| r.allocation.amount).sum()
    }

    fn total_deployed(&self) -> f64 {
        self.allocations.values().map(|r| r.deployed()).sum()
    }
}

pub struct MarginLedger {
    config: LedgerConfig,
    state: Mutex<LedgerState>,
    events: Arc<EventRecorder>,
    clock: Arc<dyn Clock>,
}

impl MarginLedger {
    pub fn new(config: LedgerConfig, events: Arc<EventRecorder>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            state: Mutex::new(LedgerState::default()),
            events,
            clock,
        }
    }

    pub fn margin_type(&self) -> MarginType {
        self.config.margin_type
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// base capacity + active allocations - active deployments
    pub fn available_margin(&self) -> f64 {
        let state = self.state.lock();
        self.available_locked(&state)
    }

    fn available_locked(&self, state: &LedgerState) -> f64 {
        self.config.base_capacity + state.total_allocated() - state.total_deployed()
    }

    /// Deployed share of everything allocated (0 when nothing is allocated)
    pub fn utilization_rate(&self) -> f64 {
        let state = self.state.lock();
        Self::utilization_locked(&state)
    }

    fn utilization_locked(state: &LedgerState) -> f64 {
        let allocated = state.total_allocated();
        if allocated <= 0.0 {
            0.0
        } else {
            (state.total_deployed() / allocated).clamp(0.0, 1.0)
        }
    }

    pub fn total_allocated(&self) -> f64 {
        self.state.lock().total_allocated()
    }

    pub fn total_deployed(&self) -> f64 {
        self.state.lock().total_deployed()
    }

    pub fn active_allocation_count(&self) -> usize {
        self.state.lock().allocations.len()
    }

    /// Reserve `amount` for `operation_id` with the configured lifetime
    pub fn allocate(
        &self,
        operation_id: &str,
        amount: f64,
        priority: Priority,
        reason: &str,
    ) -> EngineResult<MarginAllocation> {
        let ttl = Duration::seconds(self.config.default_allocation_ttl_secs);
        self.allocate_with_ttl(operation_id, amount, priority, reason, ttl)
    }

    pub fn allocate_with_ttl(
        &self,
        operation_id: &str,
        amount: f64,
        priority: Priority,
        reason: &str,
        ttl: Duration,
    ) -> EngineResult<MarginAllocation> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(EngineError::InvalidArgument(format!(
                "allocation amount must be positive, got {}",
                amount
            )));
        }
        if operation_id.is_empty() {
            return Err(EngineError::InvalidArgument(
                "operation id must not be empty".to_string(),
            ));
        }

        let now = self.clock.now();
        let mut state = self.state.lock();

        if state.allocations.len() >= self.config.max_concurrent_allocations {
            tracing::warn!(
                operation_id,
                active = state.allocations.len(),
                max = self.config.max_concurrent_allocations,
                "Allocation rejected: concurrent allocation limit reached"
            );
            return Err(EngineError::Capacity(format!(
                "maximum concurrent allocations ({}) reached",
                self.config.max_concurrent_allocations
            )));
        }

        let available = self.available_locked(&state);
        if amount > available + EPSILON {
            tracing::warn!(
                operation_id,
                amount,
                available,
                "Allocation rejected: insufficient margin"
            );
            return Err(EngineError::Capacity(format!(
                "requested {:.2} exceeds available margin {:.2}",
                amount, available
            )));
        }

        let allocation = MarginAllocation {
            id: uuid::Uuid::new_v4().to_string(),
            margin_type: self.config.margin_type,
            amount,
            utilization_rate: 0.0,
            allocated_at: now,
            expires_at: now + ttl,
            metadata: AllocationMetadata {
                operation_id: operation_id.to_string(),
                priority,
                reason: reason.to_string(),
            },
        };

        let seq = state.next_seq;
        state.next_seq += 1;
        state.allocations.insert(
            allocation.id.clone(),
            AllocationRecord {
                allocation: allocation.clone(),
                deployments: Vec::new(),
                samples: vec![0.0],
                seq,
            },
        );

        tracing::info!(
            allocation_id = %allocation.id,
            operation_id,
            amount,
            margin_type = %self.config.margin_type,
            "Margin allocated"
        );
        self.events.record(
            MarginEvent::new(
                MarginEventType::Allocation,
                self.config.margin_type,
                now,
                format!(
                    "Allocated {:.2} {} margin to {} ({})",
                    amount, self.config.margin_type, operation_id, reason
                ),
                amount / available.max(amount),
            )
            .with_allocation(&allocation.id),
        );

        Ok(allocation)
    }

    /// Consume part of an allocation
    pub fn deploy(
        &self,
        allocation_id: &str,
        amount: f64,
        reason: &str,
    ) -> EngineResult<MarginDeployment> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(EngineError::InvalidArgument(format!(
                "deployment amount must be positive, got {}",
                amount
            )));
        }

        let now = self.clock.now();
        let mut state = self.state.lock();
        let record = state
            .allocations
            .get_mut(allocation_id)
            .ok_or_else(|| EngineError::NotFound(format!("allocation {}", allocation_id)))?;

        let remaining = record.remaining();
        if amount > remaining + EPSILON {
            tracing::warn!(
                allocation_id,
                amount,
                remaining,
                "Deployment rejected: exceeds remaining allocation"
            );
            return Err(EngineError::Capacity(format!(
                "deployment {:.2} exceeds remaining allocation {:.2}",
                amount, remaining
            )));
        }

        let deployment = MarginDeployment {
            id: uuid::Uuid::new_v4().to_string(),
            allocation_id: allocation_id.to_string(),
            deployed_at: now,
            amount,
            reason: reason.to_string(),
            status: DeploymentStatus::Active,
        };
        record.deployments.push(deployment.clone());
        let rate = (record.deployed() / record.allocation.amount).clamp(0.0, 1.0);
        record.allocation.utilization_rate = rate;
        record.samples.push(rate);
        let impact = amount / record.allocation.amount;

        tracing::info!(
            allocation_id,
            deployment_id = %deployment.id,
            amount,
            utilization = rate,
            "Margin deployed"
        );
        self.events.record(
            MarginEvent::new(
                MarginEventType::Deployment,
                self.config.margin_type,
                now,
                format!("Deployed {:.2} from allocation {} ({})", amount, allocation_id, reason),
                impact,
            )
            .with_allocation(allocation_id),
        );

        Ok(deployment)
    }

    /// Close an allocation and its deployments, returning the utilization record
    pub fn recover(&self, allocation_id: &str, reason: &str) -> EngineResult<MarginUtilization> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.recover_locked(&mut state, allocation_id, reason, now)
    }

    fn recover_locked(
        &self,
        state: &mut LedgerState,
        allocation_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<MarginUtilization> {
        let mut record = state
            .allocations
            .remove(allocation_id)
            .ok_or_else(|| EngineError::NotFound(format!("allocation {}", allocation_id)))?;

        let deployed = record.deployed();
        for deployment in record.deployments.iter_mut() {
            deployment.status = DeploymentStatus::Closed;
        }

        let utilization_rate = deployed / record.allocation.amount;
        let peak_utilization = record.samples.iter().copied().fold(0.0, f64::max);
        let average_utilization =
            record.samples.iter().sum::<f64>() / record.samples.len().max(1) as f64;

        let utilization = MarginUtilization {
            allocation_id: allocation_id.to_string(),
            margin_type: record.allocation.margin_type,
            utilization_rate,
            peak_utilization,
            average_utilization,
            timestamp: now,
            duration_secs: (now - record.allocation.allocated_at).num_seconds(),
        };
        state.utilization_history.push(utilization.clone());

        let returned = record.allocation.amount - deployed;
        tracing::info!(
            allocation_id,
            operation_id = %record.allocation.metadata.operation_id,
            utilization = utilization_rate,
            returned,
            reason,
            "Margin recovered"
        );
        self.events.record(
            MarginEvent::new(
                MarginEventType::Recovery,
                record.allocation.margin_type,
                now,
                format!(
                    "Recovered allocation {} ({}): {:.1}% utilized, {:.2} returned",
                    allocation_id,
                    reason,
                    utilization_rate * 100.0,
                    returned
                ),
                utilization_rate,
            )
            .with_allocation(allocation_id),
        );

        Ok(utilization)
    }

    /// Recover every allocation whose lifetime has elapsed. A summary
    /// OPTIMIZATION event is appended when anything was reclaimed.
    pub fn sweep_expired(&self) -> Vec<MarginUtilization> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let mut expired: Vec<(u64, String)> = state
            .allocations
            .values()
            .filter(|r| r.allocation.is_expired(now))
            .map(|r| (r.seq, r.allocation.id.clone()))
            .collect();
        expired.sort();

        if expired.is_empty() {
            return Vec::new();
        }

        let total_before = state.total_allocated();
        let mut recovered = Vec::with_capacity(expired.len());
        let mut reclaimed = 0.0;
        for (_, id) in expired {
            let amount = state
                .allocations
                .get(&id)
                .map(|r| r.remaining())
                .unwrap_or(0.0);
            if let Ok(utilization) = self.recover_locked(&mut state, &id, "expired", now) {
                reclaimed += amount;
                recovered.push(utilization);
            }
        }

        self.events.record(MarginEvent::new(
            MarginEventType::Optimization,
            self.config.margin_type,
            now,
            format!(
                "Expiry sweep recovered {} allocation(s), {:.2} undeployed margin reclaimed",
                recovered.len(),
                reclaimed
            ),
            if total_before > 0.0 { reclaimed / total_before } else { 0.0 },
        ));

        recovered
    }

    /// Active allocations, oldest first
    pub fn allocations(&self) -> Vec<MarginAllocation> {
        let state = self.state.lock();
        let mut records: Vec<&AllocationRecord> = state.allocations.values().collect();
        records.sort_by_key(|r| r.seq);
        records.into_iter().map(|r| r.allocation.clone()).collect()
    }

    pub fn allocation(&self, allocation_id: &str) -> Option<MarginAllocation> {
        self.state
            .lock()
            .allocations
            .get(allocation_id)
            .map(|r| r.allocation.clone())
    }

    /// Most recently created active allocation for an operation
    pub fn latest_for_operation(&self, operation_id: &str) -> Option<MarginAllocation> {
        self.state
            .lock()
            .allocations
            .values()
            .filter(|r| r.allocation.metadata.operation_id == operation_id)
            .max_by_key(|r| r.seq)
            .map(|r| r.allocation.clone())
    }

    pub fn deployments(&self, allocation_id: &str) -> EngineResult<Vec<MarginDeployment>> {
        self.state
            .lock()
            .allocations
            .get(allocation_id)
            .map(|r| r.deployments.clone())
            .ok_or_else(|| EngineError::NotFound(format!("allocation {}", allocation_id)))
    }

    pub fn utilization_history(&self) -> Vec<MarginUtilization> {
        self.state.lock().utilization_history.clone()
    }
}
