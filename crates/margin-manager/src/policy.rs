//! Policy Engine
//!
//! Evaluates condition/action policies against processed signals and ledger
//! state, and checks utilization thresholds. Action failures are recorded as
//! events and never stop later actions or policies.

use chrono::{DateTime, Utc};
use resilience_core::{
    Action, Condition, EngineError, EventRecorder, MarginAllocation, MarginDeployment,
    MarginEvent, MarginEventType, MarginPolicy, MarginThreshold, Signal, ThresholdLevel,
};

use crate::ledger::MarginLedger;

/// Inputs a condition may look at
#[derive(Debug, Clone, Copy)]
pub struct PolicyContext<'a> {
    pub signal: Option<&'a Signal>,
    pub utilization: f64,
    pub now: DateTime<Utc>,
}

/// SIGNAL and RISK conditions are false without a triggering signal.
pub fn evaluate_condition(condition: &Condition, ctx: &PolicyContext<'_>) -> bool {
    match condition {
        Condition::Signal { operator, value } => match ctx.signal {
            Some(signal) if operator.is_equality() => operator.compare(&signal.signal_type, value),
            Some(_) => {
                tracing::debug!(?operator, "SIGNAL conditions only support EQ/NE");
                false
            }
            None => false,
        },
        Condition::Utilization { operator, value } => operator.compare(&ctx.utilization, value),
        Condition::Time { operator, value } => operator.compare(&ctx.now, value),
        Condition::Risk { operator, value } => ctx
            .signal
            .map(|s| operator.compare(&s.severity.risk_score(), value))
            .unwrap_or(false),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionFailure {
    pub policy_id: String,
    pub error: EngineError,
}

#[derive(Debug, Clone, Default)]
pub struct EvaluationReport {
    /// Policies whose conditions all held, in evaluation order
    pub triggered: Vec<String>,
    pub allocations: Vec<MarginAllocation>,
    pub deployments: Vec<MarginDeployment>,
    pub failures: Vec<ActionFailure>,
    pub threshold_level: Option<ThresholdLevel>,
}

pub struct PolicyEngine {
    /// Sorted by ascending priority; ties keep declaration order
    policies: Vec<MarginPolicy>,
    thresholds: Vec<MarginThreshold>,
}

impl PolicyEngine {
    pub fn new(mut policies: Vec<MarginPolicy>, thresholds: Vec<MarginThreshold>) -> Self {
        policies.sort_by_key(|p| p.priority);
        Self {
            policies,
            thresholds,
        }
    }

    pub fn policies(&self) -> &[MarginPolicy] {
        &self.policies
    }

    pub fn thresholds(&self) -> &[MarginThreshold] {
        &self.thresholds
    }

    /// Run every active policy for the ledger's margin type against a processed signal,
    /// then check thresholds against the resulting utilization.
    pub fn evaluate_signal(
        &self,
        signal: &Signal,
        ledger: &MarginLedger,
        events: &EventRecorder,
        now: DateTime<Utc>,
    ) -> EvaluationReport {
        let mut report = self.run_policies(Some(signal), ledger, events, now);
        report.threshold_level = self.check_thresholds(ledger, events, now);
        report
    }

    /// Run policies against ledger state alone (periodic sweep)
    pub fn evaluate_ledger(
        &self,
        ledger: &MarginLedger,
        events: &EventRecorder,
        now: DateTime<Utc>,
    ) -> EvaluationReport {
        self.run_policies(None, ledger, events, now)
    }

    fn run_policies(
        &self,
        signal: Option<&Signal>,
        ledger: &MarginLedger,
        events: &EventRecorder,
        now: DateTime<Utc>,
    ) -> EvaluationReport {
        let mut report = EvaluationReport::default();

        for policy in self
            .policies
            .iter()
            .filter(|p| p.active && p.margin_type == ledger.margin_type())
        {
            // Utilization is re-read per policy so earlier actions are visible
            let ctx = PolicyContext {
                signal,
                utilization: ledger.utilization_rate(),
                now,
            };
            if !policy.conditions.iter().all(|c| evaluate_condition(c, &ctx)) {
                continue;
            }

            tracing::info!(
                policy_id = %policy.id,
                signal_id = signal.map(|s| s.id.as_str()).unwrap_or("-"),
                "Policy triggered"
            );
            report.triggered.push(policy.id.clone());

            for action in &policy.actions {
                self.execute_action(policy, action, signal, ledger, events, now, &mut report);
            }
        }

        report
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_action(
        &self,
        policy: &MarginPolicy,
        action: &Action,
        signal: Option<&Signal>,
        ledger: &MarginLedger,
        events: &EventRecorder,
        now: DateTime<Utc>,
        report: &mut EvaluationReport,
    ) {
        let trigger = signal
            .map(|s| format!("signal {}", s.id))
            .unwrap_or_else(|| "ledger state".to_string());

        let result = match action {
            Action::Allocate {
                amount,
                priority,
                reason,
            } => {
                let reason = reason
                    .clone()
                    .unwrap_or_else(|| format!("policy {} triggered by {}", policy.id, trigger));
                ledger
                    .allocate(&policy.operation_id(), *amount, *priority, &reason)
                    .map(|allocation| report.allocations.push(allocation))
            }
            Action::Deploy { amount, reason } => {
                let reason = reason
                    .clone()
                    .unwrap_or_else(|| format!("policy {} triggered by {}", policy.id, trigger));
                let operation_id = policy.operation_id();
                match ledger.latest_for_operation(&operation_id) {
                    Some(allocation) => ledger
                        .deploy(&allocation.id, *amount, &reason)
                        .map(|deployment| report.deployments.push(deployment)),
                    None => Err(EngineError::NotFound(format!(
                        "no active allocation for operation {}",
                        operation_id
                    ))),
                }
            }
            Action::Alert { message } => {
                let impact = signal.map(|s| s.severity.risk_score()).unwrap_or(0.5);
                events.record(
                    MarginEvent::new(
                        MarginEventType::PolicyTrigger,
                        policy.margin_type,
                        now,
                        format!("ALERT from policy {} ({}): {}", policy.id, trigger, message),
                        impact,
                    )
                    .with_policy(&policy.id),
                );
                Ok(())
            }
            Action::Escalate { message } => {
                events.record(
                    MarginEvent::new(
                        MarginEventType::PolicyTrigger,
                        policy.margin_type,
                        now,
                        format!("ESCALATE from policy {} ({}): {}", policy.id, trigger, message),
                        1.0,
                    )
                    .with_policy(&policy.id),
                );
                Ok(())
            }
        };

        if let Err(error) = result {
            tracing::warn!(policy_id = %policy.id, %error, "Policy action failed");
            let event_type = match error {
                EngineError::Capacity(_) => MarginEventType::Exhaustion,
                _ => MarginEventType::PolicyTrigger,
            };
            events.record(
                MarginEvent::new(
                    event_type,
                    policy.margin_type,
                    now,
                    format!("Policy {} action failed: {}", policy.id, error),
                    ledger.utilization_rate(),
                )
                .with_policy(&policy.id),
            );
            report.failures.push(ActionFailure {
                policy_id: policy.id.clone(),
                error,
            });
        }
    }

    /// Append one THRESHOLD_BREACH event per threshold the current utilization
    /// has crossed. Returns the highest level reached.
    pub fn check_thresholds(
        &self,
        ledger: &MarginLedger,
        events: &EventRecorder,
        now: DateTime<Utc>,
    ) -> Option<ThresholdLevel> {
        let utilization = ledger.utilization_rate();
        let mut highest = None;

        for threshold in self
            .thresholds
            .iter()
            .filter(|t| t.margin_type == ledger.margin_type())
        {
            let Some(level) = threshold.level_for(utilization) else {
                continue;
            };
            tracing::warn!(
                threshold_id = %threshold.id,
                ?level,
                utilization,
                "Margin threshold breached"
            );
            events.record(MarginEvent::new(
                MarginEventType::ThresholdBreach,
                threshold.margin_type,
                now,
                format!(
                    "{} margin utilization {:.1}% reached {:?} level of threshold {}",
                    threshold.margin_type,
                    utilization * 100.0,
                    level,
                    threshold.id
                ),
                utilization,
            ));
            highest = highest.max(Some(level));
        }

        highest
    }
}
