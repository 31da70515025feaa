#[cfg(test)]
mod ledger_tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use resilience_core::{
        EngineError, EventRecorder, LedgerConfig, ManualClock, MarginEventType, MarginType,
        Priority,
    };

    use crate::ledger::MarginLedger;

    fn setup(
        base_capacity: f64,
        max_concurrent: usize,
    ) -> (MarginLedger, Arc<EventRecorder>, Arc<ManualClock>) {
        let events = Arc::new(EventRecorder::new(1_000));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let config = LedgerConfig {
            margin_type: MarginType::Time,
            base_capacity,
            max_concurrent_allocations: max_concurrent,
            default_allocation_ttl_secs: 600,
        };
        let ledger = MarginLedger::new(config, events.clone(), clock.clone());
        (ledger, events, clock)
    }

    #[test]
    fn allocate_deploy_recover_lifecycle() {
        let (ledger, events, _) = setup(60.0, 5);

        let allocation = ledger
            .allocate("X", 30.0, Priority::Medium, "pre-position buffer")
            .unwrap();
        assert_eq!(allocation.metadata.operation_id, "X");
        assert_eq!(ledger.available_margin(), 90.0);

        ledger.deploy(&allocation.id, 10.0, "shift delay").unwrap();
        assert_eq!(ledger.available_margin(), 80.0);
        assert!((ledger.utilization_rate() - 1.0 / 3.0).abs() < 1e-12);

        let utilization = ledger.recover(&allocation.id, "operation complete").unwrap();
        assert_eq!(utilization.utilization_rate, 1.0 / 3.0);
        assert_eq!(utilization.peak_utilization, 1.0 / 3.0);
        assert!((utilization.average_utilization - 1.0 / 6.0).abs() < 1e-12);
        assert_eq!(ledger.active_allocation_count(), 0);
        assert_eq!(ledger.available_margin(), 60.0);
        assert_eq!(ledger.utilization_history().len(), 1);

        let types: Vec<MarginEventType> = events.recent(10).iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                MarginEventType::Allocation,
                MarginEventType::Deployment,
                MarginEventType::Recovery
            ]
        );
    }

    #[test]
    fn allocation_above_available_is_rejected_without_mutation() {
        let (ledger, events, _) = setup(20.0, 5);

        let err = ledger.allocate("big", 20.5, Priority::High, "too much").unwrap_err();
        assert!(matches!(err, EngineError::Capacity(_)));
        assert_eq!(ledger.active_allocation_count(), 0);
        assert_eq!(ledger.available_margin(), 20.0);
        assert!(events.is_empty());

        // exactly the available amount fits
        assert!(ledger.allocate("fits", 20.0, Priority::High, "ok").is_ok());
    }

    #[test]
    fn concurrent_allocation_limit() {
        let (ledger, _, _) = setup(100.0, 2);

        let first = ledger.allocate("a", 5.0, Priority::Low, "a").unwrap();
        let second = ledger.allocate("b", 5.0, Priority::Low, "b").unwrap();
        let err = ledger.allocate("c", 5.0, Priority::Low, "c").unwrap_err();
        assert!(matches!(err, EngineError::Capacity(_)));

        assert!(ledger.allocation(&first.id).is_some());
        assert!(ledger.allocation(&second.id).is_some());
        assert_eq!(ledger.active_allocation_count(), 2);
    }

    #[test]
    fn over_deployment_is_atomic() {
        let (ledger, events, _) = setup(50.0, 5);
        let allocation = ledger.allocate("op", 10.0, Priority::Medium, "r").unwrap();
        ledger.deploy(&allocation.id, 6.0, "first").unwrap();
        let events_before = events.len();

        let err = ledger.deploy(&allocation.id, 4.5, "second").unwrap_err();
        assert!(matches!(err, EngineError::Capacity(_)));
        assert_eq!(ledger.deployments(&allocation.id).unwrap().len(), 1);
        assert_eq!(ledger.total_deployed(), 6.0);
        assert_eq!(events.len(), events_before);

        // remaining capacity can still be used in full
        ledger.deploy(&allocation.id, 4.0, "rest").unwrap();
        assert_eq!(ledger.allocation(&allocation.id).unwrap().utilization_rate, 1.0);
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let (ledger, _, _) = setup(50.0, 5);
        assert!(matches!(
            ledger.deploy("missing", 1.0, "r"),
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            ledger.recover("missing", "r"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn double_recover_fails_second_time() {
        let (ledger, _, _) = setup(50.0, 5);
        let allocation = ledger.allocate("op", 10.0, Priority::Medium, "r").unwrap();
        ledger.recover(&allocation.id, "done").unwrap();
        assert!(matches!(
            ledger.recover(&allocation.id, "done"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn invalid_amounts_rejected() {
        let (ledger, _, _) = setup(50.0, 5);
        assert!(matches!(
            ledger.allocate("op", 0.0, Priority::Medium, "r"),
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(matches!(
            ledger.allocate("op", f64::NAN, Priority::Medium, "r"),
            Err(EngineError::InvalidArgument(_))
        ));
        let allocation = ledger.allocate("op", 5.0, Priority::Medium, "r").unwrap();
        assert!(matches!(
            ledger.deploy(&allocation.id, -1.0, "r"),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn sweep_recovers_only_expired_allocations() {
        let (ledger, events, clock) = setup(100.0, 5);
        let short = ledger
            .allocate_with_ttl("short", 10.0, Priority::Low, "r", Duration::seconds(30))
            .unwrap();
        let long = ledger.allocate("long", 10.0, Priority::Low, "r").unwrap();
        ledger.deploy(&short.id, 2.5, "partial").unwrap();

        assert!(ledger.sweep_expired().is_empty());

        clock.advance(Duration::seconds(31));
        let swept = ledger.sweep_expired();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].allocation_id, short.id);
        assert_eq!(swept[0].utilization_rate, 0.25);
        assert_eq!(swept[0].duration_secs, 31);
        assert!(ledger.allocation(&long.id).is_some());

        let recent = events.recent(2);
        assert_eq!(recent[0].event_type, MarginEventType::Recovery);
        assert!(recent[0].description.contains("expired"));
        assert_eq!(recent[1].event_type, MarginEventType::Optimization);
    }

    #[test]
    fn latest_for_operation_picks_newest() {
        let (ledger, _, _) = setup(100.0, 5);
        ledger.allocate("op", 5.0, Priority::Low, "first").unwrap();
        let newer = ledger.allocate("op", 7.0, Priority::Low, "second").unwrap();
        ledger.allocate("other", 3.0, Priority::Low, "third").unwrap();

        assert_eq!(ledger.latest_for_operation("op").unwrap().id, newer.id);
        assert!(ledger.latest_for_operation("nobody").is_none());
        assert_eq!(ledger.allocations().len(), 3);
        assert_eq!(ledger.allocations()[0].metadata.reason, "first");
    }

    #[test]
    fn concurrent_callers_do_not_exceed_limits() {
        let (ledger, _, _) = setup(1_000.0, 8);
        let ledger = Arc::new(ledger);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    ledger
                        .allocate(&format!("op-{}", i), 10.0, Priority::Medium, "parallel")
                        .is_ok()
                })
            })
            .collect();

        let succeeded = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(succeeded, 8);
        assert_eq!(ledger.active_allocation_count(), 8);
    }
}

#[cfg(test)]
mod policy_tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use resilience_core::{
        Action, Condition, EventRecorder, LedgerConfig, ManualClock, MarginEventType,
        MarginPolicy, MarginThreshold, MarginType, Operator, Priority, Severity, Signal,
        SignalSourceType, SignalType, ThresholdLevel,
    };

    use crate::ledger::MarginLedger;
    use crate::policy::{evaluate_condition, PolicyContext, PolicyEngine};

    fn ledger(base_capacity: f64) -> (MarginLedger, Arc<EventRecorder>) {
        let events = Arc::new(EventRecorder::new(1_000));
        let config = LedgerConfig {
            base_capacity,
            ..Default::default()
        };
        let ledger =
            MarginLedger::new(config, events.clone(), Arc::new(ManualClock::new(Utc::now())));
        (ledger, events)
    }

    fn signal(signal_type: SignalType, severity: Severity) -> Signal {
        Signal::new("sig-1", signal_type, severity, SignalSourceType::Sensor, 70.0, Utc::now())
    }

    fn policy(
        id: &str,
        priority: u32,
        conditions: Vec<Condition>,
        actions: Vec<Action>,
    ) -> MarginPolicy {
        MarginPolicy {
            id: id.to_string(),
            margin_type: MarginType::Time,
            conditions,
            actions,
            priority,
            active: true,
        }
    }

    #[test]
    fn condition_semantics() {
        let s = signal(SignalType::Emergency, Severity::High);
        let now = Utc::now();
        let ctx = PolicyContext {
            signal: Some(&s),
            utilization: 0.4,
            now,
        };

        assert!(evaluate_condition(
            &Condition::Signal { operator: Operator::Eq, value: SignalType::Emergency },
            &ctx
        ));
        assert!(!evaluate_condition(
            &Condition::Signal { operator: Operator::Gt, value: SignalType::Maintenance },
            &ctx
        ));
        assert!(evaluate_condition(
            &Condition::Utilization { operator: Operator::Lt, value: 0.5 },
            &ctx
        ));
        assert!(evaluate_condition(
            &Condition::Time { operator: Operator::Gte, value: now - Duration::hours(1) },
            &ctx
        ));
        assert!(evaluate_condition(
            &Condition::Risk { operator: Operator::Gte, value: 0.8 },
            &ctx
        ));

        let no_signal = PolicyContext { signal: None, ..ctx };
        assert!(!evaluate_condition(
            &Condition::Risk { operator: Operator::Gte, value: 0.0 },
            &no_signal
        ));
    }

    #[test]
    fn emergency_policy_allocates_once() {
        let (ledger, events) = ledger(100.0);
        let engine = PolicyEngine::new(
            vec![policy(
                "emergency",
                1,
                vec![Condition::Signal { operator: Operator::Eq, value: SignalType::Emergency }],
                vec![Action::Allocate { amount: 15.0, priority: Priority::High, reason: None }],
            )],
            Vec::new(),
        );

        let report = engine.evaluate_signal(
            &signal(SignalType::Weather, Severity::High),
            &ledger,
            &events,
            Utc::now(),
        );
        assert!(report.triggered.is_empty());

        let report = engine.evaluate_signal(
            &signal(SignalType::Emergency, Severity::High),
            &ledger,
            &events,
            Utc::now(),
        );
        assert_eq!(report.triggered, vec!["emergency"]);
        assert_eq!(report.allocations.len(), 1);
        assert_eq!(report.allocations[0].amount, 15.0);
        assert_eq!(report.allocations[0].metadata.operation_id, "policy-emergency");
        assert_eq!(ledger.active_allocation_count(), 1);
    }

    #[test]
    fn policies_run_in_priority_order_and_deploy_uses_own_allocation() {
        let (ledger, events) = ledger(100.0);
        let engine = PolicyEngine::new(
            vec![
                policy(
                    "deployer",
                    5,
                    vec![],
                    vec![Action::Deploy { amount: 4.0, reason: None }],
                ),
                policy(
                    "deployer-alloc",
                    1,
                    vec![],
                    vec![
                        Action::Allocate { amount: 10.0, priority: Priority::Medium, reason: None },
                        Action::Deploy { amount: 4.0, reason: Some("absorb".to_string()) },
                    ],
                ),
            ],
            Vec::new(),
        );

        let report = engine.evaluate_signal(
            &signal(SignalType::Maintenance, Severity::Low),
            &ledger,
            &events,
            Utc::now(),
        );
        assert_eq!(report.triggered, vec!["deployer-alloc", "deployer"]);
        assert_eq!(report.deployments.len(), 1);
        // "deployer" has no allocation of its own
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].policy_id, "deployer");
        assert_eq!(ledger.total_deployed(), 4.0);
    }

    #[test]
    fn capacity_failure_recorded_as_exhaustion_and_later_policies_run() {
        let (ledger, events) = ledger(5.0);
        let engine = PolicyEngine::new(
            vec![
                policy(
                    "greedy",
                    1,
                    vec![],
                    vec![Action::Allocate { amount: 50.0, priority: Priority::High, reason: None }],
                ),
                policy(
                    "notify",
                    2,
                    vec![],
                    vec![Action::Escalate { message: "margin exhausted".to_string() }],
                ),
            ],
            Vec::new(),
        );

        let report = engine.evaluate_signal(
            &signal(SignalType::Capacity, Severity::Critical),
            &ledger,
            &events,
            Utc::now(),
        );
        assert_eq!(report.triggered.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(events.count_by_type(MarginEventType::Exhaustion), 1);
        assert_eq!(events.count_by_type(MarginEventType::PolicyTrigger), 1);
        let last = events.recent(1).pop().unwrap();
        assert_eq!(last.impact, 1.0);
        assert_eq!(last.policy_id.as_deref(), Some("notify"));
    }

    #[test]
    fn inactive_and_foreign_policies_are_skipped() {
        let (ledger, events) = ledger(100.0);
        let mut inactive = policy("off", 1, vec![], vec![Action::Alert { message: "x".into() }]);
        inactive.active = false;
        let mut capacity = policy("cap", 1, vec![], vec![Action::Alert { message: "y".into() }]);
        capacity.margin_type = MarginType::Capacity;

        let engine = PolicyEngine::new(vec![inactive, capacity], Vec::new());
        let report = engine.evaluate_signal(
            &signal(SignalType::Weather, Severity::Low),
            &ledger,
            &events,
            Utc::now(),
        );
        assert!(report.triggered.is_empty());
        assert!(events.is_empty());
    }

    #[test]
    fn threshold_breach_reports_highest_level() {
        let (ledger, events) = ledger(100.0);
        let allocation = ledger.allocate("op", 10.0, Priority::Medium, "r").unwrap();
        ledger.deploy(&allocation.id, 8.0, "r").unwrap();

        let engine = PolicyEngine::new(
            Vec::new(),
            vec![MarginThreshold {
                id: "time".to_string(),
                margin_type: MarginType::Time,
                warning: 0.5,
                critical: 0.75,
                emergency: 0.9,
                auto_deploy: 0.95,
            }],
        );

        let level = engine.check_thresholds(&ledger, &events, Utc::now());
        assert_eq!(level, Some(ThresholdLevel::Critical));
        assert_eq!(events.count_by_type(MarginEventType::ThresholdBreach), 1);
    }

    #[test]
    fn ledger_only_evaluation_ignores_signal_conditions() {
        let (ledger, events) = ledger(100.0);
        let engine = PolicyEngine::new(
            vec![
                policy(
                    "needs-signal",
                    1,
                    vec![Condition::Signal { operator: Operator::Ne, value: SignalType::Weather }],
                    vec![Action::Alert { message: "a".into() }],
                ),
                policy(
                    "idle-ledger",
                    2,
                    vec![Condition::Utilization { operator: Operator::Eq, value: 0.0 }],
                    vec![Action::Alert { message: "idle".into() }],
                ),
            ],
            Vec::new(),
        );

        let report = engine.evaluate_ledger(&ledger, &events, Utc::now());
        assert_eq!(report.triggered, vec!["idle-ledger"]);
    }
}
