use std::sync::Arc;
use std::time::Duration;

use resilience_core::{EngineState, SignalDetectionConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::pipeline::EngineInner;

/// Runs `tick` every `period` until shutdown is signalled or `tick` returns
/// false. The first tick fires one full period after spawn.
fn spawn_periodic<F>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> bool + Send + 'static,
{
    tokio::spawn(async move {
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer.tick().await;

        tracing::debug!(worker = name, period_ms = period.as_millis() as u64, "Worker started");
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if !tick() {
                        tracing::debug!(worker = name, "Worker exiting early");
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(worker = name, "Worker stopped");
    })
}

/// Spawn the batch (batch mode only), health and expiry workers. Each worker
/// stops on its own once the engine leaves ACTIVE.
pub(crate) fn spawn_all(
    inner: &Arc<EngineInner>,
    config: Arc<SignalDetectionConfig>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(3);

    if !config.processing.real_time_processing {
        let engine = inner.clone();
        let period = config.processing.batch_interval();
        handles.push(spawn_periodic("batch", period, shutdown.clone(), move || {
            if engine.state() != EngineState::Active {
                return false;
            }
            match engine.drain_once(&config) {
                Ok(_) => true,
                Err(fault) => {
                    engine.fault(&fault.0);
                    false
                }
            }
        }));
    }

    let engine = inner.clone();
    handles.push(spawn_periodic(
        "health",
        inner.settings.health_interval(),
        shutdown.clone(),
        move || {
            if engine.state() != EngineState::Active {
                return false;
            }
            match engine.health_check() {
                Ok(_) => true,
                Err(fault) => {
                    engine.fault(&fault.0);
                    false
                }
            }
        },
    ));

    let engine = inner.clone();
    handles.push(spawn_periodic(
        "expiry-sweep",
        inner.settings.sweep_interval(),
        shutdown,
        move || {
            if engine.state() != EngineState::Active {
                return false;
            }
            match engine.sweep() {
                Ok(_) => true,
                Err(fault) => {
                    engine.fault(&fault.0);
                    false
                }
            }
        },
    ));

    handles
}
