use chrono::{DateTime, Utc};
use resilience_core::{EngineError, Signal};
use signal_detection::HealthWarning;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

/// A signal that failed enrichment or storage
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingFailure {
    pub signal_id: String,
    pub error: EngineError,
    pub timestamp: DateTime<Utc>,
}

/// One typed channel per notification category. Margin events are published
/// by the event recorder itself.
pub struct EventBus {
    signals: broadcast::Sender<Signal>,
    health_warnings: broadcast::Sender<HealthWarning>,
    processing_errors: broadcast::Sender<ProcessingFailure>,
}

impl EventBus {
    pub fn new() -> Self {
        let (signals, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (health_warnings, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (processing_errors, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            signals,
            health_warnings,
            processing_errors,
        }
    }

    // Sends fail only when nobody is subscribed.

    pub fn publish_signal(&self, signal: &Signal) {
        let _ = self.signals.send(signal.clone());
    }

    pub fn publish_health_warning(&self, warning: &HealthWarning) {
        let _ = self.health_warnings.send(warning.clone());
    }

    pub fn publish_processing_error(&self, failure: &ProcessingFailure) {
        let _ = self.processing_errors.send(failure.clone());
    }

    pub fn subscribe_signals(&self) -> broadcast::Receiver<Signal> {
        self.signals.subscribe()
    }

    pub fn subscribe_health_warnings(&self) -> broadcast::Receiver<HealthWarning> {
        self.health_warnings.subscribe()
    }

    pub fn subscribe_processing_errors(&self) -> broadcast::Receiver<ProcessingFailure> {
        self.processing_errors.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
