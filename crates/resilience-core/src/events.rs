//! Append-only audit log of margin events.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::broadcast;

use crate::margin::{MarginEvent, MarginEventType};

const SUBSCRIBER_CAPACITY: usize = 1024;

pub struct EventRecorder {
    events: Mutex<VecDeque<MarginEvent>>,
    /// Oldest events are dropped past this many records
    retention: usize,
    tx: broadcast::Sender<MarginEvent>,
}

impl EventRecorder {
    pub fn new(retention: usize) -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self {
            events: Mutex::new(VecDeque::new()),
            retention: retention.max(1),
            tx,
        }
    }

    pub fn record(&self, event: MarginEvent) {
        tracing::debug!(
            event_type = ?event.event_type,
            margin_type = %event.margin_type,
            impact = event.impact,
            "{}",
            event.description
        );

        {
            let mut events = self.events.lock();
            events.push_back(event.clone());
            while events.len() > self.retention {
                events.pop_front();
            }
        }

        // No subscribers is not an error
        let _ = self.tx.send(event);
    }

    /// The `limit` most recent events, oldest first
    pub fn recent(&self, limit: usize) -> Vec<MarginEvent> {
        let events = self.events.lock();
        let skip = events.len().saturating_sub(limit);
        events.iter().skip(skip).cloned().collect()
    }

    pub fn count_by_type(&self, event_type: MarginEventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MarginEvent> {
        self.tx.subscribe()
    }
}
