//! Detection Orchestrator
//!
//! The engine value callers own and share: lifecycle state machine,
//! real-time and batched signal processing, the margin ledger API, and the
//! periodic batch, health and expiry workers.

pub mod bus;
pub mod engine;
mod pipeline;
pub mod status;
mod workers;

pub use bus::{EventBus, ProcessingFailure};
pub use engine::SignalDetectionEngine;
pub use status::{DetectionResult, DetectionStatistics, SignalDetectionStatus};
