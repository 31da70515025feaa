//! Shared domain model for the signal detection and margin management engine.

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod margin;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::*;
pub use error::*;
pub use events::EventRecorder;
pub use margin::*;
pub use types::*;
