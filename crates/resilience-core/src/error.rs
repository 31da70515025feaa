use thiserror::Error;

use crate::types::EngineState;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Capacity error: {0}")]
    Capacity(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Engine is not active (state: {0})")]
    NotActive(EngineState),
}

impl EngineError {
    /// Capacity and not-found failures leave the engine usable; the caller may retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, EngineError::Capacity(_) | EngineError::NotFound(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
