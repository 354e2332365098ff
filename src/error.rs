//! Engine error types

use thiserror::Error;

/// Errors raised by the decision engine and its collaborators
#[derive(Debug, Error)]
pub enum EngineError {
    /// Fewer samples than a factor or pattern requires
    #[error("Insufficient data: need {needed} samples, have {available}")]
    DataInsufficient { needed: usize, available: usize },

    /// Malformed collaborator output or an illegal request
    #[error("Validation error: {0}")]
    Validation(String),

    /// Advisor or execution collaborator returned an error
    #[error("External call failed ({collaborator}): {message}")]
    ExternalCall {
        collaborator: &'static str,
        message: String,
    },

    /// Advisor or execution collaborator did not answer in time
    #[error("External call timed out ({collaborator}) after {after_ms}ms")]
    Timeout {
        collaborator: &'static str,
        after_ms: u64,
    },

    /// Programming defect; never silently recovered
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Whether the error is a recoverable condition (safe outcome substitution applies)
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, EngineError::InvariantViolation(_))
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
