//! Custom error types for the measurement pipeline.
//!
//! This module defines the primary error type, `DaqError`, shared by every layer of the
//! crate. Using the `thiserror` crate, it provides a centralized and consistent way to
//! report the different kinds of failures a measurement run can hit.
//!
//! ## Error Hierarchy
//!
//! - **Configuration errors** (`Config`, `Configuration`, `ParameterNotSet`, `InvalidUnit`):
//!   raised at construction time, before any thread is started.
//! - **Validation errors** (`ParameterValidation`, `UnknownParameter`): raised when a value
//!   is assigned. Values are never clamped silently.
//! - **Persistence errors** (`Io`, `Csv`, `Json`, `HeaderParse`, `MetadataAfterData`,
//!   `JsonTypeMismatch`): raised by the results layer.
//! - **Run-time errors** (`Cancelled`, `BatchLengthMismatch`, `WorkerState`,
//!   `WorkerPanicked`, `ShutdownFailed`): raised inside or around the worker thread.
//!
//! User procedure hooks return `anyhow::Result`; a hook error whose root cause is
//! [`DaqError::Cancelled`] is treated as a cancellation rather than a failure.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing {0} parameter")]
    ParameterNotSet(String),

    #[error("Invalid value for parameter '{name}': {reason}")]
    ParameterValidation { name: String, reason: String },

    #[error("Unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("Invalid unit '{0}'")]
    InvalidUnit(String),

    #[error("Cannot convert from '{from}' to '{to}'")]
    IncompatibleUnits { from: String, to: String },

    #[error("Metadata '{0}' has already been evaluated")]
    MetadataAlreadyEvaluated(String),

    #[error("Metadata cannot be stored in '{0}': data rows were already written")]
    MetadataAfterData(String),

    #[error("Failed to parse results header: {0}")]
    HeaderParse(String),

    #[error("Unknown procedure type '{0}'")]
    UnknownProcedure(String),

    #[error("'{0}' is only available while a worker runs the procedure")]
    NotBound(&'static str),

    #[error("Procedure run was cancelled")]
    Cancelled,

    #[error("Batch results columns have mismatched lengths: {0}")]
    BatchLengthMismatch(String),

    #[error("Type mismatch for column '{column}' in JSON results: stored {stored}, received {received}")]
    JsonTypeMismatch {
        column: String,
        stored: String,
        received: String,
    },

    #[error("Worker is in the wrong state: {0}")]
    WorkerState(String),

    #[error("Worker thread panicked: {0}")]
    WorkerPanicked(String),

    #[error("Procedure shutdown failed: {0}")]
    ShutdownFailed(String),
}

impl DaqError {
    /// Returns true when `err` (or any error in its chain) is a cancellation.
    pub fn is_cancellation(err: &anyhow::Error) -> bool {
        err.chain()
            .any(|cause| matches!(cause.downcast_ref::<DaqError>(), Some(DaqError::Cancelled)))
    }

    /// Convenience constructor for validation failures.
    pub fn validation(name: impl Into<String>, reason: impl Into<String>) -> Self {
        DaqError::ParameterValidation {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn detects_cancellation_through_context() {
        let err = Err::<(), _>(DaqError::Cancelled)
            .context("sweep step 3")
            .unwrap_err();
        assert!(DaqError::is_cancellation(&err));
    }

    #[test]
    fn other_errors_are_not_cancellation() {
        let err = anyhow::anyhow!("instrument timeout");
        assert!(!DaqError::is_cancellation(&err));

        let err: anyhow::Error = DaqError::ParameterNotSet("iterations".into()).into();
        assert!(!DaqError::is_cancellation(&err));
    }

    #[test]
    fn messages_name_the_offender() {
        let err = DaqError::validation("Loop Iterations", "value 0 is out of range [1, 10]");
        assert_eq!(
            err.to_string(),
            "Invalid value for parameter 'Loop Iterations': value 0 is out of range [1, 10]"
        );
        assert_eq!(
            DaqError::ParameterNotSet("iterations".into()).to_string(),
            "Missing iterations parameter"
        );
    }
}
