//! Error types for the approximate aggregation engine.
//!
//! Per-record decode failures have no variant here: a malformed line is
//! counted and skipped by the filter stage. Everything in this enum is fatal
//! to the operation that returns it.

use std::fmt;
use thiserror::Error;

use crate::source::PartitionId;

/// Execution phase of a run, used to attribute failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Calibration pass in error-bound mode
    Pilot,
    /// Pass that produces the reported result
    Final,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Pilot => write!(f, "pilot"),
            Phase::Final => write!(f, "final"),
        }
    }
}

/// The primary error type for approxagg operations.
#[derive(Error, Debug)]
pub enum ApproxError {
    /// Invalid query or engine parameter
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Configuration file could not be read or parsed
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Pilot statistics are missing or inconsistent for a partition
    #[error("Calibration incomplete for partition {partition}: {reason}")]
    CalibrationIncomplete {
        partition: PartitionId,
        reason: String,
    },

    /// A calibrated plan was attached to a query it was not derived from
    #[error("Calibrated plan does not match query: {message}")]
    PlanMismatch { message: String },

    /// A partition task failed after all attempts
    #[error("Execution error in {phase} pass{}: {message}", partition_suffix(.partition))]
    Execution {
        phase: Phase,
        partition: Option<PartitionId>,
        message: String,
    },

    /// I/O error
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Arrow error
    #[error("Arrow error: {message}")]
    Arrow { message: String },

    /// Operation cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal error (bug in the engine)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ApproxError {
    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a calibration error for one partition.
    pub fn calibration_incomplete(partition: PartitionId, reason: impl Into<String>) -> Self {
        Self::CalibrationIncomplete {
            partition,
            reason: reason.into(),
        }
    }

    /// Create a plan mismatch error.
    pub fn plan_mismatch(message: impl Into<String>) -> Self {
        Self::PlanMismatch {
            message: message.into(),
        }
    }

    /// Create an execution error.
    pub fn execution(phase: Phase, partition: Option<PartitionId>, message: impl Into<String>) -> Self {
        Self::Execution {
            phase,
            partition,
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the error stems from caller input rather than the run itself.
    pub fn is_usage_error(&self) -> bool {
        matches!(self, Self::InvalidArgument { .. } | Self::Config { .. })
    }
}

impl From<arrow::error::ArrowError> for ApproxError {
    fn from(err: arrow::error::ArrowError) -> Self {
        Self::Arrow {
            message: err.to_string(),
        }
    }
}

fn partition_suffix(partition: &Option<PartitionId>) -> String {
    partition
        .map(|p| format!(" (partition {})", p))
        .unwrap_or_default()
}

/// Result type alias for approxagg operations.
pub type Result<T> = std::result::Result<T, ApproxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ApproxError::invalid_argument("ratio must be in (0, 1]");
        assert_eq!(err.to_string(), "Invalid argument: ratio must be in (0, 1]");
    }

    #[test]
    fn test_execution_error_names_partition() {
        let err = ApproxError::execution(Phase::Pilot, Some(PartitionId::new(3)), "disk gone");
        assert_eq!(
            err.to_string(),
            "Execution error in pilot pass (partition p00003): disk gone"
        );

        let err = ApproxError::execution(Phase::Final, None, "no workers");
        assert_eq!(err.to_string(), "Execution error in final pass: no workers");
    }

    #[test]
    fn test_usage_errors() {
        assert!(ApproxError::invalid_argument("x").is_usage_error());
        assert!(ApproxError::config("x").is_usage_error());
        assert!(!ApproxError::Cancelled.is_usage_error());
    }
}
