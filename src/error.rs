//! Error types for syncsim.
//!
//! All errors in syncsim are strongly typed using thiserror.
//! An aborted wait is reported as [`SyncError::Aborted`] and is
//! cancellation, not failure; see [`SimError::is_cancellation`].

use thiserror::Error;

use crate::event::EngineKind;

/// Validation errors raised while checking an engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Field '{field}' must be at least {min}, got {actual}")]
    TooSmall {
        field: String,
        min: usize,
        actual: usize,
    },

    #[error("Invalid delay range for '{field}': min {min_ms}ms exceeds max {max_ms}ms")]
    InvalidDelayRange {
        field: String,
        min_ms: u64,
        max_ms: u64,
    },

    #[error("Field '{field}' must be non-zero")]
    Zero {
        field: String,
    },

    #[error("Unknown {kind} '{value}' (expected one of: {expected})")]
    UnknownVariant {
        kind: String,
        value: String,
        expected: String,
    },
}

/// Errors from the blocking resource primitives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The primitive (or the run signal) was closed while the caller waited.
    /// Nothing was acquired.
    #[error("Wait on '{primitive}' aborted")]
    Aborted {
        primitive: String,
    },
}

/// Execution errors that occur while an engine is running.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Invariant violated in {engine}: {detail}")]
    InvariantViolation {
        engine: EngineKind,
        detail: String,
    },

    #[error("{engine} is halted after a fault: {reason}")]
    Halted {
        engine: EngineKind,
        reason: String,
    },

    #[error("Failed to spawn worker '{worker}': {message}")]
    WorkerSpawn {
        worker: String,
        message: String,
    },

    #[error("Channel '{path}' disconnected")]
    Disconnected {
        path: String,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },
}

/// Top-level error type for syncsim.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl SimError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates an invariant violation for `engine`.
    #[must_use]
    pub fn invariant(engine: EngineKind, detail: impl Into<String>) -> Self {
        Self::Execution(ExecutionError::InvariantViolation {
            engine,
            detail: detail.into(),
        })
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this error only reports an aborted wait.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Sync(SyncError::Aborted { .. }))
    }

    /// Returns true if a synchronization invariant was broken.
    #[must_use]
    pub const fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::InvariantViolation { .. }))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Internal { .. } => false,
            Self::Sync(_) => true,
            Self::Execution(e) => matches!(e, ExecutionError::Timeout { .. }),
        }
    }
}

/// Result type alias for syncsim operations.
pub type SimResult<T> = Result<T, SimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_too_small() {
        let err = ValidationError::TooSmall {
            field: "philosophers".to_string(),
            min: 2,
            actual: 1,
        };
        let msg = format!("{err}");
        assert!(msg.contains("philosophers"));
        assert!(msg.contains("at least 2"));
    }

    #[test]
    fn test_validation_error_delay_range() {
        let err = ValidationError::InvalidDelayRange {
            field: "think".to_string(),
            min_ms: 10,
            max_ms: 5,
        };
        let msg = format!("{err}");
        assert!(msg.contains("10ms"));
        assert!(msg.contains("5ms"));
    }

    #[test]
    fn test_invariant_violation_message() {
        let err = SimError::invariant(EngineKind::ReadersWriters, "writer active with 2 readers");
        assert!(err.is_invariant_violation());
        assert!(!err.is_retryable());
        let msg = format!("{err}");
        assert!(msg.contains("readers-writers"));
        assert!(msg.contains("2 readers"));
    }

    #[test]
    fn test_aborted_wait_is_cancellation() {
        let err: SimError = SyncError::Aborted {
            primitive: "empty-slots".to_string(),
        }
        .into();
        assert!(err.is_cancellation());
        assert!(!err.is_invariant_violation());
        assert!(format!("{err}").contains("empty-slots"));
    }

    #[test]
    fn test_sim_error_internal() {
        let err = SimError::internal("poisoned lock: controller");
        assert!(err.is_internal());
        assert!(!err.is_retryable());
        assert!(format!("{err}").contains("controller"));
    }

    #[test]
    fn test_sim_error_retryable() {
        let err1: SimError = ValidationError::Zero {
            field: "capacity".to_string(),
        }
        .into();
        assert!(err1.is_validation());
        assert!(!err1.is_retryable());

        let err2: SimError = ExecutionError::Timeout { duration_ms: 100 }.into();
        assert!(err2.is_retryable());
        assert!(format!("{err2}").contains("100ms"));
    }
}
