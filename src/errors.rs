// Copyright 2025 Machina Contributors.

//! Error types for state machine, versioning, and saga operations

use thiserror::Error;

/// Errors that can occur across the machina core
#[derive(Debug, Clone, Error)]
pub enum MachinaError {
    /// Trigger is not permitted from the current state
    #[error("Invalid transition: trigger {trigger} not permitted from state {state}")]
    InvalidTransition {
        /// The state the machine was in
        state: String,
        /// The trigger that was fired
        trigger: String,
    },

    /// `fire` was called from within an entry or exit callback
    #[error("Callback re-entrancy: fire called from within an entry/exit action in state {state}")]
    CallbackReentrancy {
        /// The state whose callback attempted the nested fire
        state: String,
    },

    /// A state referenced by an operation is not part of the configuration
    #[error("Unknown state: {0}")]
    UnknownState(String),

    /// Requested version is not registered for the entity type
    #[error("Version not found: {entity_type} has no version {version}")]
    VersionNotFound {
        /// Entity type that was searched
        entity_type: String,
        /// Version that was requested
        version: String,
    },

    /// Entity type is not present in the registry
    #[error("Entity type not registered: {0}")]
    EntityTypeNotFound(String),

    /// The registered state/trigger domain does not match the requested one
    #[error("Type mismatch for {entity_type}: registered ({registered_state}, {registered_trigger}), requested ({requested_state}, {requested_trigger})")]
    TypeMismatch {
        /// Entity type under which the mismatch occurred
        entity_type: String,
        /// State type registered for the entity type
        registered_state: String,
        /// Trigger type registered for the entity type
        registered_trigger: String,
        /// State type the caller asked for
        requested_state: String,
        /// Trigger type the caller asked for
        requested_trigger: String,
    },

    /// Upgrade between two versions is not possible
    #[error("Version incompatible: {from} -> {to}: {reason}")]
    VersionIncompatible {
        /// Source version
        from: String,
        /// Target version
        to: String,
        /// Why the upgrade is rejected
        reason: String,
    },

    /// A breaking change blocks the requested operation
    #[error("Breaking change: {0}")]
    BreakingChange(String),

    /// Migration failed and the pre-migration snapshot was restored
    #[error("Migration failed (rolled back): {cause}")]
    MigrationFailure {
        /// Underlying cause of the failure
        cause: String,
    },

    /// Migration hook rejected the upgrade before it started
    #[error("Migration aborted by hook {hook}")]
    MigrationAborted {
        /// Name of the hook that returned false
        hook: String,
    },

    /// Saga reached a terminal failure
    #[error("Saga failed: {0}")]
    SagaFailed(String),

    /// One or more compensation steps failed
    #[error("Compensation failure: {0}")]
    CompensationFailure(String),

    /// Optimistic append found a different stream version than expected
    #[error("Concurrency conflict: expected sequence {expected}, but found {actual}")]
    ConcurrencyConflict {
        /// Expected stream sequence
        expected: u64,
        /// Actual stream sequence
        actual: u64,
    },

    /// An operation exceeded its deadline
    #[error("Timeout elapsed: {0}")]
    TimeoutElapsed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Event log storage failure
    #[error("Event log error: {0}")]
    EventLogError(String),

    /// Generic invalid operation
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Reason why the operation is invalid
        reason: String,
    },

    /// Generic internal error
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type for machina operations
pub type MachinaResult<T> = Result<T, MachinaError>;

impl From<serde_json::Error> for MachinaError {
    fn from(err: serde_json::Error) -> Self {
        MachinaError::SerializationError(err.to_string())
    }
}

impl MachinaError {
    /// Create a generic internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        MachinaError::InternalError(msg.into())
    }

    /// Check if this error means a version or entity type was not found
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            MachinaError::VersionNotFound { .. } | MachinaError::EntityTypeNotFound(_)
        )
    }

    /// Check if this is a transition-level rejection
    pub fn is_transition_error(&self) -> bool {
        matches!(
            self,
            MachinaError::InvalidTransition { .. }
                | MachinaError::CallbackReentrancy { .. }
                | MachinaError::UnknownState(_)
        )
    }

    /// Check if this is an optimistic-concurrency conflict
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, MachinaError::ConcurrencyConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = MachinaError::InvalidTransition {
            state: "Shipped".to_string(),
            trigger: "Process".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid transition: trigger Process not permitted from state Shipped"
        );

        let err = MachinaError::CallbackReentrancy {
            state: "Processing".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Callback re-entrancy: fire called from within an entry/exit action in state Processing"
        );

        let err = MachinaError::VersionNotFound {
            entity_type: "Order".to_string(),
            version: "2.0.0".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Version not found: Order has no version 2.0.0"
        );

        let err = MachinaError::ConcurrencyConflict {
            expected: 5,
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "Concurrency conflict: expected sequence 5, but found 3"
        );

        let err = MachinaError::MigrationFailure {
            cause: "state Cancelled missing in target".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Migration failed (rolled back): state Cancelled missing in target"
        );

        let err = MachinaError::TimeoutElapsed("step reserve_inventory".to_string());
        assert_eq!(err.to_string(), "Timeout elapsed: step reserve_inventory");
    }

    #[test]
    fn test_helper_predicates() {
        assert!(MachinaError::VersionNotFound {
            entity_type: "Order".to_string(),
            version: "1.0.0".to_string(),
        }
        .is_not_found());
        assert!(MachinaError::EntityTypeNotFound("Order".to_string()).is_not_found());
        assert!(!MachinaError::SagaFailed("x".to_string()).is_not_found());

        assert!(MachinaError::InvalidTransition {
            state: "A".to_string(),
            trigger: "t".to_string(),
        }
        .is_transition_error());
        assert!(MachinaError::UnknownState("A".to_string()).is_transition_error());
        assert!(!MachinaError::SagaFailed("x".to_string()).is_transition_error());

        assert!(MachinaError::ConcurrencyConflict {
            expected: 1,
            actual: 2
        }
        .is_concurrency_conflict());
        assert!(!MachinaError::InternalError("x".to_string()).is_concurrency_conflict());
    }

    #[test]
    fn test_serde_json_conversion() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{ nope }").unwrap_err();
        let err: MachinaError = serde_err.into();
        match err {
            MachinaError::SerializationError(msg) => assert!(!msg.is_empty()),
            other => panic!("Expected SerializationError, got {other:?}"),
        }
    }

    #[test]
    fn test_all_errors_clone() {
        let errors = vec![
            MachinaError::InvalidTransition {
                state: "A".to_string(),
                trigger: "t".to_string(),
            },
            MachinaError::CallbackReentrancy {
                state: "A".to_string(),
            },
            MachinaError::UnknownState("A".to_string()),
            MachinaError::VersionNotFound {
                entity_type: "E".to_string(),
                version: "1.0.0".to_string(),
            },
            MachinaError::BreakingChange("removed state".to_string()),
            MachinaError::MigrationFailure {
                cause: "x".to_string(),
            },
            MachinaError::SagaFailed("x".to_string()),
            MachinaError::CompensationFailure("x".to_string()),
            MachinaError::TimeoutElapsed("x".to_string()),
        ];
        for error in errors {
            let cloned = error.clone();
            assert_eq!(error.to_string(), cloned.to_string());
        }
    }
}
