// Copyright 2025 Cowboy AI, LLC.

//! Error types for lifecycle operations

use crate::client::ClientError;
use crate::infrastructure::event_store::EventStoreError;
use crate::infrastructure::kv_store::StoreError;
use thiserror::Error;

/// Errors that can occur in lifecycle operations
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Malformed request (empty names, no command or address)
    #[error("Validation error: {0}")]
    Validation(String),

    /// A cache transaction step failed and every earlier step was rolled back
    #[error("Transaction rolled back at step {step}: {reason}")]
    TransactionRollback {
        /// Name of the step that failed
        step: String,
        /// Why it failed
        reason: String,
    },

    /// Durable append retried and still failed
    #[error("Queue write exhausted after {attempts} attempts: {last_error}")]
    QueueWriteExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Error from the final attempt
        last_error: String,
    },

    /// Shared store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Event log failure
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// Wire client failure
    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Transition rejected by the state machine
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state
        from: String,
        /// Attempted target state
        to: String,
    },

    /// Identity is not tracked
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// Event type tag not present in the registry
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// Component is shutting down
    #[error("Shutting down")]
    Shutdown,
}

/// Result type for lifecycle operations
pub type LifecycleResult<T> = Result<T, LifecycleError>;

impl From<serde_json::Error> for LifecycleError {
    fn from(err: serde_json::Error) -> Self {
        LifecycleError::Serialization(err.to_string())
    }
}

impl LifecycleError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        LifecycleError::Validation(msg.into())
    }

    /// Check if this is a validation error
    pub fn is_validation_error(&self) -> bool {
        matches!(self, LifecycleError::Validation(_))
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, LifecycleError::ServiceNotFound(_))
    }

    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            LifecycleError::Store(e) => e.is_transient(),
            LifecycleError::EventStore(EventStoreError::Store(e)) => e.is_transient(),
            LifecycleError::Client(ClientError::Timeout(_))
            | LifecycleError::Client(ClientError::ConnectionRefused(_)) => true,
            _ => false,
        }
    }
}
