use thiserror::Error;

use crate::{SagaId, StepKey, StepStatus};

/// Errors that can occur when interacting with the saga store.
#[derive(Debug, Error)]
pub enum SagaStoreError {
    /// The same step and status were recorded before with a different payload.
    ///
    /// Indicates a non-idempotent duplicate delivery and needs operator
    /// attention. Never retried.
    #[error("Step {key} of saga {saga_id} already recorded as {status} with a different payload")]
    Idempotency {
        saga_id: SagaId,
        key: StepKey,
        status: StepStatus,
    },

    /// The proposed status is not reachable from the stored one.
    #[error("Invalid transition for step {key} of saga {saga_id}: {from} -> {to}")]
    Transition {
        saga_id: SagaId,
        key: StepKey,
        from: StepStatus,
        to: StepStatus,
    },

    /// The step's parent chain loops back on itself.
    #[error("Circular parent chain for step {key} of saga {saga_id}: {message}")]
    CircularChain {
        saga_id: SagaId,
        key: StepKey,
        message: String,
    },

    /// Compare-and-swap retries were exhausted.
    #[error("Concurrency conflict on step {key} of saga {saga_id} after {attempts} attempts")]
    ConcurrencyConflict {
        saga_id: SagaId,
        key: StepKey,
        attempts: u32,
    },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A key/value backend reported a failure of its own.
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Result type for saga store operations.
pub type Result<T> = std::result::Result<T, SagaStoreError>;
