//! Engine error types.

use saga_store::{FailureInfo, SagaStoreError};
use thiserror::Error;

/// Errors raised by an [`EventBus`](crate::EventBus) implementation.
#[derive(Debug, Error)]
pub enum BusError {
    /// A point-to-point send found nobody to deliver to.
    #[error("No subscriber for message type {message_type}")]
    NoSubscriber { message_type: String },

    /// An inbound message is missing a header or carries an unparsable one.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// The transport failed. Usually transient.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that can occur while dispatching messages or compensating steps.
#[derive(Debug, Error)]
pub enum SagaError {
    /// A saga store operation failed. Validation and concurrency errors
    /// always surface here unchanged.
    #[error("Saga store error: {0}")]
    Store(#[from] SagaStoreError),

    #[error("Event bus error: {0}")]
    Bus(#[from] BusError),

    /// Invoking a handler failed for a reason other than its own business error.
    #[error("Dispatch to {handler_type} for {message_type} failed: {reason}")]
    Dispatch {
        handler_type: String,
        message_type: String,
        reason: String,
    },

    #[error("No handler registered for {message_type} (handler type: {handler_type:?})")]
    HandlerNotFound {
        message_type: String,
        handler_type: Option<String>,
    },

    /// A point-to-point message matched several handlers and named none.
    #[error("Message {message_type} matches handlers {handlers:?}; a handler type is required")]
    AmbiguousHandler {
        message_type: String,
        handlers: Vec<String>,
    },

    /// A non-starting handler received a message without a saga id.
    #[error("Message {message_type} for non-starting handler {handler_type} carries no saga id")]
    MissingSagaId {
        message_type: String,
        handler_type: String,
    },

    #[error("Cannot decode payload of {message_type}: {source}")]
    PayloadDecode {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },

    /// A mark method named a step the context never sent nor received.
    #[error("Step {step_type} was not tracked by this context")]
    UntrackedStep { step_type: String },

    #[error("Handler {handler_type} is already registered for {message_type}")]
    DuplicateHandler {
        handler_type: String,
        message_type: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The cancellation token fired. Never triggers compensation.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Outcome a handler returns from its business or compensation method.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A business failure. Recorded as `Failed` (or `CompensationFailed`
    /// inside compensation) instead of being propagated.
    #[error("Handler failed: {0}")]
    Failed(FailureInfo),

    #[error("Handler cancelled")]
    Cancelled,

    /// An engine error the handler chose to propagate.
    #[error(transparent)]
    Engine(#[from] SagaError),
}

impl HandlerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(FailureInfo::new(reason))
    }

    /// Wraps an arbitrary error as a business failure.
    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        Self::Failed(FailureInfo::from_error(error))
    }
}

impl From<SagaStoreError> for HandlerError {
    fn from(error: SagaStoreError) -> Self {
        Self::Engine(SagaError::Store(error))
    }
}

impl From<BusError> for HandlerError {
    fn from(error: BusError) -> Self {
        Self::Engine(SagaError::Bus(error))
    }
}

/// Convenience type alias for engine results.
pub type Result<T> = std::result::Result<T, SagaError>;
