//! Step identity and step metadata records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{MessageId, StepStatus};

/// Composite identity of a saga step.
///
/// At most one metadata record exists per key within a saga.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepKey {
    /// Message type representing the step.
    pub step_type: String,
    /// Handler that processed (or emitted) the step.
    pub handler_type: String,
    /// Disambiguates repeated occurrences of the same step type.
    pub message_id: MessageId,
}

impl StepKey {
    pub fn new(
        step_type: impl Into<String>,
        handler_type: impl Into<String>,
        message_id: MessageId,
    ) -> Self {
        Self {
            step_type: step_type.into(),
            handler_type: handler_type.into(),
            message_id,
        }
    }

    /// Hash field name used by key/value backends.
    pub fn field(&self) -> String {
        format!(
            "step:{}:handler:{}:message-id:{}",
            self.step_type, self.handler_type, self.message_id
        )
    }
}

impl std::fmt::Display for StepKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}, {}, {})",
            self.step_type, self.handler_type, self.message_id
        )
    }
}

/// Why a step failed, or why its compensation failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub reason: String,
    pub error_type: Option<String>,
    pub detail: Option<String>,
}

impl FailureInfo {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            error_type: None,
            detail: None,
        }
    }

    /// Captures an error's message, type name and source chain.
    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        let mut detail = Vec::new();
        let mut source = error.source();
        while let Some(inner) = source {
            detail.push(inner.to_string());
            source = inner.source();
        }

        Self {
            reason: error.to_string(),
            error_type: Some(std::any::type_name::<E>().to_string()),
            detail: (!detail.is_empty()).then(|| detail.join(": ")),
        }
    }

    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl std::fmt::Display for FailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_type {
            Some(error_type) => write!(f, "{} ({error_type})", self.reason),
            None => write!(f, "{}", self.reason),
        }
    }
}

/// One immutable record of a step's state.
///
/// A transition never edits a record in place; it replaces the record for
/// the same [`StepKey`] with a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStepMetadata {
    pub step_type: String,
    pub handler_type: String,
    pub status: StepStatus,
    pub message_id: MessageId,
    /// `None` marks a root step.
    pub parent_message_id: Option<MessageId>,
    /// Type name used to rehydrate `payload`.
    pub message_type_name: String,
    pub application_id: Option<String>,
    /// The serialized step message.
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
    pub failure: Option<FailureInfo>,
}

impl SagaStepMetadata {
    pub fn key(&self) -> StepKey {
        StepKey::new(&self.step_type, &self.handler_type, self.message_id)
    }

    pub fn is_root(&self) -> bool {
        self.parent_message_id.is_none()
    }
}
