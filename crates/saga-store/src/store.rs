use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};

use crate::validator::{self, ValidationResult};
use crate::{
    FailureInfo, MessageId, Result, SagaId, SagaStepMetadata, SagaStoreError, StepKey, StepStatus,
};

/// A request to record a step status.
#[derive(Debug, Clone)]
pub struct LogStep {
    pub saga_id: SagaId,
    pub key: StepKey,
    pub parent_message_id: Option<MessageId>,
    pub status: StepStatus,
    pub message_type_name: String,
    pub application_id: Option<String>,
    pub payload: serde_json::Value,
    pub failure: Option<FailureInfo>,
}

impl LogStep {
    /// Creates a request for a root step with an empty payload.
    ///
    /// The message type name defaults to the step type.
    pub fn new(saga_id: SagaId, key: StepKey, status: StepStatus) -> Self {
        Self {
            saga_id,
            message_type_name: key.step_type.clone(),
            key,
            parent_message_id: None,
            status,
            application_id: None,
            payload: serde_json::Value::Null,
            failure: None,
        }
    }

    pub fn parent(mut self, parent_message_id: Option<MessageId>) -> Self {
        self.parent_message_id = parent_message_id;
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn message_type_name(mut self, name: impl Into<String>) -> Self {
        self.message_type_name = name.into();
        self
    }

    pub fn application_id(mut self, application_id: Option<String>) -> Self {
        self.application_id = application_id;
        self
    }

    pub fn failure(mut self, failure: Option<FailureInfo>) -> Self {
        self.failure = failure;
        self
    }

    /// Builds the record this request would store.
    pub fn to_metadata(&self, recorded_at: DateTime<Utc>) -> SagaStepMetadata {
        SagaStepMetadata {
            step_type: self.key.step_type.clone(),
            handler_type: self.key.handler_type.clone(),
            status: self.status,
            message_id: self.key.message_id,
            parent_message_id: self.parent_message_id,
            message_type_name: self.message_type_name.clone(),
            application_id: self.application_id.clone(),
            payload: self.payload.clone(),
            recorded_at,
            failure: self.failure.clone(),
        }
    }
}

/// What a successful `log_step` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepWrite {
    /// A new record replaced the previous one.
    Applied,
    /// The same status and payload were already stored; nothing changed.
    Unchanged,
}

/// How to find a step message to rehydrate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepLookup {
    /// Most recent record of this step type.
    StepType(String),
    MessageId(MessageId),
}

/// A step payload read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub message_type_name: String,
    pub message_id: MessageId,
    pub parent_message_id: Option<MessageId>,
    pub payload: serde_json::Value,
}

impl StoredMessage {
    /// Deserializes the payload into its original type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Core trait for saga store implementations.
///
/// Implementations must validate every step write with
/// [`validator::validate`] and make the replacement of a step record atomic
/// per [`StepKey`]. All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Validates and records a step status.
    ///
    /// Returns `Unchanged` for an idempotent redelivery. Duplicates with a
    /// different payload, illegal transitions and circular chains are
    /// errors and leave the stored state untouched.
    async fn log_step(&self, step: LogStep) -> Result<StepWrite>;

    /// Current status of a step, `StepStatus::None` if never recorded.
    async fn get_step_status(&self, saga_id: SagaId, key: &StepKey) -> Result<StepStatus>;

    async fn get_saga_handler_step(
        &self,
        saga_id: SagaId,
        key: &StepKey,
    ) -> Result<Option<SagaStepMetadata>>;

    /// Snapshot of every step record of a saga, oldest first.
    async fn get_saga_handler_steps(&self, saga_id: SagaId) -> Result<Vec<SagaStepMetadata>>;

    /// Loads the saga's business data document.
    async fn load_saga_data(&self, saga_id: SagaId) -> Result<Option<serde_json::Value>>;

    /// Replaces the saga's business data document.
    async fn save_saga_data(&self, saga_id: SagaId, data: serde_json::Value) -> Result<()>;

    /// Rehydrates the message recorded for a step.
    async fn load_saga_step_message(
        &self,
        saga_id: SagaId,
        lookup: StepLookup,
    ) -> Result<Option<StoredMessage>> {
        let steps = self.get_saga_handler_steps(saga_id).await?;
        Ok(find_step_message(&steps, &lookup))
    }
}

/// Extension trait providing typed convenience methods for saga stores.
#[async_trait]
pub trait SagaStoreExt: SagaStore {
    /// Returns true if the step is recorded as `Completed`.
    async fn is_step_completed(&self, saga_id: SagaId, key: &StepKey) -> Result<bool> {
        Ok(self.get_step_status(saga_id, key).await? == StepStatus::Completed)
    }

    /// Loads saga data, falling back to `T::default()` when none exists yet.
    async fn load_saga_data_as<T>(&self, saga_id: SagaId) -> Result<T>
    where
        T: DeserializeOwned + Default + Send,
    {
        match self.load_saga_data(saga_id).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(T::default()),
        }
    }

    async fn save_saga_data_as<T>(&self, saga_id: SagaId, data: &T) -> Result<()>
    where
        T: Serialize + Sync,
    {
        self.save_saga_data(saga_id, serde_json::to_value(data)?)
            .await
    }

    async fn load_step_message_as<T>(&self, saga_id: SagaId, lookup: StepLookup) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        self.load_saga_step_message(saga_id, lookup)
            .await?
            .map(|message| message.decode())
            .transpose()
    }
}

// Blanket implementation for all SagaStore implementations
impl<T: SagaStore + ?Sized> SagaStoreExt for T {}

/// Picks the record a lookup refers to.
///
/// A step-type lookup returns the most recently recorded match.
pub(crate) fn find_step_message(
    steps: &[SagaStepMetadata],
    lookup: &StepLookup,
) -> Option<StoredMessage> {
    let found = match lookup {
        StepLookup::StepType(step_type) => steps
            .iter()
            .filter(|s| &s.step_type == step_type)
            .max_by_key(|s| s.recorded_at),
        StepLookup::MessageId(id) => steps.iter().find(|s| s.message_id == *id),
    }?;

    Some(StoredMessage {
        message_type_name: found.message_type_name.clone(),
        message_id: found.message_id,
        parent_message_id: found.parent_message_id,
        payload: found.payload.clone(),
    })
}

/// Runs the validator for `step` and maps its verdict onto the store's
/// error taxonomy.
///
/// `Ok(true)` means the caller must write, `Ok(false)` means the write is
/// an idempotent no-op.
pub(crate) fn check_step(
    step: &LogStep,
    proposed: &SagaStepMetadata,
    steps: &[SagaStepMetadata],
    existing: Option<&SagaStepMetadata>,
) -> Result<bool> {
    let validation = validator::validate(steps, &step.key, proposed, existing);
    match validation.result {
        ValidationResult::ValidTransition => Ok(true),
        ValidationResult::Idempotent => {
            tracing::debug!(
                saga_id = %step.saga_id,
                step = %step.key,
                status = %step.status,
                "idempotent step write ignored"
            );
            metrics::counter!("saga_steps_idempotent_total").increment(1);
            Ok(false)
        }
        ValidationResult::DuplicateWithDifferentPayload => Err(SagaStoreError::Idempotency {
            saga_id: step.saga_id,
            key: step.key.clone(),
            status: step.status,
        }),
        ValidationResult::InvalidTransition => Err(SagaStoreError::Transition {
            saga_id: step.saga_id,
            key: step.key.clone(),
            from: existing.map(|e| e.status).unwrap_or_default(),
            to: step.status,
        }),
        ValidationResult::CircularChain => Err(SagaStoreError::CircularChain {
            saga_id: step.saga_id,
            key: step.key.clone(),
            message: validation.message,
        }),
    }
}
