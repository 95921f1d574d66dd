//! Compensation chains.
//!
//! A failed step is recorded as `Failed` and handed to the handler able to
//! compensate it. When that handler marks the step `Compensated`, the
//! coordinator moves on to the step's logical parent, and so on until a
//! root step (one without a parent message) is compensated.

use std::sync::Arc;

use common::{IdGenerator, MessageId, SagaId, UuidGenerator};
use saga_store::{
    FailureInfo, LogStep, SagaStepMetadata, SagaStore, StepKey, StepStatus, StepWrite,
};
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::context::EngineServices;
use crate::error::{Result, SagaError};
use crate::observer::{SagaObserver, TracingObserver};
use crate::registry::HandlerRegistry;

/// A step as seen by the party that is about to change its status.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRef {
    pub saga_id: SagaId,
    pub key: StepKey,
    pub parent_message_id: Option<MessageId>,
    pub message_type_name: String,
    pub application_id: Option<String>,
    pub payload: serde_json::Value,
}

impl StepRef {
    pub fn from_record(saga_id: SagaId, record: &SagaStepMetadata) -> Self {
        Self {
            saga_id,
            key: record.key(),
            parent_message_id: record.parent_message_id,
            message_type_name: record.message_type_name.clone(),
            application_id: record.application_id.clone(),
            payload: record.payload.clone(),
        }
    }

    /// A store request recording this step with `status`.
    pub fn log(&self, status: StepStatus) -> LogStep {
        LogStep::new(self.saga_id, self.key.clone(), status)
            .parent(self.parent_message_id)
            .message_type_name(self.message_type_name.clone())
            .application_id(self.application_id.clone())
            .payload(self.payload.clone())
    }
}

/// Tuning for parent resolution.
#[derive(Debug, Clone)]
pub struct CompensationConfig {
    /// How many consecutive response-relay steps may be skipped when
    /// resolving a step's logical parent.
    pub orchestrator_hops: usize,
}

impl Default for CompensationConfig {
    fn default() -> Self {
        Self {
            orchestrator_hops: 1,
        }
    }
}

/// Drives compensation of failed steps and their ancestors.
pub struct CompensationCoordinator {
    store: Arc<dyn SagaStore>,
    bus: Arc<dyn EventBus>,
    ids: Arc<dyn IdGenerator>,
    registry: Arc<HandlerRegistry>,
    observer: Arc<dyn SagaObserver>,
    config: CompensationConfig,
    application_id: Option<String>,
}

impl CompensationCoordinator {
    pub fn new(
        store: Arc<dyn SagaStore>,
        bus: Arc<dyn EventBus>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            store,
            bus,
            ids: Arc::new(UuidGenerator),
            registry,
            observer: Arc::new(TracingObserver),
            config: CompensationConfig::default(),
            application_id: None,
        }
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SagaObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_config(mut self, config: CompensationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_application_id(mut self, application_id: Option<String>) -> Self {
        self.application_id = application_id;
        self
    }

    pub fn store(&self) -> &Arc<dyn SagaStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn observer(&self) -> &Arc<dyn SagaObserver> {
        &self.observer
    }

    /// Collaborators handed to every saga context.
    pub fn services(self: &Arc<Self>) -> EngineServices {
        EngineServices {
            store: Arc::clone(&self.store),
            bus: Arc::clone(&self.bus),
            ids: Arc::clone(&self.ids),
            coordinator: Arc::clone(self),
            observer: Arc::clone(&self.observer),
            application_id: self.application_id.clone(),
        }
    }

    /// Records `step` as failed and invokes its compensation handler.
    ///
    /// A no-op when the step is already failed or compensated, or when a
    /// concurrent caller recorded the same failure first, so a chain
    /// re-entered by redelivery does not run twice.
    #[tracing::instrument(skip_all, fields(saga_id = %step.saga_id, step = %step.key))]
    pub async fn compensate(
        self: &Arc<Self>,
        step: &StepRef,
        failure: FailureInfo,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let status = self.store.get_step_status(step.saga_id, &step.key).await?;
        if status.is_failed_or_compensated() {
            tracing::debug!(%status, "step already failed, compensation not restarted");
            return Ok(());
        }

        tracing::info!(failure = %failure, "step failed, compensating");
        let write = self
            .store
            .log_step(step.log(StepStatus::Failed).failure(Some(failure)))
            .await?;
        if write == StepWrite::Unchanged {
            tracing::debug!("failure already recorded by a concurrent writer");
            return Ok(());
        }

        let Some(record) = self
            .store
            .get_saga_handler_step(step.saga_id, &step.key)
            .await?
        else {
            self.skip(step.saga_id, &step.key, "failed step vanished from the store");
            return Ok(());
        };

        self.invoke_compensation(step.saga_id, &record, cancel)
            .await
    }

    /// Records `step` as compensated and continues with its logical parent.
    #[tracing::instrument(skip_all, fields(saga_id = %step.saga_id, step = %step.key))]
    pub async fn compensate_parent(
        self: &Arc<Self>,
        step: &StepRef,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let existing = self
            .store
            .get_saga_handler_step(step.saga_id, &step.key)
            .await?;
        let status = existing.as_ref().map_or(StepStatus::None, |r| r.status);
        if status.is_terminal() {
            tracing::debug!(%status, "step already compensated");
            return Ok(());
        }

        // A compensated step keeps the failure that started the chain.
        let failure = existing.and_then(|r| r.failure);
        let write = self
            .store
            .log_step(step.log(StepStatus::Compensated).failure(failure))
            .await?;
        if write == StepWrite::Unchanged {
            tracing::debug!("compensation already recorded by a concurrent writer");
            return Ok(());
        }
        metrics::counter!("saga_compensations_total").increment(1);

        let Some(parent_id) = step.parent_message_id else {
            tracing::info!("root step compensated, compensation chain complete");
            return Ok(());
        };

        let steps = self.store.get_saga_handler_steps(step.saga_id).await?;
        let Some(parent) = self.logical_parent(&steps, parent_id) else {
            self.skip(
                step.saga_id,
                &step.key,
                &format!("parent message {parent_id} has no recorded step"),
            );
            return Ok(());
        };

        self.invoke_compensation(step.saga_id, &parent, cancel)
            .await
    }

    /// Resolves the step a parent message id refers to, skipping up to
    /// `orchestrator_hops` steps recorded by response relays.
    pub(crate) fn logical_parent(
        &self,
        steps: &[SagaStepMetadata],
        parent_id: MessageId,
    ) -> Option<SagaStepMetadata> {
        let mut parent = record_for(steps, parent_id)?;

        for _ in 0..self.config.orchestrator_hops {
            if !self.registry.is_relay(&parent.handler_type) {
                break;
            }
            let Some(next) = parent
                .parent_message_id
                .and_then(|grandparent| record_for(steps, grandparent))
            else {
                break;
            };
            tracing::debug!(relay = %parent.key(), "skipping response relay step");
            parent = next;
        }

        Some(parent.clone())
    }

    async fn invoke_compensation(
        self: &Arc<Self>,
        saga_id: SagaId,
        record: &SagaStepMetadata,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let key = record.key();
        if record.status.is_terminal() {
            tracing::debug!(step = %key, "step already compensated");
            return Ok(());
        }

        let Some(invoker) = self
            .registry
            .compensator_for(&record.step_type, &record.handler_type)
        else {
            self.skip(saga_id, &key, "no handler compensates this step type");
            return Ok(());
        };

        self.observer.on_compensation_started(saga_id, &key);
        match invoker
            .compensate(saga_id, record, self.services(), cancel)
            .await
        {
            Err(error @ (SagaError::PayloadDecode { .. } | SagaError::Dispatch { .. })) => {
                self.skip(saga_id, &key, &error.to_string());
                Ok(())
            }
            other => other,
        }
    }

    fn skip(&self, saga_id: SagaId, key: &StepKey, reason: &str) {
        metrics::counter!("saga_compensation_skipped_total").increment(1);
        self.observer.on_compensation_skipped(saga_id, key, reason);
    }
}

/// Record for a message id, preferring one still eligible for compensation
/// and then the most recent.
fn record_for(steps: &[SagaStepMetadata], message_id: MessageId) -> Option<&SagaStepMetadata> {
    steps
        .iter()
        .filter(|s| s.message_id == message_id)
        .max_by_key(|s| (!s.status.is_terminal(), s.recorded_at))
}
