//! Saga context handed to handlers.
//!
//! A context is bound to one step: the inbound message being handled, or
//! the recorded step being compensated. Every message it sends or
//! publishes is remembered by type, so a later `mark_as_*::<T>()` can
//! record the exact payload that went out under the key
//! `(T, handler, message id)`.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::Utc;
use common::{IdGenerator, MessageId, SagaId};
use saga_store::{FailureInfo, SagaStepMetadata, SagaStore, SagaStoreExt, StepKey, StepStatus};
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::coordinator::{CompensationCoordinator, StepRef};
use crate::error::{Result, SagaError};
use crate::handler::SagaData;
use crate::message::{MessageEnvelope, SagaMessage};
use crate::observer::SagaObserver;

/// Collaborators shared by every context of an engine.
#[derive(Clone)]
pub struct EngineServices {
    pub store: Arc<dyn SagaStore>,
    pub bus: Arc<dyn EventBus>,
    pub ids: Arc<dyn IdGenerator>,
    pub coordinator: Arc<CompensationCoordinator>,
    pub observer: Arc<dyn SagaObserver>,
    pub application_id: Option<String>,
}

/// The step a context is bound to.
#[derive(Debug, Clone)]
pub(crate) struct CurrentStep {
    pub key: StepKey,
    pub parent_message_id: Option<MessageId>,
    pub correlation_id: Option<String>,
    pub message_type_name: String,
    pub payload: serde_json::Value,
}

impl CurrentStep {
    pub fn from_envelope(
        envelope: &MessageEnvelope,
        step_type: &str,
        handler_type: &str,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            key: StepKey::new(step_type, handler_type, envelope.message_id),
            parent_message_id: envelope.parent_message_id,
            correlation_id: envelope.correlation_id.clone(),
            message_type_name: envelope.message_type.clone(),
            payload,
        }
    }

    pub fn from_record(record: &SagaStepMetadata) -> Self {
        Self {
            key: record.key(),
            parent_message_id: record.parent_message_id,
            correlation_id: None,
            message_type_name: record.message_type_name.clone(),
            payload: record.payload.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct TrackedMessage {
    message_id: MessageId,
    payload: serde_json::Value,
}

/// Context for a handler with message type `M` and saga data `D`.
pub struct SagaContext<M, D = ()> {
    services: EngineServices,
    saga_id: SagaId,
    handler_type: &'static str,
    step: CurrentStep,
    data: D,
    step_messages: HashMap<&'static str, TrackedMessage>,
    marked: Vec<StepKey>,
    cancel: CancellationToken,
    _message: PhantomData<fn() -> M>,
}

/// Context of a reactive handler, one without saga data.
pub type StepContext<M> = SagaContext<M, ()>;

impl<M: SagaMessage, D: SagaData> SagaContext<M, D> {
    /// Builds a context bound to `step`, loading (or defaulting) saga data.
    ///
    /// Dispatch, compensation and [`SagaEngine::load_context`](crate::SagaEngine::load_context)
    /// all construct contexts through here.
    pub(crate) async fn initialize(
        services: EngineServices,
        saga_id: SagaId,
        handler_type: &'static str,
        mut step: CurrentStep,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let data = if D::PERSISTENT {
            services.store.load_saga_data_as::<D>(saga_id).await?
        } else {
            D::default()
        };
        if step.correlation_id.is_none() {
            step.correlation_id = Some(saga_id.to_string());
        }

        Ok(Self {
            services,
            saga_id,
            handler_type,
            step,
            data,
            step_messages: HashMap::new(),
            marked: Vec::new(),
            cancel,
            _message: PhantomData,
        })
    }

    pub fn saga_id(&self) -> SagaId {
        self.saga_id
    }

    pub fn handler_type(&self) -> &'static str {
        self.handler_type
    }

    /// Id of the message this context is handling.
    pub fn message_id(&self) -> MessageId {
        self.step.key.message_id
    }

    pub fn parent_message_id(&self) -> Option<MessageId> {
        self.step.parent_message_id
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.step.correlation_id.as_deref()
    }

    pub fn step_key(&self) -> &StepKey {
        &self.step.key
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut D {
        &mut self.data
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn store(&self) -> &Arc<dyn SagaStore> {
        &self.services.store
    }

    /// Keys this context has recorded a status for, in order.
    pub fn marked_steps(&self) -> &[StepKey] {
        &self.marked
    }

    pub(crate) fn services(&self) -> &EngineServices {
        &self.services
    }

    /// Sends a command to its single subscriber.
    pub async fn send<T: SagaMessage>(&mut self, message: T) -> Result<()> {
        self.send_to(message, None).await
    }

    /// Sends a command to a specific handler, or lets the bus route it.
    pub async fn send_to<T: SagaMessage>(
        &mut self,
        message: T,
        handler_type: Option<&str>,
    ) -> Result<()> {
        let envelope = self.outgoing(message, handler_type)?;
        self.services.bus.send(envelope, &self.cancel).await?;
        Ok(())
    }

    /// Publishes an event to every subscriber.
    pub async fn publish<T: SagaMessage>(&mut self, message: T) -> Result<()> {
        let envelope = self.outgoing(message, None)?;
        self.services.bus.publish(envelope, &self.cancel).await?;
        Ok(())
    }

    /// Prepares a send whose step outcome is recorded right after it.
    pub fn send_with_tracking<T: SagaMessage>(&mut self, message: T) -> Tracked<'_, M, D, T> {
        Tracked::new(self, message, Route::Send(None))
    }

    pub fn send_to_with_tracking<T: SagaMessage>(
        &mut self,
        message: T,
        handler_type: impl Into<String>,
    ) -> Tracked<'_, M, D, T> {
        Tracked::new(self, message, Route::Send(Some(handler_type.into())))
    }

    /// Prepares a publish whose step outcome is recorded right after it.
    pub fn publish_with_tracking<T: SagaMessage>(&mut self, message: T) -> Tracked<'_, M, D, T> {
        Tracked::new(self, message, Route::Publish)
    }

    /// Records step `T` as `Completed`.
    pub async fn mark_as_complete<T: SagaMessage>(&mut self) -> Result<()> {
        let step = self.step_ref::<T>()?;
        self.save_data().await?;
        self.services
            .store
            .log_step(step.log(StepStatus::Completed))
            .await?;
        self.marked.push(step.key);
        Ok(())
    }

    /// Records step `T` as `Failed` and compensates it, then its ancestors.
    pub async fn mark_as_failed<T: SagaMessage>(&mut self, failure: FailureInfo) -> Result<()> {
        let step = self.step_ref::<T>()?;
        self.save_data().await?;
        self.services
            .coordinator
            .compensate(&step, failure, &self.cancel)
            .await?;
        self.reload_data().await?;
        self.marked.push(step.key);
        Ok(())
    }

    /// Records step `T` as `Compensated` and compensates its logical parent.
    pub async fn mark_as_compensated<T: SagaMessage>(&mut self) -> Result<()> {
        let step = self.step_ref::<T>()?;
        self.save_data().await?;
        self.services
            .coordinator
            .compensate_parent(&step, &self.cancel)
            .await?;
        self.reload_data().await?;
        self.marked.push(step.key);
        Ok(())
    }

    /// Records step `T` as `CompensationFailed`. The chain stops here.
    pub async fn mark_as_compensation_failed<T: SagaMessage>(
        &mut self,
        failure: FailureInfo,
    ) -> Result<()> {
        let step = self.step_ref::<T>()?;
        self.save_data().await?;
        self.services
            .store
            .log_step(
                step.log(StepStatus::CompensationFailed)
                    .failure(Some(failure)),
            )
            .await?;
        self.marked.push(step.key);
        Ok(())
    }

    /// Persists saga data. A no-op for reactive contexts.
    pub async fn save_data(&self) -> Result<()> {
        if D::PERSISTENT {
            self.services
                .store
                .save_saga_data_as(self.saga_id, &self.data)
                .await?;
        }
        Ok(())
    }

    // Compensation may have run other handlers that saved their own changes.
    async fn reload_data(&mut self) -> Result<()> {
        if D::PERSISTENT {
            self.data = self
                .services
                .store
                .load_saga_data_as::<D>(self.saga_id)
                .await?;
        }
        Ok(())
    }

    fn outgoing<T: SagaMessage>(
        &mut self,
        mut message: T,
        handler_type: Option<&str>,
    ) -> Result<MessageEnvelope> {
        message.set_saga_id(self.saga_id);
        let envelope = MessageEnvelope::for_message(&message)?
            .message_id(self.services.ids.message_id())
            .parent_message_id(Some(self.step.key.message_id))
            .saga_id(self.saga_id)
            .correlation_id(self.step.correlation_id.clone())
            .handler_type(handler_type.map(str::to_string))
            .application_id(self.services.application_id.clone())
            .published_at(Utc::now())
            .build();

        self.step_messages.insert(
            T::message_type(),
            TrackedMessage {
                message_id: envelope.message_id,
                payload: envelope.payload.clone(),
            },
        );
        Ok(envelope)
    }

    /// Resolves `T` to a step: a message this context emitted, or the
    /// step the context is bound to.
    fn step_ref<T: SagaMessage>(&self) -> Result<StepRef> {
        let step_type = T::message_type();

        if let Some(tracked) = self.step_messages.get(step_type) {
            return Ok(StepRef {
                saga_id: self.saga_id,
                key: StepKey::new(step_type, self.handler_type, tracked.message_id),
                parent_message_id: Some(self.step.key.message_id),
                message_type_name: step_type.to_string(),
                application_id: self.services.application_id.clone(),
                payload: tracked.payload.clone(),
            });
        }

        if step_type == self.step.key.step_type {
            return Ok(StepRef {
                saga_id: self.saga_id,
                key: self.step.key.clone(),
                parent_message_id: self.step.parent_message_id,
                message_type_name: self.step.message_type_name.clone(),
                application_id: self.services.application_id.clone(),
                payload: self.step.payload.clone(),
            });
        }

        Err(SagaError::UntrackedStep {
            step_type: step_type.to_string(),
        })
    }
}

enum Route {
    Send(Option<String>),
    Publish,
}

/// A pending send or publish paired with the step outcome to record once
/// it has gone out.
#[must_use = "a tracked message is only emitted by one of the then_mark_as_* methods"]
pub struct Tracked<'a, M, D, T> {
    ctx: &'a mut SagaContext<M, D>,
    message: T,
    route: Route,
}

impl<'a, M: SagaMessage, D: SagaData, T: SagaMessage> Tracked<'a, M, D, T> {
    fn new(ctx: &'a mut SagaContext<M, D>, message: T, route: Route) -> Self {
        Self {
            ctx,
            message,
            route,
        }
    }

    async fn emit(self) -> Result<&'a mut SagaContext<M, D>> {
        let Self {
            ctx,
            message,
            route,
        } = self;
        match route {
            Route::Send(handler_type) => ctx.send_to(message, handler_type.as_deref()).await?,
            Route::Publish => ctx.publish(message).await?,
        }
        Ok(ctx)
    }

    pub async fn then_mark_as_complete(self) -> Result<()> {
        self.emit().await?.mark_as_complete::<T>().await
    }

    pub async fn then_mark_as_failed(self, failure: FailureInfo) -> Result<()> {
        self.emit().await?.mark_as_failed::<T>(failure).await
    }

    pub async fn then_mark_as_compensated(self) -> Result<()> {
        self.emit().await?.mark_as_compensated::<T>().await
    }

    pub async fn then_mark_as_compensation_failed(self, failure: FailureInfo) -> Result<()> {
        self.emit()
            .await?
            .mark_as_compensation_failed::<T>(failure)
            .await
    }
}
