//! Handler registry and the typed invokers behind it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::SagaId;
use futures_util::future::BoxFuture;
use saga_store::{FailureInfo, SagaStepMetadata};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::context::{CurrentStep, EngineServices, SagaContext};
use crate::dispatcher::DispatchReport;
use crate::error::{HandlerError, Result, SagaError};
use crate::handler::{EntryPoint, HandlerDescriptor, SagaHandler};
use crate::message::{MessageEnvelope, MessageKind, SagaMessage};
use crate::middleware::{Endpoint, InvocationContext, MiddlewarePipeline};

/// Type-erased entry points of one registered handler.
#[async_trait]
pub(crate) trait HandlerInvoker: Send + Sync {
    fn descriptor(&self) -> &HandlerDescriptor;

    /// Runs the handler for an inbound message through the pipeline.
    async fn dispatch(
        &self,
        envelope: &MessageEnvelope,
        services: EngineServices,
        pipeline: &MiddlewarePipeline,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport>;

    /// Runs the handler's compensation for a recorded step.
    async fn compensate(
        &self,
        saga_id: SagaId,
        record: &SagaStepMetadata,
        services: EngineServices,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Handlers keyed by the message type they consume.
///
/// Built once at startup; lookups never inspect handler types at dispatch.
#[derive(Default)]
pub struct HandlerRegistry {
    by_message: HashMap<&'static str, Vec<Arc<dyn HandlerInvoker>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler. A second handler with the same handler type for
    /// the same message type is rejected.
    pub fn register<H: SagaHandler>(&mut self, handler: H) -> Result<()> {
        self.register_arc(Arc::new(handler))
    }

    pub fn register_arc<H: SagaHandler>(&mut self, handler: Arc<H>) -> Result<()> {
        let descriptor = HandlerDescriptor::of::<H>();
        let handlers = self.by_message.entry(descriptor.message_type).or_default();
        if handlers
            .iter()
            .any(|h| h.descriptor().handler_type == descriptor.handler_type)
        {
            return Err(SagaError::DuplicateHandler {
                handler_type: descriptor.handler_type.to_string(),
                message_type: descriptor.message_type.to_string(),
            });
        }

        tracing::debug!(
            handler = descriptor.handler_type,
            message_type = descriptor.message_type,
            "handler registered"
        );
        handlers.push(Arc::new(Invoker {
            handler,
            descriptor,
        }));
        Ok(())
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &HandlerDescriptor> {
        self.by_message
            .values()
            .flatten()
            .map(|invoker| invoker.descriptor())
    }

    pub fn handlers_for(&self, message_type: &str) -> Vec<&HandlerDescriptor> {
        self.by_message
            .get(message_type)
            .map(|handlers| handlers.iter().map(|h| h.descriptor()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_message.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether steps recorded by `handler_type` are response relays.
    pub fn is_relay(&self, handler_type: &str) -> bool {
        self.descriptors()
            .any(|d| d.handler_type == handler_type && d.relays_responses)
    }

    /// Handlers an inbound message must be delivered to.
    ///
    /// - Responses fan out to every handler of the message type (narrowed
    ///   to the named handler type when there is one).
    /// - A named handler type selects that handler.
    /// - Unnamed commands need exactly one handler; unnamed events fan out.
    /// - An event nobody handles resolves to nothing; a command is an error.
    pub(crate) fn resolve(&self, envelope: &MessageEnvelope) -> Result<Vec<Arc<dyn HandlerInvoker>>> {
        let not_found = || SagaError::HandlerNotFound {
            message_type: envelope.message_type.clone(),
            handler_type: envelope.handler_type.clone(),
        };

        let Some(handlers) = self.by_message.get(envelope.message_type.as_str()) else {
            return match envelope.kind {
                MessageKind::Command => Err(not_found()),
                _ => Ok(Vec::new()),
            };
        };

        let selected: Vec<_> = match envelope.handler_type.as_deref() {
            Some(handler_type) => handlers
                .iter()
                .filter(|h| h.descriptor().handler_type == handler_type)
                .cloned()
                .collect(),
            None if envelope.kind.is_response() => handlers.clone(),
            None if envelope.kind == MessageKind::Command && handlers.len() > 1 => {
                return Err(SagaError::AmbiguousHandler {
                    message_type: envelope.message_type.clone(),
                    handlers: handlers
                        .iter()
                        .map(|h| h.descriptor().handler_type.to_string())
                        .collect(),
                });
            }
            None => handlers.clone(),
        };

        if selected.is_empty() {
            return Err(not_found());
        }
        Ok(selected)
    }

    /// The handler that compensates a step: the one that recorded it if it
    /// handles that step type, otherwise any handler compensating the type.
    pub(crate) fn compensator_for(
        &self,
        step_type: &str,
        handler_type: &str,
    ) -> Option<Arc<dyn HandlerInvoker>> {
        let handlers = self.by_message.get(step_type)?;
        let compensating = || handlers.iter().filter(|h| h.descriptor().compensates);

        compensating()
            .find(|h| h.descriptor().handler_type == handler_type)
            .or_else(|| compensating().next())
            .cloned()
    }
}

struct Invoker<H> {
    handler: Arc<H>,
    descriptor: HandlerDescriptor,
}

#[async_trait]
impl<H: SagaHandler> HandlerInvoker for Invoker<H> {
    fn descriptor(&self) -> &HandlerDescriptor {
        &self.descriptor
    }

    async fn dispatch(
        &self,
        envelope: &MessageEnvelope,
        services: EngineServices,
        pipeline: &MiddlewarePipeline,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport> {
        let message_type = H::Message::message_type();
        let mut message: H::Message =
            envelope
                .decode()
                .map_err(|source| SagaError::PayloadDecode {
                    message_type: message_type.to_string(),
                    source,
                })?;

        let saga_id = match message.saga_id().or(envelope.saga_id) {
            Some(saga_id) => saga_id,
            None if H::STARTS_SAGA => {
                let saga_id = services.ids.saga_id();
                message.set_saga_id(saga_id);
                tracing::info!(%saga_id, handler = H::HANDLER_TYPE, "saga started");
                saga_id
            }
            None => {
                return Err(SagaError::MissingSagaId {
                    message_type: message_type.to_string(),
                    handler_type: H::HANDLER_TYPE.to_string(),
                });
            }
        };

        let step = CurrentStep::from_envelope(
            envelope,
            message_type,
            H::HANDLER_TYPE,
            serde_json::to_value(&message)?,
        );
        let ctx = SagaContext::<H::Message, H::Data>::initialize(
            services,
            saga_id,
            H::HANDLER_TYPE,
            step,
            cancel.clone(),
        )
        .await?;

        let entry = EntryPoint::for_kind(envelope.kind);
        let invocation =
            InvocationContext::new(saga_id, H::HANDLER_TYPE, envelope, entry, cancel.clone());
        let endpoint = HandlerEndpoint {
            handler: self.handler.as_ref(),
            ctx: Mutex::new(ctx),
            message,
            entry,
        };
        pipeline.run(&invocation, &endpoint).await?;

        let ctx = endpoint.ctx.into_inner();
        ctx.save_data().await?;
        Ok(DispatchReport {
            saga_id,
            handler_type: H::HANDLER_TYPE,
            step: ctx.step_key().clone(),
            marked: ctx.marked_steps().to_vec(),
        })
    }

    async fn compensate(
        &self,
        saga_id: SagaId,
        record: &SagaStepMetadata,
        services: EngineServices,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(SagaError::Cancelled);
        }

        let message_type = H::Message::message_type();
        if record.message_type_name != message_type {
            return Err(SagaError::Dispatch {
                handler_type: H::HANDLER_TYPE.to_string(),
                message_type: record.message_type_name.clone(),
                reason: format!("recorded payload is not a {message_type}"),
            });
        }
        let message: H::Message = serde_json::from_value(record.payload.clone()).map_err(
            |source| SagaError::PayloadDecode {
                message_type: message_type.to_string(),
                source,
            },
        )?;

        let mut ctx = SagaContext::<H::Message, H::Data>::initialize(
            services,
            saga_id,
            H::HANDLER_TYPE,
            CurrentStep::from_record(record),
            cancel.clone(),
        )
        .await?;

        tracing::info!(
            %saga_id,
            step = %record.key(),
            handler = H::HANDLER_TYPE,
            "compensating step"
        );
        match self.handler.compensate(&mut ctx, message).await {
            Ok(()) => {}
            Err(HandlerError::Failed(failure)) => {
                ctx.services()
                    .observer
                    .on_handler_failed(saga_id, ctx.step_key(), &failure);
                ctx.mark_as_compensation_failed::<H::Message>(failure)
                    .await?;
            }
            Err(HandlerError::Cancelled) => return Err(SagaError::Cancelled),
            Err(HandlerError::Engine(error)) => return Err(error),
        }
        ctx.save_data().await
    }
}

/// Pipeline endpoint that runs one handler entry point.
struct HandlerEndpoint<'h, H: SagaHandler> {
    handler: &'h H,
    ctx: Mutex<SagaContext<H::Message, H::Data>>,
    message: H::Message,
    entry: EntryPoint,
}

impl<H: SagaHandler> Endpoint for HandlerEndpoint<'_, H> {
    fn call<'a>(&'a self, _invocation: &'a InvocationContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut ctx = self.ctx.lock().await;
            run_entry(self.handler, &mut ctx, self.message.clone(), self.entry).await
        })
    }
}

/// Invokes the selected entry point and turns handler outcomes into step
/// statuses: a business failure marks the step failed (which compensates
/// it), cancellation is reported as such and never compensates.
async fn run_entry<H: SagaHandler>(
    handler: &H,
    ctx: &mut SagaContext<H::Message, H::Data>,
    message: H::Message,
    entry: EntryPoint,
) -> Result<()> {
    if ctx.cancellation().is_cancelled() {
        return Err(SagaError::Cancelled);
    }

    let outcome = match entry {
        EntryPoint::Handle => handler.handle(ctx, message).await,
        EntryPoint::SuccessResponse => handler.handle_success_response(ctx, message).await,
        EntryPoint::Compensate => {
            let failure = FailureInfo::new(format!(
                "{} received",
                H::Message::message_type()
            ))
            .with_error_type(MessageKind::FailedEvent.as_str());
            return ctx.mark_as_failed::<H::Message>(failure).await;
        }
    };

    match outcome {
        Ok(()) => Ok(()),
        Err(HandlerError::Failed(failure)) => {
            ctx.services()
                .observer
                .on_handler_failed(ctx.saga_id(), ctx.step_key(), &failure);
            ctx.mark_as_failed::<H::Message>(failure).await
        }
        Err(HandlerError::Cancelled) => Err(SagaError::Cancelled),
        Err(HandlerError::Engine(error)) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        BillingListener, CreateOrderCommand, InventoryHandler, OrderCreatedEvent, PaymentAccepted,
        PaymentAuditor, PaymentHandler, ResponseRelay, StartOrderHandler,
    };

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register(StartOrderHandler).unwrap();
        registry.register(InventoryHandler).unwrap();
        registry.register(BillingListener::default()).unwrap();
        registry.register(PaymentHandler::default()).unwrap();
        registry
    }

    fn envelope<M: SagaMessage>(message: &M, handler_type: Option<&str>) -> MessageEnvelope {
        MessageEnvelope::for_message(message)
            .unwrap()
            .handler_type(handler_type.map(str::to_string))
            .build()
    }

    fn handler_types(invokers: &[Arc<dyn HandlerInvoker>]) -> Vec<&'static str> {
        let mut types: Vec<_> = invokers
            .iter()
            .map(|i| i.descriptor().handler_type)
            .collect();
        types.sort();
        types
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = registry();

        let result = registry.register(StartOrderHandler);

        assert!(matches!(result, Err(SagaError::DuplicateHandler { .. })));
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn named_handler_is_selected() {
        let resolved = registry()
            .resolve(&envelope(&OrderCreatedEvent { order_id: 1 }, Some("Inventory")))
            .unwrap();

        assert_eq!(handler_types(&resolved), vec!["Inventory"]);
    }

    #[test]
    fn unnamed_event_fans_out() {
        let resolved = registry()
            .resolve(&envelope(&OrderCreatedEvent { order_id: 1 }, None))
            .unwrap();

        assert_eq!(handler_types(&resolved), vec!["Billing", "Inventory"]);
    }

    #[test]
    fn responses_fan_out_to_every_handler() {
        let mut registry = HandlerRegistry::new();
        registry.register(ResponseRelay).unwrap();
        registry.register(PaymentAuditor::default()).unwrap();
        let accepted = PaymentAccepted { order_id: 1 };

        let all = registry.resolve(&envelope(&accepted, None)).unwrap();
        assert_eq!(handler_types(&all), vec!["PaymentAudit", "ResponseRelay"]);

        let named = registry
            .resolve(&envelope(&accepted, Some("ResponseRelay")))
            .unwrap();
        assert_eq!(handler_types(&named), vec!["ResponseRelay"]);
    }

    #[test]
    fn unhandled_event_resolves_to_nothing_but_command_fails() {
        let registry = HandlerRegistry::new();

        let event = registry
            .resolve(&envelope(&OrderCreatedEvent { order_id: 1 }, None))
            .unwrap();
        assert!(event.is_empty());

        let command = registry.resolve(&envelope(&CreateOrderCommand::default(), None));
        assert!(matches!(command, Err(SagaError::HandlerNotFound { .. })));
    }

    #[test]
    fn unknown_handler_type_is_not_found() {
        let result = registry().resolve(&envelope(&OrderCreatedEvent { order_id: 1 }, Some("Nope")));

        assert!(matches!(
            result,
            Err(SagaError::HandlerNotFound { handler_type: Some(h), .. }) if h == "Nope"
        ));
    }

    #[test]
    fn compensator_prefers_the_recording_handler() {
        let registry = registry();

        let exact = registry
            .compensator_for("OrderCreatedEvent", "Billing")
            .unwrap();
        assert_eq!(exact.descriptor().handler_type, "Billing");

        // StartOrder recorded the event but does not consume it.
        let fallback = registry
            .compensator_for("OrderCreatedEvent", "StartOrder")
            .unwrap();
        assert_eq!(fallback.descriptor().handler_type, "Inventory");

        assert!(registry.compensator_for("Unknown", "StartOrder").is_none());
    }
}
