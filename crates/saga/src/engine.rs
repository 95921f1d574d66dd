//! Engine assembly.
//!
//! [`SagaEngine::builder`] wires a store, a bus, the registered handlers
//! and a middleware pipeline into a dispatcher and a compensation
//! coordinator. Anything not supplied falls back to the in-process
//! implementations.

use std::sync::Arc;

use chrono::Utc;
use common::{IdGenerator, SagaId, UuidGenerator};
use saga_store::{InMemorySagaStore, KeyValueBackend, KvSagaStore, SagaStore};
use tokio_util::sync::CancellationToken;

use crate::bus::{EventBus, InMemoryEventBus};
use crate::config::EngineConfig;
use crate::context::{CurrentStep, SagaContext};
use crate::coordinator::CompensationCoordinator;
use crate::dispatcher::{DispatchReport, SagaDispatcher};
use crate::error::Result;
use crate::handler::{SagaData, SagaHandler};
use crate::message::{InboundMessage, MessageEnvelope, SagaMessage};
use crate::middleware::{Middleware, MiddlewarePipeline};
use crate::observer::{SagaObserver, TracingObserver};
use crate::registry::HandlerRegistry;
use crate::worker::SagaWorker;

/// Builder for [`SagaEngine`].
pub struct SagaEngineBuilder {
    store: Option<Arc<dyn SagaStore>>,
    bus: Option<Arc<dyn EventBus>>,
    ids: Option<Arc<dyn IdGenerator>>,
    observer: Option<Arc<dyn SagaObserver>>,
    pipeline: Option<MiddlewarePipeline>,
    registry: HandlerRegistry,
    config: EngineConfig,
}

impl SagaEngineBuilder {
    fn new() -> Self {
        Self {
            store: None,
            bus: None,
            ids: None,
            observer: None,
            pipeline: None,
            registry: HandlerRegistry::new(),
            config: EngineConfig::default(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn SagaStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Uses a [`KvSagaStore`] over `backend`, tuned by the configured
    /// [`StoreConfig`](saga_store::StoreConfig).
    pub fn kv_backend<B: KeyValueBackend + 'static>(mut self, backend: B) -> Self {
        self.store = Some(Arc::new(KvSagaStore::with_config(
            backend,
            self.config.store.clone(),
        )));
        self
    }

    pub fn bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn SagaObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Replaces the default pipeline (tracing, then logging).
    pub fn pipeline(mut self, pipeline: MiddlewarePipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Appends a middleware, innermost last.
    pub fn middleware<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        let pipeline = self.pipeline.take().unwrap_or_else(MiddlewarePipeline::standard);
        self.pipeline = Some(pipeline.with(middleware));
        self
    }

    pub fn register<H: SagaHandler>(mut self, handler: H) -> Result<Self> {
        self.registry.register(handler)?;
        Ok(self)
    }

    pub fn register_arc<H: SagaHandler>(mut self, handler: Arc<H>) -> Result<Self> {
        self.registry.register_arc(handler)?;
        Ok(self)
    }

    /// Subscribes every registered handler on the bus and assembles the engine.
    pub async fn build(self) -> Result<SagaEngine> {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemorySagaStore::new()));
        let bus = self
            .bus
            .unwrap_or_else(|| Arc::new(InMemoryEventBus::new()));
        let ids = self.ids.unwrap_or_else(|| Arc::new(UuidGenerator));
        let observer = self.observer.unwrap_or_else(|| Arc::new(TracingObserver));
        let pipeline = self.pipeline.unwrap_or_else(MiddlewarePipeline::standard);

        for descriptor in self.registry.descriptors() {
            bus.subscribe(descriptor.message_type, descriptor.handler_type)
                .await?;
        }
        tracing::info!(
            handlers = self.registry.len(),
            middleware = ?pipeline.names(),
            application_id = ?self.config.application_id,
            "saga engine built"
        );

        let registry = Arc::new(self.registry);
        let coordinator = Arc::new(
            CompensationCoordinator::new(store, Arc::clone(&bus), Arc::clone(&registry))
                .with_ids(Arc::clone(&ids))
                .with_observer(observer)
                .with_config(self.config.compensation())
                .with_application_id(self.config.application_id.clone()),
        );
        let dispatcher = Arc::new(SagaDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&coordinator),
            pipeline,
        ));

        Ok(SagaEngine {
            bus,
            ids,
            registry,
            coordinator,
            dispatcher,
            application_id: self.config.application_id,
        })
    }
}

/// A configured saga engine.
pub struct SagaEngine {
    bus: Arc<dyn EventBus>,
    ids: Arc<dyn IdGenerator>,
    registry: Arc<HandlerRegistry>,
    coordinator: Arc<CompensationCoordinator>,
    dispatcher: Arc<SagaDispatcher>,
    application_id: Option<String>,
}

impl SagaEngine {
    pub fn builder() -> SagaEngineBuilder {
        SagaEngineBuilder::new()
    }

    pub fn store(&self) -> &Arc<dyn SagaStore> {
        self.coordinator.store()
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<CompensationCoordinator> {
        &self.coordinator
    }

    pub fn dispatcher(&self) -> &Arc<SagaDispatcher> {
        &self.dispatcher
    }

    pub async fn dispatch(
        &self,
        envelope: &MessageEnvelope,
        cancel: &CancellationToken,
    ) -> Result<Vec<DispatchReport>> {
        self.dispatcher.dispatch(envelope, cancel).await
    }

    pub async fn dispatch_inbound(
        &self,
        inbound: &InboundMessage,
        cancel: &CancellationToken,
    ) -> Result<Vec<DispatchReport>> {
        self.dispatcher.dispatch_inbound(inbound, cancel).await
    }

    /// A consumer loop over this engine's bus.
    pub fn worker(&self) -> SagaWorker {
        SagaWorker::new(Arc::clone(&self.bus), Arc::clone(&self.dispatcher))
    }

    /// Sends a root message (one without a parent) to its handler.
    pub async fn send<M: SagaMessage>(
        &self,
        message: &M,
        cancel: &CancellationToken,
    ) -> Result<MessageEnvelope> {
        let envelope = self.root_envelope(message)?;
        self.bus.send(envelope.clone(), cancel).await?;
        Ok(envelope)
    }

    /// Publishes a root message to every subscriber.
    pub async fn publish<M: SagaMessage>(
        &self,
        message: &M,
        cancel: &CancellationToken,
    ) -> Result<MessageEnvelope> {
        let envelope = self.root_envelope(message)?;
        self.bus.publish(envelope.clone(), cancel).await?;
        Ok(envelope)
    }

    /// Builds the context `handler_type` would see for `envelope`, outside
    /// of dispatch.
    ///
    /// Useful for code that reacts to a message without a registered
    /// handler, e.g. an HTTP callback completing a step.
    pub async fn load_context<M: SagaMessage, D: SagaData>(
        &self,
        saga_id: SagaId,
        envelope: &MessageEnvelope,
        handler_type: &'static str,
        cancel: CancellationToken,
    ) -> Result<SagaContext<M, D>> {
        let step = CurrentStep::from_envelope(
            envelope,
            M::message_type(),
            handler_type,
            envelope.payload.clone(),
        );
        SagaContext::initialize(
            self.coordinator.services(),
            saga_id,
            handler_type,
            step,
            cancel,
        )
        .await
    }

    fn root_envelope<M: SagaMessage>(&self, message: &M) -> Result<MessageEnvelope> {
        let mut builder = MessageEnvelope::for_message(message)?
            .message_id(self.ids.message_id())
            .application_id(self.application_id.clone())
            .published_at(Utc::now());
        if let Some(saga_id) = message.saga_id() {
            builder = builder.correlation_id(Some(saga_id.to_string()));
        }
        Ok(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use saga_store::{SagaStoreExt, StepKey, StepStatus};

    use super::*;
    use crate::bus::InMemoryEventBus;
    use crate::error::SagaError;
    use crate::middleware::RetryMiddleware;
    use crate::observer::NoOpObserver;
    use crate::testing::{
        BillingListener, CreateOrderCommand, InventoryHandler, OrderCreatedEvent, OrderSagaData,
        PaymentHandler, ResponseRelay, StartOrderHandler,
    };

    async fn engine(bus: &InMemoryEventBus, payment: PaymentHandler) -> SagaEngine {
        SagaEngine::builder()
            .bus(Arc::new(bus.clone()))
            .register(StartOrderHandler)
            .unwrap()
            .register(InventoryHandler)
            .unwrap()
            .register(payment)
            .unwrap()
            .register(ResponseRelay)
            .unwrap()
            .build()
            .await
            .unwrap()
    }

    /// Dispatches queued messages until the bus is idle.
    async fn drain(engine: &SagaEngine, bus: &InMemoryEventBus) -> Vec<DispatchReport> {
        let cancel = CancellationToken::new();
        let mut reports = Vec::new();
        loop {
            let pending = bus.take_pending();
            if pending.is_empty() {
                return reports;
            }
            for inbound in pending {
                reports.extend(engine.dispatch_inbound(&inbound, &cancel).await.unwrap());
            }
        }
    }

    fn step_of<'a>(reports: &'a [DispatchReport], handler_type: &str) -> &'a StepKey {
        &reports
            .iter()
            .find(|r| r.handler_type == handler_type)
            .unwrap()
            .step
    }

    #[tokio::test]
    async fn build_subscribes_every_handler() {
        let bus = InMemoryEventBus::new();
        let engine = engine(&bus, PaymentHandler::default()).await;

        assert_eq!(engine.registry().len(), 4);
        assert_eq!(bus.subscribers("OrderCreatedEvent"), vec!["Inventory"]);
        assert_eq!(bus.subscribers("PaymentAccepted"), vec!["ResponseRelay"]);
    }

    #[tokio::test]
    async fn happy_path_completes_every_step() {
        let bus = InMemoryEventBus::new();
        let payment = PaymentHandler::default();
        let engine = engine(&bus, payment.clone()).await;

        engine
            .send(
                &CreateOrderCommand {
                    order_id: 42,
                    ..Default::default()
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let reports = drain(&engine, &bus).await;

        assert_eq!(reports.len(), 4);
        let saga_id = reports[0].saga_id;
        assert!(reports.iter().all(|r| r.saga_id == saga_id));

        let steps = engine.store().get_saga_handler_steps(saga_id).await.unwrap();
        assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
        assert_eq!(payment.charged(), vec![42]);
        assert!(payment.refunded().is_empty());
    }

    #[tokio::test]
    async fn failed_payment_compensates_back_to_the_root() {
        let bus = InMemoryEventBus::new();
        let payment = PaymentHandler::default();
        let engine = engine(&bus, payment.clone()).await;

        engine
            .send(
                &CreateOrderCommand {
                    order_id: 7,
                    saga_id: None,
                    fail_payment: true,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let reports = drain(&engine, &bus).await;
        let saga_id = reports[0].saga_id;
        let store = engine.store();

        let payment_step = step_of(&reports, "Payment");
        let record = store
            .get_saga_handler_step(saga_id, payment_step)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, StepStatus::Compensated);
        assert_eq!(record.failure.unwrap().reason, "card declined");

        for handler_type in ["Inventory", "StartOrder"] {
            let status = store
                .get_step_status(saga_id, step_of(&reports, handler_type))
                .await
                .unwrap();
            assert_eq!(status, StepStatus::Compensated, "{handler_type}");
        }

        let data: OrderSagaData = store.load_saga_data_as(saga_id).await.unwrap();
        assert!(data.cancelled);
        assert!(payment.charged().is_empty());
        assert_eq!(payment.refunded(), vec![7]);
        assert!(bus.history_of("PaymentAccepted").is_empty());
    }

    #[tokio::test]
    async fn events_fan_out_to_every_listener() {
        let bus = InMemoryEventBus::new();
        let billing = BillingListener::default();
        let engine = SagaEngine::builder()
            .bus(Arc::new(bus.clone()))
            .observer(Arc::new(NoOpObserver))
            .middleware(RetryMiddleware::default())
            .register(InventoryHandler)
            .unwrap()
            .register_arc(Arc::new(billing.clone()))
            .unwrap()
            .build()
            .await
            .unwrap();
        assert_eq!(
            engine.dispatcher().pipeline().names(),
            vec!["tracing", "logging", "retry"]
        );

        let saga_id = SagaId::new();
        let envelope = MessageEnvelope::for_message(&OrderCreatedEvent { order_id: 1 })
            .unwrap()
            .saga_id(saga_id)
            .build();
        let reports = engine
            .dispatch(&envelope, &CancellationToken::new())
            .await
            .unwrap();

        let mut handlers: Vec<_> = reports.iter().map(|r| r.handler_type).collect();
        handlers.sort();
        assert_eq!(handlers, vec!["Billing", "Inventory"]);
        assert_eq!(billing.seen(), 1);
    }

    #[tokio::test]
    async fn load_context_marks_steps_outside_dispatch() {
        let engine = SagaEngine::builder().build().await.unwrap();
        let saga_id = SagaId::new();
        let envelope = MessageEnvelope::for_message(&OrderCreatedEvent { order_id: 1 })
            .unwrap()
            .saga_id(saga_id)
            .build();

        let mut ctx = engine
            .load_context::<OrderCreatedEvent, ()>(
                saga_id,
                &envelope,
                "Callback",
                CancellationToken::new(),
            )
            .await
            .unwrap();
        ctx.mark_as_complete::<OrderCreatedEvent>().await.unwrap();

        let key = StepKey::new("OrderCreatedEvent", "Callback", envelope.message_id);
        assert_eq!(
            engine.store().get_step_status(saga_id, &key).await.unwrap(),
            StepStatus::Completed
        );
    }

    #[tokio::test]
    async fn unhandled_root_command_is_rejected_by_the_bus() {
        let engine = SagaEngine::builder().build().await.unwrap();

        let result = engine
            .send(&CreateOrderCommand::default(), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(SagaError::Bus(_))));
    }
}
