//! Saga orchestration engine.
//!
//! Handlers declare which message they consume and whether they carry
//! saga-scoped data. The engine routes inbound messages to them, hands
//! each a [`SagaContext`] for sending, publishing and recording step
//! outcomes, and walks compensation chains when a step fails:
//!
//! 1. The failed step is recorded `Failed` and its handler's `compensate`
//!    runs.
//! 2. `mark_as_compensated` records the step `Compensated` and resolves
//!    its logical parent (skipping response relays).
//! 3. The parent's handler compensates in turn, until the root step.
//!
//! Step records live in a [`saga_store::SagaStore`]; every write is
//! validated for legal transitions, idempotent redelivery and circular
//! ancestry.

pub mod bus;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod handler;
pub mod message;
pub mod middleware;
pub mod observer;
pub mod registry;
pub mod telemetry;
pub mod worker;

#[cfg(test)]
mod testing;

pub use bus::{EventBus, InMemoryEventBus, InboundStream};
pub use common::{IdGenerator, MessageId, SagaId, UuidGenerator};
pub use config::EngineConfig;
pub use context::{EngineServices, SagaContext, StepContext, Tracked};
pub use coordinator::{CompensationConfig, CompensationCoordinator, StepRef};
pub use dispatcher::{DispatchReport, SagaDispatcher};
pub use engine::{SagaEngine, SagaEngineBuilder};
pub use error::{BusError, HandlerError, Result, SagaError};
pub use handler::{EntryPoint, HandlerDescriptor, SagaData, SagaHandler};
pub use message::{InboundMessage, MessageEnvelope, MessageEnvelopeBuilder, MessageKind, SagaMessage};
pub use middleware::{
    InvocationContext, LoggingMiddleware, Middleware, MiddlewarePipeline, Next, RetryMiddleware,
    TracingMiddleware,
};
pub use observer::{NoOpObserver, SagaObserver, TracingObserver};
pub use registry::HandlerRegistry;
pub use saga_store::{FailureInfo, StepKey, StepStatus};
pub use telemetry::{LogFormat, init_tracing};
pub use worker::SagaWorker;
