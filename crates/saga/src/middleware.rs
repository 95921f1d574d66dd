//! Middleware pipeline wrapped around every handler invocation.
//!
//! Stages run in registration order. Each receives the
//! [`InvocationContext`] and a [`Next`] continuation; it may annotate,
//! short-circuit by not calling `next`, or call it more than once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::{MessageId, SagaId};
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::{Result, SagaError};
use crate::handler::EntryPoint;
use crate::message::{MessageEnvelope, MessageKind};

/// What a middleware stage knows about the invocation it wraps.
#[derive(Debug)]
pub struct InvocationContext {
    pub saga_id: SagaId,
    pub handler_type: &'static str,
    pub message_type: String,
    pub message_id: MessageId,
    pub kind: MessageKind,
    pub entry: EntryPoint,
    cancellation: CancellationToken,
    annotations: Mutex<HashMap<String, String>>,
}

impl InvocationContext {
    pub(crate) fn new(
        saga_id: SagaId,
        handler_type: &'static str,
        envelope: &MessageEnvelope,
        entry: EntryPoint,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            saga_id,
            handler_type,
            message_type: envelope.message_type.clone(),
            message_id: envelope.message_id,
            kind: envelope.kind,
            entry,
            cancellation,
            annotations: Mutex::new(HashMap::new()),
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Attaches a value visible to later stages.
    pub fn annotate(&self, key: impl Into<String>, value: impl Into<String>) {
        self.annotations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    pub fn annotation(&self, key: &str) -> Option<String> {
        self.annotations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

/// The innermost call of a pipeline.
pub(crate) trait Endpoint: Send + Sync {
    fn call<'a>(&'a self, invocation: &'a InvocationContext) -> BoxFuture<'a, Result<()>>;
}

/// Continuation to the rest of the pipeline.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    stages: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Endpoint,
}

impl Next<'_> {
    /// Runs the remaining stages and then the handler.
    pub async fn run(self, invocation: &InvocationContext) -> Result<()> {
        match self.stages.split_first() {
            Some((stage, rest)) => {
                let next = Next {
                    stages: rest,
                    endpoint: self.endpoint,
                };
                stage.handle(invocation, next).await
            }
            None => self.endpoint.call(invocation).await,
        }
    }
}

/// A cross-cutting stage around handler invocation.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, invocation: &InvocationContext, next: Next<'_>) -> Result<()>;
}

/// Ordered middleware stages.
#[derive(Clone, Default)]
pub struct MiddlewarePipeline {
    stages: Vec<Arc<dyn Middleware>>,
}

impl MiddlewarePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// The default stack: tracing span outermost, then logging.
    pub fn standard() -> Self {
        Self::new().with(TracingMiddleware).with(LoggingMiddleware)
    }

    pub fn with<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.push(Arc::new(middleware));
        self
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.stages.push(middleware);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub(crate) async fn run(
        &self,
        invocation: &InvocationContext,
        endpoint: &dyn Endpoint,
    ) -> Result<()> {
        Next {
            stages: &self.stages,
            endpoint,
        }
        .run(invocation)
        .await
    }
}

/// Opens a span per invocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMiddleware;

#[async_trait]
impl Middleware for TracingMiddleware {
    fn name(&self) -> &'static str {
        "tracing"
    }

    async fn handle(&self, invocation: &InvocationContext, next: Next<'_>) -> Result<()> {
        let span = tracing::info_span!(
            "saga_handler",
            saga_id = %invocation.saga_id,
            handler = invocation.handler_type,
            message_type = %invocation.message_type,
            message_id = %invocation.message_id,
            entry = invocation.entry.as_str()
        );
        next.run(invocation).instrument(span).await
    }
}

/// Logs each invocation's outcome and records its duration.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn handle(&self, invocation: &InvocationContext, next: Next<'_>) -> Result<()> {
        let start = Instant::now();
        let result = next.run(invocation).await;
        let elapsed = start.elapsed();

        metrics::histogram!(
            "saga_dispatch_duration_seconds",
            "handler" => invocation.handler_type
        )
        .record(elapsed.as_secs_f64());

        match &result {
            Ok(()) => tracing::debug!(
                duration_ms = elapsed.as_millis() as u64,
                "handler invocation completed"
            ),
            Err(error) => tracing::warn!(
                duration_ms = elapsed.as_millis() as u64,
                error = %error,
                "handler invocation failed"
            ),
        }
        result
    }
}

/// Retries invocations that failed on the event bus.
///
/// Store and handler errors are never retried: validation errors are
/// permanent and business failures have already been recorded.
#[derive(Debug, Clone)]
pub struct RetryMiddleware {
    max_attempts: u32,
    backoff: Duration,
}

impl RetryMiddleware {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

impl Default for RetryMiddleware {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(50))
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn handle(&self, invocation: &InvocationContext, next: Next<'_>) -> Result<()> {
        let mut attempt = 1;
        loop {
            match next.run(invocation).await {
                Err(SagaError::Bus(error))
                    if attempt < self.max_attempts && !invocation.cancellation().is_cancelled() =>
                {
                    tracing::warn!(attempt, error = %error, "bus failure, retrying handler");
                    tokio::time::sleep(self.backoff * attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
