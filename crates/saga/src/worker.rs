//! Consumer loop feeding the dispatcher.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::dispatcher::SagaDispatcher;
use crate::error::{Result, SagaError};

/// Pulls messages off the bus and dispatches each on its own task.
///
/// There is no lock across sagas, and steps of one saga may run
/// concurrently; the store's per-step compare-and-swap keeps them
/// consistent.
pub struct SagaWorker {
    bus: Arc<dyn EventBus>,
    dispatcher: Arc<SagaDispatcher>,
}

impl SagaWorker {
    pub fn new(bus: Arc<dyn EventBus>, dispatcher: Arc<SagaDispatcher>) -> Self {
        Self { bus, dispatcher }
    }

    /// Runs until `cancel` fires or the stream ends, then waits for
    /// in-flight dispatches to finish.
    ///
    /// Dispatch failures are logged per message and do not stop the loop.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut stream = self.bus.consume(cancel.clone()).await?;
        let mut tasks = JoinSet::new();
        tracing::info!("saga worker started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(inbound)) => {
                        let dispatcher = Arc::clone(&self.dispatcher);
                        let token = cancel.child_token();
                        tasks.spawn(async move {
                            match dispatcher.dispatch_inbound(&inbound, &token).await {
                                Ok(_) => {}
                                Err(SagaError::Cancelled) => {
                                    tracing::debug!(message_type = %inbound.message_type, "dispatch cancelled");
                                }
                                Err(error) => {
                                    metrics::counter!("saga_dispatch_errors_total").increment(1);
                                    tracing::error!(
                                        message_type = %inbound.message_type,
                                        error = %error,
                                        "dispatch failed"
                                    );
                                }
                            }
                        });
                    }
                    Some(Err(error)) => {
                        tracing::error!(error = %error, "failed to receive message");
                    }
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(error) = joined {
                        tracing::error!(error = %error, "dispatch task panicked");
                    }
                }
            }
        }

        tracing::info!(in_flight = tasks.len(), "saga worker stopping, draining in-flight dispatches");
        while let Some(joined) = tasks.join_next().await {
            if let Err(error) = joined {
                tracing::error!(error = %error, "dispatch task panicked");
            }
        }
        Ok(())
    }
}
