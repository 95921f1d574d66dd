//! Inbound message dispatch.

use std::sync::Arc;

use common::SagaId;
use saga_store::{StepKey, StepStatus};
use tokio_util::sync::CancellationToken;

use crate::coordinator::CompensationCoordinator;
use crate::error::{Result, SagaError};
use crate::message::{InboundMessage, MessageEnvelope};
use crate::middleware::MiddlewarePipeline;
use crate::registry::HandlerRegistry;

/// What one handler did with a dispatched message.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReport {
    pub saga_id: SagaId,
    pub handler_type: &'static str,
    /// Step key of the inbound message for this handler.
    pub step: StepKey,
    /// Steps the handler recorded a status for.
    pub marked: Vec<StepKey>,
}

/// Routes inbound messages to their handlers.
///
/// Per message: resolve handlers, then for each one resolve the saga id,
/// build its context, run the middleware pipeline around the selected
/// entry point and finally check that the handler recorded an outcome.
pub struct SagaDispatcher {
    registry: Arc<HandlerRegistry>,
    coordinator: Arc<CompensationCoordinator>,
    pipeline: MiddlewarePipeline,
}

impl SagaDispatcher {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        coordinator: Arc<CompensationCoordinator>,
        pipeline: MiddlewarePipeline,
    ) -> Self {
        Self {
            registry,
            coordinator,
            pipeline,
        }
    }

    pub fn pipeline(&self) -> &MiddlewarePipeline {
        &self.pipeline
    }

    /// Dispatches one message. Returns one report per handler invoked;
    /// the first handler error aborts the remaining handlers.
    #[tracing::instrument(
        skip_all,
        fields(message_type = %envelope.message_type, message_id = %envelope.message_id)
    )]
    pub async fn dispatch(
        &self,
        envelope: &MessageEnvelope,
        cancel: &CancellationToken,
    ) -> Result<Vec<DispatchReport>> {
        if cancel.is_cancelled() {
            return Err(SagaError::Cancelled);
        }

        let invokers = self.registry.resolve(envelope)?;
        if invokers.is_empty() {
            tracing::debug!("no handler subscribed, message ignored");
            return Ok(Vec::new());
        }
        metrics::counter!("saga_dispatch_total", "message_type" => envelope.message_type.clone())
            .increment(1);

        let mut reports = Vec::with_capacity(invokers.len());
        for invoker in invokers {
            let report = invoker
                .dispatch(envelope, self.coordinator.services(), &self.pipeline, cancel)
                .await?;
            self.post_check(&report).await?;
            reports.push(report);
        }
        Ok(reports)
    }

    /// Decodes a transport message and dispatches it.
    pub async fn dispatch_inbound(
        &self,
        inbound: &InboundMessage,
        cancel: &CancellationToken,
    ) -> Result<Vec<DispatchReport>> {
        let envelope = MessageEnvelope::from_inbound(inbound)?;
        self.dispatch(&envelope, cancel).await
    }

    /// Warns when the handler left no step completed, failed or compensated.
    async fn post_check(&self, report: &DispatchReport) -> Result<()> {
        let store = self.coordinator.store();
        for key in report.marked.iter().chain(std::iter::once(&report.step)) {
            let status = store.get_step_status(report.saga_id, key).await?;
            if matches!(
                status,
                StepStatus::Completed | StepStatus::Failed | StepStatus::Compensated
            ) {
                return Ok(());
            }
        }

        self.coordinator
            .observer()
            .on_unmarked_dispatch(report.saga_id, &report.step);
        Ok(())
    }
}
