//! Saga observer trait

use common::SagaId;
use saga_store::{FailureInfo, StepKey};

/// Observer for the points where the engine contains a problem instead of
/// propagating it.
pub trait SagaObserver: Send + Sync + 'static {
    fn on_compensation_started(&self, saga_id: SagaId, step: &StepKey);
    /// Compensation of `step` could not proceed and the chain stops there.
    fn on_compensation_skipped(&self, saga_id: SagaId, step: &StepKey, reason: &str);
    /// A handler returned a business failure that is being recorded.
    fn on_handler_failed(&self, saga_id: SagaId, step: &StepKey, failure: &FailureInfo);
    /// A handler returned without marking any step.
    fn on_unmarked_dispatch(&self, saga_id: SagaId, step: &StepKey);
}

/// No-op observer
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpObserver;

impl SagaObserver for NoOpObserver {
    fn on_compensation_started(&self, _saga_id: SagaId, _step: &StepKey) {}
    fn on_compensation_skipped(&self, _saga_id: SagaId, _step: &StepKey, _reason: &str) {}
    fn on_handler_failed(&self, _saga_id: SagaId, _step: &StepKey, _failure: &FailureInfo) {}
    fn on_unmarked_dispatch(&self, _saga_id: SagaId, _step: &StepKey) {}
}

/// Tracing and metrics based observer
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SagaObserver for TracingObserver {
    fn on_compensation_started(&self, saga_id: SagaId, step: &StepKey) {
        tracing::info!(%saga_id, step = %step, "Compensation started");
    }

    fn on_compensation_skipped(&self, saga_id: SagaId, step: &StepKey, reason: &str) {
        tracing::warn!(%saga_id, step = %step, reason = %reason, "Compensation skipped");
    }

    fn on_handler_failed(&self, saga_id: SagaId, step: &StepKey, failure: &FailureInfo) {
        metrics::counter!("saga_handler_failures_total", "handler" => step.handler_type.clone())
            .increment(1);
        tracing::warn!(%saga_id, step = %step, failure = %failure, "Handler failed");
    }

    fn on_unmarked_dispatch(&self, saga_id: SagaId, step: &StepKey) {
        metrics::counter!("saga_unmarked_dispatch_total").increment(1);
        tracing::warn!(
            %saga_id,
            step = %step,
            "Handler returned without marking a step as complete, failed or compensated"
        );
    }
}
