use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::store::{LogStep, SagaStore, StepWrite, check_step};
use crate::{Result, SagaId, SagaStepMetadata, StepKey, StepStatus};

#[derive(Debug, Default)]
struct SagaEntry {
    steps: HashMap<StepKey, SagaStepMetadata>,
    data: Option<serde_json::Value>,
}

impl SagaEntry {
    fn snapshot(&self) -> Vec<SagaStepMetadata> {
        let mut steps: Vec<_> = self.steps.values().cloned().collect();
        steps.sort_by_key(|s| s.recorded_at);
        steps
    }
}

/// In-memory saga store.
///
/// Validation and the write happen under one write lock, so step writes are
/// atomic without a compare-and-swap loop. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    sagas: Arc<RwLock<HashMap<SagaId, SagaEntry>>>,
}

impl InMemorySagaStore {
    /// Creates a new empty in-memory saga store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of step records across all sagas.
    pub async fn step_count(&self) -> usize {
        self.sagas
            .read()
            .await
            .values()
            .map(|entry| entry.steps.len())
            .sum()
    }

    /// Clears all sagas.
    pub async fn clear(&self) {
        self.sagas.write().await.clear();
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    #[tracing::instrument(skip(self, step), fields(saga_id = %step.saga_id, step = %step.key, status = %step.status))]
    async fn log_step(&self, step: LogStep) -> Result<StepWrite> {
        let mut sagas = self.sagas.write().await;
        let entry = sagas.entry(step.saga_id).or_default();

        let proposed = step.to_metadata(Utc::now());
        let existing = entry.steps.get(&step.key);
        let snapshot = entry.snapshot();

        if !check_step(&step, &proposed, &snapshot, existing)? {
            return Ok(StepWrite::Unchanged);
        }

        entry.steps.insert(step.key.clone(), proposed);
        metrics::counter!("saga_steps_logged_total").increment(1);
        tracing::debug!("step recorded");
        Ok(StepWrite::Applied)
    }

    async fn get_step_status(&self, saga_id: SagaId, key: &StepKey) -> Result<StepStatus> {
        let sagas = self.sagas.read().await;
        Ok(sagas
            .get(&saga_id)
            .and_then(|entry| entry.steps.get(key))
            .map(|s| s.status)
            .unwrap_or_default())
    }

    async fn get_saga_handler_step(
        &self,
        saga_id: SagaId,
        key: &StepKey,
    ) -> Result<Option<SagaStepMetadata>> {
        let sagas = self.sagas.read().await;
        Ok(sagas
            .get(&saga_id)
            .and_then(|entry| entry.steps.get(key))
            .cloned())
    }

    async fn get_saga_handler_steps(&self, saga_id: SagaId) -> Result<Vec<SagaStepMetadata>> {
        let sagas = self.sagas.read().await;
        Ok(sagas
            .get(&saga_id)
            .map(SagaEntry::snapshot)
            .unwrap_or_default())
    }

    async fn load_saga_data(&self, saga_id: SagaId) -> Result<Option<serde_json::Value>> {
        let sagas = self.sagas.read().await;
        Ok(sagas.get(&saga_id).and_then(|entry| entry.data.clone()))
    }

    async fn save_saga_data(&self, saga_id: SagaId, data: serde_json::Value) -> Result<()> {
        let mut sagas = self.sagas.write().await;
        sagas.entry(saga_id).or_default().data = Some(data);
        Ok(())
    }
}
