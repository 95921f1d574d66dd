use async_trait::async_trait;
use chrono::Utc;

use super::{KeyValueBackend, data_key, steps_key};
use crate::store::{LogStep, SagaStore, StepWrite, check_step};
use crate::{Result, SagaId, SagaStepMetadata, SagaStoreError, StepKey, StepStatus, StoreConfig};

/// Saga store over any [`KeyValueBackend`], writing step records with
/// compare-and-swap.
///
/// Each write reads the raw field, validates against the decoded record and
/// the saga's current snapshot, then swaps only if the raw field is still
/// what was read. A lost race re-runs the whole read/validate/write cycle
/// after an incremental backoff, so the loser re-evaluates legality against
/// the winner's record.
#[derive(Clone)]
pub struct KvSagaStore<B> {
    backend: B,
    config: StoreConfig,
}

impl<B: KeyValueBackend> KvSagaStore<B> {
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, StoreConfig::default())
    }

    pub fn with_config(backend: B, config: StoreConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn decode(raw: &str) -> Result<SagaStepMetadata> {
        Ok(serde_json::from_str(raw)?)
    }

    async fn read_steps(&self, saga_id: SagaId) -> Result<Vec<SagaStepMetadata>> {
        let raw = self.backend.hash_get_all(&steps_key(saga_id)).await?;
        let mut steps = raw
            .values()
            .map(|value| Self::decode(value))
            .collect::<Result<Vec<_>>>()?;
        steps.sort_by_key(|s| s.recorded_at);
        Ok(steps)
    }
}

#[async_trait]
impl<B: KeyValueBackend> SagaStore for KvSagaStore<B> {
    #[tracing::instrument(skip(self, step), fields(saga_id = %step.saga_id, step = %step.key, status = %step.status))]
    async fn log_step(&self, step: LogStep) -> Result<StepWrite> {
        let key = steps_key(step.saga_id);
        let field = step.key.field();

        for attempt in 1..=self.config.max_attempts {
            let current = self.backend.hash_get(&key, &field).await?;
            let existing = current.as_deref().map(Self::decode).transpose()?;
            let snapshot = self.read_steps(step.saga_id).await?;

            let proposed = step.to_metadata(Utc::now());
            if !check_step(&step, &proposed, &snapshot, existing.as_ref())? {
                return Ok(StepWrite::Unchanged);
            }

            let encoded = serde_json::to_string(&proposed)?;
            if self
                .backend
                .hash_compare_and_swap(&key, &field, current.as_deref(), &encoded)
                .await?
            {
                if let Some(ttl) = self.config.step_ttl {
                    if self.backend.supports_expiration() {
                        self.backend.expire(&key, ttl).await?;
                    }
                }
                metrics::counter!("saga_steps_logged_total").increment(1);
                tracing::debug!(attempt, "step recorded");
                return Ok(StepWrite::Applied);
            }

            metrics::counter!("saga_step_cas_conflicts_total").increment(1);
            tracing::debug!(attempt, "step write lost a compare-and-swap race, retrying");
            tokio::time::sleep(self.config.backoff_for(attempt)).await;
        }

        tracing::warn!(
            attempts = self.config.max_attempts,
            "step write gave up after repeated conflicts"
        );
        Err(SagaStoreError::ConcurrencyConflict {
            saga_id: step.saga_id,
            key: step.key.clone(),
            attempts: self.config.max_attempts,
        })
    }

    async fn get_step_status(&self, saga_id: SagaId, key: &StepKey) -> Result<StepStatus> {
        Ok(self
            .get_saga_handler_step(saga_id, key)
            .await?
            .map(|s| s.status)
            .unwrap_or_default())
    }

    async fn get_saga_handler_step(
        &self,
        saga_id: SagaId,
        key: &StepKey,
    ) -> Result<Option<SagaStepMetadata>> {
        self.backend
            .hash_get(&steps_key(saga_id), &key.field())
            .await?
            .as_deref()
            .map(Self::decode)
            .transpose()
    }

    async fn get_saga_handler_steps(&self, saga_id: SagaId) -> Result<Vec<SagaStepMetadata>> {
        self.read_steps(saga_id).await
    }

    async fn load_saga_data(&self, saga_id: SagaId) -> Result<Option<serde_json::Value>> {
        self.backend
            .get(&data_key(saga_id))
            .await?
            .map(|raw| serde_json::from_str(&raw).map_err(SagaStoreError::from))
            .transpose()
    }

    async fn save_saga_data(&self, saga_id: SagaId, data: serde_json::Value) -> Result<()> {
        self.backend
            .set(&data_key(saga_id), &serde_json::to_string(&data)?)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::kv::InMemoryKeyValueBackend;
    use crate::store::SagaStoreExt;
    use crate::MessageId;

    /// Backend that loses the first `conflicts` CAS attempts to a phantom writer.
    #[derive(Clone)]
    struct ContendedBackend {
        inner: InMemoryKeyValueBackend,
        conflicts: Arc<AtomicU32>,
        attempts: Arc<AtomicU32>,
    }

    impl ContendedBackend {
        fn new(conflicts: u32) -> Self {
            Self {
                inner: InMemoryKeyValueBackend::new(),
                conflicts: Arc::new(AtomicU32::new(conflicts)),
                attempts: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    #[async_trait]
    impl KeyValueBackend for ContendedBackend {
        async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
            self.inner.hash_get(key, field).await
        }

        async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
            self.inner.hash_get_all(key).await
        }

        async fn hash_compare_and_swap(
            &self,
            key: &str,
            field: &str,
            expected: Option<&str>,
            value: &str,
        ) -> Result<bool> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let lose = self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if lose {
                return Ok(false);
            }
            self.inner
                .hash_compare_and_swap(key, field, expected, value)
                .await
        }

        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<()> {
            self.inner.set(key, value).await
        }
    }

    fn fast_config(max_attempts: u32) -> StoreConfig {
        StoreConfig {
            max_attempts,
            retry_backoff: Duration::from_millis(1),
            step_ttl: Some(Duration::from_secs(60)),
        }
    }

    #[tokio::test]
    async fn write_uses_documented_key_layout() {
        let store = KvSagaStore::new(InMemoryKeyValueBackend::new());
        let saga_id = SagaId::new();
        let key = StepKey::new("OrderCreated", "StartOrder", MessageId::new());

        store
            .log_step(LogStep::new(saga_id, key.clone(), StepStatus::Completed))
            .await
            .unwrap();

        let raw = store
            .backend()
            .hash_get(&format!("saga:{saga_id}:steps"), &key.field())
            .await
            .unwrap();
        assert!(raw.is_some());
    }

    #[tokio::test]
    async fn successful_write_refreshes_ttl() {
        let store = KvSagaStore::with_config(InMemoryKeyValueBackend::new(), fast_config(3));
        let saga_id = SagaId::new();

        store
            .log_step(LogStep::new(
                saga_id,
                StepKey::new("A", "H", MessageId::new()),
                StepStatus::Started,
            ))
            .await
            .unwrap();

        let ttl = store.backend().ttl(&steps_key(saga_id)).await.unwrap();
        assert!(ttl > Duration::from_secs(50));
    }

    #[tokio::test]
    async fn lost_races_are_retried() {
        let backend = ContendedBackend::new(2);
        let store = KvSagaStore::with_config(backend.clone(), fast_config(5));
        let saga_id = SagaId::new();
        let key = StepKey::new("A", "H", MessageId::new());

        let write = store
            .log_step(LogStep::new(saga_id, key.clone(), StepStatus::Completed))
            .await
            .unwrap();

        assert_eq!(write, StepWrite::Applied);
        assert_eq!(backend.attempts.load(Ordering::SeqCst), 3);
        assert!(store.is_step_completed(saga_id, &key).await.unwrap());
    }

    #[tokio::test]
    async fn exhausted_retries_raise_concurrency_conflict() {
        let backend = ContendedBackend::new(u32::MAX);
        let store = KvSagaStore::with_config(backend.clone(), fast_config(3));
        let saga_id = SagaId::new();
        let key = StepKey::new("A", "H", MessageId::new());

        let result = store
            .log_step(LogStep::new(saga_id, key.clone(), StepStatus::Completed))
            .await;

        assert!(matches!(
            result,
            Err(SagaStoreError::ConcurrencyConflict { attempts: 3, .. })
        ));
        assert_eq!(backend.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(
            store.get_step_status(saga_id, &key).await.unwrap(),
            StepStatus::None
        );
    }

    #[tokio::test]
    async fn racing_transitions_have_one_winner() {
        let store = KvSagaStore::with_config(InMemoryKeyValueBackend::new(), fast_config(10));
        let saga_id = SagaId::new();
        let key = StepKey::new("A", "H", MessageId::new());
        store
            .log_step(LogStep::new(saga_id, key.clone(), StepStatus::Started))
            .await
            .unwrap();

        let complete = {
            let store = store.clone();
            let step = LogStep::new(saga_id, key.clone(), StepStatus::Completed);
            tokio::spawn(async move { store.log_step(step).await })
        };
        let fail = {
            let store = store.clone();
            let step = LogStep::new(saga_id, key.clone(), StepStatus::Failed);
            tokio::spawn(async move { store.log_step(step).await })
        };

        let results = [complete.await.unwrap(), fail.await.unwrap()];
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(SagaStoreError::Transition { .. })))
        );

        let status = store.get_step_status(saga_id, &key).await.unwrap();
        assert!(matches!(status, StepStatus::Completed | StepStatus::Failed));
    }

    #[tokio::test]
    async fn saga_data_round_trip() {
        let store = KvSagaStore::new(InMemoryKeyValueBackend::new());
        let saga_id = SagaId::new();

        assert!(store.load_saga_data(saga_id).await.unwrap().is_none());
        store
            .save_saga_data(saga_id, json!({"reserved": true}))
            .await
            .unwrap();
        assert_eq!(
            store.load_saga_data(saga_id).await.unwrap(),
            Some(json!({"reserved": true}))
        );
    }
}
