use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::KeyValueBackend;
use crate::Result;

#[derive(Debug, Default)]
struct Entry {
    fields: HashMap<String, String>,
    value: Option<String>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Process-local key/value backend with CAS and expiry semantics.
///
/// Useful for tests and single-process deployments of [`KvSagaStore`](super::KvSagaStore).
#[derive(Clone, Default)]
pub struct InMemoryKeyValueBackend {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl InMemoryKeyValueBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub async fn key_count(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    /// Remaining time to live of a key, if it has one.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

#[async_trait]
impl KeyValueBackend for InMemoryKeyValueBackend {
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(Instant::now()))
            .and_then(|e| e.fields.get(field).cloned()))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(Instant::now()))
            .map(|e| e.fields.clone())
            .unwrap_or_default())
    }

    async fn hash_compare_and_swap(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.to_string()).or_default();
        if !entry.is_live(now) {
            *entry = Entry::default();
        }

        if entry.fields.get(field).map(String::as_str) != expected {
            return Ok(false);
        }

        entry.fields.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(Instant::now()))
            .and_then(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.to_string()).or_default();
        entry.value = Some(value.to_string());
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    fn supports_expiration(&self) -> bool {
        true
    }
}
