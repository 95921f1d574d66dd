use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

/// Minimal key/value surface the saga store needs from an external backend.
///
/// The only write primitive for step records is
/// [`hash_compare_and_swap`](KeyValueBackend::hash_compare_and_swap);
/// backends that cannot honor it atomically must not implement this trait.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Writes `value` to `key`/`field` only if the stored value equals
    /// `expected` (`None` meaning the field must not exist).
    ///
    /// Returns `false` when another writer changed the field first.
    async fn hash_compare_and_swap(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Refreshes the expiry of `key`. A no-op for backends without expiration.
    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    fn supports_expiration(&self) -> bool {
        false
    }
}
