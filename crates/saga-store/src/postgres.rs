use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::kv::KeyValueBackend;
use crate::Result;

/// PostgreSQL-backed key/value backend for [`KvSagaStore`](crate::KvSagaStore).
///
/// Hash fields live in `saga_kv_hash`, plain values in `saga_kv`. The
/// compare-and-swap is a single conditional statement, so its atomicity
/// comes from the row lock Postgres takes for the write.
#[derive(Clone)]
pub struct PostgresKeyValueBackend {
    pool: PgPool,
}

impl PostgresKeyValueBackend {
    /// Creates a new PostgreSQL backend.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    /// Deletes rows whose expiry has passed. Returns the number removed.
    pub async fn purge_expired(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let hashes = sqlx::query("DELETE FROM saga_kv_hash WHERE expires_at <= now()")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let values = sqlx::query("DELETE FROM saga_kv WHERE expires_at <= now()")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(hashes + values)
    }
}

#[async_trait]
impl KeyValueBackend for PostgresKeyValueBackend {
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar(
            r#"
            SELECT value FROM saga_kv_hash
            WHERE key = $1 AND field = $2
              AND (expires_at IS NULL OR expires_at > now())
            "#,
        )
        .bind(key)
        .bind(field)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let rows = sqlx::query(
            r#"
            SELECT field, value FROM saga_kv_hash
            WHERE key = $1
              AND (expires_at IS NULL OR expires_at > now())
            "#,
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| Ok((row.try_get("field")?, row.try_get("value")?)))
            .collect()
    }

    async fn hash_compare_and_swap(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool> {
        let result = match expected {
            // An expired row counts as absent, so it may be taken over.
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO saga_kv_hash (key, field, value)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (key, field) DO UPDATE
                        SET value = EXCLUDED.value, expires_at = NULL
                        WHERE saga_kv_hash.expires_at IS NOT NULL
                          AND saga_kv_hash.expires_at <= now()
                    "#,
                )
                .bind(key)
                .bind(field)
                .bind(value)
                .execute(&self.pool)
                .await?
            }
            Some(expected) => {
                sqlx::query(
                    r#"
                    UPDATE saga_kv_hash SET value = $4
                    WHERE key = $1 AND field = $2 AND value = $3
                      AND (expires_at IS NULL OR expires_at > now())
                    "#,
                )
                .bind(key)
                .bind(field)
                .bind(expected)
                .bind(value)
                .execute(&self.pool)
                .await?
            }
        };

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar(
            r#"
            SELECT value FROM saga_kv
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO saga_kv (key, value)
            VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = NULL
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let secs = ttl.as_secs_f64();
        sqlx::query(
            "UPDATE saga_kv_hash SET expires_at = now() + make_interval(secs => $2) WHERE key = $1",
        )
        .bind(key)
        .bind(secs)
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "UPDATE saga_kv SET expires_at = now() + make_interval(secs => $2) WHERE key = $1",
        )
        .bind(key)
        .bind(secs)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn supports_expiration(&self) -> bool {
        true
    }
}
