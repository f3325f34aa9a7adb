//! Postgres key-value backend.
//!
//! One `kv_entries` table, upserts via `ON CONFLICT`, expiry as a timestamp
//! column checked on every read. The schema is ensured at startup.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Config, Pool, Runtime};
use secrecy::ExposeSecret;
use tokio_postgres::NoTls;

use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::store::KvBackend;

pub struct PostgresBackend {
    pool: Pool,
}

impl PostgresBackend {
    /// Connect, verify the pool, and ensure the schema.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let url = config
            .url
            .as_ref()
            .ok_or_else(|| StoreError::Pool("DATABASE_URL not configured".to_string()))?;

        let mut cfg = Config::new();
        cfg.url = Some(url.expose_secret().to_string());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.pool_size,
            ..Default::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Pool(e.to_string()))?;

        let backend = Self { pool };
        backend.ensure_schema().await?;
        Ok(backend)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let conn = self.pool.get().await?;
        conn.batch_execute(
            r#"
            CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                value JSONB NOT NULL,
                expires_at TIMESTAMPTZ
            );
            CREATE INDEX IF NOT EXISTS kv_entries_expires_at_idx
                ON kv_entries (expires_at) WHERE expires_at IS NOT NULL;
            "#,
        )
        .await?;
        Ok(())
    }

    /// Cheap readiness probe for `/healthz`.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let conn = self.pool.get().await?;
        conn.simple_query("SELECT 1").await?;
        Ok(())
    }
}

#[async_trait]
impl KvBackend for PostgresBackend {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "SELECT value FROM kv_entries
                 WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())",
                &[&key],
            )
            .await?;
        Ok(row.map(|r| r.get::<_, serde_json::Value>(0)))
    }

    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let conn = self.pool.get().await?;
        let ttl_secs = ttl.map(|d| d.as_secs_f64());
        conn.execute(
            "INSERT INTO kv_entries (key, value, expires_at)
             VALUES ($1, $2, NOW() + ($3 * INTERVAL '1 second'))
             ON CONFLICT (key) DO UPDATE
                 SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
            &[&key, &value, &ttl_secs],
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let conn = self.pool.get().await?;
        let affected = conn
            .execute("DELETE FROM kv_entries WHERE key = $1", &[&key])
            .await?;
        Ok(affected > 0)
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, serde_json::Value)>, StoreError> {
        let conn = self.pool.get().await?;
        // LIKE with the prefix escaped; keys are internal and never contain
        // wildcards, but escape anyway.
        let pattern = format!("{}%", prefix.replace('%', r"\%").replace('_', r"\_"));
        let rows = conn
            .query(
                "SELECT key, value FROM kv_entries
                 WHERE key LIKE $1 AND (expires_at IS NULL OR expires_at > NOW())",
                &[&pattern],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<_, String>(0), r.get::<_, serde_json::Value>(1)))
            .collect())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let conn = self.pool.get().await?;
        let affected = conn
            .execute(
                "DELETE FROM kv_entries WHERE expires_at IS NOT NULL AND expires_at <= NOW()",
                &[],
            )
            .await?;
        Ok(affected)
    }
}
