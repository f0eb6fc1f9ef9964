//! SQLite storage implementation.
//!
//! A file-based storage backend using SQLite. Good for:
//! - Local development
//! - Single-machine deployments
//! - Durable metrics across runs

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::path::Path;
use std::time::Duration;

use crate::error::{StoreError, StoreResult};
use crate::traits::store::{CacheStore, MetricsStore};
use crate::types::metric::{AggregateStats, MetricRecord, ModelUsage};

/// SQLite-backed cache and metrics store.
pub struct SqliteStore {
    pool: SqlitePool,
}

/// Timestamps are stored as fixed-width RFC 3339 so text order is time order.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("Invalid date: {}", e).into()))
}

impl SqliteStore {
    /// Connect with a SQLite URL.
    ///
    /// # Example URLs
    /// - `sqlite://data/metrics.db?mode=rwc` - File, created if missing
    /// - `sqlite::memory:` - Use [`SqliteStore::in_memory`] instead
    pub async fn new(database_url: &str) -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Open (and create if missing) a database file.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory SQLite store (for testing).
    ///
    /// Pinned to one connection: every in-memory connection is its own database.
    pub async fn in_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_cache_entries_expires_at ON cache_entries(expires_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                source TEXT NOT NULL,
                prompt_hash TEXT NOT NULL,
                model TEXT NOT NULL,
                execution_time_seconds REAL NOT NULL,
                token_count INTEGER,
                retry_count INTEGER NOT NULL DEFAULT 0,
                fallback_attempts INTEGER NOT NULL DEFAULT 1,
                cached BOOLEAN NOT NULL DEFAULT 0,
                validation_passed BOOLEAN,
                schema_used TEXT,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_attempts_timestamp ON attempts(timestamp);
            CREATE INDEX IF NOT EXISTS idx_attempts_source ON attempts(source);
            CREATE INDEX IF NOT EXISTS idx_attempts_model ON attempts(model);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Remove expired cache entries. Returns how many were removed.
    pub async fn purge_expired(&self) -> StoreResult<usize> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ?")
            .bind(format_ts(Utc::now()))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() as usize)
    }
}

// Row types for sqlx queries
#[derive(Debug, FromRow)]
struct AttemptRow {
    id: i64,
    timestamp: String,
    source: String,
    prompt_hash: String,
    model: String,
    execution_time_seconds: f64,
    token_count: Option<i64>,
    retry_count: i64,
    fallback_attempts: i64,
    cached: bool,
    validation_passed: Option<bool>,
    schema_used: Option<String>,
    error: Option<String>,
}

impl AttemptRow {
    fn into_record(self) -> StoreResult<MetricRecord> {
        Ok(MetricRecord {
            id: Some(self.id),
            timestamp: parse_ts(&self.timestamp)?,
            source: self.source,
            prompt_hash: self.prompt_hash,
            model: self.model,
            execution_time: self.execution_time_seconds,
            token_count: self.token_count,
            retry_count: self.retry_count.max(0) as u32,
            fallback_attempts: self.fallback_attempts.max(0) as u32,
            cached: self.cached,
            validation_passed: self.validation_passed,
            schema_used: self.schema_used,
            error: self.error,
        })
    }
}

const ATTEMPT_COLUMNS: &str = "id, timestamp, source, prompt_hash, model, execution_time_seconds, \
     token_count, retry_count, fallback_attempts, cached, validation_passed, schema_used, error";

#[async_trait]
impl CacheStore for SqliteStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM cache_entries WHERE key = ? AND expires_at > ?")
                .bind(key)
                .bind(format_ts(Utc::now()))
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((raw,)) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &Value, ttl: Duration) -> StoreResult<()> {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .ok_or_else(|| StoreError::Backend(format!("TTL out of range: {:?}", ttl).into()))?;
        let raw = serde_json::to_string(value)?;

        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(&raw)
        .bind(format_ts(expires_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT key FROM cache_entries WHERE substr(key, 1, ?) = ? AND expires_at > ? ORDER BY key",
        )
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .bind(format_ts(Utc::now()))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(key,)| key).collect())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }

        let placeholders = keys.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let query = format!("DELETE FROM cache_entries WHERE key IN ({})", placeholders);

        let mut q = sqlx::query(&query);
        for key in keys {
            q = q.bind(key);
        }
        let result = q.execute(&self.pool).await?;

        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl MetricsStore for SqliteStore {
    async fn append(&self, record: &MetricRecord) -> StoreResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO attempts (
                timestamp, source, prompt_hash, model, execution_time_seconds,
                token_count, retry_count, fallback_attempts, cached,
                validation_passed, schema_used, error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(format_ts(record.timestamp))
        .bind(&record.source)
        .bind(&record.prompt_hash)
        .bind(&record.model)
        .bind(record.execution_time)
        .bind(record.token_count)
        .bind(i64::from(record.retry_count))
        .bind(i64::from(record.fallback_attempts))
        .bind(record.cached)
        .bind(record.validation_passed)
        .bind(&record.schema_used)
        .bind(&record.error)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn recent(&self, limit: usize) -> StoreResult<Vec<MetricRecord>> {
        let query = format!(
            "SELECT {} FROM attempts ORDER BY timestamp DESC, id DESC LIMIT ?",
            ATTEMPT_COLUMNS
        );
        let rows = sqlx::query_as::<_, AttemptRow>(&query)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(|r| r.into_record()).collect()
    }

    async fn since(&self, since: Option<DateTime<Utc>>) -> StoreResult<Vec<MetricRecord>> {
        let rows = match since {
            Some(cutoff) => {
                let query = format!(
                    "SELECT {} FROM attempts WHERE timestamp >= ? ORDER BY timestamp, id",
                    ATTEMPT_COLUMNS
                );
                sqlx::query_as::<_, AttemptRow>(&query)
                    .bind(format_ts(cutoff))
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = format!("SELECT {} FROM attempts ORDER BY timestamp, id", ATTEMPT_COLUMNS);
                sqlx::query_as::<_, AttemptRow>(&query)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter().map(|r| r.into_record()).collect()
    }

    async fn aggregate(&self, since: DateTime<Utc>) -> StoreResult<AggregateStats> {
        let cutoff = format_ts(since);

        let (total, avg_time, cache_hits, errors, validation_failures, retries, avg_tokens): (
            i64,
            Option<f64>,
            Option<i64>,
            Option<i64>,
            Option<i64>,
            Option<i64>,
            Option<f64>,
        ) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                AVG(execution_time_seconds),
                SUM(CASE WHEN cached = 1 THEN 1 ELSE 0 END),
                SUM(CASE WHEN error IS NOT NULL THEN 1 ELSE 0 END),
                SUM(CASE WHEN validation_passed = 0 THEN 1 ELSE 0 END),
                SUM(retry_count),
                AVG(token_count)
            FROM attempts
            WHERE timestamp >= ?
            "#,
        )
        .bind(&cutoff)
        .fetch_one(&self.pool)
        .await?;

        let usage: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT model, COUNT(*) AS count
            FROM attempts
            WHERE timestamp >= ?
            GROUP BY model
            ORDER BY count DESC, model ASC
            "#,
        )
        .bind(&cutoff)
        .fetch_all(&self.pool)
        .await?;

        let total_attempts = total.max(0) as u64;
        let cache_hits = cache_hits.unwrap_or(0).max(0) as u64;
        let errors = errors.unwrap_or(0).max(0) as u64;
        let rate = |count: u64| {
            (total_attempts > 0).then(|| count as f64 / total_attempts as f64 * 100.0)
        };

        Ok(AggregateStats {
            total_attempts,
            avg_execution_time: avg_time,
            cache_hits,
            errors,
            validation_failures: validation_failures.unwrap_or(0).max(0) as u64,
            total_retries: retries.unwrap_or(0).max(0) as u64,
            avg_tokens,
            cache_hit_rate: rate(cache_hits),
            error_rate: rate(errors),
            model_usage: usage
                .into_iter()
                .map(|(model, count)| ModelUsage {
                    model,
                    count: count.max(0) as u64,
                })
                .collect(),
        })
    }
}
