use async_trait::async_trait;
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use taskgate_application::RecordStore;
use taskgate_core::{AppError, AppResult};

/// PostgreSQL-backed record store.
///
/// Records live in a single keyed JSONB table; compare_and_swap relies on a
/// conditional UPDATE so concurrent resolutions serialize inside Postgres.
#[derive(Clone)]
pub struct PostgresRecordStore {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct RecordRow {
    record_key: String,
    record_value: Value,
}

impl PostgresRecordStore {
    /// Creates a store with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the backing table when it does not exist yet.
    pub async fn ensure_schema(&self) -> AppResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS taskgate_records (
                record_key TEXT PRIMARY KEY,
                record_value JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|error| AppError::Internal(format!("failed to ensure record schema: {error}")))?;

        Ok(())
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    async fn load_by_key(&self, key: &str) -> AppResult<Option<Value>> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT record_key, record_value
            FROM taskgate_records
            WHERE record_key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| AppError::Internal(format!("failed to load record '{key}': {error}")))?;

        Ok(row.map(|row| row.record_value))
    }

    async fn upsert(&self, key: &str, record: Value) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO taskgate_records (record_key, record_value, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (record_key)
            DO UPDATE SET record_value = EXCLUDED.record_value, updated_at = now()
            "#,
        )
        .bind(key)
        .bind(record)
        .execute(&self.pool)
        .await
        .map_err(|error| AppError::Internal(format!("failed to upsert record '{key}': {error}")))?;

        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &Value,
        record: Value,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE taskgate_records
            SET record_value = $3, updated_at = now()
            WHERE record_key = $1 AND record_value = $2
            "#,
        )
        .bind(key)
        .bind(expected)
        .bind(record)
        .execute(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to conditionally update record '{key}': {error}"
            ))
        })?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_by_keys(&self, keys: &[String]) -> AppResult<()> {
        if keys.is_empty() {
            return Ok(());
        }

        sqlx::query(
            r#"
            DELETE FROM taskgate_records
            WHERE record_key = ANY($1)
            "#,
        )
        .bind(keys)
        .execute(&self.pool)
        .await
        .map_err(|error| AppError::Internal(format!("failed to delete records: {error}")))?;

        Ok(())
    }

    async fn load_all_by_prefix(&self, prefix: &str) -> AppResult<Vec<(String, Value)>> {
        let escaped = prefix
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let pattern = format!("{escaped}%");
        let rows = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT record_key, record_value
            FROM taskgate_records
            WHERE record_key LIKE $1
            "#,
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to scan records by prefix '{prefix}': {error}"))
        })?;

        Ok(rows
            .into_iter()
            .map(|row| (row.record_key, row.record_value))
            .collect())
    }
}
