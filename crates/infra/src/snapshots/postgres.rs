//! Postgres-backed snapshot store (`sheet_instrument_snapshots`).
//!
//! Every write is a single `INSERT ... ON CONFLICT` statement, so each
//! operation is atomic per key without an explicit transaction.

use std::sync::Arc;

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use sheetcache_core::{truncate_chars, SnapshotKey, MAX_ERROR_CHARS};

use super::store::{SnapshotStore, SnapshotStoreError};
use super::types::{Snapshot, SnapshotMeta, CURRENT_BUILD_VERSION, INITIAL_BUILD_VERSION};

/// Postgres-backed snapshot store.
#[derive(Debug, Clone)]
pub struct PostgresSnapshotStore {
    pool: Arc<PgPool>,
}

impl PostgresSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait::async_trait]
impl SnapshotStore for PostgresSnapshotStore {
    #[instrument(skip(self), fields(account_id = %key.account_id, sheet_id = %key.sheet_id), err)]
    async fn get(&self, key: SnapshotKey) -> Result<Option<Snapshot>, SnapshotStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                account_id,
                sheet_id,
                payload,
                built_at,
                build_ms,
                instrument_count,
                build_version,
                last_error,
                last_error_at
            FROM sheet_instrument_snapshots
            WHERE account_id = $1 AND sheet_id = $2
            "#,
        )
        .bind(key.account_id.get())
        .bind(key.sheet_id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_snapshot", e))?;

        row.as_ref()
            .map(snapshot_from_row)
            .transpose()
            .map_err(|e| SnapshotStoreError::Storage(format!("failed to decode snapshot row: {e}")))
    }

    #[instrument(
        skip(self, payload),
        fields(
            account_id = %key.account_id,
            sheet_id = %key.sheet_id,
            payload_bytes = payload.len(),
            instrument_count = meta.instrument_count
        ),
        err
    )]
    async fn upsert_snapshot(
        &self,
        key: SnapshotKey,
        payload: &str,
        meta: SnapshotMeta,
    ) -> Result<(), SnapshotStoreError> {
        sqlx::query(
            r#"
            INSERT INTO sheet_instrument_snapshots (
                account_id,
                sheet_id,
                payload,
                built_at,
                build_ms,
                instrument_count,
                build_version,
                last_error,
                last_error_at
            )
            VALUES ($1, $2, $3, NOW(), $4, $5, $6, NULL, NULL)
            ON CONFLICT (account_id, sheet_id)
            DO UPDATE SET
                payload = EXCLUDED.payload,
                built_at = EXCLUDED.built_at,
                build_ms = EXCLUDED.build_ms,
                instrument_count = EXCLUDED.instrument_count,
                build_version = EXCLUDED.build_version,
                last_error = NULL,
                last_error_at = NULL
            "#,
        )
        .bind(key.account_id.get())
        .bind(key.sheet_id.get())
        .bind(payload)
        .bind(i64::try_from(meta.build_ms).unwrap_or(i64::MAX))
        .bind(i32::try_from(meta.instrument_count).unwrap_or(i32::MAX))
        .bind(CURRENT_BUILD_VERSION)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_snapshot", e))?;

        Ok(())
    }

    #[instrument(skip(self, message), fields(account_id = %key.account_id, sheet_id = %key.sheet_id), err)]
    async fn upsert_error(&self, key: SnapshotKey, message: &str) -> Result<(), SnapshotStoreError> {
        let message = truncate_chars(message, MAX_ERROR_CHARS);

        sqlx::query(
            r#"
            INSERT INTO sheet_instrument_snapshots (
                account_id,
                sheet_id,
                payload,
                instrument_count,
                build_version,
                last_error,
                last_error_at
            )
            VALUES ($1, $2, NULL, 0, $4, $3, NOW())
            ON CONFLICT (account_id, sheet_id)
            DO UPDATE SET
                last_error = EXCLUDED.last_error,
                last_error_at = EXCLUDED.last_error_at
            "#,
        )
        .bind(key.account_id.get())
        .bind(key.sheet_id.get())
        .bind(message)
        .bind(INITIAL_BUILD_VERSION)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_error", e))?;

        Ok(())
    }
}

fn snapshot_from_row(row: &PgRow) -> Result<Snapshot, sqlx::Error> {
    let build_ms: Option<i64> = row.try_get("build_ms")?;
    let instrument_count: i32 = row.try_get("instrument_count")?;

    Ok(Snapshot {
        key: SnapshotKey::new(
            row.try_get::<i64, _>("account_id")?,
            row.try_get::<i64, _>("sheet_id")?,
        ),
        payload: row.try_get("payload")?,
        built_at: row.try_get("built_at")?,
        build_ms: build_ms.map(|ms| ms.max(0) as u64),
        instrument_count: instrument_count.max(0) as u32,
        build_version: row.try_get("build_version")?,
        last_error: row.try_get("last_error")?,
        last_error_at: row.try_get("last_error_at")?,
    })
}

/// Map SQLx errors to SnapshotStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> SnapshotStoreError {
    match err {
        sqlx::Error::Database(db_err) => SnapshotStoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            SnapshotStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => SnapshotStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
