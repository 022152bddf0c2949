//! Postgres-backed rebuild queue.
//!
//! ## Claim atomicity
//!
//! `claim_many` is one statement: a `FOR UPDATE SKIP LOCKED` selection of the
//! oldest claimable rows feeding an `UPDATE ... RETURNING`. Concurrent claimers
//! skip each other's locked rows, and staleness is judged with the database
//! clock (`NOW()`), never the caller's.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | QueueError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (other) | Any other | `Storage` |
//! | Other | N/A | `Storage` |

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, field, instrument, Span};

use sheetcache_core::{SnapshotKey, WorkerId};

use super::store::{QueueError, RebuildQueue};
use super::types::{normalize_reason, QueueEntry, QueueStats, CLAIM_TTL_SECS};
use crate::db::is_unique_violation;

/// Postgres-backed rebuild queue (`sheet_instrument_snapshot_queue`).
#[derive(Debug, Clone)]
pub struct PostgresRebuildQueue {
    pool: Arc<PgPool>,
}

impl PostgresRebuildQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn refresh(&self, key: SnapshotKey, reason: Option<&str>) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE sheet_instrument_snapshot_queue
            SET enqueued_at = NOW(),
                reason = $3,
                claimed_at = NULL,
                claimed_by = NULL
            WHERE account_id = $1 AND sheet_id = $2
            "#,
        )
        .bind(key.account_id.get())
        .bind(key.sheet_id.get())
        .bind(reason)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("refresh_entry", e))?;

        Ok(result.rows_affected())
    }
}

#[async_trait::async_trait]
impl RebuildQueue for PostgresRebuildQueue {
    #[instrument(
        skip(self, reason),
        fields(account_id = %key.account_id, sheet_id = %key.sheet_id),
        err
    )]
    async fn enqueue(&self, key: SnapshotKey, reason: &str) -> Result<(), QueueError> {
        let reason = normalize_reason(reason);

        if self.refresh(key, reason.as_deref()).await? > 0 {
            return Ok(());
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO sheet_instrument_snapshot_queue (
                account_id,
                sheet_id,
                enqueued_at,
                reason,
                attempts
            )
            VALUES ($1, $2, NOW(), $3, 0)
            "#,
        )
        .bind(key.account_id.get())
        .bind(key.sheet_id.get())
        .bind(reason.as_deref())
        .execute(&*self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                // Lost the first-insert race; the winner's row now exists.
                debug!(key = %key, "concurrent enqueue detected, refreshing existing entry");
                self.refresh(key, reason.as_deref()).await.map(|_| ())
            }
            Err(e) => Err(map_sqlx_error("insert_entry", e)),
        }
    }

    #[instrument(
        skip(self),
        fields(worker_id = %worker_id, operation = field::Empty, claimed = field::Empty),
        err
    )]
    async fn claim_many(
        &self,
        worker_id: &WorkerId,
        max_items: usize,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        if max_items == 0 {
            return Ok(Vec::new());
        }

        let span = Span::current();
        span.record("operation", "claim_many");

        let rows = sqlx::query(
            r#"
            WITH candidates AS (
                SELECT account_id, sheet_id
                FROM sheet_instrument_snapshot_queue
                WHERE claimed_at IS NULL
                   OR claimed_at < NOW() - make_interval(secs => $2)
                ORDER BY enqueued_at ASC, account_id ASC, sheet_id ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE sheet_instrument_snapshot_queue q
            SET claimed_at = NOW(),
                claimed_by = $1,
                attempts = q.attempts + 1,
                last_attempt_at = NOW()
            FROM candidates c
            WHERE q.account_id = c.account_id AND q.sheet_id = c.sheet_id
            RETURNING
                q.account_id,
                q.sheet_id,
                q.enqueued_at,
                q.reason,
                q.attempts,
                q.last_attempt_at,
                q.claimed_at,
                q.claimed_by
            "#,
        )
        .bind(worker_id.as_str())
        .bind(CLAIM_TTL_SECS as f64)
        .bind(max_items as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_many", e))?;

        let mut claimed = rows
            .iter()
            .map(entry_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| QueueError::Storage(format!("failed to decode queue row: {e}")))?;

        // RETURNING carries no ordering guarantee.
        claimed.sort_by(|a, b| (a.enqueued_at, a.key).cmp(&(b.enqueued_at, b.key)));

        span.record("claimed", claimed.len());
        Ok(claimed)
    }

    #[instrument(
        skip(self),
        fields(account_id = %key.account_id, sheet_id = %key.sheet_id, worker_id = %worker_id),
        err
    )]
    async fn release(&self, key: SnapshotKey, worker_id: &WorkerId) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE sheet_instrument_snapshot_queue
            SET claimed_at = NULL,
                claimed_by = NULL
            WHERE account_id = $1 AND sheet_id = $2 AND claimed_by = $3
            "#,
        )
        .bind(key.account_id.get())
        .bind(key.sheet_id.get())
        .bind(worker_id.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(account_id = %key.account_id, sheet_id = %key.sheet_id), err)]
    async fn delete(&self, key: SnapshotKey) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            DELETE FROM sheet_instrument_snapshot_queue
            WHERE account_id = $1 AND sheet_id = $2
            "#,
        )
        .bind(key.account_id.get())
        .bind(key.sheet_id.get())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete", e))?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, key: SnapshotKey) -> Result<Option<QueueEntry>, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT
                account_id,
                sheet_id,
                enqueued_at,
                reason,
                attempts,
                last_attempt_at,
                claimed_at,
                claimed_by
            FROM sheet_instrument_snapshot_queue
            WHERE account_id = $1 AND sheet_id = $2
            "#,
        )
        .bind(key.account_id.get())
        .bind(key.sheet_id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref()
            .map(entry_from_row)
            .transpose()
            .map_err(|e| QueueError::Storage(format!("failed to decode queue row: {e}")))
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE claimed_at IS NULL) AS unclaimed,
                COUNT(*) FILTER (
                    WHERE claimed_at >= NOW() - make_interval(secs => $1)
                ) AS claimed,
                COUNT(*) FILTER (
                    WHERE claimed_at < NOW() - make_interval(secs => $1)
                ) AS stale
            FROM sheet_instrument_snapshot_queue
            "#,
        )
        .bind(CLAIM_TTL_SECS as f64)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |column: &str| -> Result<usize, QueueError> {
            row.try_get::<i64, _>(column)
                .map(|n| n.max(0) as usize)
                .map_err(|e| QueueError::Storage(format!("failed to read {column}: {e}")))
        };

        Ok(QueueStats {
            unclaimed: count("unclaimed")?,
            claimed: count("claimed")?,
            stale: count("stale")?,
        })
    }
}

fn entry_from_row(row: &PgRow) -> Result<QueueEntry, sqlx::Error> {
    let attempts: i32 = row.try_get("attempts")?;
    let claimed_by: Option<String> = row.try_get("claimed_by")?;

    Ok(QueueEntry {
        key: SnapshotKey::new(
            row.try_get::<i64, _>("account_id")?,
            row.try_get::<i64, _>("sheet_id")?,
        ),
        enqueued_at: row.try_get::<DateTime<Utc>, _>("enqueued_at")?,
        reason: row.try_get("reason")?,
        attempts: attempts.max(0) as u32,
        last_attempt_at: row.try_get("last_attempt_at")?,
        claimed_at: row.try_get("claimed_at")?,
        claimed_by: claimed_by.map(WorkerId::new),
    })
}

/// Map SQLx errors to QueueError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code() {
                Some(code) if code.as_ref() == "23505" => QueueError::Conflict(msg),
                _ => QueueError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            QueueError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => QueueError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
