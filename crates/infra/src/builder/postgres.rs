//! Postgres link source over the engineering tables.
//!
//! Reads `sheet_instrument_links` joined to `instruments` and
//! `instrument_loops`. These tables belong to the surrounding application;
//! this adapter only reads them.

use std::sync::Arc;

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{field, instrument, Span};

use sheetcache_core::{InstrumentLink, SnapshotKey};

use super::{InstrumentLinkSource, SourceError};

/// Reads instrument links straight from the authoritative tables.
#[derive(Debug, Clone)]
pub struct PostgresLinkSource {
    pool: Arc<PgPool>,
}

impl PostgresLinkSource {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait::async_trait]
impl InstrumentLinkSource for PostgresLinkSource {
    #[instrument(
        skip(self),
        fields(account_id = %key.account_id, sheet_id = %key.sheet_id, link_count = field::Empty),
        err
    )]
    async fn fetch_links(&self, key: SnapshotKey) -> Result<Vec<InstrumentLink>, SourceError> {
        let rows = sqlx::query(
            r#"
            SELECT
                i.id AS instrument_id,
                i.tag AS instrument_tag,
                i.tag_norm AS instrument_tag_norm,
                i.instrument_type,
                l.link_role,
                COALESCE(
                    ARRAY_AGG(DISTINCT lp.loop_tag) FILTER (WHERE lp.loop_tag IS NOT NULL),
                    ARRAY[]::TEXT[]
                ) AS loop_tags
            FROM sheet_instrument_links l
            JOIN instruments i
              ON i.account_id = l.account_id AND i.id = l.instrument_id
            LEFT JOIN instrument_loops lp
              ON lp.account_id = i.account_id AND lp.instrument_id = i.id
            WHERE l.account_id = $1 AND l.sheet_id = $2
            GROUP BY i.id, i.tag, i.tag_norm, i.instrument_type, l.link_role
            ORDER BY i.tag ASC, i.id ASC, l.link_role ASC NULLS FIRST
            "#,
        )
        .bind(key.account_id.get())
        .bind(key.sheet_id.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
                SourceError::Unavailable(e.to_string())
            }
            other => SourceError::Query(other.to_string()),
        })?;

        let links = rows
            .iter()
            .map(link_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SourceError::Query(format!("failed to decode link row: {e}")))?;

        Span::current().record("link_count", links.len());
        Ok(links)
    }
}

fn link_from_row(row: &PgRow) -> Result<InstrumentLink, sqlx::Error> {
    Ok(InstrumentLink {
        instrument_id: row.try_get("instrument_id")?,
        instrument_tag: row.try_get("instrument_tag")?,
        instrument_tag_norm: row.try_get("instrument_tag_norm")?,
        instrument_type: row.try_get("instrument_type")?,
        link_role: row.try_get("link_role")?,
        loop_tags: row.try_get("loop_tags")?,
    })
}
