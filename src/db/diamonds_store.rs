//! `diamonds` store — the consolidator's minimal normalized target table
//! (feed, supplier_stone_id, source_updated_at, feed_price, status).
//!
//! Everything past this minimal shape (pricing rules, rating, margins) is
//! out of scope here; this exists only so the no-op-suppression upsert
//! rule is testable against a real write.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

#[derive(Debug, Clone, PartialEq)]
pub struct DiamondRecord {
    pub feed: String,
    pub supplier_stone_id: String,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub feed_price: Option<i64>,
    pub status: String,
}

pub struct DiamondsStore {
    pool: PgPool,
}

impl DiamondsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, feed: &str, supplier_stone_id: &str) -> Result<Option<DiamondRecord>> {
        let row = sqlx::query(
            r#"
            SELECT feed, supplier_stone_id, source_updated_at, feed_price, status
            FROM diamonds
            WHERE feed = $1 AND supplier_stone_id = $2
            "#,
        )
        .bind(feed)
        .bind(supplier_stone_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch diamonds row")?;
        Ok(row.map(|r| row_to_diamond(&r)))
    }

    /// Upserts a record, but suppresses the write as a no-op when
    /// `source_updated_at`, `feed_price`, and `status` are all unchanged
    /// from what's stored. Returns `false` when suppressed.
    pub async fn upsert_if_newer(&self, record: &DiamondRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO diamonds (feed, supplier_stone_id, source_updated_at, feed_price, status)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (feed, supplier_stone_id) DO UPDATE SET
                source_updated_at = EXCLUDED.source_updated_at,
                feed_price = EXCLUDED.feed_price,
                status = EXCLUDED.status,
                updated_at = now()
            WHERE diamonds.source_updated_at IS NULL
               OR EXCLUDED.source_updated_at IS DISTINCT FROM diamonds.source_updated_at
               OR EXCLUDED.feed_price IS DISTINCT FROM diamonds.feed_price
               OR EXCLUDED.status IS DISTINCT FROM diamonds.status
            "#,
        )
        .bind(&record.feed)
        .bind(&record.supplier_stone_id)
        .bind(record.source_updated_at)
        .bind(record.feed_price)
        .bind(&record.status)
        .execute(&self.pool)
        .await
        .context("failed to upsert diamonds row")?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_diamond(row: &sqlx::postgres::PgRow) -> DiamondRecord {
    DiamondRecord {
        feed: row.get("feed"),
        supplier_stone_id: row.get("supplier_stone_id"),
        source_updated_at: row.get("source_updated_at"),
        feed_price: row.get("feed_price"),
        status: row.get("status"),
    }
}
