//! Per-feed raw table store (`bulk_upsert_raw`).
//!
//! Table name is dynamic per feed (`raw_nivoda_stones`, etc.), so unlike
//! the other stores this one builds its SQL with `format!` rather than a
//! fixed literal — `table_name` always comes from a trusted
//! `FeedAdapter::raw_table_name()`, never from request input.

use anyhow::{Context, Result};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::models::{ConsolidationStatus, ItemIdentity, RawRecord};

pub struct RawStore {
    pool: PgPool,
    table_name: String,
}

impl RawStore {
    pub fn new(pool: PgPool, table_name: String) -> Self {
        Self { pool, table_name }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn upsert_sql(&self) -> String {
        format!(
            r#"
            INSERT INTO {table} (feed, supplier_stone_id, offer_id, payload,
                                  source_updated_at, consolidated, consolidation_status, run_id)
            VALUES ($1, $2, $3, $4, $5, false, 'pending', $6)
            ON CONFLICT (feed, supplier_stone_id) DO UPDATE SET
                offer_id = EXCLUDED.offer_id,
                payload = EXCLUDED.payload,
                source_updated_at = EXCLUDED.source_updated_at,
                consolidated = CASE
                    WHEN EXCLUDED.source_updated_at IS DISTINCT FROM {table}.source_updated_at
                    THEN false
                    ELSE {table}.consolidated
                END,
                consolidation_status = CASE
                    WHEN EXCLUDED.source_updated_at IS DISTINCT FROM {table}.source_updated_at
                    THEN 'pending'
                    ELSE {table}.consolidation_status
                END,
                run_id = EXCLUDED.run_id
            "#,
            table = self.table_name,
        )
    }

    /// Upserts one page of items, keyed on `(feed, supplier_stone_id)`.
    /// Each row is marked `consolidated = false` on insert and on any
    /// update where the incoming `source_updated_at` is newer — an update
    /// with a stale or equal `source_updated_at` leaves `consolidated`
    /// untouched, so reprocessing a redelivered page never re-flags rows
    /// nothing has changed on.
    pub async fn bulk_upsert_raw(
        &self,
        feed: &str,
        run_id: Uuid,
        items: &[ItemIdentity],
    ) -> Result<u64> {
        let sql = self.upsert_sql();
        let mut affected = 0u64;
        for item in items {
            let result = sqlx::query(&sql)
                .bind(feed)
                .bind(&item.supplier_stone_id)
                .bind(&item.offer_id)
                .bind(&item.payload)
                .bind(item.source_updated_at)
                .bind(run_id)
                .execute(&self.pool)
                .await
                .with_context(|| format!("failed to upsert into {}", self.table_name))?;
            affected += result.rows_affected();
        }
        Ok(affected)
    }

    /// Same upsert, run against a caller-owned transaction so it commits
    /// atomically with whatever else the caller does in that transaction
    /// (the worker pairs this with the partition cursor advance so raw
    /// rows and the cursor can never diverge).
    pub async fn bulk_upsert_raw_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        feed: &str,
        run_id: Uuid,
        items: &[ItemIdentity],
    ) -> Result<u64> {
        let sql = self.upsert_sql();
        let mut affected = 0u64;
        for item in items {
            let result = sqlx::query(&sql)
                .bind(feed)
                .bind(&item.supplier_stone_id)
                .bind(&item.offer_id)
                .bind(&item.payload)
                .bind(item.source_updated_at)
                .bind(run_id)
                .execute(&mut **tx)
                .await
                .with_context(|| format!("failed to upsert into {}", self.table_name))?;
            affected += result.rows_affected();
        }
        Ok(affected)
    }

    /// Fetches rows still awaiting consolidation for a run, in supplier
    /// stone id order so repeated calls page consistently.
    pub async fn pending_consolidation(
        &self,
        run_id: Uuid,
        limit: i64,
    ) -> Result<Vec<RawRecord>> {
        let sql = format!(
            r#"
            SELECT feed, supplier_stone_id, offer_id, payload, source_updated_at,
                   consolidated, consolidation_status, run_id
            FROM {table}
            WHERE run_id = $1 AND consolidation_status = 'pending'
            ORDER BY supplier_stone_id
            LIMIT $2
            "#,
            table = self.table_name,
        );
        let rows = sqlx::query(&sql)
            .bind(run_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("failed to fetch pending rows from {}", self.table_name))?;
        Ok(rows.iter().map(row_to_raw_record).collect())
    }

    pub async fn mark_consolidated(
        &self,
        feed: &str,
        supplier_stone_id: &str,
        status: ConsolidationStatus,
    ) -> Result<bool> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET consolidated = $3, consolidation_status = $4
            WHERE feed = $1 AND supplier_stone_id = $2
            "#,
            table = self.table_name,
        );
        let result = sqlx::query(&sql)
            .bind(feed)
            .bind(supplier_stone_id)
            .bind(matches!(status, ConsolidationStatus::Consolidated))
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to mark row consolidated in {}", self.table_name))?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_raw_record(row: &sqlx::postgres::PgRow) -> RawRecord {
    RawRecord {
        feed: row.get("feed"),
        supplier_stone_id: row.get("supplier_stone_id"),
        offer_id: row.get("offer_id"),
        payload: row.get("payload"),
        source_updated_at: row.get("source_updated_at"),
        consolidated: row.get("consolidated"),
        consolidation_status: ConsolidationStatus::parse(
            row.get::<String, _>("consolidation_status").as_str(),
        )
        .unwrap_or(ConsolidationStatus::Pending),
        run_id: row.get("run_id"),
    }
}
