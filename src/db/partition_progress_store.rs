//! `partition_progress` store — durable per-partition cursor with
//! optimistic-concurrency updates: every mutation is a conditional `UPDATE`
//! whose `rows_affected()` count is the success signal, never a row lock.

use anyhow::{Context, Result};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::models::PartitionProgress;

pub struct PartitionProgressStore {
    pool: PgPool,
}

impl PartitionProgressStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Seeds one row per partition at `next_offset = 0`. Idempotent: a
    /// retried seed for a partition already present is a no-op.
    pub async fn seed(&self, run_id: Uuid, partition_ids: &[String]) -> Result<()> {
        for partition_id in partition_ids {
            sqlx::query(
                r#"
                INSERT INTO partition_progress (run_id, partition_id, next_offset, completed, failed, updated_at)
                VALUES ($1, $2, 0, false, false, now())
                ON CONFLICT (run_id, partition_id) DO NOTHING
                "#,
            )
            .bind(run_id)
            .bind(partition_id)
            .execute(&self.pool)
            .await
            .context("failed to seed partition_progress row")?;
        }
        Ok(())
    }

    pub async fn get(&self, run_id: Uuid, partition_id: &str) -> Result<Option<PartitionProgress>> {
        let row = sqlx::query(
            r#"
            SELECT run_id, partition_id, next_offset, completed, failed, updated_at
            FROM partition_progress
            WHERE run_id = $1 AND partition_id = $2
            "#,
        )
        .bind(run_id)
        .bind(partition_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch partition_progress row")?;
        Ok(row.map(|r| row_to_progress(&r)))
    }

    pub async fn list_for_run(&self, run_id: Uuid) -> Result<Vec<PartitionProgress>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, partition_id, next_offset, completed, failed, updated_at
            FROM partition_progress
            WHERE run_id = $1
            ORDER BY partition_id
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list partition_progress rows")?;
        Ok(rows.iter().map(row_to_progress).collect())
    }

    /// Advances the cursor from `expected_offset` to `new_offset`, only if
    /// the row is still at `expected_offset` and not terminal. Returns
    /// `false` on a lost race (another worker already advanced it, or a
    /// stale retry reapplied an already-applied page) rather than erroring
    /// — the caller treats that as "someone else handled this."
    pub async fn advance(
        &self,
        run_id: Uuid,
        partition_id: &str,
        expected_offset: i64,
        new_offset: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE partition_progress
            SET next_offset = $4, updated_at = now()
            WHERE run_id = $1 AND partition_id = $2
              AND next_offset = $3 AND completed = false AND failed = false
            "#,
        )
        .bind(run_id)
        .bind(partition_id)
        .bind(expected_offset)
        .bind(new_offset)
        .execute(&self.pool)
        .await
        .context("failed to advance partition_progress cursor")?;
        Ok(result.rows_affected() > 0)
    }

    /// Same CAS, run against a caller-owned transaction so the cursor
    /// advance commits atomically with the page's raw-row upsert.
    pub async fn advance_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
        partition_id: &str,
        expected_offset: i64,
        new_offset: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE partition_progress
            SET next_offset = $4, updated_at = now()
            WHERE run_id = $1 AND partition_id = $2
              AND next_offset = $3 AND completed = false AND failed = false
            "#,
        )
        .bind(run_id)
        .bind(partition_id)
        .bind(expected_offset)
        .bind(new_offset)
        .execute(&mut **tx)
        .await
        .context("failed to advance partition_progress cursor")?;
        Ok(result.rows_affected() > 0)
    }

    /// Marks the partition complete at `final_offset`. Idempotent: a
    /// redelivered completion for a partition already completed at the
    /// same offset succeeds (true) without changing anything; one
    /// completed at a *different* offset (should never happen absent a
    /// bug) is rejected (false) rather than silently overwritten.
    pub async fn complete(&self, run_id: Uuid, partition_id: &str, final_offset: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE partition_progress
            SET completed = true, next_offset = $3, updated_at = now()
            WHERE run_id = $1 AND partition_id = $2 AND failed = false
              AND (completed = false OR next_offset = $3)
            "#,
        )
        .bind(run_id)
        .bind(partition_id)
        .bind(final_offset)
        .execute(&self.pool)
        .await
        .context("failed to mark partition completed")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_failed(&self, run_id: Uuid, partition_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE partition_progress
            SET failed = true, updated_at = now()
            WHERE run_id = $1 AND partition_id = $2 AND completed = false AND failed = false
            "#,
        )
        .bind(run_id)
        .bind(partition_id)
        .execute(&self.pool)
        .await
        .context("failed to mark partition failed")?;
        Ok(result.rows_affected() > 0)
    }

    /// Resets a failed partition back to `running`, preserving `next_offset`
    /// so the retried worker resumes from where the failed attempt left off
    /// rather than re-fetching pages it already committed.
    pub async fn reset_for_retry(&self, run_id: Uuid, partition_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE partition_progress
            SET failed = false, updated_at = now()
            WHERE run_id = $1 AND partition_id = $2 AND failed = true
            "#,
        )
        .bind(run_id)
        .bind(partition_id)
        .execute(&self.pool)
        .await
        .context("failed to reset partition for retry")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn counts_for_run(&self, run_id: Uuid) -> Result<PartitionCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE completed) AS completed,
                COUNT(*) FILTER (WHERE failed) AS failed
            FROM partition_progress
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await
        .context("failed to count partition_progress rows")?;

        Ok(PartitionCounts {
            total: row.get::<i64, _>("total"),
            completed: row.get::<i64, _>("completed"),
            failed: row.get::<i64, _>("failed"),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PartitionCounts {
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
}

fn row_to_progress(row: &sqlx::postgres::PgRow) -> PartitionProgress {
    PartitionProgress {
        run_id: row.get("run_id"),
        partition_id: row.get("partition_id"),
        next_offset: row.get("next_offset"),
        completed: row.get("completed"),
        failed: row.get("failed"),
        updated_at: row.get("updated_at"),
    }
}
