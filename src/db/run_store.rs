//! `run_metadata` store.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::{Run, RunStatus, RunType};

pub struct RunStore {
    pool: PgPool,
}

impl RunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        feed: &str,
        run_type: RunType,
        expected_workers: i32,
        watermark_before: Option<DateTime<Utc>>,
    ) -> Result<Run> {
        let run_id = Uuid::new_v4();
        let row = sqlx::query(
            r#"
            INSERT INTO run_metadata
                (run_id, feed, run_type, status, expected_workers, watermark_before, started_at)
            VALUES ($1, $2, $3, 'running', $4, $5, now())
            RETURNING run_id, feed, run_type, expected_workers, watermark_before,
                      watermark_after, started_at, completed_at,
                      consolidation_started_at, consolidation_completed_at,
                      consolidation_processed, consolidation_errors, consolidation_total
            "#,
        )
        .bind(run_id)
        .bind(feed)
        .bind(run_type.as_str())
        .bind(expected_workers)
        .bind(watermark_before)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert run_metadata row")?;

        Ok(row_to_run(&row))
    }

    pub async fn get(&self, run_id: Uuid) -> Result<Option<Run>> {
        let row = sqlx::query(
            r#"
            SELECT run_id, feed, run_type, expected_workers, watermark_before,
                   watermark_after, started_at, completed_at,
                   consolidation_started_at, consolidation_completed_at,
                   consolidation_processed, consolidation_errors, consolidation_total
            FROM run_metadata
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch run_metadata row")?;

        Ok(row.map(|r| row_to_run(&r)))
    }

    /// Last completed run for a feed, used to compute the incremental
    /// window's `updated_from`.
    pub async fn last_completed(&self, feed: &str) -> Result<Option<Run>> {
        let row = sqlx::query(
            r#"
            SELECT run_id, feed, run_type, expected_workers, watermark_before,
                   watermark_after, started_at, completed_at,
                   consolidation_started_at, consolidation_completed_at,
                   consolidation_processed, consolidation_errors, consolidation_total
            FROM run_metadata
            WHERE feed = $1 AND status = 'completed'
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(feed)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch last completed run")?;

        Ok(row.map(|r| row_to_run(&r)))
    }

    pub async fn set_status(&self, run_id: Uuid, status: RunStatus) -> Result<bool> {
        let completed_at_clause = match status {
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled => ", completed_at = now()",
            RunStatus::Running | RunStatus::Stalled => "",
        };
        let sql = format!(
            "UPDATE run_metadata SET status = $2{completed_at_clause} WHERE run_id = $1"
        );
        let result = sqlx::query(&sql)
            .bind(run_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .context("failed to update run status")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_watermark_after(&self, run_id: Uuid, watermark_after: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query("UPDATE run_metadata SET watermark_after = $2 WHERE run_id = $1")
            .bind(run_id)
            .bind(watermark_after)
            .execute(&self.pool)
            .await
            .context("failed to set watermark_after")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn record_consolidation_start(&self, run_id: Uuid, total: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE run_metadata
            SET consolidation_started_at = now(), consolidation_total = $2
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .bind(total)
        .execute(&self.pool)
        .await
        .context("failed to record consolidation start")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn record_consolidation_progress(
        &self,
        run_id: Uuid,
        processed_delta: i64,
        errors_delta: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE run_metadata
            SET consolidation_processed = consolidation_processed + $2,
                consolidation_errors = consolidation_errors + $3
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .bind(processed_delta)
        .bind(errors_delta)
        .execute(&self.pool)
        .await
        .context("failed to record consolidation progress")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn record_consolidation_complete(&self, run_id: Uuid) -> Result<bool> {
        let result = sqlx::query("UPDATE run_metadata SET consolidation_completed_at = now() WHERE run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .context("failed to record consolidation completion")?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_run(row: &sqlx::postgres::PgRow) -> Run {
    Run {
        run_id: row.get("run_id"),
        feed: row.get("feed"),
        run_type: RunType::parse(row.get::<String, _>("run_type").as_str()).unwrap_or(RunType::Incremental),
        expected_workers: row.get("expected_workers"),
        watermark_before: row.get("watermark_before"),
        watermark_after: row.get("watermark_after"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        consolidation_started_at: row.get("consolidation_started_at"),
        consolidation_completed_at: row.get("consolidation_completed_at"),
        consolidation_processed: row.get("consolidation_processed"),
        consolidation_errors: row.get("consolidation_errors"),
        consolidation_total: row.get("consolidation_total"),
    }
}
