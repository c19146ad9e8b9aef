//! `worker_runs` store — one row per `(run_id, partition_id)` attempt.

use anyhow::{Context, Result};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::cap_error_message;
use crate::models::{WorkerRun, WorkerRunStatus};

pub struct WorkerRunStore {
    pool: PgPool,
}

impl WorkerRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn start(
        &self,
        run_id: Uuid,
        partition_id: &str,
        worker_id: &str,
        work_item_payload: &serde_json::Value,
    ) -> Result<WorkerRun> {
        let id = Uuid::new_v4();
        let row = sqlx::query(
            r#"
            INSERT INTO worker_runs
                (id, run_id, partition_id, worker_id, status, records_processed,
                 error_message, work_item_payload, started_at)
            VALUES ($1, $2, $3, $4, 'running', 0, NULL, $5, now())
            ON CONFLICT (run_id, partition_id)
            DO UPDATE SET
                worker_id = EXCLUDED.worker_id,
                status = 'running',
                work_item_payload = EXCLUDED.work_item_payload,
                started_at = now(),
                completed_at = NULL
            RETURNING id, run_id, partition_id, worker_id, status, records_processed,
                      error_message, work_item_payload, started_at, completed_at
            "#,
        )
        .bind(id)
        .bind(run_id)
        .bind(partition_id)
        .bind(worker_id)
        .bind(work_item_payload)
        .fetch_one(&self.pool)
        .await
        .context("failed to upsert worker_runs row")?;

        Ok(row_to_worker_run(&row))
    }

    /// Records that `records_processed` more rows were processed for this
    /// attempt and marks it completed, returning the row's new cumulative
    /// `records_processed` total. A partition can be worked over several
    /// pages before it finalizes, so this accumulates rather than
    /// overwrites — the caller threads the returned total into the
    /// `WorkDone` message rather than reporting only the last page's count.
    pub async fn complete(
        &self,
        run_id: Uuid,
        partition_id: &str,
        records_processed: i64,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"
            UPDATE worker_runs
            SET status = 'completed',
                records_processed = records_processed + $3,
                completed_at = now()
            WHERE run_id = $1 AND partition_id = $2
            RETURNING records_processed
            "#,
        )
        .bind(run_id)
        .bind(partition_id)
        .bind(records_processed)
        .fetch_one(&self.pool)
        .await
        .context("failed to record worker_runs completion")?;
        Ok(row.get("records_processed"))
    }

    pub async fn fail(&self, run_id: Uuid, partition_id: &str, error: &str) -> Result<bool> {
        let capped = cap_error_message(error);
        let result = sqlx::query(
            r#"
            UPDATE worker_runs
            SET status = 'failed', error_message = $3, completed_at = now()
            WHERE run_id = $1 AND partition_id = $2
            "#,
        )
        .bind(run_id)
        .bind(partition_id)
        .bind(capped)
        .execute(&self.pool)
        .await
        .context("failed to record worker_runs failure")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_for_run(&self, run_id: Uuid) -> Result<Vec<WorkerRun>> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, partition_id, worker_id, status, records_processed,
                   error_message, work_item_payload, started_at, completed_at
            FROM worker_runs
            WHERE run_id = $1
            ORDER BY partition_id
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list worker_runs rows")?;
        Ok(rows.iter().map(row_to_worker_run).collect())
    }
}

fn row_to_worker_run(row: &sqlx::postgres::PgRow) -> WorkerRun {
    WorkerRun {
        id: row.get("id"),
        run_id: row.get("run_id"),
        partition_id: row.get("partition_id"),
        worker_id: row.get("worker_id"),
        status: WorkerRunStatus::parse(row.get::<String, _>("status").as_str())
            .unwrap_or(WorkerRunStatus::Failed),
        records_processed: row.get("records_processed"),
        error_message: row.get("error_message"),
        work_item_payload: row.get("work_item_payload"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    }
}
