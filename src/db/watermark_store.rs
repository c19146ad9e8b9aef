//! `watermarks` store, one row per feed.
//!
//! The watermark is conceptually a small blob keyed by
//! `watermark_blob_name`; this crate persists it as a Postgres row instead,
//! since the pipeline already depends on Postgres for everything else and
//! a second storage system for a single small JSON object isn't worth the
//! operational surface.

use anyhow::{Context, Result};
use sqlx::{PgPool, Row};

use crate::models::Watermark;

pub struct WatermarkStore {
    pool: PgPool,
}

impl WatermarkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, feed: &str) -> Result<Option<Watermark>> {
        let row = sqlx::query(
            "SELECT last_updated_at, last_run_id FROM watermarks WHERE feed = $1",
        )
        .bind(feed)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch watermark")?;

        Ok(row.map(|r| Watermark {
            last_updated_at: r.get("last_updated_at"),
            last_run_id: r.get("last_run_id"),
        }))
    }

    pub async fn set(&self, feed: &str, watermark: &Watermark) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO watermarks (feed, last_updated_at, last_run_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (feed) DO UPDATE SET
                last_updated_at = EXCLUDED.last_updated_at,
                last_run_id = EXCLUDED.last_run_id
            "#,
        )
        .bind(feed)
        .bind(watermark.last_updated_at)
        .bind(&watermark.last_run_id)
        .execute(&self.pool)
        .await
        .context("failed to upsert watermark")?;
        Ok(())
    }
}
