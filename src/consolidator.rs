//! Consolidator — core-scoped surface only. Reads a `Consolidate` message,
//! walks the feed's raw rows still pending consolidation for that run, and
//! upserts each into the minimal `diamonds` table, suppressing no-op
//! writes. Real pricing/rating stays out of scope; this module's job is
//! strictly the idempotent entry point and the update-suppression
//! invariant.

use uuid::Uuid;

use crate::db::diamonds_store::{DiamondRecord, DiamondsStore};
use crate::db::raw_store::RawStore;
use crate::db::run_store::RunStore;
use crate::db::watermark_store::WatermarkStore;
use crate::error::IngestError;
use crate::models::{Consolidate, ConsolidationStatus, RunStatus, Watermark};

pub struct ConsolidationOutcome {
    pub processed: i64,
    pub errors: i64,
    pub wrote: i64,
    pub suppressed_no_op: i64,
}

/// Processes one `Consolidate` message. Idempotent per `run_id`: calling
/// this twice for the same run only re-touches rows still `pending`
/// (consolidated rows are excluded by `RawStore::pending_consolidation`),
/// so a duplicate delivery or a deliberate extra emission after a
/// successful partition retry (see `DESIGN.md`'s Open Question
/// resolution) is always safe to run again.
pub async fn consolidate(
    message: &Consolidate,
    raw_records: &RawStore,
    diamonds: &DiamondsStore,
    runs: &RunStore,
    watermarks: &WatermarkStore,
    page_size: i64,
) -> Result<ConsolidationOutcome, IngestError> {
    let mut outcome = ConsolidationOutcome {
        processed: 0,
        errors: 0,
        wrote: 0,
        suppressed_no_op: 0,
    };

    runs.record_consolidation_start(message.run_id, 0)
        .await
        .map_err(IngestError::Other)?;

    loop {
        let pending = raw_records
            .pending_consolidation(message.run_id, page_size)
            .await
            .map_err(IngestError::Other)?;
        if pending.is_empty() {
            break;
        }

        for row in &pending {
            let feed_price = row
                .payload
                .get("min_price")
                .and_then(|v| v.as_i64())
                .or_else(|| row.payload.get("price").and_then(|v| v.as_i64()));

            let record = DiamondRecord {
                feed: row.feed.clone(),
                supplier_stone_id: row.supplier_stone_id.clone(),
                source_updated_at: row.source_updated_at,
                feed_price,
                status: "active".to_string(),
            };

            match diamonds.upsert_if_newer(&record).await {
                Ok(true) => outcome.wrote += 1,
                Ok(false) => outcome.suppressed_no_op += 1,
                Err(err) => {
                    outcome.errors += 1;
                    tracing::warn!(
                        supplier_stone_id = %row.supplier_stone_id,
                        error = %err,
                        "failed to upsert diamonds row"
                    );
                    let _ = raw_records
                        .mark_consolidated(&row.feed, &row.supplier_stone_id, ConsolidationStatus::Errored)
                        .await;
                    outcome.processed += 1;
                    continue;
                }
            }

            raw_records
                .mark_consolidated(&row.feed, &row.supplier_stone_id, ConsolidationStatus::Consolidated)
                .await
                .map_err(IngestError::Other)?;
            outcome.processed += 1;
        }

        runs.record_consolidation_progress(message.run_id, pending.len() as i64, 0)
            .await
            .map_err(IngestError::Other)?;

        if (pending.len() as i64) < page_size {
            break;
        }
    }

    runs.record_consolidation_complete(message.run_id)
        .await
        .map_err(IngestError::Other)?;

    // Write-on-consolidation-success only: a pass that left errors behind
    // must not advance the high-water mark,
    // since some rows for this run never made it into `diamonds`.
    if outcome.errors == 0 {
        let run = runs.get(message.run_id).await.map_err(IngestError::Other)?;
        if let Some(run) = run {
            if let Some(watermark_after) = run.watermark_after {
                watermarks
                    .set(
                        &message.feed,
                        &Watermark {
                            last_updated_at: watermark_after,
                            last_run_id: message.run_id.to_string(),
                        },
                    )
                    .await
                    .map_err(IngestError::Other)?;
            }
            runs.set_status(message.run_id, RunStatus::Completed)
                .await
                .map_err(IngestError::Other)?;
        }
    } else {
        tracing::warn!(
            run_id = %message.run_id,
            errors = outcome.errors,
            "consolidation finished with errors, withholding watermark advance"
        );
    }

    tracing::info!(
        run_id = %message.run_id,
        feed = message.feed,
        force = message.force,
        processed = outcome.processed,
        errors = outcome.errors,
        "consolidation pass complete"
    );

    Ok(outcome)
}

/// Dedup key the consolidator uses to decide whether a `Consolidate`
/// message for the same run has already been fully handled. Callers that
/// want to skip redundant passes can compare against the run's
/// `consolidation_completed_at` before invoking `consolidate`.
pub fn dedup_key(message: &Consolidate) -> Uuid {
    message.run_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_is_the_run_id() {
        let msg = Consolidate {
            feed: "nivoda".to_string(),
            run_id: Uuid::new_v4(),
            trace_id: Uuid::new_v4(),
            force: false,
        };
        assert_eq!(dedup_key(&msg), msg.run_id);
    }
}
