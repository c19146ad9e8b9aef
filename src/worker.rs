//! Worker — per-message state machine. A worker process calls
//! `process_one_message` once per received `WorkItem` and then acks,
//! abandons, or self-enqueues depending on the outcome.

use std::sync::Arc;

use crate::bus::MessageBus;
use crate::coordinator;
use crate::config::RunConfig;
use crate::db::partition_progress_store::PartitionProgressStore;
use crate::db::raw_store::RawStore;
use crate::db::run_store::RunStore;
use crate::db::worker_run_store::WorkerRunStore;
use crate::error::IngestError;
use crate::feed::{FeedAdapter, SortOrder};
use crate::models::{WorkDone, WorkItem, WorkerRunStatus};
use crate::retry::{retry_with_backoff, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Idempotency guard fired (already completed, or duplicate/out-of-order
    /// offset); the message is acked with no state change.
    Skipped,
    /// One page processed; more pages remain, a continuation was enqueued.
    Continued,
    /// The partition finished (zero items returned, or the bounded end was
    /// reached) and a WorkDone(success) was emitted.
    PartitionCompleted,
    /// The page failed; WorkDone(failure) was emitted and the message
    /// should be abandoned for redelivery.
    PartitionFailed,
    /// The page processed and the cursor advanced, but publishing the
    /// continuation failed; the message must be abandoned (not acked) so
    /// the broker redelivers it — the already-advanced `next_offset` makes
    /// that redelivery hit the idempotency guard at the top of this
    /// function rather than reprocessing the page.
    ContinuationEnqueueFailed,
}

#[allow(clippy::too_many_arguments)]
pub async fn process_one_message(
    worker_id: &str,
    message: &WorkItem,
    offset_end: Option<i64>,
    adapter: Arc<dyn FeedAdapter>,
    partition_progress: &PartitionProgressStore,
    worker_runs: &WorkerRunStore,
    raw_records: &RawStore,
    runs: &RunStore,
    bus: &dyn MessageBus,
    run_config: &RunConfig,
) -> Result<MessageOutcome, IngestError> {
    partition_progress
        .seed(message.run_id, std::slice::from_ref(&message.partition_id))
        .await
        .map_err(IngestError::Other)?;

    let progress = partition_progress
        .get(message.run_id, &message.partition_id)
        .await
        .map_err(IngestError::Other)?
        .ok_or_else(|| IngestError::Fatal("partition_progress row missing after seed".to_string()))?;

    if progress.completed {
        tracing::info!(run_id = %message.run_id, partition_id = %message.partition_id, "partition already completed, skipping");
        return Ok(MessageOutcome::Skipped);
    }
    if message.offset != progress.next_offset {
        tracing::info!(
            run_id = %message.run_id,
            partition_id = %message.partition_id,
            expected = progress.next_offset,
            got = message.offset,
            "out-of-order or duplicate delivery, skipping"
        );
        return Ok(MessageOutcome::Skipped);
    }

    if let Some(end) = offset_end {
        if message.offset >= end {
            partition_progress
                .complete(message.run_id, &message.partition_id, message.offset)
                .await
                .map_err(IngestError::Other)?;
            return finalize_success(worker_id, message, 0, partition_progress, worker_runs, runs, bus, run_config).await;
        }
    }

    worker_runs
        .start(message.run_id, &message.partition_id, worker_id, &serde_json::to_value(message).unwrap_or_default())
        .await
        .map_err(IngestError::Other)?;

    let query = adapter.with_price_range(
        &adapter.build_base_query(message.updated_from, message.updated_to),
        message.min_price,
        message.max_price,
    );

    let page_result = retry_with_backoff(RetryPolicy::default(), || {
        let adapter = adapter.clone();
        let query = query.clone();
        async move { adapter.search(&query, message.offset, message.limit, SortOrder::CreatedAtAsc).await }
    })
    .await;

    let page = match page_result {
        Ok(page) => page,
        Err(err) => {
            return fail_partition(worker_id, message, &err, partition_progress, worker_runs, runs, bus, run_config).await;
        }
    };

    if page.items.is_empty() {
        partition_progress
            .complete(message.run_id, &message.partition_id, message.offset)
            .await
            .map_err(IngestError::Other)?;
        return finalize_success(worker_id, message, 0, partition_progress, worker_runs, runs, bus, run_config).await;
    }

    let identities: Result<Vec<_>, IngestError> =
        page.items.iter().map(|item| adapter.extract_identity(item)).collect();
    let identities = match identities {
        Ok(ids) => ids,
        Err(err) => return fail_partition(worker_id, message, &err, partition_progress, worker_runs, runs, bus, run_config).await,
    };

    let new_offset = message.offset + identities.len() as i64;

    // Both stores are handed clones of the same connection pool, so the
    // bulk upsert and the cursor advance commit as one transaction: raw
    // rows and the cursor can never diverge even on a mid-write crash.
    let advanced = match partition_progress.pool().begin().await.map_err(anyhow::Error::from) {
        Ok(mut tx) => {
            let upsert = raw_records
                .bulk_upsert_raw_in_tx(&mut tx, &message.feed, message.run_id, &identities)
                .await;
            if let Err(err) = upsert {
                let _ = tx.rollback().await;
                return fail_partition(worker_id, message, &IngestError::Other(err), partition_progress, worker_runs, runs, bus, run_config).await;
            }
            let advanced = partition_progress
                .advance_in_tx(&mut tx, message.run_id, &message.partition_id, message.offset, new_offset)
                .await
                .map_err(IngestError::Other)?;
            tx.commit().await.map_err(|e| IngestError::Other(e.into()))?;
            advanced
        }
        Err(err) => {
            return fail_partition(worker_id, message, &IngestError::Other(err), partition_progress, worker_runs, runs, bus, run_config).await;
        }
    };
    if !advanced {
        // Another attempt already advanced this cursor; treat as a
        // duplicate rather than re-deriving has_more from a stale offset.
        tracing::info!(run_id = %message.run_id, partition_id = %message.partition_id, "cursor already advanced by a concurrent delivery");
        return Ok(MessageOutcome::Skipped);
    }

    let records_processed = worker_runs
        .complete(message.run_id, &message.partition_id, identities.len() as i64)
        .await
        .map_err(IngestError::Other)?;

    let has_more = identities.len() as i64 == message.limit
        && offset_end.map(|end| new_offset < end).unwrap_or(true);

    if has_more {
        let next_message = WorkItem {
            offset: new_offset,
            ..message.clone()
        };
        match bus.publish_work_item(&next_message).await {
            Ok(()) => Ok(MessageOutcome::Continued),
            Err(err) => {
                tracing::warn!(
                    run_id = %message.run_id,
                    partition_id = %message.partition_id,
                    error = %err,
                    "failed to publish continuation, abandoning original message for redelivery"
                );
                Ok(MessageOutcome::ContinuationEnqueueFailed)
            }
        }
    } else {
        partition_progress
            .complete(message.run_id, &message.partition_id, new_offset)
            .await
            .map_err(IngestError::Other)?;
        finalize_success(worker_id, message, records_processed, partition_progress, worker_runs, runs, bus, run_config).await
    }
}

#[allow(clippy::too_many_arguments)]
async fn finalize_success(
    worker_id: &str,
    message: &WorkItem,
    records_processed: i64,
    partition_progress: &PartitionProgressStore,
    worker_runs: &WorkerRunStore,
    runs: &RunStore,
    bus: &dyn MessageBus,
    run_config: &RunConfig,
) -> Result<MessageOutcome, IngestError> {
    bus.publish_work_done(&WorkDone {
        feed: message.feed.clone(),
        run_id: message.run_id,
        trace_id: message.trace_id,
        worker_id: worker_id.to_string(),
        partition_id: message.partition_id.clone(),
        records_processed,
        status: WorkerRunStatus::Completed,
        error: None,
    })
    .await?;

    let run = runs
        .get(message.run_id)
        .await
        .map_err(IngestError::Other)?
        .ok_or_else(|| IngestError::Fatal("run row missing during finalization".to_string()))?;

    coordinator::evaluate_run(
        message.run_id,
        &message.feed,
        message.trace_id,
        run.expected_workers,
        partition_progress,
        runs,
        bus,
        run_config,
    )
    .await?;

    Ok(MessageOutcome::PartitionCompleted)
}

#[allow(clippy::too_many_arguments)]
async fn fail_partition(
    worker_id: &str,
    message: &WorkItem,
    error: &IngestError,
    partition_progress: &PartitionProgressStore,
    worker_runs: &WorkerRunStore,
    runs: &RunStore,
    bus: &dyn MessageBus,
    run_config: &RunConfig,
) -> Result<MessageOutcome, IngestError> {
    let capped = error.capped_message();
    let first_failure = partition_progress
        .mark_failed(message.run_id, &message.partition_id)
        .await
        .map_err(IngestError::Other)?;

    worker_runs
        .fail(message.run_id, &message.partition_id, &capped)
        .await
        .map_err(IngestError::Other)?;

    if first_failure {
        bus.publish_work_done(&WorkDone {
            feed: message.feed.clone(),
            run_id: message.run_id,
            trace_id: message.trace_id,
            worker_id: worker_id.to_string(),
            partition_id: message.partition_id.clone(),
            records_processed: 0,
            status: WorkerRunStatus::Failed,
            error: Some(capped),
        })
        .await?;

        // Every finalization, success or failure, invokes the coordinator
        // so the run's terminal decision is derived purely from
        // partition-progress tallies rather than from success events alone
        // (otherwise an all-failing run would never be evaluated).
        let run = runs
            .get(message.run_id)
            .await
            .map_err(IngestError::Other)?
            .ok_or_else(|| IngestError::Fatal("run row missing during finalization".to_string()))?;

        coordinator::evaluate_run(
            message.run_id,
            &message.feed,
            message.trace_id,
            run.expected_workers,
            partition_progress,
            runs,
            bus,
            run_config,
        )
        .await?;
    }

    tracing::warn!(run_id = %message.run_id, partition_id = %message.partition_id, error = %error, "partition failed");
    Ok(MessageOutcome::PartitionFailed)
}
