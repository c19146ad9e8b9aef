//! Run Coordinator — a pure decision function over partition tallies, plus
//! a thin async wrapper that reads the tally from the store and emits bus
//! messages. Deliberately idempotent-tolerant: the pure function may be
//! invoked multiple times under concurrent worker completions, and the
//! consolidator itself dedupes by `run_id`, so re-emitting `CONSOLIDATE`
//! is always safe.

use chrono::Duration as ChronoDuration;
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::config::RunConfig;
use crate::db::partition_progress_store::{PartitionCounts, PartitionProgressStore};
use crate::db::run_store::RunStore;
use crate::db::worker_run_store::WorkerRunStore;
use crate::error::IngestError;
use crate::models::{Consolidate, RunStatus, WorkerRunStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorDecision {
    /// Not every partition has finalized yet; no action.
    Pending,
    /// Every partition succeeded.
    Consolidate,
    /// Enough partitions succeeded to clear the auto-consolidation
    /// threshold; consolidate anyway, but delayed and flagged `force`.
    ForceConsolidate,
    /// Below threshold: fail the run, no consolidation.
    RunFailed,
}

/// Pure decision over a partition tally. No I/O.
pub fn decide(tally: PartitionCounts, expected: i64, success_threshold: f64) -> CoordinatorDecision {
    if expected == 0 {
        return CoordinatorDecision::Pending;
    }
    if tally.completed == expected && tally.failed == 0 {
        return CoordinatorDecision::Consolidate;
    }
    if tally.completed + tally.failed >= expected {
        let success_rate = tally.completed as f64 / expected as f64;
        if success_rate >= success_threshold && tally.completed > 0 {
            return CoordinatorDecision::ForceConsolidate;
        }
        return CoordinatorDecision::RunFailed;
    }
    CoordinatorDecision::Pending
}

/// Reads the tally for `run_id` from the store, decides, and emits the
/// corresponding bus message / run-status transition. Called after every
/// worker finalization, success or failure.
pub async fn evaluate_run(
    run_id: Uuid,
    feed: &str,
    trace_id: Uuid,
    expected_workers: i32,
    partition_progress: &PartitionProgressStore,
    runs: &RunStore,
    bus: &dyn MessageBus,
    config: &RunConfig,
) -> Result<CoordinatorDecision, IngestError> {
    let tally = partition_progress.counts_for_run(run_id).await.map_err(IngestError::Other)?;
    let decision = decide(tally, expected_workers as i64, config.auto_consolidation_success_threshold);

    match decision {
        CoordinatorDecision::Pending => {}
        CoordinatorDecision::Consolidate => {
            bus.publish_consolidate(&Consolidate {
                feed: feed.to_string(),
                run_id,
                trace_id,
                force: false,
            })
            .await?;
        }
        CoordinatorDecision::ForceConsolidate => {
            bus.publish_consolidate_delayed(
                &Consolidate {
                    feed: feed.to_string(),
                    run_id,
                    trace_id,
                    force: true,
                },
                ChronoDuration::minutes(config.auto_consolidation_delay_minutes as i64),
            )
            .await?;
            tracing::warn!(%run_id, feed, "run reached partial success; force-consolidating after delay");
        }
        CoordinatorDecision::RunFailed => {
            runs.set_status(run_id, RunStatus::Failed).await.map_err(IngestError::Other)?;
            tracing::error!(%run_id, feed, "run failed: success rate below threshold");
        }
    }

    Ok(decision)
}

/// Stall detection, evaluated lazily when a run's status is read, not
/// persisted as a transition. A run is reported `stalled` when it is
/// still running, has no failures, and no partition has updated in over
/// `run_stall_threshold_minutes`.
pub async fn detect_stall(
    run_id: Uuid,
    partition_progress: &PartitionProgressStore,
    threshold_minutes: i64,
) -> Result<bool, IngestError> {
    let rows = partition_progress.list_for_run(run_id).await.map_err(IngestError::Other)?;
    if rows.is_empty() {
        return Ok(false);
    }
    if rows.iter().any(|p| p.failed) {
        return Ok(false);
    }
    let most_recent = rows.iter().map(|p| p.updated_at).max().unwrap();
    let age = chrono::Utc::now() - most_recent;
    Ok(age > ChronoDuration::minutes(threshold_minutes))
}

/// Sweeps incomplete partitions and running worker rows to `failed`, then
/// marks the run `completed_at := now`. An explicit operator action, not
/// part of the automatic decision path.
pub async fn cancel(
    run_id: Uuid,
    reason: &str,
    partition_progress: &PartitionProgressStore,
    worker_runs: &WorkerRunStore,
    runs: &RunStore,
) -> Result<(), IngestError> {
    tracing::warn!(%run_id, reason, "cancelling run");

    let partitions = partition_progress.list_for_run(run_id).await.map_err(IngestError::Other)?;
    for partition in partitions.into_iter().filter(|p| !p.completed && !p.failed) {
        partition_progress
            .mark_failed(run_id, &partition.partition_id)
            .await
            .map_err(IngestError::Other)?;
    }

    let worker_rows = worker_runs.list_for_run(run_id).await.map_err(IngestError::Other)?;
    for worker_run in worker_rows.into_iter().filter(|w| w.status == WorkerRunStatus::Running) {
        worker_runs
            .fail(run_id, &worker_run.partition_id, reason)
            .await
            .map_err(IngestError::Other)?;
    }

    runs.set_status(run_id, RunStatus::Cancelled).await.map_err(IngestError::Other)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tally(total: i64, completed: i64, failed: i64) -> PartitionCounts {
        PartitionCounts { total, completed, failed }
    }

    #[test]
    fn pending_when_partitions_still_in_flight() {
        assert_eq!(decide(tally(10, 3, 0), 10, 0.70), CoordinatorDecision::Pending);
    }

    #[test]
    fn full_success_consolidates() {
        assert_eq!(decide(tally(10, 10, 0), 10, 0.70), CoordinatorDecision::Consolidate);
    }

    #[test]
    fn above_threshold_partial_success_force_consolidates() {
        // 10 partitions, 8 succeed, 2 fail -> 0.80 >= 0.70
        assert_eq!(decide(tally(10, 8, 2), 10, 0.70), CoordinatorDecision::ForceConsolidate);
    }

    #[test]
    fn under_threshold_fails_the_run() {
        // 10 partitions, 5 succeed, 5 fail -> 0.50 < 0.70
        assert_eq!(decide(tally(10, 5, 5), 10, 0.70), CoordinatorDecision::RunFailed);
    }

    #[test]
    fn zero_completed_never_force_consolidates_even_at_threshold() {
        assert_eq!(decide(tally(1, 0, 1), 1, 0.0), CoordinatorDecision::RunFailed);
    }

    #[test]
    fn exactly_at_threshold_force_consolidates() {
        assert_eq!(decide(tally(10, 7, 3), 10, 0.70), CoordinatorDecision::ForceConsolidate);
    }
}
