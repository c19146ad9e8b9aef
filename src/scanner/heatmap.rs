//! Adaptive heatmap scanner.
//!
//! Walks `[min_price, max_price)` as half-open subranges, recording each
//! non-empty chunk and adapting its step to the local density. Every
//! adapter call is wrapped in bounded retry (see [`crate::retry`]); a
//! non-recoverable failure aborts the scan with [`IngestError::ScanAborted`].

use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;

use crate::config::HeatmapConfig;
use crate::error::IngestError;
use crate::feed::{FeedAdapter, FeedQuery};
use crate::models::{DensityChunk, Partition};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::scanner::partitioner::partition_density_map;

#[derive(Debug, Clone, Default)]
pub struct ScanStats {
    pub api_calls: u64,
    pub scan_duration_ms: u64,
    pub ranges_scanned: u64,
    pub non_empty_ranges: u64,
    pub used_two_pass: bool,
}

pub struct ScanResult {
    pub density_map: Vec<DensityChunk>,
    pub partitions: Vec<Partition>,
    pub total_records: i64,
    pub worker_count: usize,
    pub stats: ScanStats,
}

/// Counts one `[min, max)` chunk through the adapter, retrying transient
/// failures.
async fn count_chunk(
    adapter: &Arc<dyn FeedAdapter>,
    base_query: &FeedQuery,
    min: i64,
    max: i64,
    stats_calls: &std::sync::atomic::AtomicU64,
) -> Result<i64, IngestError> {
    let query = adapter.with_price_range(base_query, min, max);
    let result = retry_with_backoff(RetryPolicy::default(), || {
        let adapter = adapter.clone();
        let query = query.clone_owned();
        async move { adapter.count(&query).await }
    })
    .await;
    stats_calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    result
}

// FeedQuery doesn't implement Clone generically in a way that's ergonomic
// across closures without an explicit helper; this keeps call sites terse.
impl FeedQuery {
    fn clone_owned(&self) -> Self {
        FeedQuery(self.0.clone())
    }
}

/// Runs the single-pass adaptive scan over `[config.min_price,
/// config.max_price)`, or the two-pass coarse-then-refine variant when
/// `config.use_two_pass` is set.
pub async fn scan(
    adapter: Arc<dyn FeedAdapter>,
    base_query: FeedQuery,
    config: HeatmapConfig,
) -> Result<ScanResult, IngestError> {
    let start = Instant::now();
    let api_calls = std::sync::atomic::AtomicU64::new(0);

    let density_map = if config.use_two_pass {
        two_pass_scan(&adapter, &base_query, &config, &api_calls).await?
    } else {
        adaptive_scan(
            &adapter,
            &base_query,
            config.min_price,
            config.max_price,
            &config,
            &api_calls,
        )
        .await?
    };

    let total_records: i64 = density_map.iter().map(|c| c.count).sum();
    let desired_workers = if total_records == 0 {
        0
    } else {
        let by_target = (total_records as f64 / config.target_records_per_chunk as f64).ceil() as usize;
        let by_min_records =
            (total_records as f64 / config.min_records_per_worker as f64).ceil() as usize;
        by_target.min(by_min_records).min(config.max_workers).max(1)
    };

    let partitions = if desired_workers == 0 {
        Vec::new()
    } else {
        partition_density_map(&density_map, desired_workers)
    };

    let stats = ScanStats {
        api_calls: api_calls.load(std::sync::atomic::Ordering::Relaxed),
        scan_duration_ms: start.elapsed().as_millis() as u64,
        ranges_scanned: density_map.len() as u64, // non-empty only; see note below
        non_empty_ranges: density_map.len() as u64,
        used_two_pass: config.use_two_pass,
    };

    Ok(ScanResult {
        worker_count: partitions.len(),
        density_map,
        partitions,
        total_records,
        stats,
    })
}

/// Single-pass adaptive scan over `[start, end)`. Each batch issues up to
/// `concurrency` count-calls in parallel, preserving interval continuity:
/// batch-next always starts at the exclusive upper bound of batch-previous.
async fn adaptive_scan(
    adapter: &Arc<dyn FeedAdapter>,
    base_query: &FeedQuery,
    start: i64,
    end: i64,
    config: &HeatmapConfig,
    api_calls: &std::sync::atomic::AtomicU64,
) -> Result<Vec<DensityChunk>, IngestError> {
    let mut density_map = Vec::new();
    let mut cursor = start;
    let mut step = if cursor < config.dense_zone_threshold {
        config.dense_zone_step
    } else {
        config.initial_step
    };
    let lower_bound_sparse = 2 * config.dense_zone_step;

    while cursor < end {
        // Build one batch of up to `concurrency` chunks, each sized by the
        // current step (dense-zone chunks never cross the threshold).
        let mut batch_bounds = Vec::new();
        let mut batch_cursor = cursor;
        for _ in 0..config.concurrency {
            if batch_cursor >= end {
                break;
            }
            let in_dense_zone = batch_cursor < config.dense_zone_threshold;
            let this_step = if in_dense_zone {
                config.dense_zone_step
            } else {
                step
            };
            let mut chunk_end = (batch_cursor + this_step).min(end);
            if in_dense_zone {
                chunk_end = chunk_end.min(config.dense_zone_threshold);
            }
            batch_bounds.push((batch_cursor, chunk_end));
            batch_cursor = chunk_end;
            if in_dense_zone && chunk_end >= config.dense_zone_threshold {
                // Zone boundary crossed mid-batch; the next chunk re-derives
                // its step from the sparse branch on the following iteration.
                break;
            }
        }

        let futures = batch_bounds
            .iter()
            .map(|&(min, max)| count_chunk(adapter, base_query, min, max, api_calls));
        let counts: Vec<Result<i64, IngestError>> = join_all(futures).await;

        for ((min, max), count_result) in batch_bounds.into_iter().zip(counts.into_iter()) {
            let count = count_result.map_err(|e| IngestError::ScanAborted(e.to_string()))?;
            if count > 0 {
                density_map.push(DensityChunk { min, max, count });
            }

            if max >= config.dense_zone_threshold {
                // Sparse-zone adaptive step update.
                if count == 0 {
                    step = (step * 5).min(100_000);
                } else {
                    let proposed = (step as f64 * config.target_records_per_chunk as f64 / count as f64)
                        .floor() as i64;
                    step = proposed.clamp(lower_bound_sparse, 50_000);
                }
            }
            cursor = max;
        }
    }

    Ok(density_map)
}

/// Two-pass variant: pass 1 coarse-scans for non-empty regions, pass 2
/// binary-searches each region's true boundaries, pass 3 fine-scans each
/// refined region with the adaptive stepping above.
async fn two_pass_scan(
    adapter: &Arc<dyn FeedAdapter>,
    base_query: &FeedQuery,
    config: &HeatmapConfig,
    api_calls: &std::sync::atomic::AtomicU64,
) -> Result<Vec<DensityChunk>, IngestError> {
    // Pass 1: coarse scan with fixed step, collect contiguous non-empty
    // coarse chunks into dense regions.
    let mut coarse_chunks = Vec::new();
    let mut cursor = config.min_price;
    while cursor < config.max_price {
        let chunk_end = (cursor + config.coarse_step).min(config.max_price);
        let count = count_chunk(adapter, base_query, cursor, chunk_end, api_calls)
            .await
            .map_err(|e| IngestError::ScanAborted(e.to_string()))?;
        coarse_chunks.push((cursor, chunk_end, count));
        cursor = chunk_end;
    }

    let mut regions: Vec<(i64, i64)> = Vec::new();
    for (min, max, count) in coarse_chunks {
        if count > 0 {
            if let Some(last) = regions.last_mut() {
                if last.1 == min {
                    last.1 = max;
                    continue;
                }
            }
            regions.push((min, max));
        }
    }

    // Pass 2: binary-search-refine each region's boundaries.
    let min_step = config.initial_step.max(1);
    let mut refined_regions = Vec::new();
    for (region_min, region_max) in regions {
        let refined_min = binary_search_boundary(
            adapter,
            base_query,
            config.min_price,
            region_min,
            region_max,
            min_step,
            api_calls,
            true,
        )
        .await?;
        let refined_max = binary_search_boundary(
            adapter,
            base_query,
            region_min,
            region_max,
            config.max_price,
            min_step,
            api_calls,
            false,
        )
        .await?;
        refined_regions.push((refined_min, refined_max));
    }

    // Pass 3: fine-scan each refined region with adaptive stepping.
    let mut density_map = Vec::new();
    for (region_min, region_max) in refined_regions {
        let mut region_map = adaptive_scan(
            adapter,
            base_query,
            region_min,
            region_max,
            config,
            api_calls,
        )
        .await?;
        density_map.append(&mut region_map);
    }

    Ok(density_map)
}

/// Narrows `[low, high]` toward the true empty/non-empty boundary near
/// `pivot` until `high - low <= min_step`. `searching_left` controls which
/// side of the pivot is being refined (the region's start or its end).
#[allow(clippy::too_many_arguments)]
async fn binary_search_boundary(
    adapter: &Arc<dyn FeedAdapter>,
    base_query: &FeedQuery,
    mut low: i64,
    pivot_known_nonempty: i64,
    mut high: i64,
    min_step: i64,
    api_calls: &std::sync::atomic::AtomicU64,
    searching_left: bool,
) -> Result<i64, IngestError> {
    let _ = pivot_known_nonempty;
    while high - low > min_step {
        let mid = low + (high - low) / 2;
        let (probe_min, probe_max) = if searching_left {
            (mid, high)
        } else {
            (low, mid)
        };
        let count = count_chunk(adapter, base_query, probe_min, probe_max, api_calls)
            .await
            .map_err(|e| IngestError::ScanAborted(e.to_string()))?;
        if searching_left {
            if count > 0 {
                high = mid;
            } else {
                low = mid;
            }
        } else if count > 0 {
            low = mid;
        } else {
            high = mid;
        }
    }
    Ok(if searching_left { low } else { high })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{FeedAdapter, SearchPage, SortOrder};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// A synthetic adapter backed by a fixed list of item prices, used to
    /// exercise the scanner end-to-end without a network dependency.
    struct SyntheticAdapter {
        prices: Mutex<BTreeMap<i64, i64>>, // price -> count
    }

    impl SyntheticAdapter {
        fn from_prices(prices: &[i64]) -> Self {
            let mut map = BTreeMap::new();
            for &p in prices {
                *map.entry(p).or_insert(0) += 1;
            }
            Self {
                prices: Mutex::new(map),
            }
        }
    }

    #[async_trait]
    impl FeedAdapter for SyntheticAdapter {
        fn feed_id(&self) -> &str {
            "synthetic"
        }
        fn raw_table_name(&self) -> &str {
            "raw_synthetic"
        }
        fn watermark_blob_name(&self) -> &str {
            "synthetic-watermark"
        }
        fn max_page_size(&self) -> i64 {
            500
        }
        fn worker_page_size(&self) -> i64 {
            100
        }
        fn price_granularity(&self) -> i64 {
            1
        }
        fn build_base_query(
            &self,
            _updated_from: Option<DateTime<Utc>>,
            _updated_to: Option<DateTime<Utc>>,
        ) -> FeedQuery {
            FeedQuery(serde_json::json!({}))
        }
        fn with_price_range(&self, _query: &FeedQuery, min: i64, max: i64) -> FeedQuery {
            FeedQuery(serde_json::json!({ "min": min, "max": max }))
        }
        async fn count(&self, query: &FeedQuery) -> Result<i64, IngestError> {
            let min = query.0["min"].as_i64().unwrap();
            let max = query.0["max"].as_i64().unwrap();
            let prices = self.prices.lock().unwrap();
            Ok(prices.range(min..max).map(|(_, c)| c).sum())
        }
        async fn search(
            &self,
            _query: &FeedQuery,
            _offset: i64,
            _limit: i64,
            _order: SortOrder,
        ) -> Result<SearchPage, IngestError> {
            unimplemented!("scanner tests only exercise count()")
        }
        fn extract_identity(
            &self,
            _item: &serde_json::Value,
        ) -> Result<crate::models::ItemIdentity, IngestError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn uniform_distribution_recovers_total_records() {
        let prices: Vec<i64> = (0..5000).map(|i| i % 100_000).collect();
        let adapter: Arc<dyn FeedAdapter> = Arc::new(SyntheticAdapter::from_prices(&prices));
        let config = HeatmapConfig {
            min_price: 0,
            max_price: 100_000,
            dense_zone_threshold: 5_000,
            dense_zone_step: 50,
            initial_step: 500,
            target_records_per_chunk: 1_000,
            concurrency: 8,
            max_workers: 100,
            min_records_per_worker: 500,
            use_two_pass: false,
            coarse_step: 5_000,
            price_granularity: 1,
        };
        let query = adapter.build_base_query(None, None);
        let result = scan(adapter, query, config).await.unwrap();
        assert_eq!(result.total_records, 5000);
        assert!(result.partitions.iter().all(|p| p.total_records > 0));
        assert_eq!(result.worker_count, result.partitions.len());
    }

    #[tokio::test]
    async fn single_item_yields_one_partition() {
        let adapter: Arc<dyn FeedAdapter> = Arc::new(SyntheticAdapter::from_prices(&[1500]));
        let config = HeatmapConfig {
            min_price: 0,
            max_price: 10_000,
            dense_zone_threshold: 1_000,
            dense_zone_step: 50,
            initial_step: 500,
            target_records_per_chunk: 1_000,
            concurrency: 4,
            max_workers: 100,
            min_records_per_worker: 500,
            use_two_pass: false,
            coarse_step: 1_000,
            price_granularity: 1,
        };
        let query = adapter.build_base_query(None, None);
        let result = scan(adapter, query, config).await.unwrap();
        assert_eq!(result.partitions.len(), 1);
        assert_eq!(result.total_records, 1);
    }

    #[tokio::test]
    async fn all_same_price_is_a_single_chunk() {
        let prices = vec![1000; 100];
        let adapter: Arc<dyn FeedAdapter> = Arc::new(SyntheticAdapter::from_prices(&prices));
        let config = HeatmapConfig {
            min_price: 0,
            max_price: 10_000,
            dense_zone_threshold: 1_000,
            dense_zone_step: 50,
            initial_step: 500,
            target_records_per_chunk: 1_000,
            concurrency: 4,
            max_workers: 100,
            min_records_per_worker: 500,
            use_two_pass: false,
            coarse_step: 1_000,
            price_granularity: 1,
        };
        let query = adapter.build_base_query(None, None);
        let result = scan(adapter, query, config).await.unwrap();
        assert_eq!(result.total_records, 100);
    }

    #[tokio::test]
    async fn empty_space_yields_zero_records_and_no_partitions() {
        let adapter: Arc<dyn FeedAdapter> = Arc::new(SyntheticAdapter::from_prices(&[]));
        let config = HeatmapConfig {
            min_price: 0,
            max_price: 1_000,
            dense_zone_threshold: 500,
            dense_zone_step: 50,
            initial_step: 100,
            target_records_per_chunk: 1_000,
            concurrency: 4,
            max_workers: 10,
            min_records_per_worker: 500,
            use_two_pass: false,
            coarse_step: 500,
            price_granularity: 1,
        };
        let query = adapter.build_base_query(None, None);
        let result = scan(adapter, query, config).await.unwrap();
        assert_eq!(result.total_records, 0);
        assert!(result.partitions.is_empty());
    }
}
