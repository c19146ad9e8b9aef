//! Balanced partitioning over a density map.
//!
//! Pure function: no I/O, no adapter calls. Walks the density map in price
//! order and greedily closes a partition once its running total reaches the
//! per-worker target, so `partitions.len() == worker_count` is an output,
//! not an input — the caller decides `worker_count` from total records and
//! feeds it in here. The final partition absorbs any remainder so every
//! record in the density map lands in exactly one partition.

use crate::models::{DensityChunk, Partition};

/// Splits `density_map` into `worker_count` contiguous partitions, each
/// covering a `[min_price, max_price)` span, with `total_records` summed
/// from the chunks it absorbed. `density_map` must already be sorted by
/// `min` (the scanner produces it in scan order, which is ascending).
pub fn partition_density_map(density_map: &[DensityChunk], worker_count: usize) -> Vec<Partition> {
    if density_map.is_empty() || worker_count == 0 {
        return Vec::new();
    }

    let total_records: i64 = density_map.iter().map(|c| c.count).sum();
    if total_records == 0 {
        return Vec::new();
    }

    let target_per_partition = (total_records as f64 / worker_count as f64).ceil() as i64;
    let target_per_partition = target_per_partition.max(1);

    let mut partitions = Vec::with_capacity(worker_count);
    let mut running_min = density_map[0].min;
    let mut running_count: i64 = 0;
    let mut running_max = density_map[0].min;

    for chunk in density_map {
        running_count += chunk.count;
        running_max = chunk.max;

        let partitions_remaining = worker_count - partitions.len();
        let is_last_partition = partitions_remaining <= 1;

        if !is_last_partition && running_count >= target_per_partition {
            partitions.push(Partition {
                partition_id: format!("partition-{}", partitions.len()),
                min_price: running_min,
                max_price: running_max,
                total_records: running_count,
            });
            running_min = running_max;
            running_count = 0;
        }
    }

    // Absorb whatever remains (including the case where worker_count == 1,
    // or the last chunk didn't reach target) into a final partition.
    if running_count > 0 || partitions.is_empty() {
        partitions.push(Partition {
            partition_id: format!("partition-{}", partitions.len()),
            min_price: running_min,
            max_price: running_max,
            total_records: running_count,
        });
    }

    partitions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(min: i64, max: i64, count: i64) -> DensityChunk {
        DensityChunk { min, max, count }
    }

    #[test]
    fn empty_density_map_yields_no_partitions() {
        assert!(partition_density_map(&[], 5).is_empty());
    }

    #[test]
    fn zero_workers_yields_no_partitions() {
        let map = vec![chunk(0, 100, 10)];
        assert!(partition_density_map(&map, 0).is_empty());
    }

    #[test]
    fn single_worker_absorbs_everything_into_one_partition() {
        let map = vec![chunk(0, 100, 10), chunk(100, 200, 20), chunk(200, 300, 5)];
        let partitions = partition_density_map(&map, 1);
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].min_price, 0);
        assert_eq!(partitions[0].max_price, 300);
        assert_eq!(partitions[0].total_records, 35);
    }

    #[test]
    fn partitions_cover_the_full_range_with_no_gaps() {
        let map = vec![
            chunk(0, 100, 300),
            chunk(100, 200, 300),
            chunk(200, 300, 300),
            chunk(300, 400, 300),
        ];
        let partitions = partition_density_map(&map, 4);
        assert_eq!(partitions.len(), 4);
        assert_eq!(partitions.first().unwrap().min_price, 0);
        assert_eq!(partitions.last().unwrap().max_price, 400);
        for window in partitions.windows(2) {
            assert_eq!(window[0].max_price, window[1].min_price);
        }
        let total: i64 = partitions.iter().map(|p| p.total_records).sum();
        assert_eq!(total, 1200);
    }

    #[test]
    fn worker_count_is_authoritative_even_with_uneven_density() {
        // One dense chunk dwarfs the rest; the partitioner must still
        // produce exactly `worker_count` partitions, absorbing the
        // remainder into the last one.
        let map = vec![chunk(0, 10, 1), chunk(10, 20, 1), chunk(20, 30, 1000)];
        let partitions = partition_density_map(&map, 3);
        assert_eq!(partitions.len(), 3);
        let total: i64 = partitions.iter().map(|p| p.total_records).sum();
        assert_eq!(total, 1002);
    }

    #[test]
    fn fewer_non_empty_chunks_than_workers_still_terminates() {
        let map = vec![chunk(0, 10, 5)];
        let partitions = partition_density_map(&map, 8);
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].total_records, 5);
    }
}
