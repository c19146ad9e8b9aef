//! Density scanning and partitioning.

pub mod heatmap;
pub mod partitioner;

pub use heatmap::{scan, ScanResult, ScanStats};
pub use partitioner::partition_density_map;
