pub mod aggregator;

pub use aggregator::{StatisticsSnapshot, StatsAggregator};
