pub mod models;

pub use models::{AssignedTrade, MarkSentinel, PaidMarker, Staff};
