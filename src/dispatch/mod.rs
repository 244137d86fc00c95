pub mod expiration;
pub mod scheduler;

pub use expiration::ExpirationMonitor;
pub use scheduler::{AssignmentOutcome, TradeDispatcher};
