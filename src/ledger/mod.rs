pub mod models;
pub mod store;

pub use models::LedgerRecord;
pub use store::{LedgerStore, MemoryLedgerStore, PgLedgerStore};
