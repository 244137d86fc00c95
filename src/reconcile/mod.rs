pub mod matcher;
pub mod reconciler;

pub use reconciler::{Reconciler, ReconcilerOptions};
