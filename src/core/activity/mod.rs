pub mod models;
pub mod synchronizer;

pub use models::{ActivityLogEntry, NewActivityLog};
pub use synchronizer::ActivityLogSynchronizer;
