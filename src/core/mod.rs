pub mod activity;
pub mod backend;
pub mod notify;
pub mod profile;
pub mod read_model;
pub mod session;
pub mod user;

#[cfg(test)]
pub(crate) mod testing;

use backend::BackendError;

pub const DEFAULT_LOG_LIMIT: usize = 100;
pub const DEFAULT_AVATAR_BUCKET: &str = "avatars";

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("unexpected row shape: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("expected exactly {expected} row(s), found {found}")]
    RowCount { expected: usize, found: usize },
    #[error("no profile fields to update")]
    EmptyUpdate,
    #[error("activity log entry could not be recorded")]
    ActivityLog,
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-session knobs shared by both synchronizers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    pub log_limit: usize,
    pub live_feed: bool,
    /// Skip prepending an entry whose id is already in the list. Off by
    /// default, so an insert and its echo on the live feed both show up.
    pub dedupe_live_inserts: bool,
    pub avatar_bucket: String,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            log_limit: DEFAULT_LOG_LIMIT,
            live_feed: true,
            dedupe_live_inserts: false,
            avatar_bucket: DEFAULT_AVATAR_BUCKET.to_string(),
        }
    }
}
