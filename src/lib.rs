//! Keeps a signed-in user's activity log and profile in sync with a hosted
//! backend, or with a local SQLite stand-in when running offline.

pub mod config;
pub mod core;
pub mod logging;

pub use crate::config::{ConfigError, SyncConfig};
pub use crate::core::activity::{ActivityLogEntry, ActivityLogSynchronizer, NewActivityLog};
pub use crate::core::backend::local::LocalBackend;
pub use crate::core::backend::rest::RestBackend;
pub use crate::core::backend::{Backend, BackendError};
pub use crate::core::notify::{Notice, NoticeLevel, Notifier, SilentNotifier};
pub use crate::core::profile::{AvatarFile, Profile, ProfileChanges, ProfileSynchronizer};
pub use crate::core::session::AccountSession;
pub use crate::core::user::UserId;
pub use crate::core::{SyncError, SyncOptions};
