pub mod avatar;
pub mod models;
pub mod synchronizer;

pub use avatar::AvatarFile;
pub use models::{Profile, ProfileChanges};
pub use synchronizer::ProfileSynchronizer;
