//! Read-model of the signed-in user's profile row.
//!
//! # Invariants
//! - Only the row whose id equals the injected user id is ever read or written.
//! - `update_profile` trusts the row returned by the update; `upload_avatar`
//!   re-reads the profile after writing.
//! - Failures never roll back local state.
//! - After `close` the profile stays empty, even for updates that were
//!   already in flight.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use tokio::sync::watch;

use super::avatar::{storage_path, AvatarFile};
use super::models::{Profile, ProfileChanges};
use crate::core::activity::ActivityLogSynchronizer;
use crate::core::backend::{Backend, Filter, SelectQuery, PROFILES_TABLE};
use crate::core::notify::{Notice, Notifier};
use crate::core::read_model::{ReadModel, Snapshot};
use crate::core::user::UserId;
use crate::core::{SyncError, SyncOptions};

pub const PROFILE_ACTIVITY: &str = "profile";
pub const AVATAR_ACTIVITY: &str = "avatar";

struct Inner {
    backend: Arc<dyn Backend>,
    notifier: Arc<dyn Notifier>,
    user_id: UserId,
    avatar_bucket: String,
    activity: ActivityLogSynchronizer,
    model: ReadModel<Option<Profile>>,
}

#[derive(Clone)]
pub struct ProfileSynchronizer {
    inner: Arc<Inner>,
}

impl ProfileSynchronizer {
    /// Builds the synchronizer for the user `activity` belongs to and runs
    /// the first fetch. Profile mutations record their activity entries
    /// through `activity`.
    pub async fn start(
        backend: Arc<dyn Backend>,
        activity: ActivityLogSynchronizer,
        notifier: Arc<dyn Notifier>,
        options: &SyncOptions,
    ) -> Self {
        let synchronizer = Self {
            inner: Arc::new(Inner {
                backend,
                notifier,
                user_id: activity.user_id(),
                avatar_bucket: options.avatar_bucket.clone(),
                activity,
                model: ReadModel::new(None),
            }),
        };
        synchronizer.fetch_profile().await;
        synchronizer
    }

    pub fn user_id(&self) -> UserId {
        self.inner.user_id
    }

    pub fn profile(&self) -> Option<Profile> {
        self.inner.model.value()
    }

    pub fn loading(&self) -> bool {
        self.inner.model.loading()
    }

    pub fn ready(&self) -> bool {
        self.inner.model.ready()
    }

    pub fn watch(&self) -> watch::Receiver<Snapshot<Option<Profile>>> {
        self.inner.model.watch()
    }

    pub async fn fetch_profile(&self) -> bool {
        let inner = &self.inner;
        let ticket = inner.model.begin_fetch();
        match inner.load_profile().await {
            Ok(profile) => {
                let applied = inner.model.finish_fetch(ticket, Some(Some(profile)));
                tracing::debug!(
                    user_id = %inner.user_id,
                    seq = ticket.seq(),
                    applied,
                    "profile fetched"
                );
                true
            }
            Err(error) => {
                inner.model.finish_fetch(ticket, None);
                tracing::error!(user_id = %inner.user_id, %error, "failed to fetch profile");
                inner
                    .notifier
                    .notify(Notice::error("Error fetching profile", error.to_string()));
                false
            }
        }
    }

    /// Writes `changes`, records a `profile` activity entry and adopts the
    /// updated row. Returns `None` (after notifying) on any failure.
    pub async fn update_profile(&self, changes: ProfileChanges) -> Option<Profile> {
        let inner = &self.inner;
        match inner.apply_changes(&changes).await {
            Ok(profile) => {
                let adopted = inner
                    .model
                    .modify(|current| *current = Some(profile.clone()));
                tracing::info!(
                    user_id = %inner.user_id,
                    fields = ?changes.changed_fields(),
                    adopted,
                    "profile updated"
                );
                inner.notifier.notify(Notice::success(
                    "Profile updated",
                    "Your profile has been updated successfully.",
                ));
                Some(profile)
            }
            Err(error) => {
                tracing::error!(user_id = %inner.user_id, %error, "failed to update profile");
                inner
                    .notifier
                    .notify(Notice::error("Error updating profile", error.to_string()));
                None
            }
        }
    }

    /// Uploads `file`, points the profile at its public URL, records an
    /// `avatar` activity entry and re-reads the profile.
    ///
    /// Returns the public URL computed for the upload; the stored
    /// `avatar_url` is whatever the re-read returns.
    pub async fn upload_avatar(&self, file: AvatarFile) -> Option<String> {
        let inner = &self.inner;
        match inner.store_avatar(file).await {
            Ok(url) => {
                tracing::info!(user_id = %inner.user_id, %url, "avatar uploaded");
                inner.notifier.notify(Notice::success(
                    "Avatar updated",
                    "Your profile picture has been updated.",
                ));
                self.fetch_profile().await;
                Some(url)
            }
            Err(error) => {
                tracing::error!(user_id = %inner.user_id, %error, "failed to upload avatar");
                inner
                    .notifier
                    .notify(Notice::error("Error uploading avatar", error.to_string()));
                None
            }
        }
    }

    /// Clears the profile for good; results that arrive later are dropped.
    pub(crate) fn close(&self) {
        self.inner.model.close(None);
    }
}

impl Inner {
    fn own_row(&self) -> Filter {
        Filter::eq("id", self.user_id.to_string())
    }

    async fn load_profile(&self) -> Result<Profile, SyncError> {
        let query = SelectQuery::from(PROFILES_TABLE).filter(self.own_row());
        let rows = self.backend.select(&query).await?;
        single_profile(rows)
    }

    async fn write_profile(&self, mut patch: Value) -> Result<Profile, SyncError> {
        if let Some(fields) = patch.as_object_mut() {
            fields.insert(
                "updated_at".to_string(),
                Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
            );
        }
        let rows = self
            .backend
            .update(PROFILES_TABLE, patch, &[self.own_row()])
            .await?;
        single_profile(rows)
    }

    async fn apply_changes(&self, changes: &ProfileChanges) -> Result<Profile, SyncError> {
        if changes.is_empty() {
            return Err(SyncError::EmptyUpdate);
        }
        let profile = self.write_profile(serde_json::to_value(changes)?).await?;
        if !self
            .activity
            .add_activity_log(PROFILE_ACTIVITY, changes.describe())
            .await
        {
            return Err(SyncError::ActivityLog);
        }
        Ok(profile)
    }

    async fn store_avatar(&self, file: AvatarFile) -> Result<String, SyncError> {
        let path = storage_path(self.user_id, file.extension().as_deref());
        let AvatarFile {
            content_type,
            bytes,
            ..
        } = file;
        self.backend
            .upload_blob(&self.avatar_bucket, &path, bytes, content_type.as_deref())
            .await?;
        let url = self.backend.public_url(&self.avatar_bucket, &path);
        self.write_profile(json!({ "avatar_url": url })).await?;
        if !self
            .activity
            .add_activity_log(AVATAR_ACTIVITY, "Uploaded a new profile picture")
            .await
        {
            return Err(SyncError::ActivityLog);
        }
        Ok(url)
    }
}

fn single_profile(rows: Vec<Value>) -> Result<Profile, SyncError> {
    let found = rows.len();
    let mut rows = rows.into_iter();
    match (rows.next(), found) {
        (Some(row), 1) => Ok(serde_json::from_value(row)?),
        _ => Err(SyncError::RowCount { expected: 1, found }),
    }
}
