//! Owns the synchronizers for whoever is signed in.
//!
//! The user id is injected on `sign_in`; switching users or signing out
//! always tears the previous pair down before anything else happens.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::activity::ActivityLogSynchronizer;
use crate::core::backend::Backend;
use crate::core::notify::Notifier;
use crate::core::profile::ProfileSynchronizer;
use crate::core::user::UserId;
use crate::core::SyncOptions;

struct ActiveUser {
    activity: ActivityLogSynchronizer,
    profile: ProfileSynchronizer,
}

pub struct AccountSession {
    backend: Arc<dyn Backend>,
    notifier: Arc<dyn Notifier>,
    options: SyncOptions,
    active: Option<ActiveUser>,
}

impl AccountSession {
    pub fn new(
        backend: Arc<dyn Backend>,
        notifier: Arc<dyn Notifier>,
        options: SyncOptions,
    ) -> Self {
        Self {
            backend,
            notifier,
            options,
            active: None,
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.active.as_ref().map(|active| active.activity.user_id())
    }

    pub fn activity(&self) -> Option<&ActivityLogSynchronizer> {
        self.active.as_ref().map(|active| &active.activity)
    }

    pub fn profile(&self) -> Option<&ProfileSynchronizer> {
        self.active.as_ref().map(|active| &active.profile)
    }

    /// Follows the auth state: `Some` signs that user in, `None` signs out.
    pub async fn set_user(&mut self, user_id: Option<UserId>) {
        match user_id {
            Some(user_id) => self.sign_in(user_id).await,
            None => self.sign_out().await,
        }
    }

    pub async fn sign_in(&mut self, user_id: UserId) {
        if self.user_id() == Some(user_id) {
            return;
        }
        self.sign_out().await;

        tracing::info!(%user_id, backend = self.backend.name(), "starting session");
        let activity = ActivityLogSynchronizer::start(
            self.backend.clone(),
            user_id,
            self.notifier.clone(),
            self.options.clone(),
        )
        .await;
        let profile = ProfileSynchronizer::start(
            self.backend.clone(),
            activity.clone(),
            self.notifier.clone(),
            &self.options,
        )
        .await;
        self.active = Some(ActiveUser { activity, profile });
    }

    pub async fn sign_out(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.activity.shutdown().await;
        active.profile.close();
        tracing::info!(user_id = %active.activity.user_id(), "session ended");
    }

    pub fn health_report(&self) -> BTreeMap<String, String> {
        let mut report = BTreeMap::new();
        report.insert("backend".to_string(), self.backend.name().to_string());
        let (activity, profile, feed) = match &self.active {
            None => ("signed_out", "signed_out", "off"),
            Some(active) => (
                status(active.activity.loading(), active.activity.ready()),
                status(active.profile.loading(), active.profile.ready()),
                if active.activity.is_live() { "live" } else { "off" },
            ),
        };
        report.insert("activity".to_string(), activity.to_string());
        report.insert("profile".to_string(), profile.to_string());
        report.insert("live_feed".to_string(), feed.to_string());
        report
    }
}

fn status(loading: bool, ready: bool) -> &'static str {
    if loading {
        "loading"
    } else if ready {
        "synced"
    } else {
        "stale"
    }
}
