//! Live read-model of the signed-in user's recent activity.
//!
//! # Invariants
//! - Holds only rows whose `user_id` is the injected user.
//! - A fetch replaces the whole list with at most `log_limit` rows, newest first.
//! - Feed inserts are prepended and may grow the list past `log_limit`.
//! - Without `dedupe_live_inserts`, an entry added here and its echo on the
//!   feed both appear in the list.
//! - After `shutdown` the list stays empty, even for inserts and feed events
//!   that were already in flight.
//! - Every subscription is released, by `shutdown` or when the last handle
//!   is dropped.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::models::{ActivityLogEntry, NewActivityLog};
use crate::core::backend::{
    Backend, ChangeEvent, ChangeKind, EventMask, Filter, LiveFeed, SelectQuery, Subscription,
    SubscriptionId, ACTIVITY_LOGS_TABLE,
};
use crate::core::notify::{Notice, Notifier};
use crate::core::read_model::{ReadModel, Snapshot};
use crate::core::user::UserId;
use crate::core::{SyncError, SyncOptions};

#[derive(Default)]
struct FeedHandle {
    subscription: Option<SubscriptionId>,
    pump: Option<JoinHandle<()>>,
}

struct Inner {
    backend: Arc<dyn Backend>,
    notifier: Arc<dyn Notifier>,
    user_id: UserId,
    options: SyncOptions,
    model: ReadModel<Vec<ActivityLogEntry>>,
    feed: Mutex<FeedHandle>,
}

/// Cheap to clone; clones share one list and one subscription.
#[derive(Clone)]
pub struct ActivityLogSynchronizer {
    inner: Arc<Inner>,
}

impl ActivityLogSynchronizer {
    /// Subscribes to the user's inserts (when enabled) and runs the first fetch.
    pub async fn start(
        backend: Arc<dyn Backend>,
        user_id: UserId,
        notifier: Arc<dyn Notifier>,
        options: SyncOptions,
    ) -> Self {
        let live_feed = options.live_feed;
        let synchronizer = Self {
            inner: Arc::new(Inner {
                backend,
                notifier,
                user_id,
                options,
                model: ReadModel::new(Vec::new()),
                feed: Mutex::new(FeedHandle::default()),
            }),
        };
        if live_feed {
            synchronizer.attach_feed().await;
        }
        synchronizer.fetch_logs().await;
        synchronizer
    }

    pub fn user_id(&self) -> UserId {
        self.inner.user_id
    }

    pub fn logs(&self) -> Vec<ActivityLogEntry> {
        self.inner.model.value()
    }

    pub fn loading(&self) -> bool {
        self.inner.model.loading()
    }

    pub fn ready(&self) -> bool {
        self.inner.model.ready()
    }

    pub fn is_live(&self) -> bool {
        self.inner.feed().subscription.is_some()
    }

    pub fn watch(&self) -> watch::Receiver<Snapshot<Vec<ActivityLogEntry>>> {
        self.inner.model.watch()
    }

    /// Replaces the list with the newest `log_limit` entries.
    ///
    /// On failure the previous list stays, the user is notified and `false`
    /// is returned.
    pub async fn fetch_logs(&self) -> bool {
        let inner = &self.inner;
        let ticket = inner.model.begin_fetch();
        match inner.load_logs().await {
            Ok(logs) => {
                let count = logs.len();
                let applied = inner.model.finish_fetch(ticket, Some(logs));
                tracing::debug!(
                    user_id = %inner.user_id,
                    seq = ticket.seq(),
                    count,
                    applied,
                    "activity logs fetched"
                );
                true
            }
            Err(error) => {
                inner.model.finish_fetch(ticket, None);
                tracing::error!(user_id = %inner.user_id, %error, "failed to fetch activity logs");
                inner
                    .notifier
                    .notify(Notice::error("Error fetching activity", error.to_string()));
                false
            }
        }
    }

    /// Records an entry for the current user and prepends the stored row.
    ///
    /// Best effort: failures are logged only, never surfaced to the user.
    pub async fn add_activity_log(
        &self,
        activity_type: impl Into<String>,
        description: impl Into<String>,
    ) -> bool {
        let inner = &self.inner;
        let new_log = NewActivityLog {
            user_id: inner.user_id,
            activity_type: activity_type.into(),
            description: description.into(),
        };
        match inner.insert_log(&new_log).await {
            Ok(entry) => {
                tracing::debug!(
                    user_id = %inner.user_id,
                    entry_id = %entry.id,
                    activity_type = %entry.activity_type,
                    "activity log added"
                );
                inner.prepend(entry);
                true
            }
            Err(error) => {
                tracing::error!(
                    user_id = %inner.user_id,
                    activity_type = %new_log.activity_type,
                    %error,
                    "failed to add activity log"
                );
                false
            }
        }
    }

    /// Releases the live subscription and clears the list for good. Safe to
    /// call twice.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.model.close(Vec::new());
        let handle = std::mem::take(&mut *inner.feed());
        if let Some(pump) = handle.pump {
            pump.abort();
        }
        if let Some(id) = handle.subscription {
            if let Err(error) = inner.backend.unsubscribe(id).await {
                tracing::warn!(
                    user_id = %inner.user_id,
                    %error,
                    "failed to unsubscribe from activity feed"
                );
            }
        }
        tracing::debug!(user_id = %inner.user_id, "activity synchronizer stopped");
    }

    async fn attach_feed(&self) {
        let inner = &self.inner;
        let subscription = Subscription {
            table: ACTIVITY_LOGS_TABLE.to_string(),
            filters: vec![Filter::eq("user_id", inner.user_id.to_string())],
            events: EventMask::INSERT,
        };
        match inner.backend.subscribe(subscription).await {
            Ok(feed) => {
                let id = feed.id;
                let pump = tokio::spawn(pump_feed(Arc::downgrade(inner), feed));
                let mut handle = inner.feed();
                handle.subscription = Some(id);
                handle.pump = Some(pump);
            }
            Err(error) => {
                tracing::warn!(
                    user_id = %inner.user_id,
                    backend = inner.backend.name(),
                    %error,
                    "activity feed unavailable, continuing without live updates"
                );
            }
        }
    }
}

impl Inner {
    fn feed(&self) -> MutexGuard<'_, FeedHandle> {
        self.feed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn load_logs(&self) -> Result<Vec<ActivityLogEntry>, SyncError> {
        let query = SelectQuery::from(ACTIVITY_LOGS_TABLE)
            .filter(Filter::eq("user_id", self.user_id.to_string()))
            .order_desc("created_at")
            .limit(self.options.log_limit);
        let rows = self.backend.select(&query).await?;
        let mut logs = rows
            .into_iter()
            .map(serde_json::from_value::<ActivityLogEntry>)
            .collect::<Result<Vec<_>, _>>()?;
        logs.retain(|entry| entry.user_id == self.user_id);
        Ok(logs)
    }

    async fn insert_log(&self, new_log: &NewActivityLog) -> Result<ActivityLogEntry, SyncError> {
        let row = serde_json::to_value(new_log)?;
        let stored = self.backend.insert(ACTIVITY_LOGS_TABLE, row).await?;
        Ok(serde_json::from_value(stored)?)
    }

    fn prepend(&self, entry: ActivityLogEntry) {
        let dedupe = self.options.dedupe_live_inserts;
        let entry_id = entry.id;
        let open = self.model.modify(|logs| {
            if dedupe && logs.iter().any(|existing| existing.id == entry.id) {
                return;
            }
            logs.insert(0, entry);
        });
        if !open {
            tracing::debug!(user_id = %self.user_id, %entry_id, "dropping entry after shutdown");
        }
    }

    fn apply_remote(&self, event: ChangeEvent) {
        if event.kind != ChangeKind::Insert {
            return;
        }
        match decode_entry(event.new) {
            Ok(entry) if entry.user_id == self.user_id => self.prepend(entry),
            Ok(entry) => {
                tracing::warn!(
                    user_id = %self.user_id,
                    foreign_user_id = %entry.user_id,
                    "ignoring feed insert for another user"
                );
            }
            Err(error) => {
                tracing::warn!(user_id = %self.user_id, %error, "ignoring malformed feed insert");
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let handle = self.feed.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(pump) = handle.pump.take() {
            pump.abort();
        }
        let Some(id) = handle.subscription.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let backend = self.backend.clone();
                let user_id = self.user_id;
                runtime.spawn(async move {
                    if let Err(error) = backend.unsubscribe(id).await {
                        tracing::warn!(%user_id, %error, "failed to release dropped activity feed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    user_id = %self.user_id,
                    "activity synchronizer dropped outside a runtime, subscription not released"
                );
            }
        }
    }
}

fn decode_entry(row: Value) -> Result<ActivityLogEntry, serde_json::Error> {
    serde_json::from_value(row)
}

async fn pump_feed(inner: Weak<Inner>, mut feed: LiveFeed) {
    while let Some(event) = feed.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.apply_remote(event);
    }
}
