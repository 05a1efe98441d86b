use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Notify};

use crate::core::activity::ActivityLogEntry;
use crate::core::backend::local::LocalBackend;
use crate::core::backend::{
    Backend, BackendError, Filter, LiveFeed, SelectQuery, Subscription, SubscriptionId,
    ACTIVITY_LOGS_TABLE, PROFILES_TABLE,
};
use crate::core::notify::{Notice, Notifier};
use crate::core::read_model::Snapshot;
use crate::core::user::UserId;

pub struct Harness {
    pub backend: LocalBackend,
    pub notices: mpsc::UnboundedReceiver<Notice>,
    pub user_id: UserId,
    sender: mpsc::UnboundedSender<Notice>,
}

impl Harness {
    pub fn backend(&self) -> Arc<dyn Backend> {
        Arc::new(self.backend.clone())
    }

    pub fn notifier(&self) -> Arc<dyn Notifier> {
        Arc::new(self.sender.clone())
    }

    pub async fn insert_log(&self, user_id: UserId, description: &str) -> Value {
        self.backend
            .insert(
                ACTIVITY_LOGS_TABLE,
                json!({
                    "user_id": user_id,
                    "activity_type": "test",
                    "description": description,
                }),
            )
            .await
            .expect("log insert must succeed")
    }

    pub async fn seed_profile(&self) -> Value {
        self.backend
            .insert(
                PROFILES_TABLE,
                json!({
                    "id": self.user_id,
                    "email": "ada@example.com",
                    "first_name": "Augusta",
                    "last_name": "King",
                }),
            )
            .await
            .expect("profile insert must succeed")
    }
}

pub async fn harness() -> Harness {
    let backend = LocalBackend::connect("sqlite::memory:")
        .await
        .expect("connect must succeed");
    let (sender, notices) = mpsc::unbounded_channel();
    Harness {
        backend,
        notices,
        user_id: UserId::random(),
        sender,
    }
}

pub fn drain(notices: &mut mpsc::UnboundedReceiver<Notice>) -> Vec<Notice> {
    let mut drained = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        drained.push(notice);
    }
    drained
}

pub async fn wait_for_logs(
    receiver: &mut watch::Receiver<Snapshot<Vec<ActivityLogEntry>>>,
    mut predicate: impl FnMut(&Vec<ActivityLogEntry>) -> bool,
) {
    let waited = tokio::time::timeout(
        Duration::from_secs(2),
        receiver.wait_for(|snapshot| predicate(&snapshot.value)),
    )
    .await
    .expect("condition not reached in time");
    waited.expect("read model dropped");
}

/// Holds an insert after the row is stored (and its change published) until
/// the test releases it.
#[derive(Default)]
pub struct InsertGate {
    pub entered: Notify,
    pub release: Notify,
}

/// Delegates to a [`LocalBackend`] while counting profile reads and
/// optionally rewriting stored avatar URLs, refusing subscriptions or
/// holding inserts.
pub struct InstrumentedBackend {
    inner: LocalBackend,
    profile_selects: AtomicUsize,
    live_feed: bool,
    avatar_suffix: Option<String>,
    insert_gate: Option<Arc<InsertGate>>,
}

impl InstrumentedBackend {
    pub fn new(inner: LocalBackend) -> Self {
        Self {
            inner,
            profile_selects: AtomicUsize::new(0),
            live_feed: true,
            avatar_suffix: None,
            insert_gate: None,
        }
    }

    pub fn holding_inserts(mut self, gate: Arc<InsertGate>) -> Self {
        self.insert_gate = Some(gate);
        self
    }

    pub fn without_feed(mut self) -> Self {
        self.live_feed = false;
        self
    }

    pub fn rewriting_avatars(mut self, suffix: &str) -> Self {
        self.avatar_suffix = Some(suffix.to_string());
        self
    }

    pub fn profile_selects(&self) -> usize {
        self.profile_selects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for InstrumentedBackend {
    fn name(&self) -> &'static str {
        "instrumented"
    }

    async fn select(&self, query: &SelectQuery) -> Result<Vec<Value>, BackendError> {
        if query.table == PROFILES_TABLE {
            self.profile_selects.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.select(query).await
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value, BackendError> {
        let stored = self.inner.insert(table, row).await?;
        if let Some(gate) = &self.insert_gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        Ok(stored)
    }

    async fn update(
        &self,
        table: &str,
        mut patch: Value,
        filters: &[Filter],
    ) -> Result<Vec<Value>, BackendError> {
        if let (Some(suffix), Some(Value::String(url))) =
            (&self.avatar_suffix, patch.get_mut("avatar_url"))
        {
            url.push_str(suffix);
        }
        self.inner.update(table, patch, filters).await
    }

    async fn subscribe(&self, subscription: Subscription) -> Result<LiveFeed, BackendError> {
        if !self.live_feed {
            return Err(BackendError::Unsupported("live subscriptions"));
        }
        self.inner.subscribe(subscription).await
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BackendError> {
        self.inner.unsubscribe(id).await
    }

    async fn upload_blob(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<(), BackendError> {
        self.inner.upload_blob(bucket, path, bytes, content_type).await
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        self.inner.public_url(bucket, path)
    }
}
