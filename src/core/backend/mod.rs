pub mod local;
pub mod rest;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

pub const ACTIVITY_LOGS_TABLE: &str = "activity_logs";
pub const PROFILES_TABLE: &str = "profiles";

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected status code: {0}")]
    HttpStatus(u16),
    #[error("invalid row payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("row payload must be a JSON object")]
    NotAnObject,
    #[error("backend returned no representation for the written row")]
    EmptyResponse,
    #[error("unknown table `{0}`")]
    UnknownTable(String),
    #[error("unknown column `{column}` on table `{table}`")]
    UnknownColumn { table: String, column: String },
    #[error("object `{0}` already exists")]
    AlreadyExists(String),
    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),
}

/// Equality filter on a single column.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub value: Value,
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, row: &Value) -> bool {
        row.get(&self.column).unwrap_or(&Value::Null) == &self.value
    }
}

pub fn matches_all(filters: &[Filter], row: &Value) -> bool {
    filters.iter().all(|filter| filter.matches(row))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    pub table: String,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl SelectQuery {
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_desc(mut self, column: impl Into<String>) -> Self {
        self.order = Some(Order {
            column: column.into(),
            descending: true,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMask {
    pub insert: bool,
    pub update: bool,
    pub delete: bool,
}

impl EventMask {
    pub const INSERT: Self = Self {
        insert: true,
        update: false,
        delete: false,
    };
    pub const ALL: Self = Self {
        insert: true,
        update: true,
        delete: true,
    };

    pub fn accepts(&self, kind: ChangeKind) -> bool {
        match kind {
            ChangeKind::Insert => self.insert,
            ChangeKind::Update => self.update,
            ChangeKind::Delete => self.delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "eventType")]
    pub kind: ChangeKind,
    pub table: String,
    pub new: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub table: String,
    pub filters: Vec<Filter>,
    pub events: EventMask,
}

impl Subscription {
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.table == event.table
            && self.events.accepts(event.kind)
            && matches_all(&self.filters, &event.new)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Receiving half of a live subscription.
///
/// Dropping the feed closes the channel; backends prune closed subscribers
/// the next time they publish, but callers should still `unsubscribe`.
#[derive(Debug)]
pub struct LiveFeed {
    pub id: SubscriptionId,
    pub events: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl LiveFeed {
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }
}

/// Hosted persistence, live-change and blob storage capabilities the
/// synchronizers are written against.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn select(&self, query: &SelectQuery) -> Result<Vec<Value>, BackendError>;

    async fn insert(&self, table: &str, row: Value) -> Result<Value, BackendError>;

    async fn update(
        &self,
        table: &str,
        patch: Value,
        filters: &[Filter],
    ) -> Result<Vec<Value>, BackendError>;

    async fn subscribe(&self, subscription: Subscription) -> Result<LiveFeed, BackendError>;

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BackendError>;

    async fn upload_blob(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<(), BackendError>;

    fn public_url(&self, bucket: &str, path: &str) -> String;
}
