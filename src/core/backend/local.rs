use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    Backend, BackendError, ChangeEvent, ChangeKind, Filter, LiveFeed, SelectQuery, Subscription,
    SubscriptionId, ACTIVITY_LOGS_TABLE, PROFILES_TABLE,
};

struct TableSchema {
    name: &'static str,
    columns: &'static [&'static str],
}

const TABLES: &[TableSchema] = &[
    TableSchema {
        name: ACTIVITY_LOGS_TABLE,
        columns: &["id", "user_id", "activity_type", "description", "created_at"],
    },
    TableSchema {
        name: PROFILES_TABLE,
        columns: &[
            "id",
            "email",
            "first_name",
            "last_name",
            "avatar_url",
            "created_at",
            "updated_at",
        ],
    },
];

impl TableSchema {
    fn lookup(table: &str) -> Result<&'static TableSchema, BackendError> {
        TABLES
            .iter()
            .find(|schema| schema.name == table)
            .ok_or_else(|| BackendError::UnknownTable(table.to_string()))
    }

    fn column(&self, column: &str) -> Result<&'static str, BackendError> {
        self.columns
            .iter()
            .copied()
            .find(|candidate| *candidate == column)
            .ok_or_else(|| BackendError::UnknownColumn {
                table: self.name.to_string(),
                column: column.to_string(),
            })
    }

    fn has(&self, column: &str) -> bool {
        self.columns.contains(&column)
    }

    fn column_list(&self) -> String {
        self.columns.join(", ")
    }
}

struct Subscriber {
    subscription: Subscription,
    sender: mpsc::UnboundedSender<ChangeEvent>,
}

#[derive(Debug, Clone)]
struct StoredBlob {
    bytes: Vec<u8>,
    content_type: Option<String>,
}

/// SQLite-backed stand-in for the hosted backend.
///
/// Rows live in a sqlx pool, change events are fanned out in-process and
/// blobs are kept in memory. Clones share all state.
#[derive(Clone)]
pub struct LocalBackend {
    pool: SqlitePool,
    subscribers: Arc<Mutex<HashMap<SubscriptionId, Subscriber>>>,
    next_subscription: Arc<AtomicU64>,
    blobs: Arc<Mutex<HashMap<String, StoredBlob>>>,
    last_timestamp: Arc<Mutex<DateTime<Utc>>>,
}

impl LocalBackend {
    pub async fn connect(database_url: &str) -> Result<Self, BackendError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::debug!(database_url, "local backend ready");
        Ok(Self {
            pool,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_subscription: Arc::new(AtomicU64::new(1)),
            blobs: Arc::new(Mutex::new(HashMap::new())),
            last_timestamp: Arc::new(Mutex::new(DateTime::<Utc>::MIN_UTC)),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Publishes a change produced outside this process to matching subscribers.
    pub fn emit(&self, event: ChangeEvent) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|_, subscriber| {
            if subscriber.subscription.matches(&event) {
                subscriber.sender.send(event.clone()).is_ok()
            } else {
                !subscriber.sender.is_closed()
            }
        });
    }

    /// Registered subscriptions, including ones whose receiver is gone but
    /// that were never unsubscribed.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    pub fn blob(&self, bucket: &str, path: &str) -> Option<Vec<u8>> {
        lock(&self.blobs)
            .get(&blob_key(bucket, path))
            .map(|blob| blob.bytes.clone())
    }

    pub fn blob_content_type(&self, bucket: &str, path: &str) -> Option<String> {
        lock(&self.blobs)
            .get(&blob_key(bucket, path))
            .and_then(|blob| blob.content_type.clone())
    }

    /// Strictly increasing so `created_at DESC` never ties.
    fn next_timestamp(&self) -> String {
        let mut last = lock(&self.last_timestamp);
        let mut now = Utc::now();
        if now <= *last {
            now = *last + TimeDelta::microseconds(1);
        }
        *last = now;
        now.to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn select(&self, select: &SelectQuery) -> Result<Vec<Value>, BackendError> {
        let schema = TableSchema::lookup(&select.table)?;
        let mut query = QueryBuilder::<Sqlite>::new("SELECT ");
        query.push(schema.column_list());
        query.push(" FROM ");
        query.push(schema.name);
        push_filters(&mut query, schema, &select.filters)?;
        if let Some(order) = &select.order {
            let column = schema.column(&order.column)?;
            query.push(" ORDER BY ");
            query.push(column);
            query.push(if order.descending { " DESC" } else { " ASC" });
        }
        if let Some(limit) = select.limit {
            query.push(" LIMIT ");
            query.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(|row| row_to_json(schema, row)).collect()
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value, BackendError> {
        let schema = TableSchema::lookup(table)?;
        let mut object = into_object(row)?;
        object
            .entry("id")
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
        let now = self.next_timestamp();
        for column in ["created_at", "updated_at"] {
            if schema.has(column) {
                object
                    .entry(column)
                    .or_insert_with(|| Value::String(now.clone()));
            }
        }

        let mut columns = Vec::with_capacity(object.len());
        let mut values = Vec::with_capacity(object.len());
        for (key, value) in &object {
            columns.push(schema.column(key)?);
            values.push(value_to_text(value));
        }

        let mut query = QueryBuilder::<Sqlite>::new("INSERT INTO ");
        query.push(schema.name);
        query.push(" (");
        query.push(columns.join(", "));
        query.push(") VALUES (");
        let mut separated = query.separated(", ");
        for value in values {
            separated.push_bind(value);
        }
        separated.push_unseparated(") RETURNING ");
        query.push(schema.column_list());

        let stored = query.build().fetch_one(&self.pool).await?;
        let stored = row_to_json(schema, &stored)?;
        tracing::debug!(table = schema.name, "row inserted");
        self.emit(ChangeEvent {
            kind: ChangeKind::Insert,
            table: schema.name.to_string(),
            new: stored.clone(),
        });
        Ok(stored)
    }

    async fn update(
        &self,
        table: &str,
        patch: Value,
        filters: &[Filter],
    ) -> Result<Vec<Value>, BackendError> {
        let schema = TableSchema::lookup(table)?;
        if filters.is_empty() {
            return Err(BackendError::Unsupported("unfiltered update"));
        }
        let patch = into_object(patch)?;
        if patch.is_empty() {
            let mut select = SelectQuery::from(schema.name);
            select.filters = filters.to_vec();
            return self.select(&select).await;
        }

        let mut query = QueryBuilder::<Sqlite>::new("UPDATE ");
        query.push(schema.name);
        query.push(" SET ");
        {
            let mut separated = query.separated(", ");
            for (key, value) in &patch {
                let column = schema.column(key)?;
                separated.push(format!("{column} = "));
                separated.push_bind_unseparated(value_to_text(value));
            }
        }
        push_filters(&mut query, schema, filters)?;
        query.push(" RETURNING ");
        query.push(schema.column_list());

        let rows = query.build().fetch_all(&self.pool).await?;
        let updated = rows
            .iter()
            .map(|row| row_to_json(schema, row))
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(table = schema.name, rows = updated.len(), "rows updated");
        for row in &updated {
            self.emit(ChangeEvent {
                kind: ChangeKind::Update,
                table: schema.name.to_string(),
                new: row.clone(),
            });
        }
        Ok(updated)
    }

    async fn subscribe(&self, subscription: Subscription) -> Result<LiveFeed, BackendError> {
        TableSchema::lookup(&subscription.table)?;
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        let (sender, events) = mpsc::unbounded_channel();
        lock(&self.subscribers).insert(
            id,
            Subscriber {
                subscription,
                sender,
            },
        );
        Ok(LiveFeed { id, events })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BackendError> {
        lock(&self.subscribers).remove(&id);
        Ok(())
    }

    async fn upload_blob(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<(), BackendError> {
        let key = blob_key(bucket, path);
        let mut blobs = lock(&self.blobs);
        if blobs.contains_key(&key) {
            return Err(BackendError::AlreadyExists(key));
        }
        blobs.insert(
            key,
            StoredBlob {
                bytes,
                content_type: content_type.map(ToString::to_string),
            },
        );
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("local://{}", blob_key(bucket, path))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn blob_key(bucket: &str, path: &str) -> String {
    format!("{bucket}/{}", path.trim_start_matches('/'))
}

fn into_object(value: Value) -> Result<Map<String, Value>, BackendError> {
    match value {
        Value::Object(object) => Ok(object),
        _ => Err(BackendError::NotAnObject),
    }
}

fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

fn push_filters(
    query: &mut QueryBuilder<'_, Sqlite>,
    schema: &TableSchema,
    filters: &[Filter],
) -> Result<(), BackendError> {
    for (index, filter) in filters.iter().enumerate() {
        let column = schema.column(&filter.column)?;
        query.push(if index == 0 { " WHERE " } else { " AND " });
        query.push(column);
        match value_to_text(&filter.value) {
            Some(text) => {
                query.push(" = ");
                query.push_bind(text);
            }
            None => {
                query.push(" IS NULL");
            }
        }
    }
    Ok(())
}

fn row_to_json(schema: &TableSchema, row: &SqliteRow) -> Result<Value, BackendError> {
    let mut object = Map::with_capacity(schema.columns.len());
    for column in schema.columns {
        let value: Option<String> = row.try_get(*column)?;
        object.insert(
            (*column).to_string(),
            value.map(Value::String).unwrap_or(Value::Null),
        );
    }
    Ok(Value::Object(object))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backend::EventMask;
    use serde_json::json;

    async fn backend() -> LocalBackend {
        LocalBackend::connect("sqlite::memory:")
            .await
            .expect("connect must succeed")
    }

    fn log_row(user_id: &str, description: &str) -> Value {
        json!({
            "user_id": user_id,
            "activity_type": "test",
            "description": description,
        })
    }

    #[tokio::test]
    async fn migration_creates_required_tables() {
        let backend = backend().await;
        let rows = sqlx::query(
            r#"
            SELECT name
            FROM sqlite_master
            WHERE type = 'table'
              AND name IN ('activity_logs', 'profiles')
            ORDER BY name
            "#,
        )
        .fetch_all(&backend.pool)
        .await
        .expect("query must succeed");

        let table_names: Vec<String> = rows
            .into_iter()
            .map(|row| row.get::<String, _>("name"))
            .collect();
        assert_eq!(
            table_names,
            vec!["activity_logs".to_string(), "profiles".to_string()]
        );
    }

    #[tokio::test]
    async fn insert_fills_identifier_and_timestamps() {
        let backend = backend().await;
        let stored = backend
            .insert(ACTIVITY_LOGS_TABLE, log_row("u1", "first"))
            .await
            .expect("insert must succeed");

        assert!(Uuid::parse_str(stored["id"].as_str().expect("id is text")).is_ok());
        assert_eq!(stored["description"], "first");
        let created_at = stored["created_at"].as_str().expect("created_at is text");
        assert!(DateTime::parse_from_rfc3339(created_at).is_ok());
    }

    #[tokio::test]
    async fn select_filters_orders_and_limits() {
        let backend = backend().await;
        for index in 0..5 {
            backend
                .insert(ACTIVITY_LOGS_TABLE, log_row("u1", &format!("entry {index}")))
                .await
                .expect("insert must succeed");
        }
        backend
            .insert(ACTIVITY_LOGS_TABLE, log_row("u2", "someone else"))
            .await
            .expect("insert must succeed");

        let rows = backend
            .select(
                &SelectQuery::from(ACTIVITY_LOGS_TABLE)
                    .filter(Filter::eq("user_id", "u1"))
                    .order_desc("created_at")
                    .limit(3),
            )
            .await
            .expect("select must succeed");

        let descriptions: Vec<&str> = rows
            .iter()
            .map(|row| row["description"].as_str().unwrap_or_default())
            .collect();
        assert_eq!(descriptions, vec!["entry 4", "entry 3", "entry 2"]);
    }

    #[tokio::test]
    async fn update_returns_rows_and_publishes_changes() {
        let backend = backend().await;
        backend
            .insert(
                PROFILES_TABLE,
                json!({ "id": "u1", "email": "ada@example.com" }),
            )
            .await
            .expect("insert must succeed");
        let mut feed = backend
            .subscribe(Subscription {
                table: PROFILES_TABLE.to_string(),
                filters: vec![Filter::eq("id", "u1")],
                events: EventMask::ALL,
            })
            .await
            .expect("subscribe must succeed");

        let updated = backend
            .update(
                PROFILES_TABLE,
                json!({ "first_name": "Ada" }),
                &[Filter::eq("id", "u1")],
            )
            .await
            .expect("update must succeed");
        let event = feed.recv().await.expect("update event expected");

        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0]["first_name"], "Ada");
        assert_eq!(updated[0]["email"], "ada@example.com");
        assert_eq!(event.kind, ChangeKind::Update);
        assert_eq!(event.new, updated[0]);
    }

    #[tokio::test]
    async fn unknown_columns_and_unfiltered_updates_are_rejected() {
        let backend = backend().await;
        let bad_insert = backend
            .insert(ACTIVITY_LOGS_TABLE, json!({ "user_id": "u1", "oops": 1 }))
            .await;
        let bad_update = backend
            .update(PROFILES_TABLE, json!({ "first_name": "Ada" }), &[])
            .await;
        let bad_table = backend.select(&SelectQuery::from("accounts")).await;

        assert!(matches!(bad_insert, Err(BackendError::UnknownColumn { .. })));
        assert!(matches!(bad_update, Err(BackendError::Unsupported(_))));
        assert!(matches!(bad_table, Err(BackendError::UnknownTable(_))));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let backend = backend().await;
        let feed = backend
            .subscribe(Subscription {
                table: ACTIVITY_LOGS_TABLE.to_string(),
                filters: vec![Filter::eq("user_id", "u1")],
                events: EventMask::INSERT,
            })
            .await
            .expect("subscribe must succeed");
        assert_eq!(backend.subscriber_count(), 1);

        backend
            .unsubscribe(feed.id)
            .await
            .expect("unsubscribe must succeed");
        let mut events = feed.events;
        backend
            .insert(ACTIVITY_LOGS_TABLE, log_row("u1", "after"))
            .await
            .expect("insert must succeed");

        assert_eq!(backend.subscriber_count(), 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn blobs_are_write_once() {
        let backend = backend().await;
        backend
            .upload_blob("avatars", "u1-abc.png", vec![1, 2, 3], Some("image/png"))
            .await
            .expect("first upload must succeed");
        let second = backend
            .upload_blob("avatars", "u1-abc.png", vec![4], None)
            .await;

        assert!(matches!(second, Err(BackendError::AlreadyExists(_))));
        assert_eq!(backend.blob("avatars", "u1-abc.png"), Some(vec![1, 2, 3]));
        assert_eq!(
            backend.blob_content_type("avatars", "u1-abc.png").as_deref(),
            Some("image/png")
        );
        assert_eq!(
            backend.public_url("avatars", "u1-abc.png"),
            "local://avatars/u1-abc.png"
        );
    }
}
