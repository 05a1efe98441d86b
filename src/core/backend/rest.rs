use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;

use super::{
    Backend, BackendError, Filter, LiveFeed, SelectQuery, Subscription, SubscriptionId,
};

const PREFER: &str = "Prefer";
const RETURN_REPRESENTATION: &str = "return=representation";

/// Client for a PostgREST row API plus the storage object API of the
/// hosted backend.
#[derive(Debug, Clone)]
pub struct RestBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    access_token: Option<String>,
}

impl RestBackend {
    pub fn new(
        base_url: &str,
        api_key: &str,
        access_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            access_token,
        })
    }

    fn rows_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
        request
            .header("apikey", &self.api_key)
            .header(AUTHORIZATION, format!("Bearer {bearer}"))
    }
}

#[async_trait]
impl Backend for RestBackend {
    fn name(&self) -> &'static str {
        "rest"
    }

    async fn select(&self, query: &SelectQuery) -> Result<Vec<Value>, BackendError> {
        let mut params = vec![("select".to_string(), "*".to_string())];
        params.extend(filter_params(&query.filters));
        if let Some(order) = &query.order {
            let direction = if order.descending { "desc" } else { "asc" };
            params.push(("order".to_string(), format!("{}.{direction}", order.column)));
        }
        if let Some(limit) = query.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }

        let response = self
            .authorized(self.client.get(self.rows_url(&query.table)))
            .query(&params)
            .send()
            .await?;
        let response = check_status(response)?;
        Ok(response.json::<Vec<Value>>().await?)
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value, BackendError> {
        let response = self
            .authorized(self.client.post(self.rows_url(table)))
            .header(PREFER, RETURN_REPRESENTATION)
            .json(&row)
            .send()
            .await?;
        let response = check_status(response)?;
        response
            .json::<Vec<Value>>()
            .await?
            .into_iter()
            .next()
            .ok_or(BackendError::EmptyResponse)
    }

    async fn update(
        &self,
        table: &str,
        patch: Value,
        filters: &[Filter],
    ) -> Result<Vec<Value>, BackendError> {
        if filters.is_empty() {
            return Err(BackendError::Unsupported("unfiltered update"));
        }
        let response = self
            .authorized(self.client.patch(self.rows_url(table)))
            .header(PREFER, RETURN_REPRESENTATION)
            .query(&filter_params(filters))
            .json(&patch)
            .send()
            .await?;
        let response = check_status(response)?;
        Ok(response.json::<Vec<Value>>().await?)
    }

    async fn subscribe(&self, _subscription: Subscription) -> Result<LiveFeed, BackendError> {
        Err(BackendError::Unsupported("live subscriptions"))
    }

    async fn unsubscribe(&self, _id: SubscriptionId) -> Result<(), BackendError> {
        Ok(())
    }

    async fn upload_blob(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<(), BackendError> {
        let url = format!(
            "{}/storage/v1/object/{bucket}/{}",
            self.base_url,
            path.trim_start_matches('/')
        );
        let response = self
            .authorized(self.client.post(url))
            .header(CONTENT_TYPE, content_type.unwrap_or("application/octet-stream"))
            .header("x-upsert", "false")
            .body(bytes)
            .send()
            .await?;
        if response.status().as_u16() == 409 {
            return Err(BackendError::AlreadyExists(format!("{bucket}/{path}")));
        }
        check_status(response)?;
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{bucket}/{}",
            self.base_url,
            path.trim_start_matches('/')
        )
    }
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if !status.is_success() {
        return Err(BackendError::HttpStatus(status.as_u16()));
    }
    Ok(response)
}

fn filter_params(filters: &[Filter]) -> Vec<(String, String)> {
    filters
        .iter()
        .map(|filter| {
            let value = match &filter.value {
                Value::Null => "is.null".to_string(),
                Value::String(text) => format!("eq.{text}"),
                other => format!("eq.{other}"),
            };
            (filter.column.clone(), value)
        })
        .collect()
}
