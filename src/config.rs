use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::core::backend::local::LocalBackend;
use crate::core::backend::rest::RestBackend;
use crate::core::backend::{Backend, BackendError};
use crate::core::{SyncOptions, DEFAULT_AVATAR_BUCKET, DEFAULT_LOG_LIMIT};

const DEFAULT_DATABASE_URL: &str = "sqlite::memory:";
const DEFAULT_TIMEOUT_SECS: u64 = 20;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: `{value}`")]
    Invalid { key: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub backend_url: Option<String>,
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub database_url: String,
    pub timeout_secs: u64,
    pub options: SyncOptions,
}

impl SyncConfig {
    /// Reads `FINSYNC_*` variables, after loading `.env.local` if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::from_filename(".env.local");
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let text = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let config = Self {
            backend_url: text("FINSYNC_BACKEND_URL"),
            api_key: text("FINSYNC_API_KEY"),
            access_token: text("FINSYNC_ACCESS_TOKEN"),
            database_url: text("FINSYNC_DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            timeout_secs: parse_or(
                "FINSYNC_TIMEOUT_SECS",
                text("FINSYNC_TIMEOUT_SECS"),
                DEFAULT_TIMEOUT_SECS,
            )?,
            options: SyncOptions {
                log_limit: parse_or(
                    "FINSYNC_LOG_LIMIT",
                    text("FINSYNC_LOG_LIMIT"),
                    DEFAULT_LOG_LIMIT,
                )?,
                live_feed: true,
                dedupe_live_inserts: parse_flag(
                    "FINSYNC_DEDUPE_LIVE_INSERTS",
                    text("FINSYNC_DEDUPE_LIVE_INSERTS"),
                )?,
                avatar_bucket: text("FINSYNC_AVATAR_BUCKET")
                    .unwrap_or_else(|| DEFAULT_AVATAR_BUCKET.to_string()),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.options.log_limit == 0 {
            return Err(ConfigError::Zero("FINSYNC_LOG_LIMIT"));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Zero("FINSYNC_TIMEOUT_SECS"));
        }
        Ok(())
    }

    /// Offline unless both the backend URL and API key are set.
    pub fn is_offline(&self) -> bool {
        self.backend_url.is_none() || self.api_key.is_none()
    }

    pub async fn connect(&self) -> Result<Arc<dyn Backend>, ConfigError> {
        match (&self.backend_url, &self.api_key) {
            (Some(base_url), Some(api_key)) => {
                let backend = RestBackend::new(
                    base_url,
                    api_key,
                    self.access_token.clone(),
                    Duration::from_secs(self.timeout_secs),
                )?;
                tracing::info!(%base_url, "using hosted backend");
                Ok(Arc::new(backend))
            }
            _ => {
                let backend = LocalBackend::connect(&self.database_url).await?;
                tracing::info!(database_url = %self.database_url, "using local backend");
                Ok(Arc::new(backend))
            }
        }
    }
}

fn parse_or<T: FromStr>(
    key: &'static str,
    raw: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

fn parse_flag(key: &'static str, raw: Option<String>) -> Result<bool, ConfigError> {
    let Some(value) = raw else {
        return Ok(false);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid { key, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<SyncConfig, ConfigError> {
        let values: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        SyncConfig::from_lookup(|key| values.get(key).cloned())
    }

    #[test]
    fn defaults_are_offline() {
        let config = config_from(&[]).expect("defaults should be valid");

        assert!(config.is_offline());
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.timeout_secs, 20);
        assert_eq!(config.options, SyncOptions::default());
    }

    #[test]
    fn reads_overrides() {
        let config = config_from(&[
            ("FINSYNC_BACKEND_URL", "https://example.supabase.co/"),
            ("FINSYNC_API_KEY", "anon"),
            ("FINSYNC_LOG_LIMIT", "25"),
            ("FINSYNC_DEDUPE_LIVE_INSERTS", "TRUE"),
            ("FINSYNC_AVATAR_BUCKET", " pictures "),
        ])
        .expect("config should be valid");

        assert!(!config.is_offline());
        assert_eq!(config.options.log_limit, 25);
        assert!(config.options.dedupe_live_inserts);
        assert_eq!(config.options.avatar_bucket, "pictures");
    }

    #[test]
    fn rejects_bad_numbers_and_flags() {
        assert!(matches!(
            config_from(&[("FINSYNC_LOG_LIMIT", "many")]),
            Err(ConfigError::Invalid { key: "FINSYNC_LOG_LIMIT", .. })
        ));
        assert!(matches!(
            config_from(&[("FINSYNC_TIMEOUT_SECS", "0")]),
            Err(ConfigError::Zero("FINSYNC_TIMEOUT_SECS"))
        ));
        assert!(matches!(
            config_from(&[("FINSYNC_DEDUPE_LIVE_INSERTS", "maybe")]),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[tokio::test]
    async fn offline_config_connects_to_local_backend() {
        let config = config_from(&[]).expect("defaults should be valid");
        let backend = config.connect().await.expect("local backend should open");
        assert_eq!(backend.name(), "local");
    }
}
