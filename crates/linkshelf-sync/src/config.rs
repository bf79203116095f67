//! Store connection settings loaded from the environment.

use std::time::Duration;

use thiserror::Error;

use crate::feed::{DEFAULT_SCHEMA, DEFAULT_TABLE, DEFAULT_TOPIC_NAME, FeedTopic};

pub const ENV_STORE_URL: &str = "LINKSHELF_STORE_URL";
pub const ENV_API_KEY: &str = "LINKSHELF_API_KEY";
pub const ENV_ACCESS_TOKEN: &str = "LINKSHELF_ACCESS_TOKEN";
pub const ENV_SCHEMA: &str = "LINKSHELF_SCHEMA";
pub const ENV_TABLE: &str = "LINKSHELF_TABLE";
pub const ENV_FEED_TOPIC: &str = "LINKSHELF_FEED_TOPIC";
pub const ENV_HEARTBEAT_MS: &str = "LINKSHELF_HEARTBEAT_MS";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "LINKSHELF_CONNECT_TIMEOUT_MS";
pub const ENV_FEED_BUFFER: &str = "LINKSHELF_FEED_BUFFER";

const DEFAULT_HEARTBEAT_MS: u64 = 30_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_FEED_BUFFER: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required env: {0}")]
    Missing(&'static str),
    #[error("invalid LINKSHELF_STORE_URL: {0}")]
    InvalidStoreUrl(String),
    #[error("invalid LINKSHELF_HEARTBEAT_MS: {0}")]
    InvalidHeartbeat(String),
    #[error("invalid LINKSHELF_CONNECT_TIMEOUT_MS: {0}")]
    InvalidConnectTimeout(String),
    #[error("invalid LINKSHELF_FEED_BUFFER: {0}")]
    InvalidFeedBuffer(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Store base URL without trailing slash, e.g. `https://abc.store.example`.
    pub store_url: String,
    pub api_key: String,
    /// Bearer token of the signed-in user. Falls back to the API key.
    pub access_token: String,
    pub topic: FeedTopic,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub feed_buffer: usize,
}

impl StoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let store_url = read(ENV_STORE_URL).ok_or(ConfigError::Missing(ENV_STORE_URL))?;
        let store_url = normalize_store_url(&store_url)?;
        let api_key = read(ENV_API_KEY).ok_or(ConfigError::Missing(ENV_API_KEY))?;
        let access_token = read(ENV_ACCESS_TOKEN).unwrap_or_else(|| api_key.clone());

        let topic = FeedTopic {
            name: read(ENV_FEED_TOPIC).unwrap_or_else(|| DEFAULT_TOPIC_NAME.to_string()),
            schema: read(ENV_SCHEMA).unwrap_or_else(|| DEFAULT_SCHEMA.to_string()),
            table: read(ENV_TABLE).unwrap_or_else(|| DEFAULT_TABLE.to_string()),
        };

        let heartbeat_ms = read(ENV_HEARTBEAT_MS)
            .map(|value| value.parse::<u64>())
            .transpose()
            .map_err(|error| ConfigError::InvalidHeartbeat(error.to_string()))?
            .unwrap_or(DEFAULT_HEARTBEAT_MS);
        if heartbeat_ms == 0 {
            return Err(ConfigError::InvalidHeartbeat(
                "must be greater than zero".to_string(),
            ));
        }
        let connect_timeout_ms = read(ENV_CONNECT_TIMEOUT_MS)
            .map(|value| value.parse::<u64>())
            .transpose()
            .map_err(|error| ConfigError::InvalidConnectTimeout(error.to_string()))?
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS);
        let feed_buffer = read(ENV_FEED_BUFFER)
            .map(|value| value.parse::<usize>())
            .transpose()
            .map_err(|error| ConfigError::InvalidFeedBuffer(error.to_string()))?
            .unwrap_or(DEFAULT_FEED_BUFFER);
        if feed_buffer == 0 {
            return Err(ConfigError::InvalidFeedBuffer(
                "must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            store_url,
            api_key,
            access_token,
            topic,
            heartbeat_interval: Duration::from_millis(heartbeat_ms),
            connect_timeout: Duration::from_millis(connect_timeout_ms),
            feed_buffer,
        })
    }

    /// Realtime websocket endpoint derived from the store URL.
    pub fn realtime_url(&self) -> Result<url::Url, ConfigError> {
        let mut url = url::Url::parse(self.store_url.as_str())
            .map_err(|error| ConfigError::InvalidStoreUrl(error.to_string()))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(ConfigError::InvalidStoreUrl(format!(
                    "unsupported scheme: {other}"
                )));
            }
        };
        url.set_scheme(scheme).map_err(|()| {
            ConfigError::InvalidStoreUrl(format!("cannot switch to {scheme}"))
        })?;
        let path = format!("{}/realtime/v1/websocket", url.path().trim_end_matches('/'));
        url.set_path(path.as_str());
        url.set_fragment(None);
        url.query_pairs_mut()
            .clear()
            .append_pair("apikey", self.api_key.as_str())
            .append_pair("vsn", "1.0.0");
        Ok(url)
    }
}

fn normalize_store_url(value: &str) -> Result<String, ConfigError> {
    let parsed =
        url::Url::parse(value).map_err(|error| ConfigError::InvalidStoreUrl(error.to_string()))?;
    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(ConfigError::InvalidStoreUrl(format!(
            "unsupported scheme: {scheme}"
        )));
    }
    Ok(value.trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::{ConfigError, ENV_API_KEY, ENV_FEED_BUFFER, ENV_STORE_URL, ENV_TABLE, StoreConfig};

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect::<HashMap<_, _>>();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_fill_optional_values() {
        let config = StoreConfig::from_lookup(lookup(&[
            (ENV_STORE_URL, "https://abc.store.example/"),
            (ENV_API_KEY, "anon-key"),
        ]))
        .expect("config should load");
        assert_eq!(config.store_url, "https://abc.store.example");
        assert_eq!(config.access_token, "anon-key");
        assert_eq!(config.topic.table, "bookmarks");
        assert_eq!(config.topic.name, "realtime bookmarks");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.feed_buffer, 1000);
    }

    #[test]
    fn realtime_url_switches_to_websocket_scheme() {
        let config = StoreConfig::from_lookup(lookup(&[
            (ENV_STORE_URL, "https://abc.store.example"),
            (ENV_API_KEY, "anon-key"),
        ]))
        .expect("config should load");
        assert_eq!(
            config.realtime_url().expect("realtime url").as_str(),
            "wss://abc.store.example/realtime/v1/websocket?apikey=anon-key&vsn=1.0.0"
        );
    }

    #[test]
    fn realtime_url_escapes_the_api_key() {
        let config = StoreConfig::from_lookup(lookup(&[
            (ENV_STORE_URL, "https://abc.store.example/base/"),
            (ENV_API_KEY, "key&vsn=2 x#y"),
        ]))
        .expect("config should load");
        let url = config.realtime_url().expect("realtime url");
        assert_eq!(url.path(), "/base/realtime/v1/websocket");
        let pairs = url.query_pairs().into_owned().collect::<Vec<_>>();
        assert_eq!(
            pairs,
            vec![
                ("apikey".to_string(), "key&vsn=2 x#y".to_string()),
                ("vsn".to_string(), "1.0.0".to_string()),
            ]
        );
        assert!(!url.as_str().contains("key&vsn=2"));
    }

    #[test]
    fn missing_and_invalid_values_are_reported() {
        assert_eq!(
            StoreConfig::from_lookup(lookup(&[(ENV_API_KEY, "k")])),
            Err(ConfigError::Missing(ENV_STORE_URL))
        );
        assert!(matches!(
            StoreConfig::from_lookup(lookup(&[
                (ENV_STORE_URL, "ftp://files.example"),
                (ENV_API_KEY, "k"),
            ])),
            Err(ConfigError::InvalidStoreUrl(_))
        ));
        assert!(matches!(
            StoreConfig::from_lookup(lookup(&[
                (ENV_STORE_URL, "http://localhost:54321"),
                (ENV_API_KEY, "k"),
                (ENV_FEED_BUFFER, "0"),
            ])),
            Err(ConfigError::InvalidFeedBuffer(_))
        ));
    }

    #[test]
    fn table_override_is_applied() {
        let config = StoreConfig::from_lookup(lookup(&[
            (ENV_STORE_URL, "http://localhost:54321"),
            (ENV_API_KEY, "k"),
            (ENV_TABLE, "links"),
        ]))
        .expect("config should load");
        assert_eq!(config.topic.table, "links");
        assert!(
            config
                .realtime_url()
                .expect("realtime url")
                .as_str()
                .starts_with("ws://localhost:54321/")
        );
    }
}
