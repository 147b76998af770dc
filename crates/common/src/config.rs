//! Client configuration.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Client configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// REST API configuration.
    #[serde(default)]
    pub api: ApiConfig,
    /// Push channel configuration.
    #[serde(default)]
    pub push: PushConfig,
    /// Entity cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Session persistence configuration.
    #[serde(default)]
    pub session: SessionConfig,
}

/// REST API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the dashboard API.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Total request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Connect timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// Push channel configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    /// WebSocket URL of the push endpoint.
    #[serde(default = "default_push_url")]
    pub url: String,
    /// First reconnect delay in milliseconds.
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    /// Upper bound for the reconnect delay in milliseconds.
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

/// Entity cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Page size used when fetching the announcements list.
    #[serde(default = "default_page_size")]
    pub announcements_page_size: u32,
    /// Page size used when fetching a comment thread.
    #[serde(default = "default_page_size")]
    pub comments_page_size: u32,
    /// Default page size for user management lists.
    #[serde(default = "default_page_size")]
    pub users_page_size: u32,
    /// Quiet period before a user search query is issued.
    #[serde(default = "default_search_debounce_ms")]
    pub search_debounce_ms: u64,
}

/// Session persistence configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Where access/refresh credentials are persisted.
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
}

fn default_base_url() -> String {
    "http://localhost:8989".to_string()
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_push_url() -> String {
    "ws://localhost:8989/ws".to_string()
}

const fn default_reconnect_initial_ms() -> u64 {
    500
}

const fn default_reconnect_max_ms() -> u64 {
    30_000
}

const fn default_page_size() -> u32 {
    10
}

const fn default_search_debounce_ms() -> u64 {
    300
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from(".noticeboard/credentials.json")
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl ApiConfig {
    /// Total request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            url: default_push_url(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

impl PushConfig {
    /// Reconnect delay for the given consecutive failure count.
    ///
    /// Doubles from `reconnect_initial_ms` and saturates at `reconnect_max_ms`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(16)).unwrap_or(u64::MAX);
        let millis = self
            .reconnect_initial_ms
            .saturating_mul(factor)
            .min(self.reconnect_max_ms);
        Duration::from_millis(millis)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            announcements_page_size: default_page_size(),
            comments_page_size: default_page_size(),
            users_page_size: default_page_size(),
            search_debounce_ms: default_search_debounce_ms(),
        }
    }
}

impl CacheConfig {
    /// Debounce window for user searches.
    #[must_use]
    pub const fn search_debounce(&self) -> Duration {
        Duration::from_millis(self.search_debounce_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            credentials_path: default_credentials_path(),
        }
    }
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `config/default.toml`
    /// 2. `config/{environment}.toml` (based on `NOTICEBOARD_ENV`)
    /// 3. Environment variables with `NOTICEBOARD__` prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        let env =
            std::env::var("NOTICEBOARD_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("NOTICEBOARD")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
