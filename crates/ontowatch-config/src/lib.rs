//! Settings for ontowatch embedders.
//!
//! One TOML file plus `ONTOWATCH_*` environment overrides, resolved into
//! the runtime configs of `ontowatch_api` (feed transport) and
//! `ontowatch_core` (cache tuning), along with the access token and a
//! tracing subscriber.

mod logging;

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use ontowatch_api::{FeedOptions, ReconnectConfig, StreamTransport, TlsMode, TransportConfig};
use ontowatch_core::CacheConfig;

pub use logging::{LogFormat, LogSettings, init_tracing};

/// Prefix for environment overrides. Nested keys use `__`, e.g.
/// `ONTOWATCH_FEED__TRANSPORT=websocket`.
pub const ENV_PREFIX: &str = "ONTOWATCH_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no access token configured (set `token` or `token_env`)")]
    NoCredentials,

    #[error("failed to serialize settings: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("settings loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("tracing already initialised: {0}")]
    Logging(#[from] tracing_subscriber::util::TryInitError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── Settings ────────────────────────────────────────────────────────

/// Top-level settings file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    /// Platform base URL, e.g. "https://stack.example.com".
    pub base_url: Option<String>,

    /// Ontology the feed subscribes against.
    pub ontology_rid: Option<String>,

    /// Access token (plaintext; prefer `token_env`).
    pub token: Option<String>,

    /// Environment variable holding the access token.
    pub token_env: Option<String>,

    #[serde(default)]
    pub feed: FeedSettings,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub log: LogSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FeedSettings {
    /// "sse" or "websocket".
    pub transport: StreamTransport,

    /// Seconds an idle WebSocket stays open after its last unsubscribe.
    pub teardown_grace_secs: u64,

    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Accept any TLS certificate.
    pub insecure: bool,

    /// Path to a custom CA certificate (PEM).
    pub ca_cert: Option<PathBuf>,

    pub user_agent: Option<String>,

    pub reconnect: ReconnectSettings,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            transport: StreamTransport::default(),
            teardown_grace_secs: 15,
            connect_timeout_secs: 30,
            insecure: false,
            ca_cert: None,
            user_agent: None,
            reconnect: ReconnectSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Unset retries forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_retries: None,
        }
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the settings file path via XDG / platform conventions.
pub fn default_config_path() -> PathBuf {
    ProjectDirs::from("com", "ontowatch", "ontowatch").map_or_else(
        || PathBuf::from(".ontowatch").join("config.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Loading ─────────────────────────────────────────────────────────

impl Settings {
    /// Load defaults, then `path` (or the default path), then the
    /// environment. A missing file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map_or_else(default_config_path, Path::to_path_buf);
        Self::figment(&path).extract::<Self>()?.validated()
    }

    /// The provider chain behind `load`, for embedders that layer their own.
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn validated(self) -> Result<Self, ConfigError> {
        let reconnect = &self.feed.reconnect;
        if reconnect.initial_delay_ms == 0 {
            return Err(invalid("feed.reconnect.initial_delay_ms", "must be positive"));
        }
        if reconnect.max_delay_ms < reconnect.initial_delay_ms {
            return Err(invalid(
                "feed.reconnect.max_delay_ms",
                format!(
                    "{} is below initial_delay_ms ({})",
                    reconnect.max_delay_ms, reconnect.initial_delay_ms
                ),
            ));
        }
        if self.cache.gc_interval.is_zero() {
            return Err(invalid("cache.gc_interval", "must be positive"));
        }
        if self.cache.default_page_size == Some(0) {
            return Err(invalid("cache.default_page_size", "must be positive"));
        }
        if let Some(raw) = &self.base_url {
            parse_base_url(raw)?;
        }
        Ok(self)
    }

    /// Write these settings as TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    // ── Conversion to runtime configs ───────────────────────────────

    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let raw = self
            .base_url
            .as_deref()
            .ok_or_else(|| invalid("base_url", "not set"))?;
        parse_base_url(raw)
    }

    pub fn ontology_rid(&self) -> Result<&str, ConfigError> {
        self.ontology_rid
            .as_deref()
            .filter(|rid| !rid.is_empty())
            .ok_or_else(|| invalid("ontology_rid", "not set"))
    }

    /// Resolve the access token: the `token_env` variable first, then the
    /// plaintext `token`.
    pub fn token(&self) -> Result<SecretString, ConfigError> {
        if let Some(name) = &self.token_env {
            if let Ok(value) = std::env::var(name) {
                return Ok(SecretString::from(value));
            }
            tracing::debug!(variable = %name, "token_env is not set, trying plaintext token");
        }
        self.token
            .clone()
            .map(SecretString::from)
            .ok_or(ConfigError::NoCredentials)
    }

    pub fn feed_options(&self) -> FeedOptions {
        let feed = &self.feed;
        let tls = if feed.insecure {
            TlsMode::DangerAcceptInvalid
        } else if let Some(path) = &feed.ca_cert {
            TlsMode::CustomCa(path.clone())
        } else {
            TlsMode::System
        };

        let mut http = TransportConfig {
            tls,
            connect_timeout: Duration::from_secs(feed.connect_timeout_secs),
            ..TransportConfig::default()
        };
        if let Some(agent) = &feed.user_agent {
            http.user_agent.clone_from(agent);
        }

        FeedOptions {
            transport: feed.transport,
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(feed.reconnect.initial_delay_ms),
                max_delay: Duration::from_millis(feed.reconnect.max_delay_ms),
                max_retries: feed.reconnect.max_retries,
            },
            teardown_grace: Duration::from_secs(feed.teardown_grace_secs),
            http,
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        self.cache.clone()
    }
}

fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    let url: Url = raw
        .parse()
        .map_err(|e| invalid("base_url", format!("invalid URL {raw}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(invalid(
            "base_url",
            format!("expected an http(s) URL, got scheme '{other}'"),
        )),
    }
}
