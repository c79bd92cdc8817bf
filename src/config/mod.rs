//! Configuration: worker policy, proxy settings and logging.
//!
//! Values are layered with the `config` crate: built-in defaults, then an
//! optional file (TOML, JSON or YAML, picked by extension), then environment
//! variables prefixed `OFFCACHE__` with `__` as the nesting separator, e.g.
//! `OFFCACHE__WORKER__CACHE_VERSION=v2` or `OFFCACHE__PROXY__LISTEN=0.0.0.0:8080`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::RegexSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid URL {value:?}: {source}")]
    InvalidUrl {
        value: String,
        #[source]
        source: url::ParseError,
    },

    #[error("invalid API pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Top-level configuration for the `offcache` binary.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub worker: WorkerConfig,
    pub proxy: ProxyConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Loads defaults, then `path` if given, then `OFFCACHE__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let loaded = builder
            .add_source(
                config::Environment::with_prefix("OFFCACHE")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("worker.static_files")
                    .with_list_parse_key("worker.api_patterns")
                    .try_parsing(true),
            )
            .build()?;

        Ok(loaded.try_deserialize()?)
    }
}

/// What the worker caches and how it names its stores.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Generation label reported to `GET_VERSION`.
    pub version: String,
    /// Generation suffix baked into both store names.
    pub cache_version: String,
    /// Origin the worker serves; same-origin requests are eligible for caching.
    pub origin: String,
    /// Precached at install. Relative entries resolve against `origin`;
    /// absolute entries are the pinned third-party URLs allowed through the
    /// cross-origin filter.
    pub static_files: Vec<String>,
    /// Served to navigations when the network is unreachable.
    pub offline_page: String,
    /// Activate right after install instead of waiting for pages controlled
    /// by the previous generation to close.
    pub skip_waiting_on_install: bool,
    /// Regexes identifying API URLs.
    pub api_patterns: Vec<String>,
    /// When set, cached API responses older than this are revalidated.
    pub api_max_age_secs: Option<u64>,
    pub sync_tag: String,
    pub sync_delay_ms: u64,
    pub notification_icon: String,
    pub notification_badge: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            version: "butha-buthe-library-v1".to_string(),
            cache_version: "v1".to_string(),
            origin: "http://localhost:5000".to_string(),
            static_files: [
                "/",
                "/static/css/style.css",
                "/static/js/app.js",
                "/static/images/book-placeholder.png",
                "/offline.html",
                "https://cdn.jsdelivr.net/npm/bootstrap@5.1.3/dist/css/bootstrap.min.css",
                "https://cdn.jsdelivr.net/npm/bootstrap@5.1.3/dist/js/bootstrap.bundle.min.js",
                "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.0.0/css/all.min.css",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            offline_page: "/offline.html".to_string(),
            skip_waiting_on_install: true,
            api_patterns: [r"/api/books", r"/api/categories", r"/api/user/profile"]
                .into_iter()
                .map(String::from)
                .collect(),
            api_max_age_secs: None,
            sync_tag: "sync-offline-actions".to_string(),
            sync_delay_ms: 1000,
            notification_icon: "/static/images/library-icon.png".to_string(),
            notification_badge: "/static/images/library-badge.png".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn static_cache_name(&self) -> String {
        format!("static-{}", self.cache_version)
    }

    pub fn dynamic_cache_name(&self) -> String {
        format!("dynamic-{}", self.cache_version)
    }

    pub fn origin_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.origin).map_err(|source| ConfigError::InvalidUrl {
            value: self.origin.clone(),
            source,
        })
    }

    /// Resolves `value` against the configured origin.
    pub fn resolve(&self, value: &str) -> Result<Url, ConfigError> {
        self.origin_url()?
            .join(value)
            .map_err(|source| ConfigError::InvalidUrl {
                value: value.to_owned(),
                source,
            })
    }

    /// Absolute URLs of every precached file, in configuration order.
    pub fn static_urls(&self) -> Result<Vec<Url>, ConfigError> {
        self.static_files.iter().map(|f| self.resolve(f)).collect()
    }

    pub fn api_matcher(&self) -> Result<RegexSet, ConfigError> {
        Ok(RegexSet::new(&self.api_patterns)?)
    }

    pub fn api_max_age(&self) -> Option<Duration> {
        self.api_max_age_secs.map(Duration::from_secs)
    }

    pub fn sync_delay(&self) -> Duration {
        Duration::from_millis(self.sync_delay_ms)
    }
}

/// Settings for the forward proxy that fronts the worker.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen: String,
    /// Where cache stores are persisted; in-memory when unset.
    pub cache_dir: Option<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            cache_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "offcache=info".to_string(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}
