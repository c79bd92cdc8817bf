//! The offline caching worker.
//!
//! A [`Worker`] is one generation of caching policy. It reacts to lifecycle
//! events (install, activate), intercepts requests, and answers messages,
//! background-sync and push events. Everything it needs is passed in at
//! construction: configuration, cache storage, a network fetcher, and a
//! client host.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use offcache::cache::CacheStorage;
//! use offcache::config::WorkerConfig;
//! use offcache::fetch::NetworkFetcher;
//! use offcache::worker::{LoggingHost, Registration, Worker};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let worker = Worker::new(
//!     WorkerConfig::default(),
//!     Arc::new(CacheStorage::in_memory()),
//!     Arc::new(NetworkFetcher::new()),
//!     Arc::new(LoggingHost),
//! )?;
//! let registration = Registration::new();
//! registration.register(Arc::new(worker)).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use regex::RegexSet;
use thiserror::Error;
use tokio::sync::watch;
use url::Url;

use crate::cache::CacheStorage;
use crate::config::{ConfigError, WorkerConfig};
use crate::fetch::Fetch;

pub mod clients;
pub mod intercept;
pub mod lifecycle;
pub mod message;
pub mod push;
pub mod sync;

pub use clients::{ClientHost, LoggingHost};
pub use intercept::{Interception, ResponseSource};
pub use lifecycle::{ActivateReport, InstallReport, Registration, WorkerState};
pub use message::{ReplyPort, VersionReply, WorkerMessage};
pub use push::{Notification, NotificationAction, PushPayload};
pub use sync::SyncOutcome;

/// Errors produced by the worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker is {actual}, expected {expected}")]
    InvalidState {
        expected: WorkerState,
        actual: WorkerState,
    },

    #[error("invalid worker configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid push payload: {0}")]
    InvalidPush(#[from] serde_json::Error),
}

/// One generation of the offline caching worker.
pub struct Worker {
    config: WorkerConfig,
    storage: Arc<CacheStorage>,
    fetcher: Arc<dyn Fetch>,
    host: Arc<dyn ClientHost>,

    origin: Url,
    root_url: Url,
    offline_url: Url,
    static_urls: Vec<Url>,
    api_matcher: RegexSet,
    api_max_age: Option<Duration>,

    state: watch::Sender<WorkerState>,
    skip_waiting: AtomicBool,
}

impl Worker {
    /// Builds a worker, validating every URL and pattern in `config`.
    ///
    /// # Errors
    ///
    /// [`WorkerError::Config`] if the origin, a static file, the offline page,
    /// or an API pattern is invalid.
    pub fn new(
        config: WorkerConfig,
        storage: Arc<CacheStorage>,
        fetcher: Arc<dyn Fetch>,
        host: Arc<dyn ClientHost>,
    ) -> Result<Self, WorkerError> {
        let origin = config.origin_url()?;
        let root_url = config.resolve("/")?;
        let offline_url = config.resolve(&config.offline_page)?;
        let static_urls = config.static_urls()?;
        let api_matcher = config.api_matcher()?;
        let api_max_age = config.api_max_age();

        Ok(Self {
            config,
            storage,
            fetcher,
            host,
            origin,
            root_url,
            offline_url,
            static_urls,
            api_matcher,
            api_max_age,
            state: watch::Sender::new(WorkerState::Parsed),
            skip_waiting: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Generation label, as reported by `GET_VERSION`.
    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn storage(&self) -> &Arc<CacheStorage> {
        &self.storage
    }

    pub(crate) fn fetcher(&self) -> &dyn Fetch {
        self.fetcher.as_ref()
    }

    pub(crate) fn host(&self) -> &dyn ClientHost {
        self.host.as_ref()
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub(crate) fn root_url(&self) -> &Url {
        &self.root_url
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    /// Asks to activate as soon as installation finishes, without waiting
    /// for pages controlled by the previous worker to close.
    pub fn skip_waiting(&self) {
        self.skip_waiting.store(true, Ordering::SeqCst);
    }

    pub fn is_skipping_waiting(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("version", &self.config.version)
            .field("origin", &self.origin.as_str())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use super::clients::recording::RecordingHost;
    use super::*;
    use crate::fetch::scripted::ScriptedFetcher;
    use crate::http::StatusCode;

    pub(crate) const ORIGIN: &str = "http://library.local";

    pub(crate) struct Harness {
        pub worker: Arc<Worker>,
        pub fetcher: Arc<ScriptedFetcher>,
        pub host: Arc<RecordingHost>,
        pub storage: Arc<CacheStorage>,
    }

    /// Two static files, both fetchable, served from [`ORIGIN`].
    pub(crate) fn small_config() -> WorkerConfig {
        WorkerConfig {
            origin: ORIGIN.into(),
            static_files: vec!["/".into(), "/static/css/style.css".into()],
            ..WorkerConfig::default()
        }
    }

    pub(crate) fn harness_with(config: WorkerConfig, storage: Arc<CacheStorage>) -> Harness {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher
            .respond(&format!("{ORIGIN}/"), StatusCode::Ok, "<h1>Library</h1>")
            .respond(&format!("{ORIGIN}/static/css/style.css"), StatusCode::Ok, "body{}")
            .respond(&format!("{ORIGIN}/offline.html"), StatusCode::Ok, "<h1>You are offline</h1>");
        let host = Arc::new(RecordingHost::default());
        let worker = Worker::new(
            config,
            Arc::clone(&storage),
            Arc::clone(&fetcher) as Arc<dyn Fetch>,
            Arc::clone(&host) as Arc<dyn ClientHost>,
        )
        .unwrap();
        Harness {
            worker: Arc::new(worker),
            fetcher,
            host,
            storage,
        }
    }

    pub(crate) fn harness() -> Harness {
        harness_with(small_config(), Arc::new(CacheStorage::in_memory()))
    }

    /// A harness whose worker has been installed and activated, with the
    /// offline page precached too.
    pub(crate) async fn activated_harness() -> Harness {
        let mut config = small_config();
        config.static_files.push("/offline.html".into());
        let h = harness_with(config, Arc::new(CacheStorage::in_memory()));
        let report = h.worker.install().await.unwrap();
        assert!(report.failure.is_none());
        h.worker.activate().await.unwrap();
        h
    }
}
