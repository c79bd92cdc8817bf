//! Install and activate, and the registration that sequences generations.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use super::message::ReplyPort;
use super::{Worker, WorkerError};
use crate::cache::CacheError;
use crate::http::Request;

/// Lifecycle state of a worker generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Parsed,
    Installing,
    /// Installed and waiting for the previous generation to let go.
    Installed,
    Activating,
    /// Controlling pages; the only state in which requests are intercepted.
    Activated,
    /// Superseded by a newer generation.
    Redundant,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        })
    }
}

/// Outcome of [`Worker::install`].
#[derive(Debug)]
pub struct InstallReport {
    /// Entries in the static store once installation finished.
    pub precached: usize,
    /// Why precaching failed, if it did. Installation completes regardless.
    pub failure: Option<CacheError>,
}

/// Outcome of [`Worker::activate`].
#[derive(Debug, Default)]
pub struct ActivateReport {
    /// Store names removed because they belong to another generation.
    pub deleted: Vec<String>,
    /// Pages taken over from the previous generation.
    pub claimed: usize,
}

impl Worker {
    fn transition(&self, from: WorkerState, to: WorkerState) -> Result<(), WorkerError> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                result = Err(WorkerError::InvalidState {
                    expected: from,
                    actual: *state,
                });
                false
            }
        });
        result
    }

    /// Precaches every static file into the current static store.
    ///
    /// The batch is all-or-nothing. A failed batch is logged and reported in
    /// [`InstallReport::failure`], but the worker still ends up installed:
    /// it runs with whatever the static store already held.
    ///
    /// # Errors
    ///
    /// [`WorkerError::InvalidState`] unless the worker is freshly parsed.
    pub async fn install(&self) -> Result<InstallReport, WorkerError> {
        self.transition(WorkerState::Parsed, WorkerState::Installing)?;
        info!(version = %self.version(), "installing worker");

        let name = self.config().static_cache_name();
        let failure = match self.precache(&name).await {
            Ok(()) => {
                info!(cache = %name, files = self.static_urls.len(), "static files cached");
                None
            }
            Err(e) => {
                error!(cache = %name, error = %e, "failed to cache static files");
                Some(e)
            }
        };

        let precached = match self.storage().open(&name).await {
            Ok(store) => store.len().await,
            Err(_) => 0,
        };

        if self.config().skip_waiting_on_install {
            self.skip_waiting();
        }
        self.set_state(WorkerState::Installed);

        Ok(InstallReport { precached, failure })
    }

    async fn precache(&self, name: &str) -> Result<(), CacheError> {
        let store = self.storage().open(name).await?;
        let requests = self
            .static_urls
            .iter()
            .cloned()
            .map(Request::get)
            .collect();
        store.add_all(self.fetcher(), requests).await
    }

    /// Deletes every store outside the current generation and claims open
    /// pages.
    ///
    /// A store that cannot be deleted is logged and left behind; the next
    /// activation retries it.
    ///
    /// # Errors
    ///
    /// [`WorkerError::InvalidState`] unless the worker is installed.
    pub async fn activate(&self) -> Result<ActivateReport, WorkerError> {
        self.transition(WorkerState::Installed, WorkerState::Activating)?;
        info!(version = %self.version(), "activating worker");

        let keep = [
            self.config().static_cache_name(),
            self.config().dynamic_cache_name(),
        ];
        let mut report = ActivateReport::default();

        for name in self.storage().keys().await {
            if keep.contains(&name) {
                continue;
            }
            info!(cache = %name, "deleting old cache");
            match self.storage().delete(&name).await {
                Ok(_) => report.deleted.push(name),
                Err(e) => warn!(cache = %name, error = %e, "failed to delete old cache"),
            }
        }

        report.claimed = self.host().claim();
        self.set_state(WorkerState::Activated);
        Ok(report)
    }
}

/// Tracks the active generation and at most one waiting successor.
///
/// Mirrors a browser's service worker registration: a new worker installs
/// alongside the active one, then either takes over immediately (it asked to
/// skip waiting, or nothing was active) or waits until told to.
#[derive(Debug, Default)]
pub struct Registration {
    active: RwLock<Option<Arc<Worker>>>,
    waiting: RwLock<Option<Arc<Worker>>>,
}

impl Registration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the worker that currently intercepts requests.
    pub async fn controller(&self) -> Option<Arc<Worker>> {
        self.active.read().await.clone()
    }

    pub async fn waiting(&self) -> Option<Arc<Worker>> {
        self.waiting.read().await.clone()
    }

    /// Installs `worker`, then activates it or parks it as the waiting worker.
    ///
    /// A previously waiting worker that never activated becomes redundant.
    pub async fn register(&self, worker: Arc<Worker>) -> Result<(), WorkerError> {
        let report = worker.install().await?;
        if report.failure.is_some() {
            warn!(version = %worker.version(), "worker installed without a complete static cache");
        }

        let has_active = self.active.read().await.is_some();
        if worker.is_skipping_waiting() || !has_active {
            self.promote(worker).await
        } else {
            info!(version = %worker.version(), "worker installed, waiting to activate");
            if let Some(previous) = self.waiting.write().await.replace(worker) {
                previous.set_state(WorkerState::Redundant);
            }
            Ok(())
        }
    }

    /// Retires the previous controller, then activates `worker`.
    ///
    /// The previous controller stops intercepting before activation deletes
    /// its stores. It is reinstated if activation fails.
    async fn promote(&self, worker: Arc<Worker>) -> Result<(), WorkerError> {
        let mut active = self.active.write().await;
        if let Some(previous) = active.as_ref() {
            previous.set_state(WorkerState::Redundant);
        }
        if let Err(e) = worker.activate().await {
            if let Some(previous) = active.as_ref() {
                warn!(version = %previous.version(), "activation failed, keeping previous worker");
                previous.set_state(WorkerState::Activated);
            }
            return Err(e);
        }
        *active = Some(worker);
        Ok(())
    }

    /// Delivers a message from a page.
    ///
    /// Messages go to the waiting worker when there is one, since that is
    /// the worker a page tells to skip waiting; otherwise to the controller.
    /// A waiting worker that accepted `SKIP_WAITING` is activated at once.
    pub async fn post_message(
        &self,
        message: &Value,
        port: Option<ReplyPort>,
    ) -> Result<(), WorkerError> {
        let target = match self.waiting().await {
            Some(waiting) => waiting,
            None => match self.controller().await {
                Some(active) => active,
                None => {
                    warn!("message dropped: no worker registered");
                    return Ok(());
                }
            },
        };

        target.handle_message(message, port);

        if target.state() == WorkerState::Installed && target.is_skipping_waiting() {
            let promoted = self.waiting.write().await.take();
            if let Some(worker) = promoted {
                self.promote(worker).await?;
            }
        }
        Ok(())
    }
}
