//! A single named cache store: request identity → stored response.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use super::CacheError;
use super::persist::{self, StoreSnapshot};
use crate::fetch::Fetch;
use crate::http::{Headers, Method, Request, Response, StatusCode};

/// Identity of a stored request: method plus absolute URL, fragment removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    method: String,
    url: String,
}

impl RequestKey {
    pub fn new(method: &Method, url: &url::Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_owned(),
            url: url.into(),
        }
    }

    pub fn from_request(request: &Request) -> Self {
        Self::new(request.method(), request.url())
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A response as it sits in a store.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Bytes,
    pub stored_at: DateTime<Utc>,
}

impl CachedResponse {
    fn capture(response: Response) -> Self {
        let (status, headers, body) = response.into_parts();
        Self {
            status,
            headers,
            body,
            stored_at: Utc::now(),
        }
    }

    /// Rebuilds a response that can be handed to a client.
    pub fn to_response(&self) -> Response {
        Response::from_parts(self.status, self.headers.clone(), self.body.clone())
    }

    /// Time elapsed since the entry was written.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.stored_at
    }
}

/// A named, optionally persistent key → response map.
///
/// Writes are last-write-wins: two interceptions that miss on the same URL
/// both store, and whichever lands second is kept.
#[derive(Debug)]
pub struct CacheStore {
    name: String,
    entries: RwLock<HashMap<RequestKey, CachedResponse>>,
    /// Cache directory the store is mirrored into, if any.
    dir: Option<PathBuf>,
    /// Serializes mutate-then-write so entry files hit disk in mutation order.
    write_lock: Mutex<()>,
}

impl CacheStore {
    pub(crate) fn new(name: impl Into<String>, dir: Option<PathBuf>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(HashMap::new()),
            dir,
            write_lock: Mutex::new(()),
        }
    }

    pub(crate) fn from_snapshot(
        snapshot: StoreSnapshot,
        dir: Option<PathBuf>,
    ) -> Result<Self, CacheError> {
        let mut entries = HashMap::with_capacity(snapshot.entries.len());
        for record in snapshot.entries {
            let (key, cached) = record.into_entry()?;
            entries.insert(key, cached);
        }
        Ok(Self {
            name: snapshot.name,
            entries: RwLock::new(entries),
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up an exact match for `request`.
    pub async fn match_request(&self, request: &Request) -> Option<CachedResponse> {
        self.match_key(&RequestKey::from_request(request)).await
    }

    pub async fn match_key(&self, key: &RequestKey) -> Option<CachedResponse> {
        self.entries.read().await.get(key).cloned()
    }

    /// Stores `response` under `request`, replacing any previous entry.
    ///
    /// # Errors
    ///
    /// [`CacheError::UnsupportedMethod`] for anything but GET, or an I/O
    /// error if the store is persistent and the entry cannot be written.
    pub async fn put(&self, request: &Request, response: Response) -> Result<(), CacheError> {
        if *request.method() != Method::Get {
            return Err(CacheError::UnsupportedMethod(request.method().to_string()));
        }
        let key = RequestKey::from_request(request);
        let cached = CachedResponse::capture(response);

        let _guard = self.write_lock.lock().await;
        self.entries.write().await.insert(key.clone(), cached.clone());
        debug!(cache = %self.name, key = %key, "stored response");
        self.persist_entry(&key, &cached).await
    }

    /// Removes the entry for `request`. Returns `true` if one existed.
    pub async fn delete(&self, request: &Request) -> Result<bool, CacheError> {
        let key = RequestKey::from_request(request);
        let _guard = self.write_lock.lock().await;
        let removed = self.entries.write().await.remove(&key).is_some();
        if removed {
            if let Some(dir) = &self.dir {
                persist::remove_entry(dir, &self.name, &key).await?;
            }
        }
        Ok(removed)
    }

    /// Returns every key currently stored, in no particular order.
    pub async fn keys(&self) -> Vec<RequestKey> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Fetches every request and stores the results as one batch.
    ///
    /// All fetches must complete with a 2xx status before anything is
    /// written; otherwise the store is left untouched and the first failure
    /// is returned.
    pub async fn add_all(
        &self,
        fetcher: &dyn Fetch,
        requests: Vec<Request>,
    ) -> Result<(), CacheError> {
        for request in &requests {
            if *request.method() != Method::Get {
                return Err(CacheError::UnsupportedMethod(request.method().to_string()));
            }
        }

        let responses = try_join_all(requests.iter().map(|request| async move {
            let response = fetcher
                .fetch(request)
                .await
                .map_err(|source| CacheError::Fetch {
                    url: request.url().to_string(),
                    source,
                })?;
            if !response.is_success() {
                return Err(CacheError::BadStatus {
                    url: request.url().to_string(),
                    status: response.status(),
                });
            }
            Ok(response)
        }))
        .await?;

        let batch: Vec<_> = requests
            .iter()
            .zip(responses)
            .map(|(request, response)| {
                (
                    RequestKey::from_request(request),
                    CachedResponse::capture(response),
                )
            })
            .collect();

        let _guard = self.write_lock.lock().await;
        self.entries.write().await.extend(batch.iter().cloned());
        debug!(cache = %self.name, count = batch.len(), "batch stored");
        try_join_all(batch.iter().map(|(key, cached)| self.persist_entry(key, cached))).await?;
        Ok(())
    }

    /// Mirrors one entry to disk. Callers hold `write_lock`.
    async fn persist_entry(
        &self,
        key: &RequestKey,
        cached: &CachedResponse,
    ) -> Result<(), CacheError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        if let Err(e) = persist::write_entry(dir, &self.name, key, cached).await {
            warn!(cache = %self.name, key = %key, error = %e, "failed to persist cache entry");
            return Err(e);
        }
        Ok(())
    }
}
