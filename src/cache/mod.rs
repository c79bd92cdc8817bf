//! Named cache stores, the only state a worker keeps.
//!
//! [`CacheStorage`] owns every [`CacheStore`] by name, the way a browser's
//! `CacheStorage` does: stores are opened (created on demand), enumerated,
//! deleted, and searched together. With a cache directory configured each
//! store is mirrored to disk and reloaded on startup.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::fetch::FetchError;
use crate::http::{Request, StatusCode};

mod persist;
pub mod store;

pub use store::{CacheStore, CachedResponse, RequestKey};

/// Errors produced by cache stores.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("only GET requests can be cached, got {0}")]
    UnsupportedMethod(String),

    #[error("fetching {url} failed: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },

    #[error("{url} answered {status}")]
    BadStatus { url: String, status: StatusCode },

    #[error("cache I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt cache data: {detail}")]
    Corrupt { detail: String },
}

/// The set of named cache stores, in creation order.
#[derive(Debug, Default)]
pub struct CacheStorage {
    stores: RwLock<Vec<Arc<CacheStore>>>,
    dir: Option<PathBuf>,
}

impl CacheStorage {
    /// Creates storage that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens storage mirrored to `dir`, loading any stores saved there.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] if the directory exists but cannot be read.
    pub async fn open_dir(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        let mut stores = Vec::new();
        for snapshot in persist::load_all(&dir).await? {
            let store = CacheStore::from_snapshot(snapshot, Some(dir.clone()))?;
            info!(cache = %store.name(), entries = store.len().await, "restored cache store");
            stores.push(Arc::new(store));
        }
        Ok(Self {
            stores: RwLock::new(stores),
            dir: Some(dir),
        })
    }

    /// Returns the store called `name`, creating it if needed.
    pub async fn open(&self, name: &str) -> Result<Arc<CacheStore>, CacheError> {
        if let Some(store) = self.find(name).await {
            return Ok(store);
        }
        let mut stores = self.stores.write().await;
        self.open_locked(&mut stores, name).await
    }

    /// Like [`open`](Self::open), but only while `live` holds.
    ///
    /// `live` is checked under the storage lock, and a store it admits is
    /// created under that same lock, so a store deleted by a concurrent
    /// [`delete`](Self::delete) is never recreated by a caller whose
    /// condition stopped holding first. Returns `Ok(None)` when `live` fails.
    pub async fn open_if(
        &self,
        name: &str,
        live: impl Fn() -> bool,
    ) -> Result<Option<Arc<CacheStore>>, CacheError> {
        let mut stores = self.stores.write().await;
        if !live() {
            return Ok(None);
        }
        self.open_locked(&mut stores, name).await.map(Some)
    }

    async fn open_locked(
        &self,
        stores: &mut Vec<Arc<CacheStore>>,
        name: &str,
    ) -> Result<Arc<CacheStore>, CacheError> {
        // Another task may have created it while we waited for the write lock.
        if let Some(store) = stores.iter().find(|s| s.name() == name) {
            return Ok(Arc::clone(store));
        }

        let store = Arc::new(CacheStore::new(name, self.dir.clone()));
        if let Some(dir) = &self.dir {
            persist::create_store(dir, name).await?;
        }
        debug!(cache = %name, "created cache store");
        stores.push(Arc::clone(&store));
        Ok(store)
    }

    async fn find(&self, name: &str) -> Option<Arc<CacheStore>> {
        self.stores
            .read()
            .await
            .iter()
            .find(|s| s.name() == name)
            .cloned()
    }

    pub async fn has(&self, name: &str) -> bool {
        self.find(name).await.is_some()
    }

    /// Returns every store name in creation order.
    pub async fn keys(&self) -> Vec<String> {
        self.stores
            .read()
            .await
            .iter()
            .map(|s| s.name().to_owned())
            .collect()
    }

    /// Deletes the store called `name`. Returns `true` if it existed.
    pub async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        let removed = {
            let mut stores = self.stores.write().await;
            let before = stores.len();
            stores.retain(|s| s.name() != name);
            stores.len() < before
        };
        if removed {
            if let Some(dir) = &self.dir {
                persist::remove_store(dir, name).await?;
            }
            debug!(cache = %name, "deleted cache store");
        }
        Ok(removed)
    }

    /// Searches every store, oldest first, for an exact match.
    pub async fn match_request(&self, request: &Request) -> Option<CachedResponse> {
        let key = RequestKey::from_request(request);
        let stores: Vec<_> = self.stores.read().await.clone();
        for store in stores {
            if let Some(hit) = store.match_key(&key).await {
                return Some(hit);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Response;
    use url::Url;

    fn get(url: &str) -> Request {
        Request::get(Url::parse(url).unwrap())
    }

    fn scratch_dir(test: &str) -> PathBuf {
        std::env::temp_dir().join(format!("offcache-storage-{test}-{}", std::process::id()))
    }

    #[tokio::test]
    async fn open_is_idempotent_and_ordered() {
        let storage = CacheStorage::in_memory();
        let a = storage.open("static-v1").await.unwrap();
        storage.open("dynamic-v1").await.unwrap();
        let again = storage.open("static-v1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(storage.keys().await, vec!["static-v1", "dynamic-v1"]);
    }

    #[tokio::test]
    async fn match_searches_all_stores() {
        let storage = CacheStorage::in_memory();
        storage.open("static-v1").await.unwrap();
        let dynamic = storage.open("dynamic-v1").await.unwrap();
        let request = get("http://library.local/api/books");
        dynamic
            .put(&request, Response::new(StatusCode::Ok).body("[]"))
            .await
            .unwrap();

        assert!(storage.match_request(&request).await.is_some());
        assert!(storage.match_request(&get("http://library.local/")).await.is_none());
    }

    #[tokio::test]
    async fn open_if_does_not_create_when_condition_fails() {
        let storage = CacheStorage::in_memory();
        assert!(storage.open_if("dynamic-v1", || false).await.unwrap().is_none());
        assert!(!storage.has("dynamic-v1").await);

        let store = storage.open_if("dynamic-v1", || true).await.unwrap().unwrap();
        assert_eq!(store.name(), "dynamic-v1");
        assert!(storage.has("dynamic-v1").await);
    }

    #[tokio::test]
    async fn delete_removes_store_and_entries() {
        let storage = CacheStorage::in_memory();
        let old = storage.open("dynamic-v0").await.unwrap();
        let request = get("http://library.local/api/books");
        old.put(&request, Response::new(StatusCode::Ok)).await.unwrap();

        assert!(storage.delete("dynamic-v0").await.unwrap());
        assert!(!storage.delete("dynamic-v0").await.unwrap());
        assert!(!storage.has("dynamic-v0").await);
        assert!(storage.match_request(&request).await.is_none());
    }

    #[tokio::test]
    async fn persistent_storage_survives_reopen() {
        let dir = scratch_dir("reopen");
        let _ = tokio::fs::remove_dir_all(&dir).await;

        {
            let storage = CacheStorage::open_dir(&dir).await.unwrap();
            let store = storage.open("static-v1").await.unwrap();
            store
                .put(
                    &get("http://library.local/offline.html"),
                    Response::new(StatusCode::Ok)
                        .header("Content-Type", "text/html")
                        .body("<h1>Offline</h1>"),
                )
                .await
                .unwrap();
            storage.open("dynamic-v1").await.unwrap();
            storage.open("doomed").await.unwrap();
            storage.delete("doomed").await.unwrap();
        }

        let storage = CacheStorage::open_dir(&dir).await.unwrap();
        let mut names = storage.keys().await;
        names.sort();
        assert_eq!(names, vec!["dynamic-v1", "static-v1"]);

        let hit = storage
            .match_request(&get("http://library.local/offline.html"))
            .await
            .unwrap();
        assert_eq!(hit.headers.get("content-type"), Some("text/html"));
        assert_eq!(hit.to_response().text(), "<h1>Offline</h1>");

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
