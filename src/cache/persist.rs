//! On-disk mirror of cache stores.
//!
//! Each store is a directory under the cache directory holding a small
//! manifest plus one JSON file per entry, named by the SHA-256 of the entry's
//! request key. Bodies are base64 encoded. A write touches only the file of
//! the entry being stored, replaced atomically (temp file, then rename).
//! Entry writes never create the store directory, so a store removed by an
//! activation cannot be brought back by a late write.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use super::CacheError;
use super::store::{CachedResponse, RequestKey};
use crate::http::{Headers, Method, StatusCode};

const EXTENSION: &str = "json";
const MANIFEST: &str = "store.json";

/// A store as loaded from disk.
#[derive(Debug)]
pub(crate) struct StoreSnapshot {
    pub name: String,
    pub entries: Vec<EntryRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct EntryRecord {
    method: String,
    url: String,
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
    stored_at: DateTime<Utc>,
}

impl EntryRecord {
    pub fn from_entry(key: &RequestKey, cached: &CachedResponse) -> Self {
        Self {
            method: key.method().to_owned(),
            url: key.url().to_owned(),
            status: cached.status.as_u16(),
            headers: cached.headers.clone().into_pairs(),
            body: STANDARD.encode(&cached.body),
            stored_at: cached.stored_at,
        }
    }

    pub fn into_entry(self) -> Result<(RequestKey, CachedResponse), CacheError> {
        let url = url::Url::parse(&self.url).map_err(|e| CacheError::Corrupt {
            detail: format!("bad url {:?}: {e}", self.url),
        })?;
        let Ok(method) = self.method.parse::<Method>();
        let body = STANDARD
            .decode(self.body.as_bytes())
            .map_err(|e| CacheError::Corrupt {
                detail: format!("bad body for {}: {e}", self.url),
            })?;

        Ok((
            RequestKey::new(&method, &url),
            CachedResponse {
                status: StatusCode::from_u16(self.status),
                headers: Headers::from(self.headers),
                body: Bytes::from(body),
                stored_at: self.stored_at,
            },
        ))
    }
}

/// Maps a store name onto a directory name that is safe on every platform.
fn store_dir(dir: &Path, name: &str) -> PathBuf {
    let safe: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    dir.join(safe)
}

fn entry_file(store_dir: &Path, key: &RequestKey) -> PathBuf {
    let digest = Sha256::digest(key.to_string().as_bytes());
    store_dir.join(format!("{}.{EXTENSION}", hex::encode(digest)))
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_owned(),
        source,
    }
}

async fn write_atomically(path: &Path, contents: Vec<u8>) -> Result<(), CacheError> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, contents).await.map_err(io_error(&tmp))?;
    tokio::fs::rename(&tmp, path).await.map_err(io_error(path))?;
    Ok(())
}

fn encode<T: Serialize>(value: &T, what: &str) -> Result<Vec<u8>, CacheError> {
    serde_json::to_vec(value).map_err(|e| CacheError::Corrupt {
        detail: format!("cannot encode {what}: {e}"),
    })
}

/// Creates the directory and manifest for a new, empty store.
pub(crate) async fn create_store(dir: &Path, name: &str) -> Result<(), CacheError> {
    let path = store_dir(dir, name);
    tokio::fs::create_dir_all(&path)
        .await
        .map_err(io_error(&path))?;
    let manifest = encode(
        &Manifest {
            name: name.to_owned(),
        },
        name,
    )?;
    write_atomically(&path.join(MANIFEST), manifest).await
}

/// Writes one entry. Fails if the store directory no longer exists.
pub(crate) async fn write_entry(
    dir: &Path,
    store: &str,
    key: &RequestKey,
    cached: &CachedResponse,
) -> Result<(), CacheError> {
    let path = entry_file(&store_dir(dir, store), key);
    let record = encode(&EntryRecord::from_entry(key, cached), &key.to_string())?;
    write_atomically(&path, record).await
}

pub(crate) async fn remove_entry(
    dir: &Path,
    store: &str,
    key: &RequestKey,
) -> Result<(), CacheError> {
    let path = entry_file(&store_dir(dir, store), key);
    match tokio::fs::remove_file(&path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(io_error(&path)(e)),
        _ => Ok(()),
    }
}

pub(crate) async fn remove_store(dir: &Path, name: &str) -> Result<(), CacheError> {
    let path = store_dir(dir, name);
    match tokio::fs::remove_dir_all(&path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(io_error(&path)(e)),
        _ => Ok(()),
    }
}

/// Loads every store in `dir`, sorted by store name.
///
/// A missing directory yields nothing. Directories without a readable
/// manifest and corrupt entry files are skipped with a warning rather than
/// failing startup.
pub(crate) async fn load_all(dir: &Path) -> Result<Vec<StoreSnapshot>, CacheError> {
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error(dir)(e)),
    };

    let mut snapshots = Vec::new();
    while let Some(entry) = read_dir.next_entry().await.map_err(io_error(dir))? {
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        if let Some(snapshot) = load_store(&entry.path()).await {
            snapshots.push(snapshot);
        }
    }

    snapshots.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(snapshots)
}

async fn load_store(path: &Path) -> Option<StoreSnapshot> {
    let manifest: Manifest = match read_json(&path.join(MANIFEST)).await {
        Ok(manifest) => manifest,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "skipping cache directory without manifest");
            return None;
        }
    };

    let mut entries = Vec::new();
    let mut files = match tokio::fs::read_dir(path).await {
        Ok(files) => files,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "skipping unreadable cache store");
            return None;
        }
    };
    while let Ok(Some(file)) = files.next_entry().await {
        let file = file.path();
        let is_entry = file.extension().and_then(|e| e.to_str()) == Some(EXTENSION)
            && file.file_name().and_then(|n| n.to_str()) != Some(MANIFEST);
        if !is_entry {
            continue;
        }
        match read_json::<EntryRecord>(&file).await {
            Ok(record) => entries.push(record),
            Err(e) => warn!(path = %file.display(), error = %e, "skipping corrupt cache entry"),
        }
    }

    Some(StoreSnapshot {
        name: manifest.name,
        entries,
    })
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, CacheError> {
    let raw = tokio::fs::read(path).await.map_err(io_error(path))?;
    serde_json::from_slice(&raw).map_err(|e| CacheError::Corrupt {
        detail: format!("{}: {e}", path.display()),
    })
}
