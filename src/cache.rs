//! Cache Layer - compiled fragments keyed by view identity and fingerprint
//!
//! Entries are immutable: a changed view gets a new fingerprint and therefore
//! new keys. Stale entries stay in the store until [`FragmentCache::prune`]
//! removes them; the in-process memo keeps only the latest revision per view.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::compiler::{Block, CompiledFragment};
use crate::hashing::{block_key, fragment_key, view_key};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Cache encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Cache lock poisoned")]
    Poisoned,
}

/// Opaque key -> blob storage
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;
    fn put(&self, key: &str, blob: &[u8]) -> Result<(), CacheError>;
    fn remove(&self, key: &str) -> Result<(), CacheError>;
    fn keys(&self) -> Result<Vec<String>, CacheError>;
}

const ENTRY_SUFFIX: &str = ".json";

/// One file per key under a cache directory
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{}", key, ENTRY_SUFFIX))
    }
}

impl CacheStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        match fs::read(self.path(key)) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // Write-then-rename: readers see the old entry or the new one, never a torn file
    fn put(&self, key: &str, blob: &[u8]) -> Result<(), CacheError> {
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(blob)?;
        tmp.flush()?;
        tmp.persist(self.path(key)).map_err(|e| CacheError::Io(e.error))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            if let Some(key) = name.to_str().and_then(|n| n.strip_suffix(ENTRY_SUFFIX)) {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// In-process store, used when no cache directory is configured
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<MutexGuard<'_, BTreeMap<String, Vec<u8>>>, CacheError> {
        self.entries.lock().map_err(|_| CacheError::Poisoned)
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn put(&self, key: &str, blob: &[u8]) -> Result<(), CacheError> {
        self.entries()?.insert(key.to_string(), blob.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.entries()?.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.entries()?.keys().cloned().collect())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub memoized: usize,
}

/// Compiled fragment cache over a [`CacheStore`]
pub struct FragmentCache {
    store: Box<dyn CacheStore>,
    memo: Mutex<HashMap<String, Arc<CompiledFragment>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FragmentCache {
    pub fn new(store: Box<dyn CacheStore>) -> Self {
        Self {
            store,
            memo: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn memo(&self) -> Result<MutexGuard<'_, HashMap<String, Arc<CompiledFragment>>>, CacheError> {
        self.memo.lock().map_err(|_| CacheError::Poisoned)
    }

    /// Look up a compiled fragment; `None` means compile it.
    ///
    /// A missing or undecodable block counts as a miss for the whole fragment.
    pub fn load(&self, view: &str, fingerprint: &str) -> Result<Option<Arc<CompiledFragment>>, CacheError> {
        let key = fragment_key(view, fingerprint);
        if let Some(fragment) = self.memo()?.get(&key).cloned() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(view, key = %key, "memo hit");
            return Ok(Some(fragment));
        }

        let Some(mut fragment) = self.decode::<CompiledFragment>(&key)? else {
            return Ok(self.miss(view, &key));
        };
        for name in fragment.block_names.clone() {
            let Some(block) = self.decode::<Block>(&block_key(view, &name, fingerprint))? else {
                return Ok(self.miss(view, &key));
            };
            fragment.blocks.insert(name, Arc::new(block));
        }

        let fragment = Arc::new(fragment);
        self.remember(view, key.clone(), Arc::clone(&fragment))?;
        self.hits.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(view, key = %key, "cache hit");
        Ok(Some(fragment))
    }

    fn miss(&self, view: &str, key: &str) -> Option<Arc<CompiledFragment>> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(view, key, "cache miss");
        None
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let Some(blob) = self.store.get(key)? else {
            return Ok(None);
        };
        match serde_json::from_slice(&blob) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(key, error = %e, "discarding corrupt cache entry");
                Ok(None)
            }
        }
    }

    /// Persist every block, then the fragment that refers to them
    pub fn store(&self, fragment: &Arc<CompiledFragment>) -> Result<(), CacheError> {
        for (name, block) in &fragment.blocks {
            let blob = serde_json::to_vec(block.as_ref())?;
            self.store.put(&block_key(&fragment.view, name, &fragment.fingerprint), &blob)?;
        }
        let key = fragment_key(&fragment.view, &fragment.fingerprint);
        self.store.put(&key, &serde_json::to_vec(fragment.as_ref())?)?;
        self.remember(&fragment.view, key, Arc::clone(fragment))
    }

    /// Memoize `fragment`, replacing any other revision of the same view
    fn remember(&self, view: &str, key: String, fragment: Arc<CompiledFragment>) -> Result<(), CacheError> {
        let prefix = format!("{}-", view_key(view));
        let mut memo = self.memo()?;
        memo.retain(|k, _| !k.starts_with(&prefix));
        memo.insert(key, fragment);
        Ok(())
    }

    /// Remove entries of `view` that belong to any other fingerprint
    pub fn prune(&self, view: &str, live_fingerprint: &str) -> Result<usize, CacheError> {
        let prefix = format!("{}-", view_key(view));
        let live = fragment_key(view, live_fingerprint);
        let mut removed = 0;
        for key in self.store.keys()? {
            if key.starts_with(&prefix) && !key.starts_with(&live) {
                self.store.remove(&key)?;
                removed += 1;
            }
        }
        self.memo()?.retain(|key, _| !key.starts_with(&prefix) || key.starts_with(&live));
        tracing::info!(view, removed, "pruned stale cache entries");
        Ok(removed)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            memoized: self.memo().map_or(0, |memo| memo.len()),
        }
    }
}
