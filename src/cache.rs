//! Keyed byte cache for expensive corpus transforms.
//!
//! Cleaned melodies and encodings are cached under content/config
//! fingerprints. The cache is an explicit handle passed into the pipeline —
//! no ambient global state — so tests inject [`MemoryCache`] and production
//! uses [`FsCache`]. Entries are only ever invalidated explicitly (refresh
//! flags), never by age.
//!
//! `FsCache` writes through a temp file in the cache directory and renames
//! into place, so a concurrent writer of the same key can never leave a
//! torn entry.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::Result;

/// Compute a cache key from a namespace and an arbitrary fingerprint string.
pub fn fingerprint_key(namespace: &str, fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update([0u8]);
    hasher.update(fingerprint.as_bytes());
    let digest = hasher.finalize();
    let mut key = String::with_capacity(64);
    for byte in digest {
        key.push_str(&format!("{byte:02x}"));
    }
    key
}

/// Get/put/invalidate over opaque byte values.
pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    fn invalidate(&self, key: &str) -> Result<()>;
}

/// Filesystem-backed cache: one file per key under a root directory.
pub struct FsCache {
    root: PathBuf,
}

impl FsCache {
    pub fn new(root: impl Into<PathBuf>) -> Result<FsCache> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(FsCache { root })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl Cache for FsCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.entry_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        // Write-then-rename keeps concurrent writers of one key atomic.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        std::io::Write::write_all(&mut tmp, value)?;
        tmp.persist(self.entry_path(key))
            .map_err(|e| crate::Error::Io(e.error))?;
        Ok(())
    }

    fn invalidate(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.entry_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory cache for tests.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> MemoryCache {
        MemoryCache::default()
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn invalidate(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}
