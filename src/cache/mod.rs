//! Content-addressed disk cache.
//!
//! An entry `(subpath, key)` lives at
//! `<root>/<subpath>/<shard>/<safe key>`, where the shard is two or more
//! hex digits taken from a hash of the key. Old entries are expired lazily:
//! whenever a shard directory is touched and its last sweep is older than
//! the expiry cycle, files past the age or access thresholds are removed.
//!
//! Open entries are registered so that concurrent callers share one handle
//! instead of racing on independent ones.

mod entry;

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::{Result, SummaryError};
use crate::file_ops::{age, IgnoreKinds};

pub use entry::CacheEntry;

/// Zero-byte companion files stored beside an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMarker {
    /// Only a prefix of the content has been fetched.
    Partial,
    /// Remote images may be loaded for this message.
    GetImages,
}

impl CacheMarker {
    fn suffix(self) -> &'static str {
        match self {
            CacheMarker::Partial => ".ispartial",
            CacheMarker::GetImages => ".getimages",
        }
    }
}

#[derive(Debug)]
struct Settings {
    root: PathBuf,
    expire_age: Option<Duration>,
    expire_access: Option<Duration>,
}

pub struct DataCache {
    settings: Mutex<Settings>,
    shard_mask: u32,
    expire_cycle: Duration,
    open: Mutex<HashMap<PathBuf, Weak<CacheEntry>>>,
    sweeps: Mutex<HashMap<PathBuf, SystemTime>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DataCache {
    /// A cache under `root` with default sharding and no expiry.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self::with_config(root, &CacheConfig::default())
    }

    pub fn with_config(root: impl AsRef<Path>, config: &CacheConfig) -> Self {
        let bits = config.shard_bits.clamp(1, 16);
        Self {
            settings: Mutex::new(Settings {
                root: root.as_ref().to_path_buf(),
                expire_age: config.expire_age(),
                expire_access: config.expire_access(),
            }),
            shard_mask: (1 << bits) - 1,
            expire_cycle: config.expire_cycle(),
            open: Mutex::new(HashMap::new()),
            sweeps: Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> PathBuf {
        lock(&self.settings).root.clone()
    }

    /// Move the cache root. Open handles keep their files.
    pub fn set_path(&self, root: impl AsRef<Path>) {
        lock(&self.settings).root = root.as_ref().to_path_buf();
        lock(&self.sweeps).clear();
    }

    /// Remove entries not modified for `age` (`None` disables).
    pub fn set_expire_age(&self, age: Option<Duration>) {
        lock(&self.settings).expire_age = age;
    }

    /// Remove entries not accessed for `age` (`None` disables).
    pub fn set_expire_access(&self, age: Option<Duration>) {
        lock(&self.settings).expire_access = age;
    }

    /// Shard number of `key`.
    pub fn shard_of(&self, key: &str) -> u32 {
        (key_hash(key) >> 5) & self.shard_mask
    }

    /// Where the entry `(subpath, key)` lives. Touches nothing on disk.
    pub fn get_filename(&self, subpath: &str, key: &str) -> Result<PathBuf> {
        Ok(self.shard_dir(subpath, key)?.join(safe_filename(key)))
    }

    fn shard_dir(&self, subpath: &str, key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            return Err(SummaryError::InconsistentState(
                "cache key must not be empty".into(),
            ));
        }
        let sub = Path::new(subpath);
        if !sub.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(SummaryError::InconsistentState(format!(
                "cache subpath '{subpath}' must be relative and plain"
            )));
        }
        Ok(self
            .path()
            .join(sub)
            .join(format!("{:02x}", self.shard_of(key))))
    }

    /// Resolve an entry for use, creating its shard directory if asked and
    /// giving the shard a chance to expire old files.
    fn access(&self, subpath: &str, key: &str, create: bool) -> Result<PathBuf> {
        let dir = self.shard_dir(subpath, key)?;
        let path = dir.join(safe_filename(key));
        if create && !dir.is_dir() {
            fs::create_dir_all(&dir).map_err(|e| SummaryError::io(&dir, e))?;
        } else {
            self.maybe_expire(&dir, &path);
        }
        Ok(path)
    }

    /// Create (or truncate) an entry and open it read-write.
    ///
    /// An entry already open elsewhere is closed and its file replaced.
    pub fn add(&self, subpath: &str, key: &str) -> Result<Arc<CacheEntry>> {
        let path = self.access(subpath, key, true)?;
        let mut open = lock(&self.open);
        if let Some(existing) = open.remove(&path).and_then(|w| w.upgrade()) {
            warn!(path = %path.display(), "Cache entry re-added while open, replacing it");
            existing.invalidate();
        }
        fs::remove_file(&path)
            .ignore_not_found()
            .map_err(|e| SummaryError::io(&path, e))?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| SummaryError::io(&path, e))?;
        let entry = Arc::new(CacheEntry::new(path.clone(), file));
        open.retain(|_, w| w.strong_count() > 0);
        open.insert(path, Arc::downgrade(&entry));
        Ok(entry)
    }

    /// Open an existing entry, or return the handle already open.
    pub fn get(&self, subpath: &str, key: &str) -> Result<Arc<CacheEntry>> {
        let path = self.access(subpath, key, false)?;
        let mut open = lock(&self.open);
        if let Some(existing) = open.get(&path).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SummaryError::NotFound(format!("cache entry '{subpath}/{key}'")));
            }
            Err(e) => return Err(SummaryError::io(&path, e)),
        };
        let entry = Arc::new(CacheEntry::new(path.clone(), file));
        open.retain(|_, w| w.strong_count() > 0);
        open.insert(path, Arc::downgrade(&entry));
        Ok(entry)
    }

    /// Close any open handle and delete the entry with its markers.
    /// A missing entry is not an error.
    pub fn remove(&self, subpath: &str, key: &str) -> Result<()> {
        let path = self.access(subpath, key, false)?;
        if let Some(existing) = lock(&self.open).remove(&path).and_then(|w| w.upgrade()) {
            existing.invalidate();
        }
        for p in [
            path.clone(),
            marker_path(&path, CacheMarker::Partial),
            marker_path(&path, CacheMarker::GetImages),
        ] {
            fs::remove_file(&p)
                .ignore_not_found()
                .map_err(|e| SummaryError::io(&p, e))?;
        }
        debug!(path = %path.display(), "Removed cache entry");
        Ok(())
    }

    /// Delete everything under `subpath`, closing open handles there.
    pub fn clear(&self, subpath: &str) -> Result<()> {
        let sub = Path::new(subpath);
        if !sub.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(SummaryError::InconsistentState(format!(
                "cache subpath '{subpath}' must be relative and plain"
            )));
        }
        let dir = self.path().join(sub);
        {
            let mut open = lock(&self.open);
            open.retain(|path, weak| {
                if !path.starts_with(&dir) {
                    return true;
                }
                if let Some(entry) = weak.upgrade() {
                    entry.invalidate();
                }
                false
            });
        }
        lock(&self.sweeps).retain(|shard, _| !shard.starts_with(&dir));
        fs::remove_dir_all(&dir)
            .ignore_not_found()
            .map_err(|e| SummaryError::io(&dir, e))
    }

    /// Set or clear a marker beside an entry.
    pub fn set_marker(&self, subpath: &str, key: &str, marker: CacheMarker, on: bool) -> Result<()> {
        let path = marker_path(&self.access(subpath, key, on)?, marker);
        let result = if on {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .map(drop)
        } else {
            fs::remove_file(&path).ignore_not_found()
        };
        result.map_err(|e| SummaryError::io(&path, e))
    }

    pub fn has_marker(&self, subpath: &str, key: &str, marker: CacheMarker) -> Result<bool> {
        Ok(marker_path(&self.get_filename(subpath, key)?, marker).is_file())
    }

    fn maybe_expire(&self, dir: &Path, keep: &Path) {
        let (expire_age, expire_access) = {
            let s = lock(&self.settings);
            (s.expire_age, s.expire_access)
        };
        if expire_age.is_none() && expire_access.is_none() {
            return;
        }
        let now = SystemTime::now();
        {
            let mut sweeps = lock(&self.sweeps);
            if let Some(last) = sweeps.get(dir) {
                if age(now, *last) < self.expire_cycle {
                    return;
                }
            }
            sweeps.insert(dir.to_path_buf(), now);
        }

        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Cache expiry sweep failed");
                return;
            }
        };
        let in_use: Vec<PathBuf> = lock(&self.open)
            .iter()
            .filter(|(_, w)| w.strong_count() > 0)
            .map(|(p, _)| p.clone())
            .collect();

        let mut removed = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            if path == keep || in_use.contains(&path) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let too_old = |limit: Option<Duration>, t: io::Result<SystemTime>| match (limit, t) {
                (Some(limit), Ok(t)) => age(now, t) > limit,
                _ => false,
            };
            if too_old(expire_age, meta.modified()) || too_old(expire_access, meta.accessed()) {
                match fs::remove_file(&path).ignore_not_found() {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Could not expire cache file");
                    }
                }
            }
        }
        if removed > 0 {
            debug!(dir = %dir.display(), removed, "Expired cache files");
        }
    }
}

impl Default for DataCache {
    /// A cache in the per-user cache directory.
    fn default() -> Self {
        Self::new(crate::config::cache_dir(&crate::config::Config::default()).join("data"))
    }
}

/// The classic `h * 33 + c` string hash.
pub fn key_hash(key: &str) -> u32 {
    key.bytes()
        .fold(5381u32, |h, b| h.wrapping_mul(33).wrapping_add(u32::from(b)))
}

/// Percent-encode `key` so it is a single, non-hidden path component.
pub fn safe_filename(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for (i, b) in key.bytes().enumerate() {
        let plain = b.is_ascii_alphanumeric() || b"._-@+=,".contains(&b);
        if plain && !(i == 0 && b == b'.') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn marker_path(path: &Path, marker: CacheMarker) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(marker.suffix());
    PathBuf::from(name)
}
