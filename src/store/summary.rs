//! Store summary: one record per folder of an account.
//!
//! ```text
//! HEADER   version:int32 flags:int32 mtime:time_t count:int32
//! RECORD   path:string flags:uint32 unread:int32 total:int32
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::codec::{Decoder, Encoder, DEFAULT_MAX_STRING_LEN};
use crate::error::{Result, SummaryError};
use crate::file_ops;
use crate::model::{FolderFlags, StoreInfo};
use crate::summary::header::{check_version, CURRENT_VERSION};
use crate::summary::locks::{IoGuard, OrderedLocks};
use crate::summary::PREALLOC_LIMIT;

const TIME64_VERSION: i32 = 3;

#[derive(Default)]
struct StoreState {
    flags: u32,
    mtime: i64,
    infos: Vec<Arc<StoreInfo>>,
    by_path: HashMap<String, Arc<StoreInfo>>,
}

/// Folder-existence metadata for one account, backed by one file.
pub struct StoreSummary {
    path: PathBuf,
    uri_base: String,
    max_string_len: usize,
    locks: OrderedLocks<StoreState>,
    dirty: AtomicBool,
    loaded: AtomicBool,
}

impl StoreSummary {
    /// `uri_base` is prefixed to folder paths to form their uris.
    pub fn new(path: impl AsRef<Path>, uri_base: impl Into<String>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            uri_base: uri_base.into(),
            max_string_len: DEFAULT_MAX_STRING_LEN,
            locks: OrderedLocks::new(StoreState::default()),
            dirty: AtomicBool::new(false),
            loaded: AtomicBool::new(false),
        }
    }

    pub fn with_max_string_len(mut self, len: usize) -> Self {
        self.max_string_len = len;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Replace the in-memory records with the file contents.
    pub fn load(&self) -> Result<()> {
        let io = self.locks.io();
        self.load_locked(&io)
    }

    fn load_locked(&self, io: &IoGuard<'_, StoreState>) -> Result<()> {
        self.loaded.store(false, Ordering::Release);
        let file = File::open(&self.path).map_err(|e| SummaryError::io(&self.path, e))?;
        let mut dec = Decoder::new(BufReader::new(file));
        dec.set_max_string_len(self.max_string_len);

        let version = dec.read_i32()?;
        check_version(version)?;
        dec.set_time64(version >= TIME64_VERSION);
        let flags = dec.read_i32()? as u32;
        let mtime = dec.read_time()?;
        let count = dec.read_i32()?;
        let count = u32::try_from(count)
            .map_err(|_| SummaryError::corrupt(format!("negative folder count {count}")))?;

        let capacity = (count as usize).min(PREALLOC_LIMIT);
        let mut infos = Vec::with_capacity(capacity);
        let mut by_path = HashMap::with_capacity(capacity);
        for n in 0..count {
            let info = Arc::new(decode_info(&mut dec)?);
            let path = info.path();
            if path.is_empty() {
                return Err(SummaryError::corrupt(format!("folder record {n} has no path")));
            }
            if by_path.insert(path.clone(), Arc::clone(&info)).is_some() {
                return Err(SummaryError::corrupt(format!("duplicate folder '{path}'")));
            }
            infos.push(info);
        }

        {
            let mut state = io.state();
            state.flags = flags;
            state.mtime = mtime;
            state.infos = infos;
            state.by_path = by_path;
        }
        self.dirty.store(false, Ordering::Release);
        self.loaded.store(true, Ordering::Release);
        debug!(path = %self.path.display(), version, count, "Loaded store summary");
        Ok(())
    }

    /// Write the file if dirty. Returns whether a write happened.
    pub fn save(&self) -> Result<bool> {
        let io = self.locks.io();
        if !self.is_dirty() {
            return Ok(false);
        }
        let (flags, mtime, infos) = {
            let state = io.state();
            self.dirty.store(false, Ordering::Release);
            (state.flags, chrono::Utc::now().timestamp(), state.infos.clone())
        };

        let result = file_ops::write_atomically(&self.path, None, |w| {
            let mut enc = Encoder::new(w);
            enc.set_max_string_len(self.max_string_len);
            enc.set_time64(true);
            enc.write_i32(CURRENT_VERSION)?;
            enc.write_i32(flags as i32)?;
            enc.write_time(mtime)?;
            enc.write_i32(infos.len() as i32)?;
            for info in &infos {
                enc.write_string(&info.path())?;
                enc.write_uint32(info.flags().bits())?;
                enc.write_i32(info.unread())?;
                enc.write_i32(info.total())?;
            }
            Ok(())
        });
        match result {
            Ok(()) => {
                io.state().mtime = mtime;
                info!(path = %self.path.display(), count = infos.len(), "Store summary written");
                Ok(true)
            }
            Err(e) => {
                self.mark_dirty();
                Err(e)
            }
        }
    }

    /// Time of the last successful save.
    pub fn mtime(&self) -> i64 {
        self.locks.state().mtime
    }

    pub fn count(&self) -> usize {
        self.locks.state().infos.len()
    }

    /// Add a record; a path already present is rejected.
    pub fn add(&self, info: StoreInfo) -> Result<Arc<StoreInfo>> {
        let path = info.path();
        if path.is_empty() {
            return Err(SummaryError::InconsistentState(
                "cannot add a folder with an empty path".into(),
            ));
        }
        let mut state = self.locks.state();
        if state.by_path.contains_key(&path) {
            warn!(path = %path, "Duplicate folder path, record not added");
            return Err(SummaryError::AlreadyExists(format!("folder '{path}'")));
        }
        let info = Arc::new(info);
        state.by_path.insert(path, Arc::clone(&info));
        state.infos.push(Arc::clone(&info));
        drop(state);
        self.mark_dirty();
        Ok(info)
    }

    /// Add a record for `path`, or return the existing one.
    pub fn add_from_path(&self, path: &str) -> Result<Arc<StoreInfo>> {
        if let Some(existing) = self.lookup_path(path) {
            return Ok(existing);
        }
        match self.add(StoreInfo::new(path, FolderFlags::empty())) {
            Err(SummaryError::AlreadyExists(_)) => self
                .lookup_path(path)
                .ok_or_else(|| SummaryError::NotFound(format!("folder '{path}'"))),
            other => other,
        }
    }

    /// The folder's uri: this summary's base followed by its path.
    pub fn info_uri(&self, info: &StoreInfo) -> String {
        info.uri(&self.uri_base)
    }

    pub fn lookup_index(&self, index: usize) -> Option<Arc<StoreInfo>> {
        self.locks.state().infos.get(index).cloned()
    }

    pub fn lookup_path(&self, path: &str) -> Option<Arc<StoreInfo>> {
        self.locks.state().by_path.get(path).cloned()
    }

    /// Point-in-time copy of every record.
    pub fn array(&self) -> Vec<Arc<StoreInfo>> {
        self.locks.state().infos.clone()
    }

    fn require(&self, path: &str) -> Result<Arc<StoreInfo>> {
        self.lookup_path(path)
            .ok_or_else(|| SummaryError::NotFound(format!("folder '{path}'")))
    }

    /// Record message counts for a folder. Returns whether they changed.
    pub fn set_counts(&self, path: &str, unread: i32, total: i32) -> Result<bool> {
        let info = self.require(path)?;
        let changed = info.store_counts(unread, total);
        if changed {
            self.mark_dirty();
        }
        Ok(changed)
    }

    pub fn set_info_flags(&self, path: &str, mask: FolderFlags, set: FolderFlags) -> Result<bool> {
        let info = self.require(path)?;
        let prev = info.update_flags(mask, set);
        let changed = prev != info.flags();
        if changed {
            self.mark_dirty();
        }
        Ok(changed)
    }

    /// Move a record to a new path, keeping its flags and counts.
    pub fn rename(&self, old: &str, new: &str) -> Result<Arc<StoreInfo>> {
        if new.is_empty() {
            return Err(SummaryError::InconsistentState(
                "cannot rename a folder to an empty path".into(),
            ));
        }
        let mut state = self.locks.state();
        if state.by_path.contains_key(new) {
            return Err(SummaryError::AlreadyExists(format!("folder '{new}'")));
        }
        let info = state
            .by_path
            .remove(old)
            .ok_or_else(|| SummaryError::NotFound(format!("folder '{old}'")))?;
        info.set_path(new.to_string());
        state.by_path.insert(new.to_string(), Arc::clone(&info));
        drop(state);
        self.mark_dirty();
        debug!(from = old, to = new, "Renamed folder");
        Ok(info)
    }

    pub fn remove_path(&self, path: &str) -> Result<Arc<StoreInfo>> {
        let mut state = self.locks.state();
        let info = state
            .by_path
            .remove(path)
            .ok_or_else(|| SummaryError::NotFound(format!("folder '{path}'")))?;
        state.infos.retain(|i| !Arc::ptr_eq(i, &info));
        drop(state);
        self.mark_dirty();
        Ok(info)
    }

    pub fn remove_index(&self, index: usize) -> Result<Arc<StoreInfo>> {
        let mut state = self.locks.state();
        if index >= state.infos.len() {
            return Err(SummaryError::NotFound(format!("index {index}")));
        }
        let info = state.infos.remove(index);
        state.by_path.remove(&info.path());
        drop(state);
        self.mark_dirty();
        Ok(info)
    }

    /// Drop every record.
    pub fn clear(&self) {
        let mut state = self.locks.state();
        if state.infos.is_empty() {
            return;
        }
        state.infos.clear();
        state.by_path.clear();
        drop(state);
        self.mark_dirty();
    }
}

fn decode_info<R: Read>(dec: &mut Decoder<R>) -> Result<StoreInfo> {
    let path = dec.read_string()?;
    let flags = FolderFlags::from_bits_retain(dec.read_uint32()?);
    let unread = dec.read_i32()?;
    let total = dec.read_i32()?;
    let info = StoreInfo::new(path, flags);
    info.store_counts(unread, total);
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_from_path_returns_existing() {
        let dir = tempfile::tempdir().unwrap();
        let s = StoreSummary::new(dir.path().join("store"), "mbox:/mail/");
        let a = s.add_from_path("INBOX").unwrap();
        let b = s.add_from_path("INBOX").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(s.count(), 1);
        assert_eq!(s.info_uri(&a), "mbox:/mail/INBOX");
    }

    #[test]
    fn test_remove_index_keeps_map_in_step() {
        let dir = tempfile::tempdir().unwrap();
        let s = StoreSummary::new(dir.path().join("store"), "");
        s.add_from_path("a").unwrap();
        s.add_from_path("b").unwrap();
        let removed = s.remove_index(0).unwrap();
        assert_eq!(removed.path(), "a");
        assert!(s.lookup_path("a").is_none());
        assert_eq!(s.lookup_index(0).unwrap().path(), "b");
    }
}
