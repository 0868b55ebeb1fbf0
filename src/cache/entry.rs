//! Open cache files shared between callers.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{Result, SummaryError};

/// One open cache file.
///
/// Every caller asking for the same entry while it is open gets the same
/// `Arc<CacheEntry>`, and so the same file position. The cache does not
/// serialize use of a shared handle beyond each single call.
///
/// `Read`, `Write` and `Seek` are implemented for `&CacheEntry`, so a
/// shared handle can be used directly:
///
/// ```no_run
/// # fn demo(cache: &mailsummary::cache::DataCache) -> mailsummary::error::Result<()> {
/// use std::io::Write;
/// let entry = cache.add("bodies", "42")?;
/// (&*entry).write_all(b"hello")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct CacheEntry {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl CacheEntry {
    pub(crate) fn new(path: PathBuf, file: File) -> Self {
        Self {
            path,
            file: Mutex::new(Some(file)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// False once the entry has been replaced or removed from the cache.
    pub fn is_valid(&self) -> bool {
        self.lock().is_some()
    }

    /// Close the file; further I/O on this handle fails.
    pub(crate) fn invalidate(&self) {
        self.lock().take();
    }

    /// Read the whole entry from the start.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut guard = self.lock();
        let file = guard.as_mut().ok_or_else(|| self.invalid())?;
        let mut out = Vec::new();
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_to_end(&mut out))
            .map_err(|e| SummaryError::io(&self.path, e))?;
        Ok(out)
    }

    /// Current size of the file on disk.
    pub fn len(&self) -> Result<u64> {
        let guard = self.lock();
        let file = guard.as_ref().ok_or_else(|| self.invalid())?;
        file.metadata()
            .map(|m| m.len())
            .map_err(|e| SummaryError::io(&self.path, e))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn lock(&self) -> MutexGuard<'_, Option<File>> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn invalid(&self) -> SummaryError {
        SummaryError::InconsistentState(format!(
            "cache entry '{}' was replaced or removed",
            self.path.display()
        ))
    }

    fn with_file<T>(&self, op: impl FnOnce(&mut File) -> io::Result<T>) -> io::Result<T> {
        let mut guard = self.lock();
        match guard.as_mut() {
            Some(file) => op(file),
            None => Err(io::Error::other(self.invalid())),
        }
    }
}

impl Read for &CacheEntry {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.with_file(|f| f.read(buf))
    }
}

impl Write for &CacheEntry {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_file(|f| f.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_file(|f| f.flush())
    }
}

impl Seek for &CacheEntry {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.with_file(|f| f.seek(pos))
    }
}
