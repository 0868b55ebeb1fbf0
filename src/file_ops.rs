//! Miscellaneous functions for working with files.

use std::fs::{self, File, Permissions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Result, SummaryError};

/// Replace the file at `path` atomically.
///
/// `write` fills a temporary file created beside `path`; only once it has
/// returned successfully and the data is flushed and synced is the
/// temporary renamed over `path`. On any failure the temporary is removed
/// and `path` is left untouched.
pub fn write_atomically<T>(
    path: &Path,
    permissions: Option<Permissions>,
    write: impl FnOnce(&mut BufWriter<&mut File>) -> Result<T>,
) -> Result<T> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| SummaryError::io(dir, e))?;
    let tmp_path = tmp.path().to_path_buf();

    let value = {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        let value = write(&mut writer)?;
        writer
            .flush()
            .map_err(|e| SummaryError::io(&tmp_path, e))?;
        value
    };
    if let Some(perms) = permissions {
        fs::set_permissions(&tmp_path, perms).map_err(|e| SummaryError::io(&tmp_path, e))?;
    }
    tmp.as_file()
        .sync_all()
        .map_err(|e| SummaryError::io(&tmp_path, e))?;
    tmp.persist(path)
        .map_err(|e| SummaryError::io(path, e.error))?;
    Ok(value)
}

pub trait IgnoreKinds {
    fn ignore_not_found(self) -> Self;
    fn ignore_already_exists(self) -> Self;
}

impl<R: Default> IgnoreKinds for io::Result<R> {
    fn ignore_not_found(self) -> Self {
        match self {
            Err(e) if io::ErrorKind::NotFound == e.kind() => Ok(R::default()),
            s => s,
        }
    }

    fn ignore_already_exists(self) -> Self {
        match self {
            Err(e) if io::ErrorKind::AlreadyExists == e.kind() => Ok(R::default()),
            s => s,
        }
    }
}

/// Seconds since the epoch, negative for pre-1970 times.
pub fn unix_secs(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// Modification time of `meta` in seconds (0 if the platform has none).
pub fn mtime_secs(meta: &fs::Metadata) -> i64 {
    meta.modified().map(unix_secs).unwrap_or(0)
}

/// How long ago `t` was, saturating at zero for future times.
pub fn age(now: SystemTime, t: SystemTime) -> Duration {
    now.duration_since(t).unwrap_or(Duration::ZERO)
}
