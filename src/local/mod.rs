//! Summaries of local mail folders (mbox, maildir, MH).
//!
//! A local summary reconciles the persisted index with the live folder in
//! two phases. `check` absorbs changes made behind our back; `sync` writes
//! in-memory flag changes to the folder, optionally expunging, and then
//! saves the summary. Both run under the summary's io lock.

pub mod maildir;
pub mod mbox;
pub mod mh;
pub mod xev;

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{Result, SummaryError};
use crate::model::MessageFlags;
use crate::summary::{ChangeInfo, ChangeSink, FolderSummary, Info, SummaryFormat};

pub use maildir::{MaildirExtra, MaildirFormat};
pub use mbox::{MboxExtra, MboxFormat};
pub use mh::MhFormat;

/// Folder-specific reconciliation.
///
/// These are invoked through [`FolderSummary`], which holds the io lock
/// for the duration of each call.
pub trait LocalFormat: SummaryFormat {
    /// Bring the summary in line with the folder on disk.
    ///
    /// On error the summary is left as it was before the call.
    fn check(&self, summary: &FolderSummary<Self>, changes: &mut ChangeInfo) -> Result<()>;

    /// Write pending flag changes to the folder, removing deleted
    /// messages when `expunge` is set.
    fn sync(
        &self,
        summary: &FolderSummary<Self>,
        expunge: bool,
        changes: &mut ChangeInfo,
    ) -> Result<()>;

    /// Store a new message in the folder and add its record.
    fn append_message(
        &self,
        summary: &FolderSummary<Self>,
        raw: &[u8],
        flags: MessageFlags,
    ) -> Result<Info<Self>>;

    /// Raw bytes of one message.
    fn read_message(&self, summary: &FolderSummary<Self>, info: &Info<Self>) -> Result<Vec<u8>>;
}

impl<F: LocalFormat> FolderSummary<F> {
    /// Load the summary file, then check it against the folder.
    ///
    /// A missing summary starts empty. An unreadable one is discarded and
    /// rebuilt from the folder.
    pub fn open(&self, changes: &mut ChangeInfo) -> Result<()> {
        let io = self.io();
        match self.load_locked(&io) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(path = %self.path().display(), "No summary file, starting empty");
                self.reset_locked(&io);
            }
            Err(e @ (SummaryError::CorruptRecord { .. } | SummaryError::UnsupportedVersion { .. })) => {
                warn!(
                    path = %self.path().display(),
                    error = %e,
                    "Discarding unreadable summary, rebuilding from folder"
                );
                self.reset_locked(&io);
            }
            Err(e) => return Err(e),
        }
        self.format().check(self, changes)
    }

    pub fn check(&self, changes: &mut ChangeInfo) -> Result<()> {
        let _io = self.io();
        self.format().check(self, changes)
    }

    /// Write changes back to the folder and save the summary.
    pub fn sync(&self, expunge: bool, changes: &mut ChangeInfo) -> Result<()> {
        let io = self.io();
        self.format().sync(self, expunge, changes)?;
        self.save_locked(&io)?;
        Ok(())
    }

    /// [`check`](Self::check), then hand a non-empty change set to `sink`.
    pub fn check_and_notify(&self, sink: &dyn ChangeSink) -> Result<ChangeInfo> {
        let mut changes = ChangeInfo::new();
        self.check(&mut changes)?;
        if !changes.is_empty() {
            sink.notify(&changes);
        }
        Ok(changes)
    }

    /// [`sync`](Self::sync), then hand a non-empty change set to `sink`.
    pub fn sync_and_notify(&self, expunge: bool, sink: &dyn ChangeSink) -> Result<ChangeInfo> {
        let mut changes = ChangeInfo::new();
        self.sync(expunge, &mut changes)?;
        if !changes.is_empty() {
            sink.notify(&changes);
        }
        Ok(changes)
    }

    pub fn append_message(&self, raw: &[u8], flags: MessageFlags) -> Result<Info<F>> {
        let _io = self.io();
        self.format().append_message(self, raw, flags)
    }

    pub fn read_message(&self, uid: &str) -> Result<Vec<u8>> {
        let _io = self.io();
        let info = self
            .lookup_uid(uid)
            .ok_or_else(|| SummaryError::NotFound(format!("uid {uid}")))?;
        self.format().read_message(self, &info)
    }
}

/// Flags after a sync has written a record back.
fn synced(flags: MessageFlags) -> MessageFlags {
    flags - MessageFlags::SYNC_PENDING
}

/// Whether a record has changes the folder does not reflect yet.
fn needs_sync(flags: MessageFlags) -> bool {
    flags.intersects(MessageFlags::SYNC_PENDING)
}

/// Header blocks beyond this size are truncated.
const MAX_HEADER_SIZE: usize = 1024 * 1024;

/// Header block of a one-message file, plus the file size.
fn read_file_headers(path: &Path) -> io::Result<(Vec<u8>, u64)> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut headers = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 || line == b"\n" || line == b"\r\n" {
            break;
        }
        if headers.len() + line.len() <= MAX_HEADER_SIZE {
            headers.extend_from_slice(&line);
        }
    }
    Ok((headers, size))
}
