//! The folder summary: an ordered, uid-indexed, persistent set of
//! [`MessageInfo`] records.
//!
//! The record list keeps insertion order, which is also on-disk order (and,
//! for mbox, file order). A uid index over the same records answers
//! lookups. Every mutation sets the dirty flag, and [`FolderSummary::save`]
//! only writes when it is set.

pub mod changes;
pub mod header;
pub(crate) mod locks;

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::fmt::Debug;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::codec::{Decoder, Encoder, DEFAULT_MAX_STRING_LEN};
use crate::config::SummaryConfig;
use crate::error::{Result, SummaryError};
use crate::file_ops;
use crate::model::{MessageFlags, MessageInfo};

pub use changes::{ChangeInfo, ChangeSink};
pub use header::{SummaryHeader, CURRENT_VERSION, MIN_SUPPORTED_VERSION};

use locks::{IoGuard, OrderedLocks, StateGuard};

/// Upper bound on records reserved up front when loading.
pub(crate) const PREALLOC_LIMIT: usize = 4096;

/// Shared handle to a record of format `F`.
pub type Info<F> = Arc<MessageInfo<<F as SummaryFormat>::Extra>>;

/// Per-format encoding of the parts of the summary file the base layout
/// does not cover.
pub trait SummaryFormat: Send + Sync + Sized {
    /// Payload carried by every record.
    type Extra: Send + Sync + Debug;
    /// Extra header fields.
    type HeaderExtra: Send + Clone + Default + Debug;

    fn decode_header_extra<R: Read>(&self, dec: &mut Decoder<R>) -> Result<Self::HeaderExtra>;

    fn encode_header_extra<W: Write>(
        &self,
        extra: &Self::HeaderExtra,
        enc: &mut Encoder<W>,
    ) -> Result<()>;

    fn decode_record_extra<R: Read>(&self, dec: &mut Decoder<R>) -> Result<Self::Extra>;

    fn encode_record_extra<W: Write>(&self, extra: &Self::Extra, enc: &mut Encoder<W>)
        -> Result<()>;
}

/// Options shared by every summary.
#[derive(Debug, Clone)]
pub struct SummaryOptions {
    /// Upper bound on any string field, on read and write.
    pub max_string_len: usize,
    /// Allow mbox quick sync.
    pub quick_sync: bool,
}

impl Default for SummaryOptions {
    fn default() -> Self {
        Self {
            max_string_len: DEFAULT_MAX_STRING_LEN,
            quick_sync: true,
        }
    }
}

impl From<&SummaryConfig> for SummaryOptions {
    fn from(cfg: &SummaryConfig) -> Self {
        Self {
            max_string_len: cfg.max_string_len,
            quick_sync: cfg.quick_sync,
        }
    }
}

pub(crate) struct SummaryState<F: SummaryFormat> {
    pub(crate) flags: u32,
    pub(crate) nextuid: u32,
    pub(crate) mtime: i64,
    pub(crate) header_extra: F::HeaderExtra,
    infos: Vec<Info<F>>,
    by_uid: HashMap<String, Info<F>>,
}

impl<F: SummaryFormat> SummaryState<F> {
    fn empty() -> Self {
        Self {
            flags: 0,
            nextuid: 1,
            mtime: 0,
            header_extra: F::HeaderExtra::default(),
            infos: Vec::new(),
            by_uid: HashMap::new(),
        }
    }
}

/// A message summary backed by one file.
pub struct FolderSummary<F: SummaryFormat> {
    path: PathBuf,
    format: F,
    options: SummaryOptions,
    locks: OrderedLocks<SummaryState<F>>,
    dirty: AtomicBool,
    loaded: AtomicBool,
}

impl<F: SummaryFormat> FolderSummary<F> {
    pub fn new(path: impl AsRef<Path>, format: F, options: SummaryOptions) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            format,
            options,
            locks: OrderedLocks::new(SummaryState::empty()),
            dirty: AtomicBool::new(false),
            loaded: AtomicBool::new(false),
        }
    }

    /// Path of the summary file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> &F {
        &self.format
    }

    pub fn options(&self) -> &SummaryOptions {
        &self.options
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Whether the last `load` succeeded.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Mark the summary dirty without changing any record.
    pub fn touch(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    // ── Load / save ─────────────────────────────────────────────────

    /// Replace the in-memory records with the contents of the summary file.
    ///
    /// On any failure the previous in-memory contents are kept, but the
    /// summary is marked not loaded.
    pub fn load(&self) -> Result<()> {
        let io = self.locks.io();
        self.load_locked(&io)
    }

    pub(crate) fn load_locked(&self, io: &IoGuard<'_, SummaryState<F>>) -> Result<()> {
        self.loaded.store(false, Ordering::Release);
        let file = File::open(&self.path).map_err(|e| SummaryError::io(&self.path, e))?;
        let mut dec = Decoder::new(BufReader::new(file));
        dec.set_max_string_len(self.options.max_string_len);

        let header = SummaryHeader::decode(&mut dec)?;
        let header_extra = self.format.decode_header_extra(&mut dec)?;

        // The count is untrusted until the records behind it decode.
        let capacity = (header.count as usize).min(PREALLOC_LIMIT);
        let mut infos = Vec::with_capacity(capacity);
        let mut by_uid = HashMap::with_capacity(capacity);
        for n in 0..header.count {
            let info = Arc::new(self.decode_info(&mut dec).map_err(|e| {
                warn!(
                    path = %self.path.display(),
                    record = n,
                    error = %e,
                    "Summary record decode failed"
                );
                e
            })?);
            if info.uid().is_empty() {
                return Err(SummaryError::corrupt(format!("record {n} has an empty uid")));
            }
            if by_uid
                .insert(info.uid().to_string(), Arc::clone(&info))
                .is_some()
            {
                return Err(SummaryError::corrupt(format!(
                    "duplicate uid '{}' in summary",
                    info.uid()
                )));
            }
            infos.push(info);
        }

        {
            let mut state = io.state();
            state.flags = header.flags;
            state.nextuid = header.nextuid.max(1);
            state.mtime = header.mtime;
            state.header_extra = header_extra;
            state.infos = infos;
            state.by_uid = by_uid;
        }
        self.dirty.store(false, Ordering::Release);
        self.loaded.store(true, Ordering::Release);
        debug!(
            path = %self.path.display(),
            version = header.version,
            count = header.count,
            "Loaded summary"
        );
        Ok(())
    }

    /// Write the summary if it is dirty. Returns whether a write happened.
    ///
    /// The file is replaced atomically; a failed save leaves the previous
    /// file untouched and the summary still dirty.
    pub fn save(&self) -> Result<bool> {
        let io = self.locks.io();
        self.save_locked(&io)
    }

    pub(crate) fn save_locked(&self, io: &IoGuard<'_, SummaryState<F>>) -> Result<bool> {
        if !self.is_dirty() {
            debug!(path = %self.path.display(), "Summary clean, not saving");
            return Ok(false);
        }

        let (header, header_extra, infos) = {
            let state = io.state();
            // Cleared under the state lock so a concurrent mutation re-dirties.
            self.dirty.store(false, Ordering::Release);
            let unread = state
                .infos
                .iter()
                .filter(|i| !i.has(MessageFlags::SEEN))
                .count() as u32;
            let deleted = state
                .infos
                .iter()
                .filter(|i| i.has(MessageFlags::DELETED))
                .count() as u32;
            let header = SummaryHeader {
                version: CURRENT_VERSION,
                flags: state.flags,
                nextuid: state.nextuid,
                mtime: state.mtime,
                count: state.infos.len() as u32,
                unread,
                deleted,
            };
            (header, state.header_extra.clone(), state.infos.clone())
        };

        let result = file_ops::write_atomically(&self.path, None, |w| {
            let mut enc = Encoder::new(w);
            enc.set_max_string_len(self.options.max_string_len);
            header.encode(&mut enc)?;
            self.format.encode_header_extra(&header_extra, &mut enc)?;
            for info in &infos {
                self.encode_info(info, &mut enc)?;
            }
            Ok(())
        });

        match result {
            Ok(()) => {
                info!(
                    path = %self.path.display(),
                    count = header.count,
                    "Summary written"
                );
                Ok(true)
            }
            Err(e) => {
                self.dirty.store(true, Ordering::Release);
                Err(e)
            }
        }
    }

    fn decode_info<R: Read>(&self, dec: &mut Decoder<R>) -> Result<MessageInfo<F::Extra>> {
        let uid = dec.read_string()?;
        let flags = MessageFlags::from_bits_retain(dec.read_uint32()?);
        let size = dec.read_uint32()?;
        let date_sent = dec.read_time()?;
        let date_received = dec.read_time()?;
        let subject = dec.read_string()?;
        let from = dec.read_string()?;
        let to = dec.read_string()?;
        let cc = dec.read_string()?;
        let message_id = dec.read_string()?;
        let extra = self.format.decode_record_extra(dec)?;

        let mut info = MessageInfo::new(uid, flags, size, extra);
        info.date_sent = date_sent;
        info.date_received = date_received;
        info.subject = subject;
        info.from = from;
        info.to = to;
        info.cc = cc;
        info.message_id = message_id;
        Ok(info)
    }

    fn encode_info<W: Write>(
        &self,
        info: &MessageInfo<F::Extra>,
        enc: &mut Encoder<W>,
    ) -> Result<()> {
        enc.write_string(info.uid())?;
        enc.write_uint32(info.flags().bits())?;
        enc.write_uint32(info.size())?;
        enc.write_time(info.date_sent)?;
        enc.write_time(info.date_received)?;
        enc.write_string(&info.subject)?;
        enc.write_string(&info.from)?;
        enc.write_string(&info.to)?;
        enc.write_string(&info.cc)?;
        enc.write_string(&info.message_id)?;
        self.format.encode_record_extra(&info.extra, enc)
    }

    // ── Record access ───────────────────────────────────────────────

    pub fn count(&self) -> usize {
        self.locks.state().infos.len()
    }

    /// Add a new record. The uid must be non-empty and not yet present.
    pub fn add(&self, info: MessageInfo<F::Extra>) -> Result<Info<F>> {
        self.edit().add(info)
    }

    /// Add a record, replacing any record with the same uid in place.
    pub fn add_or_replace(&self, info: MessageInfo<F::Extra>) -> Result<Info<F>> {
        self.edit().add_or_replace(info)
    }

    /// Remove a record. Handles held elsewhere stay valid.
    pub fn remove(&self, info: &Info<F>) -> Result<Info<F>> {
        self.edit().remove_uid(info.uid())
    }

    pub fn remove_uid(&self, uid: &str) -> Result<Info<F>> {
        self.edit().remove_uid(uid)
    }

    pub fn remove_index(&self, index: usize) -> Result<Info<F>> {
        self.edit().remove_index(index)
    }

    pub fn lookup_index(&self, index: usize) -> Option<Info<F>> {
        self.locks.state().infos.get(index).cloned()
    }

    pub fn lookup_uid(&self, uid: &str) -> Option<Info<F>> {
        self.locks.state().by_uid.get(uid).cloned()
    }

    /// Point-in-time copy of every record, in order.
    pub fn snapshot(&self) -> Vec<Info<F>> {
        self.locks.state().infos.clone()
    }

    pub fn uids(&self) -> Vec<String> {
        self.locks
            .state()
            .infos
            .iter()
            .map(|i| i.uid().to_string())
            .collect()
    }

    /// Remove every record, returning their uids in order.
    pub fn clear(&self) -> Vec<String> {
        let mut edit = self.edit();
        let uids: Vec<String> = edit
            .state
            .infos
            .iter()
            .map(|i| i.uid().to_string())
            .collect();
        if !uids.is_empty() {
            edit.state.infos.clear();
            edit.state.by_uid.clear();
            edit.changed = true;
        }
        uids
    }

    /// Set the bits of `mask` to those of `set` on one record.
    ///
    /// A change to user-visible bits also marks the record
    /// `FOLDER_FLAGGED` so the next sync writes it back. Returns whether
    /// the flags changed.
    pub fn set_flags(&self, uid: &str, mask: MessageFlags, set: MessageFlags) -> Result<bool> {
        let mut edit = self.edit();
        let info = edit
            .state
            .by_uid
            .get(uid)
            .cloned()
            .ok_or_else(|| SummaryError::NotFound(format!("uid {uid}")))?;
        let old = info.flags();
        let new = (old & !mask) | (set & mask);
        if new == old {
            return Ok(false);
        }
        let new = if new.user_bits() != old.user_bits() {
            new | MessageFlags::FOLDER_FLAGGED
        } else {
            new
        };
        info.store_flags(new);
        edit.changed = true;
        Ok(true)
    }

    /// Allocate the next numeric uid.
    pub fn next_uid(&self) -> String {
        let mut edit = self.edit();
        let uid = edit.state.nextuid;
        edit.state.nextuid = uid.saturating_add(1);
        edit.changed = true;
        uid.to_string()
    }

    /// Make sure future numeric uids are greater than `uid`.
    pub fn reserve_uid(&self, uid: u32) {
        let mut edit = self.edit();
        if edit.state.nextuid <= uid {
            edit.state.nextuid = uid.saturating_add(1);
            edit.changed = true;
        }
    }

    /// Reorder records with `cmp`; marks dirty only if the order changed.
    pub fn sort_by(
        &self,
        cmp: impl FnMut(&MessageInfo<F::Extra>, &MessageInfo<F::Extra>) -> CmpOrdering,
    ) {
        self.edit().sort_by(cmp);
    }

    /// Order records by numeric uid, as MH folders number their files.
    pub fn sort_by_uid_numeric(&self) {
        self.edit().sort_by(|a, b| uid_numeric_cmp(a.uid(), b.uid()));
    }

    pub fn unread_count(&self) -> usize {
        self.locks
            .state()
            .infos
            .iter()
            .filter(|i| !i.has(MessageFlags::SEEN))
            .count()
    }

    pub fn deleted_count(&self) -> usize {
        self.locks
            .state()
            .infos
            .iter()
            .filter(|i| i.has(MessageFlags::DELETED))
            .count()
    }

    /// Backing-folder modification time recorded at the last check/sync.
    pub fn mtime(&self) -> i64 {
        self.locks.state().mtime
    }

    pub fn header_extra(&self) -> F::HeaderExtra {
        self.locks.state().header_extra.clone()
    }

    /// Batch several mutations under one acquisition of the state lock.
    pub(crate) fn edit(&self) -> SummaryEdit<'_, F> {
        SummaryEdit {
            summary: self,
            state: self.locks.state(),
            changed: false,
        }
    }

    pub(crate) fn edit_with<'a>(&'a self, io: &IoGuard<'a, SummaryState<F>>) -> SummaryEdit<'a, F> {
        SummaryEdit {
            summary: self,
            state: io.state(),
            changed: false,
        }
    }

    pub(crate) fn io(&self) -> IoGuard<'_, SummaryState<F>> {
        self.locks.io()
    }

    /// Start from an empty, loaded summary (used when no file exists yet).
    pub(crate) fn reset_locked(&self, io: &IoGuard<'_, SummaryState<F>>) {
        let mut state = io.state();
        *state = SummaryState::empty();
        self.dirty.store(true, Ordering::Release);
        self.loaded.store(true, Ordering::Release);
    }
}

/// Numeric uids in numeric order, then anything else in text order.
pub fn uid_numeric_cmp(a: &str, b: &str) -> CmpOrdering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => CmpOrdering::Less,
        (Err(_), Ok(_)) => CmpOrdering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// A held state lock plus the dirty bookkeeping for the mutations made
/// through it.
pub(crate) struct SummaryEdit<'a, F: SummaryFormat> {
    summary: &'a FolderSummary<F>,
    pub(crate) state: StateGuard<'a, SummaryState<F>>,
    pub(crate) changed: bool,
}

impl<F: SummaryFormat> SummaryEdit<'_, F> {
    pub(crate) fn add(&mut self, info: MessageInfo<F::Extra>) -> Result<Info<F>> {
        if info.uid().is_empty() {
            return Err(SummaryError::InconsistentState(
                "cannot add a record with an empty uid".into(),
            ));
        }
        if self.state.by_uid.contains_key(info.uid()) {
            warn!(uid = info.uid(), "Duplicate uid, record not added");
            return Err(SummaryError::AlreadyExists(format!("uid {}", info.uid())));
        }
        Ok(self.insert(Arc::new(info)))
    }

    pub(crate) fn add_or_replace(&mut self, info: MessageInfo<F::Extra>) -> Result<Info<F>> {
        if info.uid().is_empty() {
            return Err(SummaryError::InconsistentState(
                "cannot add a record with an empty uid".into(),
            ));
        }
        let info = Arc::new(info);
        if let Some(old) = self
            .state
            .by_uid
            .insert(info.uid().to_string(), Arc::clone(&info))
        {
            if let Some(slot) = self
                .state
                .infos
                .iter_mut()
                .find(|i| Arc::ptr_eq(i, &old))
            {
                *slot = Arc::clone(&info);
            }
            self.changed = true;
            return Ok(info);
        }
        self.state.infos.push(Arc::clone(&info));
        self.changed = true;
        Ok(info)
    }

    pub(crate) fn insert(&mut self, info: Info<F>) -> Info<F> {
        self.state
            .by_uid
            .insert(info.uid().to_string(), Arc::clone(&info));
        self.state.infos.push(Arc::clone(&info));
        self.changed = true;
        info
    }

    pub(crate) fn remove_uid(&mut self, uid: &str) -> Result<Info<F>> {
        let info = self
            .state
            .by_uid
            .remove(uid)
            .ok_or_else(|| SummaryError::NotFound(format!("uid {uid}")))?;
        self.state.infos.retain(|i| !Arc::ptr_eq(i, &info));
        self.changed = true;
        Ok(info)
    }

    pub(crate) fn remove_index(&mut self, index: usize) -> Result<Info<F>> {
        if index >= self.state.infos.len() {
            return Err(SummaryError::NotFound(format!("index {index}")));
        }
        let info = self.state.infos.remove(index);
        self.state.by_uid.remove(info.uid());
        self.changed = true;
        Ok(info)
    }

    pub(crate) fn infos(&self) -> &[Info<F>] {
        &self.state.infos
    }

    pub(crate) fn contains(&self, uid: &str) -> bool {
        self.state.by_uid.contains_key(uid)
    }

    pub(crate) fn get(&self, uid: &str) -> Option<Info<F>> {
        self.state.by_uid.get(uid).cloned()
    }

    pub(crate) fn next_uid(&mut self) -> String {
        let uid = self.state.nextuid;
        self.state.nextuid = uid.saturating_add(1);
        self.changed = true;
        uid.to_string()
    }

    pub(crate) fn reserve_uid(&mut self, uid: u32) {
        if self.state.nextuid <= uid {
            self.state.nextuid = uid.saturating_add(1);
            self.changed = true;
        }
    }

    pub(crate) fn set_mtime(&mut self, mtime: i64) {
        if self.state.mtime != mtime {
            self.state.mtime = mtime;
            self.changed = true;
        }
    }

    pub(crate) fn set_header_extra(&mut self, extra: F::HeaderExtra) {
        self.state.header_extra = extra;
        self.changed = true;
    }

    pub(crate) fn sort_by(
        &mut self,
        mut cmp: impl FnMut(&MessageInfo<F::Extra>, &MessageInfo<F::Extra>) -> CmpOrdering,
    ) {
        let before: Vec<Info<F>> = self.state.infos.clone();
        self.state.infos.sort_by(|a, b| cmp(a, b));
        if self
            .state
            .infos
            .iter()
            .zip(&before)
            .any(|(a, b)| !Arc::ptr_eq(a, b))
        {
            self.changed = true;
        }
    }

    /// Replace the record order wholesale (same membership).
    pub(crate) fn reorder(&mut self, infos: Vec<Info<F>>) {
        debug_assert_eq!(infos.len(), self.state.infos.len());
        self.state.infos = infos;
        self.changed = true;
    }
}

impl<F: SummaryFormat> Drop for SummaryEdit<'_, F> {
    fn drop(&mut self) {
        if self.changed {
            self.summary.dirty.store(true, Ordering::Release);
        }
    }
}
