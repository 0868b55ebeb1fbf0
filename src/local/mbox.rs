//! mbox summaries.
//!
//! Each record remembers the byte offset of its `From ` line, and the
//! summary header remembers the mailbox size and mtime as of the last
//! check. A check that finds the mailbox grown scans only the new tail;
//! anything else triggers a full rescan.
//!
//! Sync has two strategies. Quick sync overwrites the fixed-width
//! `X-Evolution` marker of each changed message in place, which is only
//! possible when every changed message already has a marker of the same
//! width and nothing is being expunged. Full sync copies the mailbox into
//! a temporary file, rewriting the headers of changed messages and
//! dropping expunged ones, then renames it over the original.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{needs_sync, synced, xev, LocalFormat};
use crate::codec::{Decoder, Encoder};
use crate::error::{Result, SummaryError};
use crate::file_ops::{self, mtime_secs};
use crate::model::{MessageFlags, MessageInfo};
use crate::parser::header::split_message;
use crate::parser::mbox::is_mbox_separator;
use crate::parser::{parse_headers, MboxScanner, MessageHeaders, ScannedMessage};
use crate::summary::{ChangeInfo, FolderSummary, Info, SummaryEdit, SummaryFormat};

pub type MboxSummary = FolderSummary<MboxFormat>;

/// Record payload: where the message starts in the mailbox.
#[derive(Debug, Default)]
pub struct MboxExtra {
    from_offset: AtomicU64,
}

impl MboxExtra {
    pub fn new(from_offset: u64) -> Self {
        Self {
            from_offset: AtomicU64::new(from_offset),
        }
    }

    /// Offset of the message's `From ` line.
    pub fn from_offset(&self) -> u64 {
        self.from_offset.load(Ordering::Acquire)
    }

    pub(crate) fn set_from_offset(&self, offset: u64) {
        self.from_offset.store(offset, Ordering::Release);
    }
}

/// An mbox file and the summary layout that describes it.
///
/// The header extra is the mailbox size at the last check.
#[derive(Debug, Clone)]
pub struct MboxFormat {
    mbox_path: PathBuf,
}

impl MboxFormat {
    pub fn new(mbox_path: impl AsRef<Path>) -> Self {
        Self {
            mbox_path: mbox_path.as_ref().to_path_buf(),
        }
    }

    pub fn mbox_path(&self) -> &Path {
        &self.mbox_path
    }
}

impl SummaryFormat for MboxFormat {
    type Extra = MboxExtra;
    type HeaderExtra = u64;

    fn decode_header_extra<R: Read>(&self, dec: &mut Decoder<R>) -> Result<u64> {
        dec.read_off()
    }

    fn encode_header_extra<W: Write>(&self, folder_size: &u64, enc: &mut Encoder<W>) -> Result<()> {
        enc.write_off(*folder_size)
    }

    fn decode_record_extra<R: Read>(&self, dec: &mut Decoder<R>) -> Result<MboxExtra> {
        Ok(MboxExtra::new(dec.read_off()?))
    }

    fn encode_record_extra<W: Write>(&self, extra: &MboxExtra, enc: &mut Encoder<W>) -> Result<()> {
        enc.write_off(extra.from_offset())
    }
}

#[derive(Debug, Clone, Copy)]
struct FolderStat {
    size: u64,
    mtime: i64,
}

/// A same-length overwrite of one marker value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Patch {
    pub(crate) offset: u64,
    pub(crate) bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncStrategy {
    Quick,
    Full,
}

/// Pick the sync strategy for a set of planned patches, one per changed
/// message (`None` where no same-width patch exists).
pub(crate) fn choose_strategy(
    quick_enabled: bool,
    expunging: bool,
    patches: &[Option<Patch>],
) -> SyncStrategy {
    if quick_enabled && !expunging && patches.iter().all(Option::is_some) {
        SyncStrategy::Quick
    } else {
        SyncStrategy::Full
    }
}

enum Rewritten {
    Expunged(Info<MboxFormat>),
    Kept {
        info: Info<MboxFormat>,
        flags: MessageFlags,
        offset: u64,
        size: u32,
    },
}

impl MboxFormat {
    fn stat(&self) -> Result<Option<FolderStat>> {
        match fs::metadata(&self.mbox_path) {
            Ok(meta) => Ok(Some(FolderStat {
                size: meta.len(),
                mtime: mtime_secs(&meta),
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SummaryError::io(&self.mbox_path, e)),
        }
    }

    fn io_err(&self, e: io::Error) -> SummaryError {
        SummaryError::io(&self.mbox_path, e)
    }

    /// Scan from `start`, returning the messages and the end offset.
    fn scan(&self, start: u64) -> Result<(Vec<ScannedMessage>, u64)> {
        let mut out = Vec::new();
        let end = MboxScanner::new(&self.mbox_path).scan_from(start, &mut |msg| {
            out.push(msg);
            true
        })?;
        Ok((out, end))
    }

    fn check_missing(&self, summary: &MboxSummary, changes: &mut ChangeInfo) -> Result<()> {
        let mut edit = summary.edit();
        let uids: Vec<String> = edit.infos().iter().map(|i| i.uid().to_string()).collect();
        for uid in &uids {
            edit.remove_uid(uid)?;
            changes.remove_uid(uid);
        }
        if edit.state.header_extra != 0 {
            edit.set_header_extra(0);
        }
        edit.set_mtime(0);
        Ok(())
    }

    fn apply_incremental(
        &self,
        summary: &MboxSummary,
        scanned: &[ScannedMessage],
        folder_size: u64,
        mtime: i64,
        changes: &mut ChangeInfo,
    ) -> Result<()> {
        let mut edit = summary.edit();
        for msg in scanned {
            let headers = parse_headers(&msg.headers);
            let marker = headers.x_evolution.as_deref().and_then(xev::decode);
            if let Some((uid, _)) = &marker {
                // Our own appends are already recorded at this offset.
                if edit
                    .get(uid)
                    .is_some_and(|i| i.extra.from_offset() == msg.offset)
                {
                    continue;
                }
            }
            add_scanned(&mut edit, msg, &headers, marker, changes)?;
        }
        edit.set_header_extra(folder_size);
        edit.set_mtime(mtime);
        debug!(
            path = %self.mbox_path.display(),
            new = scanned.len(),
            "Absorbed appended messages"
        );
        Ok(())
    }

    fn apply_rescan(
        &self,
        summary: &MboxSummary,
        scanned: &[ScannedMessage],
        folder_size: u64,
        mtime: i64,
        changes: &mut ChangeInfo,
    ) -> Result<()> {
        let mut edit = summary.edit();
        let mut unmarked_by_offset: HashMap<u64, Info<Self>> = HashMap::new();
        for info in edit.infos() {
            info.update_flags(MessageFlags::FOLDER_NOTSEEN, MessageFlags::FOLDER_NOTSEEN);
            if info.has(MessageFlags::FOLDER_NOXEV) {
                unmarked_by_offset.insert(info.extra.from_offset(), info.clone());
            }
        }

        let mut order = Vec::with_capacity(scanned.len());
        for msg in scanned {
            let headers = parse_headers(&msg.headers);
            let marker = headers.x_evolution.as_deref().and_then(xev::decode);
            let matched = match &marker {
                Some((uid, _)) => edit.get(uid),
                None => unmarked_by_offset.get(&msg.offset).cloned(),
            }
            .filter(|i| i.has(MessageFlags::FOLDER_NOTSEEN));

            let Some(info) = matched else {
                order.push(add_scanned(&mut edit, msg, &headers, marker, changes)?);
                continue;
            };

            info.extra.set_from_offset(msg.offset);
            info.set_size(message_size(msg));
            let old = info.flags();
            let mut new = old - MessageFlags::FOLDER_NOTSEEN;
            if let Some((_, marker_flags)) = &marker {
                new -= MessageFlags::FOLDER_NOXEV;
                if !old.contains(MessageFlags::FOLDER_FLAGGED)
                    && old.user_bits() != marker_flags.user_bits()
                {
                    new = MessageFlags::from_bits_retain(
                        (new.bits() & !MessageFlags::MARKER_MASK) | marker_flags.user_bits(),
                    );
                    changes.change_uid(info.uid());
                }
            }
            info.store_flags(new);
            order.push(info);
        }

        let gone: Vec<String> = edit
            .infos()
            .iter()
            .filter(|i| i.has(MessageFlags::FOLDER_NOTSEEN))
            .map(|i| i.uid().to_string())
            .collect();
        for uid in &gone {
            edit.remove_uid(uid)?;
            changes.remove_uid(uid);
        }
        edit.reorder(order);
        edit.set_header_extra(folder_size);
        edit.set_mtime(mtime);
        info!(
            path = %self.mbox_path.display(),
            messages = scanned.len(),
            removed = gone.len(),
            "Rescanned mbox"
        );
        Ok(())
    }

    /// Plan one patch per changed record. `Ok(None)` means quick sync is
    /// impossible for at least one of them.
    fn plan_quick(&self, pending: &[(Info<Self>, MessageFlags)]) -> Result<Vec<Option<Patch>>> {
        let file = File::open(&self.mbox_path).map_err(|e| self.io_err(e))?;
        let mut src = BufReader::new(file);
        let mut patches = Vec::with_capacity(pending.len());
        for (info, flags) in pending {
            if flags.contains(MessageFlags::FOLDER_NOXEV) {
                patches.push(None);
                continue;
            }
            let offset = info.extra.from_offset();
            let (from_line, headers) =
                read_header_block(&mut src, offset).map_err(|e| self.io_err(e))?;
            if !is_mbox_separator(&from_line, offset == 0) {
                return Err(SummaryError::InconsistentState(format!(
                    "no 'From ' line at offset {offset} for uid {}",
                    info.uid()
                )));
            }
            let patch = xev::find_marker(&headers).and_then(|(start, end)| {
                xev::quick_sync_patch(&headers[start..end], info.uid(), *flags).map(|bytes| Patch {
                    offset: offset + from_line.len() as u64 + start as u64,
                    bytes,
                })
            });
            patches.push(patch);
        }
        Ok(patches)
    }

    fn apply_quick(
        &self,
        summary: &MboxSummary,
        pending: &[(Info<Self>, MessageFlags)],
        patches: Vec<Patch>,
    ) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.mbox_path)
            .map_err(|e| self.io_err(e))?;
        for patch in &patches {
            file.seek(SeekFrom::Start(patch.offset))
                .and_then(|_| file.write_all(&patch.bytes))
                .map_err(|e| self.io_err(e))?;
        }
        file.sync_all().map_err(|e| self.io_err(e))?;
        drop(file);

        let st = self.stat()?;
        let mut edit = summary.edit();
        for (info, flags) in pending {
            // A flag change made since planning stays pending.
            if info.flags() == *flags {
                info.store_flags(synced(*flags));
            }
        }
        edit.changed = true;
        if let Some(st) = st {
            edit.set_header_extra(st.size);
            edit.set_mtime(st.mtime);
        }
        debug!(
            path = %self.mbox_path.display(),
            patched = patches.len(),
            "Quick sync done"
        );
        Ok(())
    }

    fn sync_full(
        &self,
        summary: &MboxSummary,
        infos: &[Info<Self>],
        expunge: bool,
        changes: &mut ChangeInfo,
    ) -> Result<()> {
        let meta = fs::metadata(&self.mbox_path).map_err(|e| self.io_err(e))?;
        let file_len = meta.len();
        let mut ordered: Vec<Info<Self>> = infos.to_vec();
        ordered.sort_by_key(|i| i.extra.from_offset());

        let file = File::open(&self.mbox_path).map_err(|e| self.io_err(e))?;
        let mut src = BufReader::new(file);

        let (outcomes, new_len) =
            file_ops::write_atomically(&self.mbox_path, Some(meta.permissions()), |w| {
                let mut out_offset = 0u64;
                let mut outcomes = Vec::with_capacity(ordered.len());
                for (n, info) in ordered.iter().enumerate() {
                    let flags = info.flags();
                    if expunge && flags.contains(MessageFlags::DELETED) {
                        outcomes.push(Rewritten::Expunged(info.clone()));
                        continue;
                    }
                    let start = info.extra.from_offset();
                    let end = ordered
                        .get(n + 1)
                        .map(|i| i.extra.from_offset())
                        .unwrap_or(file_len);
                    if end < start || end > file_len {
                        return Err(SummaryError::InconsistentState(format!(
                            "bad message range {start}..{end} for uid {}",
                            info.uid()
                        )));
                    }
                    let raw = read_at(&mut src, start, end - start).map_err(|e| self.io_err(e))?;
                    if !is_mbox_separator(&raw, start == 0) {
                        return Err(SummaryError::InconsistentState(format!(
                            "no 'From ' line at offset {start} for uid {}",
                            info.uid()
                        )));
                    }
                    let bytes = if needs_sync(flags) {
                        rewrite_message(&raw, info.uid(), flags)?
                    } else {
                        raw
                    };
                    w.write_all(&bytes).map_err(|e| self.io_err(e))?;
                    let from_len = line_len(&bytes) as u64;
                    outcomes.push(Rewritten::Kept {
                        info: info.clone(),
                        flags,
                        offset: out_offset,
                        size: clamp_u32(bytes.len() as u64 - from_len),
                    });
                    out_offset += bytes.len() as u64;
                }
                Ok((outcomes, out_offset))
            })?;

        let mtime = self.stat()?.map(|st| st.mtime).unwrap_or(0);
        let mut edit = summary.edit();
        let mut expunged = 0usize;
        for outcome in outcomes {
            match outcome {
                Rewritten::Expunged(info) => {
                    if edit.remove_uid(info.uid()).is_ok() {
                        changes.remove_uid(info.uid());
                        expunged += 1;
                    }
                }
                Rewritten::Kept {
                    info,
                    flags,
                    offset,
                    size,
                } => {
                    info.extra.set_from_offset(offset);
                    info.set_size(size);
                    if info.flags() == flags && needs_sync(flags) {
                        info.store_flags(synced(flags));
                    }
                }
            }
        }
        edit.changed = true;
        edit.set_header_extra(new_len);
        edit.set_mtime(mtime);
        info!(
            path = %self.mbox_path.display(),
            size = new_len,
            expunged,
            "Rewrote mbox"
        );
        Ok(())
    }

    /// Byte range `(offset, length)` of one message, `From ` line included.
    fn range_of(&self, summary: &MboxSummary, info: &Info<Self>) -> Result<(u64, u64)> {
        let start = info.extra.from_offset();
        let end = summary
            .snapshot()
            .iter()
            .map(|i| i.extra.from_offset())
            .filter(|&o| o > start)
            .min();
        let end = match end {
            Some(end) => end,
            None => self.stat()?.map(|st| st.size).unwrap_or(0),
        };
        if end < start {
            return Err(SummaryError::InconsistentState(format!(
                "uid {} starts past the end of the mailbox",
                info.uid()
            )));
        }
        Ok((start, end - start))
    }
}

impl LocalFormat for MboxFormat {
    fn check(&self, summary: &MboxSummary, changes: &mut ChangeInfo) -> Result<()> {
        let Some(st) = self.stat()? else {
            return self.check_missing(summary, changes);
        };
        let known_size = summary.header_extra();
        if st.size == known_size && st.mtime == summary.mtime() {
            debug!(path = %self.mbox_path.display(), "mbox unchanged");
            return Ok(());
        }

        if st.size > known_size && known_size > 0 {
            match self.scan(known_size) {
                Ok((scanned, end)) => {
                    return self.apply_incremental(summary, &scanned, end, st.mtime, changes);
                }
                Err(SummaryError::InconsistentState(reason)) => {
                    warn!(
                        path = %self.mbox_path.display(),
                        reason = %reason,
                        "mbox changed in place, rescanning from start"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let (scanned, end) = self.scan(0)?;
        self.apply_rescan(summary, &scanned, end, st.mtime, changes)
    }

    fn sync(&self, summary: &MboxSummary, expunge: bool, changes: &mut ChangeInfo) -> Result<()> {
        self.check(summary, changes)?;

        let infos = summary.snapshot();
        let expunging = expunge && infos.iter().any(|i| i.has(MessageFlags::DELETED));
        let pending: Vec<(Info<Self>, MessageFlags)> = infos
            .iter()
            .map(|i| (i.clone(), i.flags()))
            .filter(|(_, flags)| needs_sync(*flags))
            .collect();
        if !expunging && pending.is_empty() {
            debug!(path = %self.mbox_path.display(), "Nothing to sync");
            return Ok(());
        }

        if summary.options().quick_sync && !expunging {
            let patches = match self.plan_quick(&pending) {
                Ok(p) => p,
                Err(SummaryError::InconsistentState(reason)) => {
                    warn!(reason = %reason, "Quick sync planning failed, rewriting mbox");
                    vec![None]
                }
                Err(e) => return Err(e),
            };
            if choose_strategy(true, expunging, &patches) == SyncStrategy::Quick {
                let patches = patches.into_iter().flatten().collect();
                return self.apply_quick(summary, &pending, patches);
            }
            debug!(path = %self.mbox_path.display(), "Quick sync not possible");
        }
        self.sync_full(summary, &infos, expunge, changes)
    }

    fn append_message(
        &self,
        summary: &MboxSummary,
        raw: &[u8],
        flags: MessageFlags,
    ) -> Result<Info<Self>> {
        let flags = MessageFlags::from_bits_retain(flags.user_bits());
        let before = self.stat()?;
        let in_step = match before {
            Some(st) => st.size == summary.header_extra() && st.mtime == summary.mtime(),
            None => summary.count() == 0,
        };

        let uid = summary.next_uid();
        let (headers_raw, body) = split_message(raw);
        let headers_raw = xev::rewrite_headers(headers_raw, &uid, flags).ok_or_else(|| {
            SummaryError::InconsistentState(format!("uid {uid} has no marker encoding"))
        })?;
        let headers = parse_headers(&headers_raw);

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.mbox_path)
            .map_err(|e| self.io_err(e))?;
        let start_len = file.metadata().map_err(|e| self.io_err(e))?.len();
        let pad = separator_padding(&mut file, start_len).map_err(|e| self.io_err(e))?;
        let offset = start_len + pad.len() as u64;

        let from_line = from_line(&headers);
        let mut msg = Vec::with_capacity(raw.len() + from_line.len() + 128);
        msg.extend_from_slice(pad);
        msg.extend_from_slice(from_line.as_bytes());
        msg.extend_from_slice(&headers_raw);
        msg.push(b'\n');
        escape_from_lines(body, &mut msg);
        if !msg.ends_with(b"\n") {
            msg.push(b'\n');
        }
        msg.push(b'\n');

        if let Err(e) = file.write_all(&msg).and_then(|_| file.sync_data()) {
            if let Err(trunc) = file.set_len(start_len) {
                warn!(
                    path = %self.mbox_path.display(),
                    error = %trunc,
                    "Could not roll back partial append"
                );
            }
            return Err(self.io_err(e));
        }
        drop(file);

        let size = clamp_u32((msg.len() - pad.len() - from_line.len()) as u64);
        let record = MessageInfo::from_headers(uid, &headers, flags, size, MboxExtra::new(offset));
        let after = if in_step { self.stat()? } else { None };

        let mut edit = summary.edit();
        let info = edit.add(record)?;
        if let Some(st) = after {
            edit.set_header_extra(st.size);
            edit.set_mtime(st.mtime);
        }
        debug!(
            path = %self.mbox_path.display(),
            uid = info.uid(),
            offset,
            "Appended message"
        );
        Ok(info)
    }

    fn read_message(&self, summary: &MboxSummary, info: &Info<Self>) -> Result<Vec<u8>> {
        let (offset, length) = self.range_of(summary, info)?;
        let raw = MboxScanner::new(&self.mbox_path).read_range(offset, length)?;
        let mut body = &raw[line_len(&raw)..];
        if body.ends_with(b"\n\n") {
            body = &body[..body.len() - 1];
        }
        Ok(unescape_from_lines(body))
    }
}

impl FolderSummary<MboxFormat> {
    /// Byte range `(offset, length)` of one message in the mailbox.
    pub fn message_range(&self, uid: &str) -> Result<(u64, u64)> {
        let _io = self.io();
        let info = self
            .lookup_uid(uid)
            .ok_or_else(|| SummaryError::NotFound(format!("uid {uid}")))?;
        self.format().range_of(self, &info)
    }
}

/// Add a freshly scanned message, reusing its marker uid when free.
fn add_scanned(
    edit: &mut SummaryEdit<'_, MboxFormat>,
    msg: &ScannedMessage,
    headers: &MessageHeaders,
    marker: Option<(String, MessageFlags)>,
    changes: &mut ChangeInfo,
) -> Result<Info<MboxFormat>> {
    let mut recent = false;
    let (uid, flags) = match marker {
        Some((uid, flags)) if !edit.contains(&uid) => {
            if let Ok(n) = uid.parse::<u32>() {
                edit.reserve_uid(n);
            }
            (uid, flags)
        }
        Some((_, flags)) => (edit.next_uid(), flags | MessageFlags::FOLDER_XEVCHANGE),
        None => {
            recent = !headers.status.as_deref().is_some_and(|s| s.contains('O'));
            (
                edit.next_uid(),
                headers.status_flags() | MessageFlags::FOLDER_NOXEV,
            )
        }
    };
    let record = MessageInfo::from_headers(
        uid,
        headers,
        flags,
        message_size(msg),
        MboxExtra::new(msg.offset),
    );
    let info = edit.add(record)?;
    changes.add_uid(info.uid());
    if recent {
        changes.recent_uid(info.uid());
    }
    Ok(info)
}

/// Message size without the `From ` line.
fn message_size(msg: &ScannedMessage) -> u32 {
    clamp_u32(msg.length.saturating_sub(msg.headers_offset - msg.offset))
}

fn clamp_u32(v: u64) -> u32 {
    u32::try_from(v).unwrap_or(u32::MAX)
}

fn line_len(bytes: &[u8]) -> usize {
    bytes
        .iter()
        .position(|&b| b == b'\n')
        .map(|p| p + 1)
        .unwrap_or(bytes.len())
}

fn read_at(src: &mut BufReader<File>, offset: u64, len: u64) -> io::Result<Vec<u8>> {
    src.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len as usize];
    src.read_exact(&mut buf)?;
    Ok(buf)
}

/// Read the `From ` line and the header block that follows it.
fn read_header_block(src: &mut BufReader<File>, offset: u64) -> io::Result<(Vec<u8>, Vec<u8>)> {
    src.seek(SeekFrom::Start(offset))?;
    let mut from_line = Vec::new();
    src.read_until(b'\n', &mut from_line)?;
    let mut headers = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if src.read_until(b'\n', &mut line)? == 0 || line == b"\n" || line == b"\r\n" {
            break;
        }
        headers.extend_from_slice(&line);
    }
    Ok((from_line, headers))
}

/// Give `raw` fresh marker and status headers.
fn rewrite_message(raw: &[u8], uid: &str, flags: MessageFlags) -> Result<Vec<u8>> {
    let from_len = line_len(raw);
    let (headers, body) = split_message(&raw[from_len..]);
    let headers = xev::rewrite_headers(headers, uid, flags).ok_or_else(|| {
        SummaryError::InconsistentState(format!("uid {uid} has no marker encoding"))
    })?;
    let eol: &[u8] = if headers.ends_with(b"\r\n") {
        b"\r\n"
    } else {
        b"\n"
    };
    let mut out = Vec::with_capacity(raw.len() + 64);
    out.extend_from_slice(&raw[..from_len]);
    out.extend_from_slice(&headers);
    out.extend_from_slice(eol);
    out.extend_from_slice(body);
    Ok(out)
}

/// Newlines needed so a message appended after `len` bytes starts after a
/// blank line.
fn separator_padding(file: &mut File, len: u64) -> io::Result<&'static [u8]> {
    if len == 0 {
        return Ok(b"");
    }
    let tail_len = len.min(2);
    file.seek(SeekFrom::End(-(tail_len as i64)))?;
    let mut tail = [0u8; 2];
    file.read_exact(&mut tail[..tail_len as usize])?;
    let tail = &tail[..tail_len as usize];
    let pad: &'static [u8] = if !tail.ends_with(b"\n") {
        b"\n\n"
    } else if tail != b"\n\n" && tail_len == 2 {
        b"\n"
    } else {
        b""
    };
    Ok(pad)
}

/// `From <sender> <asctime>` for a new message.
fn from_line(headers: &MessageHeaders) -> String {
    let sender = headers
        .from
        .rsplit_once('<')
        .and_then(|(_, rest)| rest.split_once('>'))
        .map(|(addr, _)| addr.trim())
        .or_else(|| headers.from.split_whitespace().find(|w| w.contains('@')))
        .filter(|s| !s.is_empty() && !s.contains(char::is_whitespace))
        .unwrap_or("MAILER-DAEMON");
    format!(
        "From {} {}\n",
        sender,
        Utc::now().format("%a %b %e %H:%M:%S %Y")
    )
}

fn is_escaped_from(line: &[u8]) -> bool {
    let quotes = line.iter().take_while(|&&b| b == b'>').count();
    line[quotes..].starts_with(b"From ")
}

/// mboxrd quoting: `>*From ` at a line start gains one `>`.
fn escape_from_lines(body: &[u8], out: &mut Vec<u8>) {
    for line in body.split_inclusive(|&b| b == b'\n') {
        if is_escaped_from(line) {
            out.push(b'>');
        }
        out.extend_from_slice(line);
    }
}

fn unescape_from_lines(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut in_body = false;
    for line in body.split_inclusive(|&b| b == b'\n') {
        if in_body && line.starts_with(b">") && is_escaped_from(line) {
            out.extend_from_slice(&line[1..]);
        } else {
            out.extend_from_slice(line);
        }
        if line == b"\n" || line == b"\r\n" {
            in_body = true;
        }
    }
    out
}
