//! Maildir summaries.
//!
//! Messages are delivered into `new/`, live in `cur/` and are written
//! through `tmp/`. Files in `cur/` are named `<uid>:2,<flags>`, one letter
//! per flag in ASCII order, so the name carries the flags and the record
//! only needs to remember the current filename.

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use super::{needs_sync, read_file_headers, synced, LocalFormat};
use crate::codec::{Decoder, Encoder};
use crate::error::{Result, SummaryError};
use crate::file_ops::{mtime_secs, IgnoreKinds};
use crate::model::{MessageFlags, MessageInfo};
use crate::parser::header::split_message;
use crate::parser::{parse_headers, MessageHeaders};
use crate::summary::{ChangeInfo, FolderSummary, Info, SummaryFormat};

pub type MaildirSummary = FolderSummary<MaildirFormat>;

/// Separator between the unique part of a filename and its flags.
const INFO_SEPARATOR: &str = ":2,";

/// Flag letters in the order they appear in a filename.
const FLAG_LETTERS: [(char, MessageFlags); 5] = [
    ('D', MessageFlags::DRAFT),
    ('F', MessageFlags::FLAGGED),
    ('R', MessageFlags::ANSWERED),
    ('S', MessageFlags::SEEN),
    ('T', MessageFlags::DELETED),
];

/// Flags a filename can carry.
pub const FILENAME_FLAGS: MessageFlags = MessageFlags::DRAFT
    .union(MessageFlags::FLAGGED)
    .union(MessageFlags::ANSWERED)
    .union(MessageFlags::SEEN)
    .union(MessageFlags::DELETED);

static DELIVERY_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Record payload: the file's current name inside `cur/`.
#[derive(Debug, Default)]
pub struct MaildirExtra {
    filename: RwLock<String>,
}

impl MaildirExtra {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: RwLock::new(filename.into()),
        }
    }

    pub fn filename(&self) -> String {
        self.filename
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_filename(&self, name: String) {
        *self.filename.write().unwrap_or_else(PoisonError::into_inner) = name;
    }
}

#[derive(Debug, Clone)]
pub struct MaildirFormat {
    root: PathBuf,
}

impl SummaryFormat for MaildirFormat {
    type Extra = MaildirExtra;
    type HeaderExtra = ();

    fn decode_header_extra<R: Read>(&self, _dec: &mut Decoder<R>) -> Result<()> {
        Ok(())
    }

    fn encode_header_extra<W: Write>(&self, _extra: &(), _enc: &mut Encoder<W>) -> Result<()> {
        Ok(())
    }

    fn decode_record_extra<R: Read>(&self, dec: &mut Decoder<R>) -> Result<MaildirExtra> {
        Ok(MaildirExtra::new(dec.read_string()?))
    }

    fn encode_record_extra<W: Write>(&self, extra: &MaildirExtra, enc: &mut Encoder<W>) -> Result<()> {
        enc.write_string(&extra.filename())
    }
}

/// Filename for a message with `uid` and `flags`.
pub fn info_to_name(uid: &str, flags: MessageFlags) -> String {
    let mut name = String::with_capacity(uid.len() + 8);
    name.push_str(uid);
    name.push_str(INFO_SEPARATOR);
    for (letter, flag) in FLAG_LETTERS {
        if flags.contains(flag) {
            name.push(letter);
        }
    }
    name
}

/// Split a filename into uid and flags. Unknown letters are ignored.
pub fn name_to_info(name: &str) -> (String, MessageFlags) {
    let Some((uid, letters)) = name.split_once(INFO_SEPARATOR) else {
        return (name.to_string(), MessageFlags::empty());
    };
    let mut flags = MessageFlags::empty();
    for c in letters.chars() {
        if let Some((_, flag)) = FLAG_LETTERS.iter().find(|(l, _)| *l == c) {
            flags |= *flag;
        }
    }
    (uid.to_string(), flags)
}

/// A fresh unique name: `<secs>.M<micros>P<pid>Q<counter>`.
pub fn generate_uid() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let counter = DELIVERY_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    format!(
        "{}.M{}P{}Q{}",
        now.as_secs(),
        now.subsec_micros(),
        std::process::id(),
        counter
    )
}

/// Create `cur/`, `new/` and `tmp/` under `root`.
pub fn create(root: impl AsRef<Path>) -> Result<()> {
    for sub in ["cur", "new", "tmp"] {
        let dir = root.as_ref().join(sub);
        fs::create_dir_all(&dir).map_err(|e| SummaryError::io(&dir, e))?;
    }
    Ok(())
}

/// A message found on disk and not yet in the summary.
struct Staged {
    uid: String,
    filename: String,
    headers: MessageHeaders,
    size: u32,
    flags: MessageFlags,
    recent: bool,
}

impl MaildirFormat {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn cur(&self) -> PathBuf {
        self.root.join("cur")
    }

    fn new_dir(&self) -> PathBuf {
        self.root.join("new")
    }

    fn tmp(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Visible regular files in `dir`.
    fn list(&self, dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir).map_err(|e| SummaryError::io(dir, e))? {
            let entry = entry.map_err(|e| SummaryError::io(dir, e))?;
            let name = match entry.file_name().into_string() {
                Ok(n) => n,
                Err(raw) => {
                    warn!(dir = %dir.display(), name = ?raw, "Skipping non-UTF-8 filename");
                    continue;
                }
            };
            if name.starts_with('.') {
                continue;
            }
            let is_file = entry
                .file_type()
                .map_err(|e| SummaryError::io(entry.path(), e))?
                .is_file();
            if is_file {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn stage(&self, path: &Path, uid: String, filename: String, flags: MessageFlags) -> Result<Staged> {
        let (headers, size) = read_file_headers(path).map_err(|e| SummaryError::io(path, e))?;
        let headers = parse_headers(&headers);
        let flags = if headers.has_attachments {
            flags | MessageFlags::ATTACHMENTS
        } else {
            flags
        };
        Ok(Staged {
            uid,
            filename,
            headers,
            size: u32::try_from(size).unwrap_or(u32::MAX),
            flags,
            recent: false,
        })
    }

    fn dir_mtime(&self) -> Result<i64> {
        let mut newest = 0;
        for dir in [self.cur(), self.new_dir()] {
            let meta = fs::metadata(&dir).map_err(|e| SummaryError::io(&dir, e))?;
            newest = newest.max(mtime_secs(&meta));
        }
        Ok(newest)
    }
}

impl LocalFormat for MaildirFormat {
    fn check(&self, summary: &MaildirSummary, changes: &mut ChangeInfo) -> Result<()> {
        let cur = self.cur();
        let new_dir = self.new_dir();

        let mut on_disk: HashMap<String, String> = HashMap::new();
        for name in self.list(&cur)? {
            let (uid, _) = name_to_info(&name);
            if let Some(prev) = on_disk.insert(uid, name.clone()) {
                warn!(first = %prev, second = %name, "Two maildir files share a uid");
            }
        }

        let known: HashSet<String> = summary.uids().into_iter().collect();
        let mut staged = Vec::new();
        let mut fresh: Vec<(&String, &String)> = on_disk
            .iter()
            .filter(|(uid, _)| !known.contains(*uid))
            .collect();
        fresh.sort();
        for (uid, name) in fresh {
            let (_, flags) = name_to_info(name);
            staged.push(self.stage(&cur.join(name), uid.clone(), name.clone(), flags)?);
        }

        let mut used: HashSet<String> = known.iter().chain(on_disk.keys()).cloned().collect();
        for name in self.list(&new_dir)? {
            let src = new_dir.join(&name);
            let (base, flags) = name_to_info(&name);
            let uid = if base.is_empty() || used.contains(&base) {
                unique_uid(&used)
            } else {
                base
            };
            let filename = info_to_name(&uid, flags);
            let mut entry = self.stage(&src, uid, filename, flags)?;
            let dest = cur.join(&entry.filename);
            if dest.exists() {
                entry.uid = unique_uid(&used);
                entry.filename = info_to_name(&entry.uid, flags);
            }
            fs::rename(&src, cur.join(&entry.filename)).map_err(|e| SummaryError::io(&src, e))?;
            debug!(from = %name, to = %entry.filename, "Moved new message into cur");
            used.insert(entry.uid.clone());
            entry.recent = true;
            on_disk.insert(entry.uid.clone(), entry.filename.clone());
            staged.push(entry);
        }
        let mtime = self.dir_mtime()?;

        let mut edit = summary.edit();
        let existing: Vec<Info<Self>> = edit.infos().to_vec();
        for info in existing {
            let Some(name) = on_disk.get(info.uid()) else {
                edit.remove_uid(info.uid())?;
                changes.remove_uid(info.uid());
                continue;
            };
            if info.extra.filename() == *name {
                continue;
            }
            info.extra.set_filename(name.clone());
            edit.changed = true;
            let old = info.flags();
            if !old.contains(MessageFlags::FOLDER_FLAGGED) {
                let (_, disk_flags) = name_to_info(name);
                let new = (old - FILENAME_FLAGS) | disk_flags;
                if new != old {
                    info.store_flags(new);
                    changes.change_uid(info.uid());
                }
            }
        }
        for entry in staged {
            let record = MessageInfo::from_headers(
                entry.uid,
                &entry.headers,
                entry.flags,
                entry.size,
                MaildirExtra::new(entry.filename),
            );
            let info = edit.add(record)?;
            changes.add_uid(info.uid());
            if entry.recent {
                changes.recent_uid(info.uid());
            }
        }
        edit.set_mtime(mtime);
        Ok(())
    }

    fn sync(
        &self,
        summary: &MaildirSummary,
        expunge: bool,
        changes: &mut ChangeInfo,
    ) -> Result<()> {
        self.check(summary, changes)?;

        let cur = self.cur();
        let infos = summary.snapshot();
        let mut edit = summary.edit();
        for info in infos {
            let flags = info.flags();
            let old_name = info.extra.filename();
            if expunge && flags.contains(MessageFlags::DELETED) {
                let path = cur.join(&old_name);
                fs::remove_file(&path)
                    .ignore_not_found()
                    .map_err(|e| SummaryError::io(&path, e))?;
                edit.remove_uid(info.uid())?;
                changes.remove_uid(info.uid());
                continue;
            }
            if !needs_sync(flags) {
                continue;
            }
            let new_name = info_to_name(info.uid(), flags);
            if new_name != old_name {
                let path = cur.join(&old_name);
                fs::rename(&path, cur.join(&new_name)).map_err(|e| SummaryError::io(&path, e))?;
                info.extra.set_filename(new_name);
            }
            info.store_flags(synced(flags));
            edit.changed = true;
        }
        drop(edit);

        let mtime = self.dir_mtime()?;
        summary.edit().set_mtime(mtime);
        Ok(())
    }

    fn append_message(
        &self,
        summary: &MaildirSummary,
        raw: &[u8],
        flags: MessageFlags,
    ) -> Result<Info<Self>> {
        let used: HashSet<String> = summary.uids().into_iter().collect();
        let uid = unique_uid(&used);
        let tmp_path = self.tmp().join(&uid);

        let written = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .and_then(|mut f| {
                f.write_all(raw)?;
                f.sync_all()
            });
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(SummaryError::io(&tmp_path, e));
        }

        let (headers, _) = split_message(raw);
        let headers = parse_headers(headers);
        let mut flags = MessageFlags::from_bits_retain(flags.user_bits());
        if headers.has_attachments {
            flags |= MessageFlags::ATTACHMENTS;
        }
        let filename = info_to_name(&uid, flags);
        if let Err(e) = fs::rename(&tmp_path, self.cur().join(&filename)) {
            let _ = fs::remove_file(&tmp_path);
            return Err(SummaryError::io(&tmp_path, e));
        }

        let size = u32::try_from(raw.len()).unwrap_or(u32::MAX);
        let record = MessageInfo::from_headers(uid, &headers, flags, size, MaildirExtra::new(filename));
        let info = summary.edit().add(record)?;
        debug!(root = %self.root.display(), uid = info.uid(), "Delivered message");
        Ok(info)
    }

    fn read_message(&self, _summary: &MaildirSummary, info: &Info<Self>) -> Result<Vec<u8>> {
        let path = self.cur().join(info.extra.filename());
        fs::read(&path).map_err(|e| SummaryError::io(&path, e))
    }
}

fn unique_uid(used: &HashSet<String>) -> String {
    loop {
        let uid = generate_uid();
        if !used.contains(&uid) {
            return uid;
        }
    }
}
