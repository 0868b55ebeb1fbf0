//! MH summaries. Each message is a file named by its numeric uid.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{needs_sync, read_file_headers, synced, LocalFormat};
use crate::codec::{Decoder, Encoder};
use crate::error::{Result, SummaryError};
use crate::file_ops::{mtime_secs, IgnoreKinds};
use crate::model::{MessageFlags, MessageInfo};
use crate::parser::header::split_message;
use crate::parser::{parse_headers, MessageHeaders};
use crate::summary::{uid_numeric_cmp, ChangeInfo, FolderSummary, Info, SummaryFormat};

pub type MhSummary = FolderSummary<MhFormat>;

/// Give up appending after this many uids turned out to be taken.
const MAX_APPEND_ATTEMPTS: usize = 100;

#[derive(Debug, Clone)]
pub struct MhFormat {
    root: PathBuf,
}

impl SummaryFormat for MhFormat {
    type Extra = ();
    type HeaderExtra = ();

    fn decode_header_extra<R: Read>(&self, _dec: &mut Decoder<R>) -> Result<()> {
        Ok(())
    }

    fn encode_header_extra<W: Write>(&self, _extra: &(), _enc: &mut Encoder<W>) -> Result<()> {
        Ok(())
    }

    fn decode_record_extra<R: Read>(&self, _dec: &mut Decoder<R>) -> Result<()> {
        Ok(())
    }

    fn encode_record_extra<W: Write>(&self, _extra: &(), _enc: &mut Encoder<W>) -> Result<()> {
        Ok(())
    }
}

/// Create the folder directory.
pub fn create(root: impl AsRef<Path>) -> Result<()> {
    let root = root.as_ref();
    fs::create_dir_all(root).map_err(|e| SummaryError::io(root, e))
}

fn is_message_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit())
}

impl MhFormat {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn message_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(|e| SummaryError::io(&self.root, e))? {
            let entry = entry.map_err(|e| SummaryError::io(&self.root, e))?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if is_message_name(&name)
                && entry
                    .file_type()
                    .map_err(|e| SummaryError::io(entry.path(), e))?
                    .is_file()
            {
                names.push(name);
            }
        }
        Ok(names)
    }
}

impl LocalFormat for MhFormat {
    fn check(&self, summary: &MhSummary, changes: &mut ChangeInfo) -> Result<()> {
        let on_disk: HashSet<String> = self.message_names()?.into_iter().collect();
        let known: HashSet<String> = summary.uids().into_iter().collect();

        let mut fresh: Vec<&String> = on_disk.difference(&known).collect();
        fresh.sort_by(|a, b| uid_numeric_cmp(a, b));
        let mut staged: Vec<(String, MessageHeaders, u64)> = Vec::with_capacity(fresh.len());
        for uid in fresh {
            let path = self.root.join(uid);
            let (headers, size) = read_file_headers(&path).map_err(|e| SummaryError::io(&path, e))?;
            staged.push((uid.clone(), parse_headers(&headers), size));
        }
        let meta = fs::metadata(&self.root).map_err(|e| SummaryError::io(&self.root, e))?;

        let mut edit = summary.edit();
        let gone: Vec<String> = edit
            .infos()
            .iter()
            .filter(|i| !on_disk.contains(i.uid()))
            .map(|i| i.uid().to_string())
            .collect();
        for uid in &gone {
            edit.remove_uid(uid)?;
            changes.remove_uid(uid);
        }
        for (uid, headers, size) in staged {
            if let Ok(n) = uid.parse::<u32>() {
                edit.reserve_uid(n);
            }
            let recent = !headers.status.as_deref().is_some_and(|s| s.contains('O'));
            let size = u32::try_from(size).unwrap_or(u32::MAX);
            let info = edit.add(MessageInfo::from_headers(
                uid,
                &headers,
                headers.status_flags(),
                size,
                (),
            ))?;
            changes.add_uid(info.uid());
            if recent {
                changes.recent_uid(info.uid());
            }
        }
        edit.sort_by(|a, b| uid_numeric_cmp(a.uid(), b.uid()));
        edit.set_mtime(mtime_secs(&meta));
        Ok(())
    }

    fn sync(&self, summary: &MhSummary, expunge: bool, changes: &mut ChangeInfo) -> Result<()> {
        self.check(summary, changes)?;

        let infos = summary.snapshot();
        let mut edit = summary.edit();
        for info in infos {
            let flags = info.flags();
            if expunge && flags.contains(MessageFlags::DELETED) {
                let path = self.root.join(info.uid());
                fs::remove_file(&path)
                    .ignore_not_found()
                    .map_err(|e| SummaryError::io(&path, e))?;
                edit.remove_uid(info.uid())?;
                changes.remove_uid(info.uid());
            } else if needs_sync(flags) {
                info.store_flags(synced(flags));
                edit.changed = true;
            }
        }
        if let Ok(meta) = fs::metadata(&self.root) {
            edit.set_mtime(mtime_secs(&meta));
        }
        Ok(())
    }

    fn append_message(
        &self,
        summary: &MhSummary,
        raw: &[u8],
        flags: MessageFlags,
    ) -> Result<Info<Self>> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)
            .map_err(|e| SummaryError::io(&self.root, e))?;
        tmp.write_all(raw)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| SummaryError::io(tmp.path(), e))?;

        let mut attempts = 0;
        let uid = loop {
            let uid = summary.next_uid();
            match tmp.persist_noclobber(self.root.join(&uid)) {
                Ok(_) => break uid,
                Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                    attempts += 1;
                    if attempts >= MAX_APPEND_ATTEMPTS {
                        return Err(SummaryError::AlreadyExists(format!(
                            "no free message number in '{}'",
                            self.root.display()
                        )));
                    }
                    tmp = e.file;
                }
                Err(e) => return Err(SummaryError::io(self.root.join(&uid), e.error)),
            }
        };

        let (headers, _) = split_message(raw);
        let headers = parse_headers(headers);
        let mut flags = MessageFlags::from_bits_retain(flags.user_bits());
        if headers.has_attachments {
            flags |= MessageFlags::ATTACHMENTS;
        }
        let size = u32::try_from(raw.len()).unwrap_or(u32::MAX);
        let info = summary
            .edit()
            .add(MessageInfo::from_headers(uid, &headers, flags, size, ()))?;
        debug!(root = %self.root.display(), uid = info.uid(), "Appended message");
        Ok(info)
    }

    fn read_message(&self, _summary: &MhSummary, info: &Info<Self>) -> Result<Vec<u8>> {
        let path = self.root.join(info.uid());
        fs::read(&path).map_err(|e| SummaryError::io(&path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_names() {
        assert!(is_message_name("17"));
        assert!(!is_message_name(".mh_sequences"));
        assert!(!is_message_name("1a"));
        assert!(!is_message_name(""));
    }
}
