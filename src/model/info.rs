//! Summary records: one per message, one per folder.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use super::flags::{FolderFlags, MessageFlags};
use crate::parser::MessageHeaders;

/// Cached metadata for one message, shared between the summary and any
/// caller holding a handle.
///
/// Records are handed out as `Arc<MessageInfo<X>>`; the record lives until
/// the summary and every caller have dropped their handle. `X` is the
/// format-specific payload (mbox offset, maildir filename, nothing for MH).
#[derive(Debug)]
pub struct MessageInfo<X> {
    uid: String,
    flags: AtomicU32,
    size: AtomicU32,

    /// `Date:` header as a Unix timestamp (0 if absent).
    pub date_sent: i64,
    /// When the message entered this folder.
    pub date_received: i64,
    pub subject: String,
    pub from: String,
    pub to: String,
    pub cc: String,
    pub message_id: String,

    /// Format-specific payload.
    pub extra: X,
}

impl<X> MessageInfo<X> {
    pub fn new(uid: impl Into<String>, flags: MessageFlags, size: u32, extra: X) -> Self {
        Self {
            uid: uid.into(),
            flags: AtomicU32::new(flags.bits()),
            size: AtomicU32::new(size),
            date_sent: 0,
            date_received: 0,
            subject: String::new(),
            from: String::new(),
            to: String::new(),
            cc: String::new(),
            message_id: String::new(),
            extra,
        }
    }

    /// Build a record from parsed headers; `date_received` is now.
    pub fn from_headers(
        uid: impl Into<String>,
        headers: &MessageHeaders,
        flags: MessageFlags,
        size: u32,
        extra: X,
    ) -> Self {
        let mut info = Self::new(uid, flags, size, extra);
        info.date_sent = headers.date_sent;
        info.date_received = chrono::Utc::now().timestamp();
        info.subject = headers.subject.clone();
        info.from = headers.from.clone();
        info.to = headers.to.clone();
        info.cc = headers.cc.clone();
        info.message_id = headers.message_id.clone();
        info
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn flags(&self) -> MessageFlags {
        MessageFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    /// Replace the whole flag set in one store.
    pub fn store_flags(&self, flags: MessageFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    /// Set the bits of `mask` to the matching bits of `set`.
    ///
    /// Returns the previous flags.
    pub fn update_flags(&self, mask: MessageFlags, set: MessageFlags) -> MessageFlags {
        let prev = self
            .flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
                Some((old & !mask.bits()) | (set.bits() & mask.bits()))
            })
            .unwrap_or_else(|old| old);
        MessageFlags::from_bits_retain(prev)
    }

    pub fn has(&self, flag: MessageFlags) -> bool {
        self.flags().contains(flag)
    }

    pub fn size(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }

    pub fn set_size(&self, size: u32) {
        self.size.store(size, Ordering::Release);
    }
}

/// Folder-existence metadata kept by the store summary.
#[derive(Debug)]
pub struct StoreInfo {
    path: RwLock<String>,
    flags: AtomicU32,
    unread: AtomicI32,
    total: AtomicI32,
    uri: Mutex<Option<String>>,
}

impl StoreInfo {
    pub fn new(path: impl Into<String>, flags: FolderFlags) -> Self {
        Self {
            path: RwLock::new(path.into()),
            flags: AtomicU32::new(flags.bits()),
            unread: AtomicI32::new(-1),
            total: AtomicI32::new(-1),
            uri: Mutex::new(None),
        }
    }

    pub fn path(&self) -> String {
        self.path
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Only the store summary renames, with its own lock held.
    pub(crate) fn set_path(&self, path: String) {
        *self.path.write().unwrap_or_else(PoisonError::into_inner) = path;
        *self.uri.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn flags(&self) -> FolderFlags {
        FolderFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    pub fn update_flags(&self, mask: FolderFlags, set: FolderFlags) -> FolderFlags {
        let prev = self
            .flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |old| {
                Some((old & !mask.bits()) | (set.bits() & mask.bits()))
            })
            .unwrap_or_else(|old| old);
        FolderFlags::from_bits_retain(prev)
    }

    /// Unread count, or -1 when unknown.
    pub fn unread(&self) -> i32 {
        self.unread.load(Ordering::Acquire)
    }

    /// Total count, or -1 when unknown.
    pub fn total(&self) -> i32 {
        self.total.load(Ordering::Acquire)
    }

    pub(crate) fn store_counts(&self, unread: i32, total: i32) -> bool {
        let a = self.unread.swap(unread, Ordering::AcqRel);
        let b = self.total.swap(total, Ordering::AcqRel);
        a != unread || b != total
    }

    /// Build the uri on first use and cache it until the next rename.
    pub fn uri(&self, base: &str) -> String {
        let mut cached = self.uri.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(uri) = cached.as_ref() {
            return uri.clone();
        }
        let uri = format!("{}{}", base, self.path());
        *cached = Some(uri.clone());
        uri
    }
}
