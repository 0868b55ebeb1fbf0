//! Message and folder flag sets.

use bitflags::bitflags;

bitflags! {
    /// Per-message flags persisted in every summary record.
    ///
    /// The low 16 bits are user-visible and are what the `X-Evolution`
    /// marker carries inside mbox messages. The `FOLDER_*` bits are
    /// bookkeeping owned by the local summaries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageFlags: u32 {
        const ANSWERED = 1 << 0;
        const DELETED = 1 << 1;
        const DRAFT = 1 << 2;
        const FLAGGED = 1 << 3;
        const SEEN = 1 << 4;
        const ATTACHMENTS = 1 << 5;
        const JUNK = 1 << 7;

        /// Flags changed in memory; the backing store needs a rewrite.
        const FOLDER_FLAGGED = 1 << 16;
        /// The message carries no `X-Evolution` marker yet.
        const FOLDER_NOXEV = 1 << 17;
        /// The marker exists but its uid or flags disagree with the record.
        const FOLDER_XEVCHANGE = 1 << 18;
        /// Transient, set on every record during an mbox rescan.
        const FOLDER_NOTSEEN = 1 << 19;
    }
}

impl MessageFlags {
    /// Bits that are written into the `X-Evolution` marker.
    pub const MARKER_MASK: u32 = 0xffff;

    /// Bits cleared once a sync has written the message back.
    pub const SYNC_PENDING: MessageFlags = MessageFlags::FOLDER_FLAGGED
        .union(MessageFlags::FOLDER_NOXEV)
        .union(MessageFlags::FOLDER_XEVCHANGE);

    /// Just the user-visible part of this set.
    pub fn user_bits(self) -> u32 {
        self.bits() & Self::MARKER_MASK
    }
}

bitflags! {
    /// Per-folder flags kept by the store summary.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FolderFlags: u32 {
        const NOSELECT = 1 << 0;
        const READONLY = 1 << 1;
        const SUBSCRIBED = 1 << 2;
        const SYSTEM = 1 << 3;
    }
}
