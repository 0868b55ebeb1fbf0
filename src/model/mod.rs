//! Summary record types and flag sets.

pub mod flags;
pub mod info;

pub use flags::{FolderFlags, MessageFlags};
pub use info::{MessageInfo, StoreInfo};
