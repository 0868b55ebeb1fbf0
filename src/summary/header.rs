//! Summary file header.
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ HEADER                               │
//! │  version: int32                      │
//! │  flags: int32                        │
//! │  nextuid: int32                      │
//! │  mtime: time_t                       │
//! │  count: int32                        │
//! │  unread: int32                       │
//! │  deleted: int32                      │
//! │  (format header extra)               │
//! ├──────────────────────────────────────┤
//! │ RECORDS × count                      │
//! │  uid: string  flags: uint32          │
//! │  size: uint32 date_sent: time_t      │
//! │  date_received: time_t               │
//! │  subject, from, to, cc,              │
//! │  message_id: string                  │
//! │  (format record extra)               │
//! └──────────────────────────────────────┘
//! ```

use std::io::{Read, Write};

use crate::codec::{Decoder, Encoder};
use crate::error::{Result, SummaryError};

/// Version written by this library.
pub const CURRENT_VERSION: i32 = 3;

/// Oldest version we can still read. Version 2 stored `time_t` in 4 bytes.
pub const MIN_SUPPORTED_VERSION: i32 = 2;

/// First version with 8-byte `time_t`.
const TIME64_VERSION: i32 = 3;

/// Decoded summary header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SummaryHeader {
    pub version: i32,
    pub flags: u32,
    pub nextuid: u32,
    /// Modification time of the backing folder at the last check/sync.
    pub mtime: i64,
    pub count: u32,
    pub unread: u32,
    pub deleted: u32,
}

/// Check `version` against the readable range.
pub fn check_version(version: i32) -> Result<()> {
    if !(MIN_SUPPORTED_VERSION..=CURRENT_VERSION).contains(&version) {
        return Err(SummaryError::UnsupportedVersion {
            found: version,
            minimum: MIN_SUPPORTED_VERSION,
            current: CURRENT_VERSION,
        });
    }
    Ok(())
}

impl SummaryHeader {
    /// Decode a header, switching `dec` to the `time_t` width of its version.
    pub fn decode<R: Read>(dec: &mut Decoder<R>) -> Result<Self> {
        let version = dec.read_i32()?;
        check_version(version)?;
        dec.set_time64(version >= TIME64_VERSION);

        let flags = dec.read_i32()? as u32;
        let nextuid = dec.read_i32()? as u32;
        let mtime = dec.read_time()?;
        let count = non_negative(dec.read_i32()?, "count")?;
        let unread = non_negative(dec.read_i32()?, "unread")?;
        let deleted = non_negative(dec.read_i32()?, "deleted")?;
        Ok(Self {
            version,
            flags,
            nextuid,
            mtime,
            count,
            unread,
            deleted,
        })
    }

    /// Encode at [`CURRENT_VERSION`], whatever `self.version` says.
    pub fn encode<W: Write>(&self, enc: &mut Encoder<W>) -> Result<()> {
        enc.set_time64(true);
        enc.write_i32(CURRENT_VERSION)?;
        enc.write_i32(self.flags as i32)?;
        enc.write_i32(self.nextuid as i32)?;
        enc.write_time(self.mtime)?;
        enc.write_i32(self.count as i32)?;
        enc.write_i32(self.unread as i32)?;
        enc.write_i32(self.deleted as i32)?;
        Ok(())
    }
}

fn non_negative(v: i32, what: &str) -> Result<u32> {
    u32::try_from(v).map_err(|_| SummaryError::corrupt(format!("negative {what} in header: {v}")))
}
