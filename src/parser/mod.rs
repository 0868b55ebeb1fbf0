//! Message parsing: the streaming mbox scanner and header decoding.

pub mod header;
pub mod mbox;

pub use header::{parse_headers, MessageHeaders};
pub use mbox::{MboxScanner, ScannedMessage};
