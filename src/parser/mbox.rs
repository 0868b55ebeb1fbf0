//! Streaming mbox scanner.
//!
//! Reads an mbox line-by-line through a large buffer, never holding more
//! than one message's headers in memory. Tolerant of mixed line endings,
//! `From ` lines not preceded by a blank line, truncated final messages and
//! binary bodies.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, SummaryError};

/// Size of the internal read buffer.
const READ_BUFFER_SIZE: usize = 256 * 1024;

/// Headers beyond this size are not buffered (the message is still scanned).
const MAX_HEADER_SIZE: usize = 1024 * 1024;

/// One message found by the scanner.
#[derive(Debug, Clone)]
pub struct ScannedMessage {
    /// Byte offset of the `From ` separator line.
    pub offset: u64,
    /// Bytes from `offset` up to the next separator or EOF.
    pub length: u64,
    /// Header block, without the `From ` line and the terminating blank line.
    pub headers: Vec<u8>,
    /// Offset of the first header byte (just after the `From ` line).
    pub headers_offset: u64,
}

/// Scanner over one mbox file.
pub struct MboxScanner {
    path: PathBuf,
}

impl MboxScanner {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Scan every message starting at byte `start`.
    ///
    /// `start` must point at a `From ` line (or be the end of the file);
    /// anything else is `InconsistentState` so callers can fall back to a
    /// scan from offset 0. The callback returns `false` to stop early.
    ///
    /// Returns the offset at which scanning stopped.
    pub fn scan_from(
        &self,
        start: u64,
        callback: &mut dyn FnMut(ScannedMessage) -> bool,
    ) -> Result<u64> {
        let mut file = File::open(&self.path).map_err(|e| SummaryError::io(&self.path, e))?;
        let file_size = file
            .metadata()
            .map_err(|e| SummaryError::io(&self.path, e))?
            .len();
        if start > file_size {
            return Err(SummaryError::InconsistentState(format!(
                "scan offset {start} is past end of file ({file_size} bytes)"
            )));
        }
        if start == file_size {
            return Ok(start);
        }
        file.seek(SeekFrom::Start(start))
            .map_err(|e| SummaryError::io(&self.path, e))?;
        let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);

        let mut current_offset = start;
        let mut line_buf: Vec<u8> = Vec::with_capacity(4096);
        let mut pending: Option<ScannedMessage> = None;
        let mut in_headers = false;
        let mut prev_line_was_empty = true;
        let mut first_line = true;

        loop {
            line_buf.clear();
            let line_len = {
                let buf = reader
                    .fill_buf()
                    .map_err(|e| SummaryError::io(&self.path, e))?;
                if buf.is_empty() {
                    break;
                }
                let consume_len = match memchr_newline(buf) {
                    Some(pos) => pos + 1,
                    None => buf.len(),
                };
                line_buf.extend_from_slice(&buf[..consume_len]);
                reader.consume(consume_len);
                consume_len
            };

            // A long line may span several buffer fills.
            let mut total_len = line_len as u64;
            while !line_buf.ends_with(b"\n") {
                let buf = reader
                    .fill_buf()
                    .map_err(|e| SummaryError::io(&self.path, e))?;
                if buf.is_empty() {
                    break;
                }
                let consume_len = match memchr_newline(buf) {
                    Some(pos) => pos + 1,
                    None => buf.len(),
                };
                line_buf.extend_from_slice(&buf[..consume_len]);
                reader.consume(consume_len);
                total_len += consume_len as u64;
            }

            let is_from_line = is_mbox_separator(&line_buf, first_line && start == 0);

            if first_line && !is_from_line && start > 0 {
                return Err(SummaryError::InconsistentState(format!(
                    "no 'From ' line at offset {start} of '{}'",
                    self.path.display()
                )));
            }

            if !is_from_line && pending.is_none() {
                if first_line {
                    debug!(
                        path = %self.path.display(),
                        "Skipping data before the first 'From ' line"
                    );
                }
                prev_line_was_empty = is_blank_line(&line_buf);
                first_line = false;
                current_offset += total_len;
                continue;
            }

            if is_from_line {
                if pending.is_some() && !prev_line_was_empty {
                    warn!(
                        offset = current_offset,
                        "Found 'From ' separator without preceding blank line"
                    );
                }
                if let Some(mut prev) = pending.take() {
                    prev.length = current_offset - prev.offset;
                    if !callback(prev) {
                        return Ok(current_offset);
                    }
                }
                pending = Some(ScannedMessage {
                    offset: current_offset,
                    length: 0,
                    headers: Vec::new(),
                    headers_offset: current_offset + total_len,
                });
                in_headers = true;
            } else if in_headers {
                if is_blank_line(&line_buf) {
                    in_headers = false;
                } else if let Some(msg) = pending.as_mut() {
                    if msg.headers.len() + line_buf.len() <= MAX_HEADER_SIZE {
                        msg.headers.extend_from_slice(&line_buf);
                    }
                }
            }

            prev_line_was_empty = is_blank_line(&line_buf);
            first_line = false;
            current_offset += total_len;
        }

        if let Some(mut last) = pending.take() {
            last.length = current_offset - last.offset;
            callback(last);
        }

        Ok(current_offset)
    }

    /// Collect every message from `start` to EOF.
    pub fn collect_from(&self, start: u64) -> Result<Vec<ScannedMessage>> {
        let mut out = Vec::new();
        self.scan_from(start, &mut |msg| {
            out.push(msg);
            true
        })?;
        Ok(out)
    }

    /// Read `length` bytes at `offset`.
    pub fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let mut file = File::open(&self.path).map_err(|e| SummaryError::io(&self.path, e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| SummaryError::io(&self.path, e))?;
        let mut buffer = vec![0u8; length as usize];
        file.read_exact(&mut buffer)
            .map_err(|e| SummaryError::io(&self.path, e))?;
        Ok(buffer)
    }
}

#[inline]
fn memchr_newline(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n')
}

/// Check whether a line is an mbox separator (`From ` at the start).
///
/// A UTF-8 BOM is only tolerated on the very first line of the file.
pub fn is_mbox_separator(line: &[u8], at_file_start: bool) -> bool {
    let line = if at_file_start && line.starts_with(&[0xEF, 0xBB, 0xBF]) {
        &line[3..]
    } else {
        line
    };
    line.starts_with(b"From ")
}

/// Check whether a line is blank (empty or only whitespace / CR / LF).
pub fn is_blank_line(line: &[u8]) -> bool {
    line.iter()
        .all(|&b| b == b'\n' || b == b'\r' || b == b' ' || b == b'\t')
}
