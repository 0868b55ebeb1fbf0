//! RFC 5322 header parsing: folding, encoded-words (RFC 2047), dates, and
//! the mailbox-private flag headers (`X-Evolution`, `Status`, `X-Status`).

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use tracing::warn;

use crate::model::MessageFlags;

/// The subset of a message's headers a summary record is built from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageHeaders {
    pub subject: String,
    pub from: String,
    pub to: String,
    pub cc: String,
    pub message_id: String,
    /// `Date:` as a Unix timestamp, 0 when absent or unparseable.
    pub date_sent: i64,
    pub has_attachments: bool,
    /// Raw `X-Evolution` value, if present.
    pub x_evolution: Option<String>,
    pub status: Option<String>,
    pub x_status: Option<String>,
}

impl MessageHeaders {
    /// Flags implied by `Status` / `X-Status` (used when no marker exists).
    pub fn status_flags(&self) -> MessageFlags {
        let mut flags = MessageFlags::empty();
        if let Some(status) = &self.status {
            if status.contains('R') {
                flags |= MessageFlags::SEEN;
            }
        }
        if let Some(x_status) = &self.x_status {
            for (c, f) in [
                ('A', MessageFlags::ANSWERED),
                ('F', MessageFlags::FLAGGED),
                ('D', MessageFlags::DELETED),
                ('T', MessageFlags::DRAFT),
            ] {
                if x_status.contains(c) {
                    flags |= f;
                }
            }
        }
        if self.has_attachments {
            flags |= MessageFlags::ATTACHMENTS;
        }
        flags
    }
}

/// Parse a raw header block (everything up to the blank line).
pub fn parse_headers(raw_headers: &[u8]) -> MessageHeaders {
    let text = decode_header_bytes(raw_headers);
    let headers = unfold_headers(&text);
    let get = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    };

    let content_type = get("content-type")
        .map(|ct| ct.split(';').next().unwrap_or("").trim().to_lowercase())
        .unwrap_or_default();
    let has_attachments = content_type.starts_with("multipart/mixed")
        || headers
            .iter()
            .any(|(k, v)| k == "content-disposition" && v.to_lowercase().contains("attachment"));

    MessageHeaders {
        subject: get("subject").map(decode_encoded_words).unwrap_or_default(),
        from: get("from").map(decode_encoded_words).unwrap_or_default(),
        to: get("to").map(decode_encoded_words).unwrap_or_default(),
        cc: get("cc").map(decode_encoded_words).unwrap_or_default(),
        message_id: get("message-id")
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
        date_sent: get("date")
            .and_then(parse_date)
            .map(|d| d.timestamp())
            .unwrap_or(0),
        has_attachments,
        x_evolution: get("x-evolution").map(str::to_string),
        status: get("status").map(str::to_string),
        x_status: get("x-status").map(str::to_string),
    }
}

/// Split a full message into its header block and body at the first blank line.
///
/// Returns `(headers, body)`; the blank line belongs to neither.
pub fn split_message(raw: &[u8]) -> (&[u8], &[u8]) {
    let mut pos = 0;
    while pos < raw.len() {
        let end = raw[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|p| pos + p + 1)
            .unwrap_or(raw.len());
        let line = &raw[pos..end];
        if line == b"\n" || line == b"\r\n" {
            return (&raw[..pos], &raw[end..]);
        }
        pos = end;
    }
    (raw, &[])
}

/// Decode raw header bytes, UTF-8 first and Windows-1252 otherwise.
fn decode_header_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

/// Join continuation lines; returns `(lowercase_name, value)` pairs.
fn unfold_headers(text: &str) -> Vec<(String, String)> {
    let mut result: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = result.last_mut() {
                last.1.push(' ');
                last.1.push_str(line.trim());
            }
        } else if let Some(colon_pos) = line.find(':') {
            let name = line[..colon_pos].trim().to_lowercase();
            let value = line[colon_pos + 1..].trim().to_string();
            result.push((name, value));
        }
    }
    result
}

/// Decode RFC 2047 encoded-words in a header value.
///
/// Whitespace between two adjacent encoded-words is dropped; a token that
/// fails to decode is kept verbatim.
pub fn decode_encoded_words(input: &str) -> String {
    use mail_parser::MessageParser;

    if !input.contains("=?") {
        return input.to_string();
    }
    let value = input.replace(['\r', '\n'], " ");
    let fake_msg = format!("Subject: {value}\r\n\r\n");
    MessageParser::default()
        .parse(fake_msg.as_bytes())
        .and_then(|msg| msg.subject().map(str::to_string))
        .unwrap_or(value)
}

/// Parse an email date in the common formats, with `mail-parser` as a
/// last resort.
pub fn parse_date(date_str: &str) -> Option<DateTime<Utc>> {
    let trimmed = date_str.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    let no_dow = trimmed
        .split_once(", ")
        .filter(|(dow, _)| dow.len() == 3)
        .map(|(_, rest)| rest)
        .unwrap_or(trimmed);
    for fmt in ["%d %b %Y %H:%M:%S %z", "%d %b %Y %H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = DateTime::parse_from_str(no_dow, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(ndt) = NaiveDateTime::parse_from_str(no_dow, fmt) {
            return Some(Utc.from_utc_datetime(&ndt));
        }
    }

    if let Some(dt) = mail_parser_date(trimmed) {
        return Some(dt);
    }

    warn!(date = trimmed, "Could not parse date");
    None
}

fn mail_parser_date(input: &str) -> Option<DateTime<Utc>> {
    use mail_parser::MessageParser;

    let fake_msg = format!("Date: {input}\n\n");
    let parsed = MessageParser::default().parse(fake_msg.as_bytes())?;
    let dt = parsed.date()?.to_rfc3339();
    DateTime::parse_from_rfc3339(&dt)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}
