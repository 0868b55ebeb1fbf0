//! The `X-Evolution` marker and the flag headers written next to it.
//!
//! The marker value is `%08x-%04x`: the numeric uid in hex, a dash, and
//! the user-visible flag bits in hex. Its fixed width is what lets mbox
//! sync patch flags in place.

use crate::model::MessageFlags;

pub const MARKER_HEADER: &str = "X-Evolution";

/// Length of every value produced by [`encode`].
pub const MARKER_LEN: usize = 13;

/// Headers replaced whenever a message is rewritten.
const FLAG_HEADERS: [&str; 3] = ["x-evolution", "status", "x-status"];

/// Encode a marker value. Only numeric uids have a marker.
pub fn encode(uid: &str, flags: MessageFlags) -> Option<String> {
    let n: u32 = uid.parse().ok()?;
    Some(format!("{:08x}-{:04x}", n, flags.user_bits()))
}

/// Decode a marker value, tolerating surrounding whitespace and short
/// hex fields.
pub fn decode(value: &str) -> Option<(String, MessageFlags)> {
    let (uid, flags) = value.trim().split_once('-')?;
    if uid.is_empty() || flags.is_empty() {
        return None;
    }
    let uid = u32::from_str_radix(uid, 16).ok()?;
    let flags = u32::from_str_radix(flags, 16).ok()?;
    Some((
        uid.to_string(),
        MessageFlags::from_bits_retain(flags & MessageFlags::MARKER_MASK),
    ))
}

/// Replacement bytes for an existing marker value, or `None` when the new
/// value would not occupy exactly the same number of bytes.
pub fn quick_sync_patch(old_value: &[u8], uid: &str, flags: MessageFlags) -> Option<Vec<u8>> {
    let new = encode(uid, flags)?;
    (new.len() == old_value.len()).then(|| new.into_bytes())
}

/// Locate the marker value inside a header block.
///
/// Returns the byte range of the value, excluding the leading whitespace
/// and the line ending.
pub fn find_marker(headers: &[u8]) -> Option<(usize, usize)> {
    let mut pos = 0;
    for line in headers.split_inclusive(|&b| b == b'\n') {
        let start = pos;
        pos += line.len();
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        if !line[..colon].eq_ignore_ascii_case(MARKER_HEADER.as_bytes()) {
            continue;
        }
        let mut value_start = colon + 1;
        while value_start < line.len() && matches!(line[value_start], b' ' | b'\t') {
            value_start += 1;
        }
        let mut value_end = line.len();
        while value_end > value_start && matches!(line[value_end - 1], b'\n' | b'\r') {
            value_end -= 1;
        }
        return Some((start + value_start, start + value_end));
    }
    None
}

/// Rewrite a header block so it carries the marker and status headers for
/// `flags`, dropping any previous copies of them.
pub fn rewrite_headers(headers: &[u8], uid: &str, flags: MessageFlags) -> Option<Vec<u8>> {
    let marker = encode(uid, flags)?;
    let eol: &[u8] = if headers.windows(2).any(|w| w == b"\r\n") {
        b"\r\n"
    } else {
        b"\n"
    };

    let mut out = Vec::with_capacity(headers.len() + 64);
    let mut skipping = false;
    for line in headers.split_inclusive(|&b| b == b'\n') {
        let continuation = matches!(line.first(), Some(b' ' | b'\t'));
        if continuation {
            if !skipping {
                out.extend_from_slice(line);
            }
            continue;
        }
        skipping = line
            .iter()
            .position(|&b| b == b':')
            .map(|colon| {
                let name = &line[..colon];
                FLAG_HEADERS
                    .iter()
                    .any(|h| name.eq_ignore_ascii_case(h.as_bytes()))
            })
            .unwrap_or(false);
        if !skipping {
            out.extend_from_slice(line);
        }
    }
    if !out.is_empty() && !out.ends_with(b"\n") {
        out.extend_from_slice(eol);
    }

    out.extend_from_slice(format!("{MARKER_HEADER}: {marker}").as_bytes());
    out.extend_from_slice(eol);
    out.extend_from_slice(status_line(flags).as_bytes());
    out.extend_from_slice(eol);
    if let Some(x_status) = x_status_line(flags) {
        out.extend_from_slice(x_status.as_bytes());
        out.extend_from_slice(eol);
    }
    Some(out)
}

fn status_line(flags: MessageFlags) -> String {
    if flags.contains(MessageFlags::SEEN) {
        "Status: RO".to_string()
    } else {
        "Status: O".to_string()
    }
}

fn x_status_line(flags: MessageFlags) -> Option<String> {
    let letters: String = [
        (MessageFlags::ANSWERED, 'A'),
        (MessageFlags::FLAGGED, 'F'),
        (MessageFlags::DELETED, 'D'),
        (MessageFlags::DRAFT, 'T'),
    ]
    .iter()
    .filter(|(f, _)| flags.contains(*f))
    .map(|(_, c)| *c)
    .collect();
    (!letters.is_empty()).then(|| format!("X-Status: {letters}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_is_fixed_width() {
        assert_eq!(encode("1", MessageFlags::SEEN).unwrap(), "00000001-0010");
        assert_eq!(
            encode("4294967295", MessageFlags::all()).unwrap().len(),
            MARKER_LEN
        );
        assert!(encode("abc", MessageFlags::empty()).is_none());
    }

    #[test]
    fn test_decode_drops_folder_bits() {
        let (uid, flags) = decode(" 0000002a-0011\r\n").unwrap();
        assert_eq!(uid, "42");
        assert_eq!(flags, MessageFlags::ANSWERED | MessageFlags::SEEN);
        assert!(decode("garbage").is_none());
        assert!(decode("-0011").is_none());
    }

    #[test]
    fn test_find_marker() {
        let h = b"Subject: x\nx-evolution:  00000001-0000\r\nTo: y\n";
        let (s, e) = find_marker(h).unwrap();
        assert_eq!(&h[s..e], b"00000001-0000");
        assert!(find_marker(b"Subject: x\n").is_none());
    }

    #[test]
    fn test_rewrite_replaces_old_flag_headers() {
        let h = b"Subject: hi\nStatus: O\nX-Evolution: 00000009-0000\n\tfolded\nTo: a\n";
        let out = rewrite_headers(h, "3", MessageFlags::SEEN | MessageFlags::FLAGGED).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "Subject: hi\nTo: a\nX-Evolution: 00000003-0018\nStatus: RO\nX-Status: F\n"
        );
    }

    #[test]
    fn test_rewrite_keeps_crlf() {
        let out = rewrite_headers(b"Subject: hi\r\n", "1", MessageFlags::empty()).unwrap();
        assert!(out.ends_with(b"Status: O\r\n"));
    }

    proptest! {
        #[test]
        fn quick_patch_only_when_length_preserved(
            old in "[0-9a-f-]{0,20}",
            uid in any::<u32>(),
            bits in any::<u32>(),
        ) {
            let flags = MessageFlags::from_bits_retain(bits);
            let patch = quick_sync_patch(old.as_bytes(), &uid.to_string(), flags);
            match patch {
                Some(bytes) => prop_assert_eq!(bytes.len(), old.len()),
                None => prop_assert_ne!(old.len(), MARKER_LEN),
            }
        }

        #[test]
        fn marker_decodes_what_it_encodes(uid in any::<u32>(), bits in 0u32..0x10000) {
            let flags = MessageFlags::from_bits_retain(bits);
            let value = encode(&uid.to_string(), flags).unwrap();
            let (back_uid, back_flags) = decode(&value).unwrap();
            prop_assert_eq!(back_uid, uid.to_string());
            prop_assert_eq!(back_flags.bits(), bits);
        }
    }
}
