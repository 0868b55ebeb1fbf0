//! Primitive binary encoding used by every summary file.
//!
//! All multi-byte integers are big-endian. Layout of the primitives:
//!
//! ```text
//! int32     4 bytes, signed
//! uint32    var-int: 7 bits per byte, most significant group first,
//!           the last byte carries the high bit (1..=5 bytes)
//! off_t     8 bytes, unsigned
//! time_t    8 bytes signed (version >= 3) or 4 bytes signed (version 2)
//! string    uint32(len + 1) then len bytes; uint32(0) means absent
//! ```

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Result, SummaryError};

/// Default upper bound on an encoded string (1 MB).
pub const DEFAULT_MAX_STRING_LEN: usize = 1024 * 1024;

fn decode_err(what: &str, e: io::Error) -> SummaryError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        SummaryError::corrupt(format!("truncated {what}"))
    } else {
        SummaryError::from(e)
    }
}

/// Reads summary primitives from any byte stream.
pub struct Decoder<R> {
    inner: R,
    time64: bool,
    max_string_len: usize,
}

impl<R: Read> Decoder<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            time64: true,
            max_string_len: DEFAULT_MAX_STRING_LEN,
        }
    }

    /// Select the `time_t` width (8 bytes when `true`, 4 when `false`).
    pub fn set_time64(&mut self, time64: bool) {
        self.time64 = time64;
    }

    pub fn set_max_string_len(&mut self, len: usize) {
        self.max_string_len = len;
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.inner
            .read_i32::<BigEndian>()
            .map_err(|e| decode_err("int32", e))
    }

    pub fn read_uint32(&mut self) -> Result<u32> {
        let mut value: u32 = 0;
        for _ in 0..5 {
            let b = self.inner.read_u8().map_err(|e| decode_err("uint32", e))?;
            value = value
                .checked_shl(7)
                .filter(|_| value >> 25 == 0)
                .ok_or_else(|| SummaryError::corrupt("uint32 overflow"))?
                | u32::from(b & 0x7f);
            if b & 0x80 != 0 {
                return Ok(value);
            }
        }
        Err(SummaryError::corrupt("uint32 longer than 5 bytes"))
    }

    pub fn read_off(&mut self) -> Result<u64> {
        self.inner
            .read_u64::<BigEndian>()
            .map_err(|e| decode_err("off_t", e))
    }

    pub fn read_time(&mut self) -> Result<i64> {
        if self.time64 {
            self.inner
                .read_i64::<BigEndian>()
                .map_err(|e| decode_err("time_t", e))
        } else {
            self.inner
                .read_i32::<BigEndian>()
                .map(i64::from)
                .map_err(|e| decode_err("time_t", e))
        }
    }

    /// Read a string; an absent string decodes as empty.
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_uint32()? as usize;
        if len == 0 {
            return Ok(String::new());
        }
        let len = len - 1;
        if len > self.max_string_len {
            return Err(SummaryError::corrupt(format!(
                "string length {len} exceeds limit {}",
                self.max_string_len
            )));
        }
        let mut buf = vec![0u8; len];
        self.inner
            .read_exact(&mut buf)
            .map_err(|e| decode_err("string", e))?;
        Ok(match String::from_utf8(buf) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        })
    }
}

/// Writes summary primitives to any byte sink.
pub struct Encoder<W> {
    inner: W,
    time64: bool,
    max_string_len: usize,
}

impl<W: Write> Encoder<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            time64: true,
            max_string_len: DEFAULT_MAX_STRING_LEN,
        }
    }

    pub fn set_time64(&mut self, time64: bool) {
        self.time64 = time64;
    }

    pub fn set_max_string_len(&mut self, len: usize) {
        self.max_string_len = len;
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        Ok(self.inner.write_i32::<BigEndian>(v)?)
    }

    pub fn write_uint32(&mut self, v: u32) -> Result<()> {
        let mut buf = [0u8; 5];
        let mut start = buf.len();
        let mut rest = v;
        loop {
            start -= 1;
            buf[start] = (rest & 0x7f) as u8;
            rest >>= 7;
            if rest == 0 {
                break;
            }
        }
        buf[4] |= 0x80;
        Ok(self.inner.write_all(&buf[start..])?)
    }

    pub fn write_off(&mut self, v: u64) -> Result<()> {
        Ok(self.inner.write_u64::<BigEndian>(v)?)
    }

    pub fn write_time(&mut self, v: i64) -> Result<()> {
        if self.time64 {
            Ok(self.inner.write_i64::<BigEndian>(v)?)
        } else {
            let narrowed = i32::try_from(v).map_err(|_| {
                SummaryError::InconsistentState(format!("time {v} does not fit in 32 bits"))
            })?;
            Ok(self.inner.write_i32::<BigEndian>(narrowed)?)
        }
    }

    pub fn write_string(&mut self, s: &str) -> Result<()> {
        if s.len() > self.max_string_len {
            return Err(SummaryError::InconsistentState(format!(
                "string length {} exceeds limit {}",
                s.len(),
                self.max_string_len
            )));
        }
        self.write_uint32(s.len() as u32 + 1)?;
        Ok(self.inner.write_all(s.as_bytes())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encode(f: impl FnOnce(&mut Encoder<&mut Vec<u8>>)) -> Vec<u8> {
        let mut out = Vec::new();
        f(&mut Encoder::new(&mut out));
        out
    }

    #[test]
    fn test_uint32_layout() {
        assert_eq!(encode(|e| e.write_uint32(0).unwrap()), vec![0x80]);
        assert_eq!(encode(|e| e.write_uint32(0x7f).unwrap()), vec![0xff]);
        assert_eq!(encode(|e| e.write_uint32(0x80).unwrap()), vec![0x01, 0x80]);
        assert_eq!(encode(|e| e.write_uint32(u32::MAX).unwrap()).len(), 5);
    }

    #[test]
    fn test_int32_is_big_endian() {
        assert_eq!(
            encode(|e| e.write_i32(0x0102_0304).unwrap()),
            vec![1, 2, 3, 4]
        );
    }

    #[test]
    fn test_time_width_follows_version() {
        let wide = encode(|e| e.write_time(1_700_000_000).unwrap());
        assert_eq!(wide.len(), 8);
        let narrow = encode(|e| {
            e.set_time64(false);
            e.write_time(1_700_000_000).unwrap()
        });
        assert_eq!(narrow.len(), 4);

        let mut dec = Decoder::new(&narrow[..]);
        dec.set_time64(false);
        assert_eq!(dec.read_time().unwrap(), 1_700_000_000);
    }

    #[test]
    fn test_absent_string_decodes_empty() {
        let mut dec = Decoder::new(&[0x80u8][..]);
        assert_eq!(dec.read_string().unwrap(), "");
    }

    #[test]
    fn test_truncated_string_is_corrupt() {
        let mut bytes = encode(|e| e.write_string("hello").unwrap());
        bytes.truncate(3);
        let err = Decoder::new(&bytes[..]).read_string().unwrap_err();
        assert!(matches!(err, SummaryError::CorruptRecord { .. }));
    }

    #[test]
    fn test_truncated_int_is_corrupt() {
        let err = Decoder::new(&[0u8, 1][..]).read_i32().unwrap_err();
        assert!(matches!(err, SummaryError::CorruptRecord { .. }));
        let err = Decoder::new(&[0x01u8][..]).read_uint32().unwrap_err();
        assert!(matches!(err, SummaryError::CorruptRecord { .. }));
    }

    #[test]
    fn test_oversized_string_rejected() {
        let bytes = encode(|e| e.write_string("abcdef").unwrap());
        let mut dec = Decoder::new(&bytes[..]);
        dec.set_max_string_len(3);
        assert!(matches!(
            dec.read_string(),
            Err(SummaryError::CorruptRecord { .. })
        ));

        let mut out = Vec::new();
        let mut enc = Encoder::new(&mut out);
        enc.set_max_string_len(3);
        assert!(matches!(
            enc.write_string("abcdef"),
            Err(SummaryError::InconsistentState(_))
        ));
    }

    #[test]
    fn test_overlong_varint_is_corrupt() {
        let err = Decoder::new(&[0x7fu8, 0x7f, 0x7f, 0x7f, 0x7f, 0x80][..])
            .read_uint32()
            .unwrap_err();
        assert!(matches!(err, SummaryError::CorruptRecord { .. }));
    }

    proptest! {
        #[test]
        fn uint32_decodes_what_it_encodes(v in any::<u32>()) {
            let bytes = encode(|e| e.write_uint32(v).unwrap());
            let mut dec = Decoder::new(&bytes[..]);
            prop_assert_eq!(dec.read_uint32().unwrap(), v);
        }

        #[test]
        fn string_decodes_what_it_encodes(s in "\\PC{0,64}") {
            let bytes = encode(|e| e.write_string(&s).unwrap());
            let mut dec = Decoder::new(&bytes[..]);
            prop_assert_eq!(dec.read_string().unwrap(), s);
        }
    }
}
