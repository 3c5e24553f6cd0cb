// # Key Encoding
//
// A key is a sequence of typed segments encoded so that unsigned byte
// comparison of the encoded form equals segment-wise logical comparison.
// Segments are self-delimiting, so boundaries can be recovered from the
// bytes alone and a traversal can operate at any prefix depth.
//
// Segment encodings (first byte is the type tag; tags order the types):
//
// - bool:    0x11 | 0x00/0x01
// - i64:     0x21 | 8 bytes big-endian with the sign bit flipped
// - u64:     0x25 | 8 bytes big-endian
// - bytes:   0x31 | payload with 0x00 escaped as 0x00 0x01 | 0x00 0x00
// - string:  same as bytes (strings are their UTF-8 bytes)
// - tuple:   0x41 | inner segments | 0x42
//
// The escape keeps embedded zeros orderable: a terminator 0x00 0x00 sorts
// below any continuation 0x00 0x01 or ordinary byte, so "ab" < "ab\0x" <
// "abc" holds in encoded form.

use std::fmt;

use crate::error::{EngineError, Result};

pub const TAG_BOOL: u8 = 0x11;
pub const TAG_I64: u8 = 0x21;
pub const TAG_U64: u8 = 0x25;
pub const TAG_BYTES: u8 = 0x31;
pub const TAG_TUPLE_BEGIN: u8 = 0x41;
pub const TAG_TUPLE_END: u8 = 0x42;

/// One logical key segment.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Segment>),
}

impl Segment {
    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Segment::Bool(b) => {
                out.push(TAG_BOOL);
                out.push(u8::from(*b));
            }
            Segment::Int(v) => {
                out.push(TAG_I64);
                out.extend_from_slice(&(*v as u64 ^ 0x8000_0000_0000_0000).to_be_bytes());
            }
            Segment::Uint(v) => {
                out.push(TAG_U64);
                out.extend_from_slice(&v.to_be_bytes());
            }
            Segment::Str(s) => {
                out.push(TAG_BYTES);
                escape_into(s.as_bytes(), out);
            }
            Segment::Bytes(b) => {
                out.push(TAG_BYTES);
                escape_into(b, out);
            }
            Segment::Tuple(inner) => {
                out.push(TAG_TUPLE_BEGIN);
                for segment in inner {
                    segment.encode_into(out);
                }
                out.push(TAG_TUPLE_END);
            }
        }
    }
}

fn escape_into(data: &[u8], out: &mut Vec<u8>) {
    for &b in data {
        if b == 0 {
            out.push(0);
            out.push(1);
        } else {
            out.push(b);
        }
    }
    out.push(0);
    out.push(0);
}

/// Length of the encoded segment starting at `bytes[0]`.
fn segment_len(bytes: &[u8]) -> Result<usize> {
    let bad = || EngineError::Corrupt("malformed key encoding".to_string());
    match *bytes.first().ok_or_else(bad)? {
        TAG_BOOL => Ok(2),
        TAG_I64 | TAG_U64 => Ok(9),
        TAG_BYTES => {
            let mut i = 1;
            loop {
                match bytes.get(i) {
                    None => return Err(bad()),
                    Some(0) => {
                        let next = bytes.get(i + 1).copied().ok_or_else(bad)?;
                        i += 2;
                        if next == 0 {
                            return Ok(i);
                        }
                        if next != 1 {
                            return Err(bad());
                        }
                    }
                    Some(_) => i += 1,
                }
            }
        }
        TAG_TUPLE_BEGIN => {
            let mut i = 1;
            while bytes.get(i).copied().ok_or_else(bad)? != TAG_TUPLE_END {
                i += segment_len(&bytes[i..])?;
            }
            Ok(i + 1)
        }
        _ => Err(bad()),
    }
}

/// Offsets of each segment start in an encoded key, plus the total length.
pub fn segment_boundaries(bytes: &[u8]) -> Result<Vec<usize>> {
    let mut offsets = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        offsets.push(i);
        i += segment_len(&bytes[i..])?;
    }
    Ok(offsets)
}

/// The mutable key buffer of an Exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Key {
    encoded: Vec<u8>,
    /// Start offset of each appended segment.
    segments: Vec<usize>,
    /// Enforced ceiling, set from the engine's page geometry.
    max_len: usize,
}

impl Key {
    pub fn new(max_len: usize) -> Key {
        Key {
            encoded: Vec::new(),
            segments: Vec::new(),
            max_len,
        }
    }

    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    pub fn len(&self) -> usize {
        self.encoded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encoded.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Remove every segment.
    pub fn clear(&mut self) -> &mut Key {
        self.encoded.clear();
        self.segments.clear();
        self
    }

    /// Append one segment.
    pub fn append(&mut self, segment: Segment) -> Result<&mut Key> {
        let start = self.encoded.len();
        segment.encode_into(&mut self.encoded);
        if self.encoded.len() > self.max_len {
            let attempted = self.encoded.len();
            self.encoded.truncate(start);
            return Err(EngineError::KeyTooLong(attempted));
        }
        self.segments.push(start);
        Ok(self)
    }

    pub fn append_int(&mut self, v: i64) -> Result<&mut Key> {
        self.append(Segment::Int(v))
    }

    pub fn append_uint(&mut self, v: u64) -> Result<&mut Key> {
        self.append(Segment::Uint(v))
    }

    pub fn append_str(&mut self, s: &str) -> Result<&mut Key> {
        self.append(Segment::Str(s.to_string()))
    }

    pub fn append_bytes(&mut self, b: &[u8]) -> Result<&mut Key> {
        self.append(Segment::Bytes(b.to_vec()))
    }

    pub fn append_bool(&mut self, b: bool) -> Result<&mut Key> {
        self.append(Segment::Bool(b))
    }

    /// Append a sentinel that sorts before every real segment at this
    /// depth. Traversal seeding only: a key carrying a sentinel cannot be
    /// stored or decoded.
    pub fn append_before(&mut self) -> &mut Key {
        self.segments.push(self.encoded.len());
        self.encoded.push(0x01);
        self
    }

    /// Append a sentinel that sorts after every real segment at this
    /// depth. Traversal seeding only.
    pub fn append_after(&mut self) -> &mut Key {
        self.segments.push(self.encoded.len());
        self.encoded.push(0xFE);
        self
    }

    /// Remove the last segment. No-op on an empty key.
    pub fn cut(&mut self) -> &mut Key {
        if let Some(start) = self.segments.pop() {
            self.encoded.truncate(start);
        }
        self
    }

    /// Clear, then append.
    pub fn to(&mut self, segment: Segment) -> Result<&mut Key> {
        self.clear();
        self.append(segment)
    }

    /// Alias for `clear` matching the reset/append building style.
    pub fn reset(&mut self) -> &mut Key {
        self.clear()
    }

    /// Replace the whole key with already-encoded bytes (traversal results).
    pub fn set_encoded(&mut self, bytes: &[u8]) -> Result<()> {
        let segments = segment_boundaries(bytes)?;
        self.encoded = bytes.to_vec();
        self.segments = segments;
        Ok(())
    }

    /// Keep only the first `n` segments.
    pub fn truncate_segments(&mut self, n: usize) {
        if n < self.segments.len() {
            let cut_at = self.segments[n];
            self.encoded.truncate(cut_at);
            self.segments.truncate(n);
        }
    }

    /// Decode back to logical segments.
    pub fn decode(&self) -> Result<Vec<Segment>> {
        decode_segments(&self.encoded)
    }
}

fn decode_segments(mut bytes: &[u8]) -> Result<Vec<Segment>> {
    let mut out = Vec::new();
    while !bytes.is_empty() {
        let (segment, used) = decode_one(bytes)?;
        out.push(segment);
        bytes = &bytes[used..];
    }
    Ok(out)
}

fn decode_one(bytes: &[u8]) -> Result<(Segment, usize)> {
    let bad = || EngineError::Corrupt("malformed key encoding".to_string());
    let used = segment_len(bytes)?;
    let segment = match bytes[0] {
        TAG_BOOL => Segment::Bool(bytes[1] != 0),
        TAG_I64 => {
            let raw = u64::from_be_bytes(bytes[1..9].try_into().unwrap());
            Segment::Int((raw ^ 0x8000_0000_0000_0000) as i64)
        }
        TAG_U64 => Segment::Uint(u64::from_be_bytes(bytes[1..9].try_into().unwrap())),
        TAG_BYTES => {
            let mut data = Vec::new();
            let mut i = 1;
            loop {
                let b = bytes[i];
                if b == 0 {
                    if bytes[i + 1] == 0 {
                        break;
                    }
                    data.push(0);
                    i += 2;
                } else {
                    data.push(b);
                    i += 1;
                }
            }
            match String::from_utf8(data) {
                Ok(s) => Segment::Str(s),
                Err(e) => Segment::Bytes(e.into_bytes()),
            }
        }
        TAG_TUPLE_BEGIN => {
            let inner = decode_segments(&bytes[1..used - 1])?;
            Segment::Tuple(inner)
        }
        _ => return Err(bad()),
    };
    Ok((segment, used))
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            Ok(segments) => {
                write!(f, "{{")?;
                for (i, segment) in segments.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    match segment {
                        Segment::Bool(b) => write!(f, "{b}")?,
                        Segment::Int(v) => write!(f, "{v}")?,
                        Segment::Uint(v) => write!(f, "{v}")?,
                        Segment::Str(s) => write!(f, "\"{s}\"")?,
                        Segment::Bytes(b) => write!(f, "0x{}", hex(b))?,
                        Segment::Tuple(_) => write!(f, "(..)")?,
                    }
                }
                write!(f, "}}")
            }
            Err(_) => write!(f, "{{?}}"),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(segments: &[Segment]) -> Vec<u8> {
        let mut key = Key::new(2047);
        for segment in segments {
            key.append(segment.clone()).unwrap();
        }
        key.encoded().to_vec()
    }

    #[test]
    fn int_order_preserved() {
        let values = [i64::MIN, -100, -1, 0, 1, 41, 42, 1 << 40, i64::MAX];
        let mut encoded: Vec<Vec<u8>> = values.iter().map(|v| encode(&[Segment::Int(*v)])).collect();
        let sorted = {
            let mut copy = encoded.clone();
            copy.sort();
            copy
        };
        assert_eq!(encoded, sorted);
        encoded.dedup();
        assert_eq!(encoded.len(), values.len());
    }

    #[test]
    fn string_order_preserved_with_embedded_zero() {
        let values: [&[u8]; 5] = [b"ab", b"ab\0", b"ab\0x", b"abc", b"b"];
        let encoded: Vec<Vec<u8>> = values
            .iter()
            .map(|v| encode(&[Segment::Bytes(v.to_vec())]))
            .collect();
        for window in encoded.windows(2) {
            assert!(window[0] < window[1]);
        }
    }

    #[test]
    fn segment_boundaries_recoverable() {
        let bytes = encode(&[
            Segment::Str("stress6".into()),
            Segment::Int(3),
            Segment::Tuple(vec![Segment::Int(1), Segment::Str("x".into())]),
        ]);
        let bounds = segment_boundaries(&bytes).unwrap();
        assert_eq!(bounds.len(), 3);
        assert_eq!(bounds[0], 0);
    }

    #[test]
    fn round_trip_decode() {
        let segments = vec![
            Segment::Str("hello".into()),
            Segment::Int(-42),
            Segment::Uint(7),
            Segment::Bool(true),
            Segment::Tuple(vec![Segment::Int(1), Segment::Int(2)]),
        ];
        let mut key = Key::new(2047);
        for segment in &segments {
            key.append(segment.clone()).unwrap();
        }
        assert_eq!(key.decode().unwrap(), segments);
        assert_eq!(key.depth(), 5);
    }

    #[test]
    fn cut_and_truncate() {
        let mut key = Key::new(2047);
        key.append_str("a").unwrap();
        key.append_int(1).unwrap();
        key.append_int(2).unwrap();
        let full = key.encoded().to_vec();
        key.cut();
        assert_eq!(key.depth(), 2);
        key.append_int(2).unwrap();
        assert_eq!(key.encoded(), &full[..]);
        key.truncate_segments(1);
        assert_eq!(key.depth(), 1);
        key.truncate_segments(5);
        assert_eq!(key.depth(), 1);
    }

    #[test]
    fn prefix_groups_contiguously() {
        // Every key under prefix {"a"} sorts between {"a"} and {"b"}.
        let prefix = encode(&[Segment::Str("a".into())]);
        let child = encode(&[Segment::Str("a".into()), Segment::Int(5)]);
        let other = encode(&[Segment::Str("b".into())]);
        assert!(prefix < child);
        assert!(child < other);
        assert!(child.starts_with(&prefix));
    }

    #[test]
    fn set_encoded_validates() {
        let good = encode(&[Segment::Int(1)]);
        let mut key = Key::new(2047);
        key.set_encoded(&good).unwrap();
        assert_eq!(key.depth(), 1);
        assert!(key.set_encoded(&[0xEE, 0x01]).is_err());
    }

    #[test]
    fn key_too_long_rejected() {
        let mut key = Key::new(32);
        assert!(key.append_bytes(&[7u8; 64]).is_err());
        // The failed append must not leave partial bytes behind.
        assert!(key.is_empty());
    }

    #[test]
    fn display_is_readable() {
        let mut key = Key::new(2047);
        key.append_str("t").unwrap();
        key.append_int(42).unwrap();
        assert_eq!(key.to_string(), "{\"t\",42}");
    }
}
