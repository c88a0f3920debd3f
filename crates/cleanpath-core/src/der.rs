//! Minimal DER reader and writer.
//!
//! Only the subset of ASN.1 DER that the CleanPath PDU uses is supported:
//! single-byte tags, definite lengths up to four length octets, INTEGER,
//! OCTET STRING, UTF8String, SEQUENCE and explicit context-specific tags.
//!
//! Parsing never indexes past the end of the input. Every length is checked
//! against the remaining buffer before a slice is taken.

use crate::error::{PduError, Result};

/// Universal INTEGER tag
pub const TAG_INTEGER: u8 = 0x02;
/// Universal OCTET STRING tag
pub const TAG_OCTET_STRING: u8 = 0x04;
/// Universal UTF8String tag
pub const TAG_UTF8_STRING: u8 = 0x0C;
/// Universal constructed SEQUENCE tag
pub const TAG_SEQUENCE: u8 = 0x30;

/// Maximum number of length octets accepted in long form
const MAX_LENGTH_OCTETS: usize = 4;

/// Constructed context-specific tag `[n]` (explicit tagging).
#[must_use]
pub const fn context_tag(n: u8) -> u8 {
    0xA0 | (n & 0x1F)
}

/// Returns the tag number of a constructed context-specific tag.
#[must_use]
pub fn context_number(tag: u8) -> Option<u8> {
    if tag & 0xE0 == 0xA0 && tag & 0x1F != 0x1F {
        Some(tag & 0x1F)
    } else {
        None
    }
}

/// Parsed tag/length header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Tag byte
    pub tag: u8,
    /// Size of tag + length octets
    pub header_len: usize,
    /// Size of the content octets
    pub content_len: usize,
}

impl Header {
    /// Total encoded size of the element
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.header_len + self.content_len
    }
}

/// Parse a tag/length header from the start of `data`.
///
/// Only the header is validated; the content may extend past `data`.
pub fn read_header(data: &[u8]) -> Result<Header> {
    if data.len() < 2 {
        return Err(PduError::Truncated {
            expected: 2,
            actual: data.len(),
        });
    }

    let tag = data[0];
    let first = data[1];

    if first & 0x80 == 0 {
        return Ok(Header {
            tag,
            header_len: 2,
            content_len: usize::from(first),
        });
    }

    let octets = usize::from(first & 0x7F);
    // 0x80 is the BER indefinite form
    if octets == 0 || octets > MAX_LENGTH_OCTETS {
        return Err(PduError::InvalidLength);
    }

    let header_len = 2 + octets;
    let Some(length_bytes) = data.get(2..header_len) else {
        return Err(PduError::Truncated {
            expected: header_len,
            actual: data.len(),
        });
    };

    if length_bytes[0] == 0 {
        return Err(PduError::InvalidLength);
    }

    let content_len = length_bytes
        .iter()
        .fold(0usize, |acc, &b| (acc << 8) | usize::from(b));

    if content_len < 0x80 {
        return Err(PduError::InvalidLength);
    }

    Ok(Header {
        tag,
        header_len,
        content_len,
    })
}

/// Sequential reader over a DER buffer.
#[derive(Debug, Clone)]
pub struct DerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DerReader<'a> {
    /// Create a reader over `data`
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Whether all bytes have been consumed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Tag of the next element, if any
    #[must_use]
    pub fn peek_tag(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    /// Read the next element, returning its tag and content.
    pub fn read_any(&mut self) -> Result<(u8, &'a [u8])> {
        let rest = &self.data[self.pos..];
        let header = read_header(rest)?;

        let available = rest.len() - header.header_len;
        if header.content_len > available {
            return Err(PduError::LengthOverflow {
                declared: header.content_len,
                remaining: available,
            });
        }

        let content = &rest[header.header_len..header.total_len()];
        self.pos += header.total_len();
        Ok((header.tag, content))
    }

    /// Read the next element and require `tag`.
    pub fn read_expected(&mut self, tag: u8) -> Result<&'a [u8]> {
        match self.peek_tag() {
            Some(found) if found != tag => {
                return Err(PduError::UnexpectedTag {
                    expected: tag,
                    found,
                });
            }
            None => {
                return Err(PduError::Truncated {
                    expected: 2,
                    actual: 0,
                });
            }
            _ => {}
        }
        let (_, content) = self.read_any()?;
        Ok(content)
    }

    /// Require that every byte has been consumed.
    pub fn finish(&self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(PduError::TrailingData(n)),
        }
    }
}

/// Decode DER INTEGER content octets into an `i64`.
pub fn decode_integer(content: &[u8]) -> Result<i64> {
    if content.is_empty() || content.len() > 8 {
        return Err(PduError::InvalidInteger);
    }

    if content.len() > 1 {
        let redundant_zero = content[0] == 0x00 && content[1] & 0x80 == 0;
        let redundant_ones = content[0] == 0xFF && content[1] & 0x80 != 0;
        if redundant_zero || redundant_ones {
            return Err(PduError::InvalidInteger);
        }
    }

    let seed: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    Ok(content
        .iter()
        .fold(seed, |acc, &b| (acc << 8) | i64::from(b)))
}

/// Encode an `i64` as minimal two's-complement content octets.
#[must_use]
pub fn encode_integer(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let redundant_zero = bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0;
        let redundant_ones = bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0;
        if !(redundant_zero || redundant_ones) {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

/// Append a DER length
fn write_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }

    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    let significant = &bytes[skip..];
    out.push(0x80 | significant.len() as u8);
    out.extend_from_slice(significant);
}

/// Append a complete element (tag, length, content).
pub fn write_element(out: &mut Vec<u8>, tag: u8, content: &[u8]) {
    out.push(tag);
    write_length(out, content.len());
    out.extend_from_slice(content);
}

/// Append `inner` wrapped in an explicit context tag `[n]`.
pub fn write_explicit(out: &mut Vec<u8>, n: u8, inner_tag: u8, inner: &[u8]) {
    let mut wrapped = Vec::with_capacity(inner.len() + 6);
    write_element(&mut wrapped, inner_tag, inner);
    write_element(out, context_tag(n), &wrapped);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_length_header() {
        let header = read_header(&[0x30, 0x05]).unwrap();
        assert_eq!(header.tag, 0x30);
        assert_eq!(header.header_len, 2);
        assert_eq!(header.content_len, 5);
        assert_eq!(header.total_len(), 7);
    }

    #[test]
    fn test_long_length_header() {
        let header = read_header(&[0x04, 0x82, 0x01, 0x00]).unwrap();
        assert_eq!(header.header_len, 4);
        assert_eq!(header.content_len, 256);
    }

    #[test]
    fn test_header_rejects_indefinite_and_non_minimal() {
        assert_eq!(read_header(&[0x30, 0x80]), Err(PduError::InvalidLength));
        // 0x7F must use the short form
        assert_eq!(read_header(&[0x30, 0x81, 0x7F]), Err(PduError::InvalidLength));
        // leading zero length octet
        assert_eq!(
            read_header(&[0x30, 0x82, 0x00, 0x90]),
            Err(PduError::InvalidLength)
        );
        assert_eq!(
            read_header(&[0x30, 0x85, 1, 1, 1, 1, 1]),
            Err(PduError::InvalidLength)
        );
    }

    #[test]
    fn test_header_truncated() {
        assert!(matches!(
            read_header(&[0x30]),
            Err(PduError::Truncated { expected: 2, .. })
        ));
        assert!(matches!(
            read_header(&[0x30, 0x82, 0x01]),
            Err(PduError::Truncated { expected: 4, .. })
        ));
    }

    #[test]
    fn test_reader_length_overflow() {
        let mut reader = DerReader::new(&[0x04, 0x05, 0x01, 0x02]);
        assert_eq!(
            reader.read_any(),
            Err(PduError::LengthOverflow {
                declared: 5,
                remaining: 2
            })
        );
    }

    #[test]
    fn test_reader_sequence() {
        let mut buf = Vec::new();
        write_element(&mut buf, TAG_OCTET_STRING, b"abc");
        write_element(&mut buf, TAG_UTF8_STRING, "déjà".as_bytes());

        let mut reader = DerReader::new(&buf);
        assert_eq!(reader.read_expected(TAG_OCTET_STRING).unwrap(), b"abc");
        assert!(matches!(
            reader.clone().read_expected(TAG_OCTET_STRING),
            Err(PduError::UnexpectedTag { found: 0x0C, .. })
        ));
        assert_eq!(
            reader.read_expected(TAG_UTF8_STRING).unwrap(),
            "déjà".as_bytes()
        );
        assert!(reader.is_empty());
        assert!(reader.finish().is_ok());
    }

    #[test]
    fn test_integer_encoding() {
        assert_eq!(encode_integer(0), vec![0x00]);
        assert_eq!(encode_integer(127), vec![0x7F]);
        assert_eq!(encode_integer(128), vec![0x00, 0x80]);
        assert_eq!(encode_integer(3390), vec![0x0D, 0x3E]);
        assert_eq!(encode_integer(-1), vec![0xFF]);
        assert_eq!(encode_integer(-129), vec![0xFF, 0x7F]);
    }

    #[test]
    fn test_integer_decoding() {
        for value in [0, 1, -1, 127, 128, -128, -129, 3390, i64::MAX, i64::MIN] {
            assert_eq!(decode_integer(&encode_integer(value)).unwrap(), value);
        }
        assert_eq!(decode_integer(&[]), Err(PduError::InvalidInteger));
        assert_eq!(decode_integer(&[0x00, 0x01]), Err(PduError::InvalidInteger));
        assert_eq!(decode_integer(&[0xFF, 0x80]), Err(PduError::InvalidInteger));
        assert_eq!(decode_integer(&[1; 9]), Err(PduError::InvalidInteger));
    }

    #[test]
    fn test_long_element_roundtrip() {
        let content = vec![0xAB; 70_000];
        let mut buf = Vec::new();
        write_element(&mut buf, TAG_OCTET_STRING, &content);
        assert_eq!(&buf[..5], &[0x04, 0x83, 0x01, 0x11, 0x70]);

        let mut reader = DerReader::new(&buf);
        assert_eq!(reader.read_expected(TAG_OCTET_STRING).unwrap(), &content[..]);
    }

    #[test]
    fn test_context_tags() {
        assert_eq!(context_tag(0), 0xA0);
        assert_eq!(context_tag(9), 0xA9);
        assert_eq!(context_number(0xA7), Some(7));
        assert_eq!(context_number(0x30), None);
        assert_eq!(context_number(0xBF), None);
    }

    proptest::proptest! {
        #[test]
        fn prop_integer_roundtrip(value in proptest::prelude::any::<i64>()) {
            let content = encode_integer(value);
            proptest::prop_assert!(!content.is_empty() && content.len() <= 8);
            proptest::prop_assert_eq!(decode_integer(&content).unwrap(), value);
        }

        #[test]
        fn prop_length_roundtrip(len in 0usize..(1 << 24)) {
            let mut out = vec![TAG_OCTET_STRING];
            write_length(&mut out, len);
            let header = read_header(&out).unwrap();
            proptest::prop_assert_eq!(header.content_len, len);
            proptest::prop_assert_eq!(header.header_len, out.len());
        }
    }
}
