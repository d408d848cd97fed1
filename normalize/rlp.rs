//! Recursive-length-prefix decoder.
//!
//! Decodes into a tagged tree (`Bytes` | `List`) with explicit bounds checks
//! on every length prefix. Non-canonical encodings (single bytes wrapped in a
//! string header, long-form lengths below 56, lengths with leading zeros) are
//! rejected so one payload has exactly one accepted encoding.
//!
//! Encoding goes through `rlp::RlpStream`; only decoding is done here.

use ::rlp::RlpStream;
use thiserror::Error;

/// Maximum list nesting accepted. Transactions use at most 4 levels
/// (envelope / access list / entry / storage keys).
pub const MAX_DEPTH: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RlpItem {
    Bytes(Vec<u8>),
    List(Vec<RlpItem>),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RlpError {
    #[error("empty input")]
    Empty,
    #[error("truncated item at offset {offset}: need {needed} bytes, {available} available")]
    Truncated { offset: usize, needed: usize, available: usize },
    #[error("non-canonical encoding at offset {0}")]
    NonCanonical(usize),
    #[error("{0} trailing bytes after top-level item")]
    TrailingBytes(usize),
    #[error("nesting deeper than {MAX_DEPTH} at offset {0}")]
    TooDeep(usize),
    #[error("length prefix does not fit in usize at offset {0}")]
    LengthOverflow(usize),
    #[error("expected {expected} at field {field}")]
    UnexpectedShape { field: usize, expected: &'static str },
    #[error("integer at field {0} too large")]
    IntegerOverflow(usize),
}

/// Decode exactly one item spanning the whole input.
pub fn decode(input: &[u8]) -> Result<RlpItem, RlpError> {
    if input.is_empty() {
        return Err(RlpError::Empty);
    }
    let (item, used) = decode_item(input, 0, 0)?;
    if used != input.len() {
        return Err(RlpError::TrailingBytes(input.len() - used));
    }
    Ok(item)
}

/// Header of the item starting at `buf[0]`: (payload offset, payload length, is_list).
fn header(buf: &[u8], base: usize) -> Result<(usize, usize, bool), RlpError> {
    let prefix = buf[0];
    match prefix {
        0x00..=0x7f => Ok((0, 1, false)),
        0x80..=0xb7 => {
            let len = (prefix - 0x80) as usize;
            if len == 1 {
                let b = *buf.get(1).ok_or(RlpError::Truncated { offset: base, needed: 2, available: buf.len() })?;
                if b < 0x80 {
                    return Err(RlpError::NonCanonical(base));
                }
            }
            Ok((1, len, false))
        }
        0xb8..=0xbf => {
            let len_of_len = (prefix - 0xb7) as usize;
            let len = long_length(buf, base, len_of_len)?;
            Ok((1 + len_of_len, len, false))
        }
        0xc0..=0xf7 => Ok((1, (prefix - 0xc0) as usize, true)),
        0xf8..=0xff => {
            let len_of_len = (prefix - 0xf7) as usize;
            let len = long_length(buf, base, len_of_len)?;
            Ok((1 + len_of_len, len, true))
        }
    }
}

fn long_length(buf: &[u8], base: usize, len_of_len: usize) -> Result<usize, RlpError> {
    let bytes = buf.get(1..1 + len_of_len).ok_or(RlpError::Truncated {
        offset: base,
        needed: 1 + len_of_len,
        available: buf.len(),
    })?;
    if bytes[0] == 0 {
        return Err(RlpError::NonCanonical(base));
    }
    if len_of_len > std::mem::size_of::<usize>() {
        return Err(RlpError::LengthOverflow(base));
    }
    let len = bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
    if len < 56 {
        return Err(RlpError::NonCanonical(base));
    }
    Ok(len)
}

fn decode_item(buf: &[u8], base: usize, depth: usize) -> Result<(RlpItem, usize), RlpError> {
    if buf.is_empty() {
        return Err(RlpError::Truncated { offset: base, needed: 1, available: 0 });
    }
    let (payload_off, payload_len, is_list) = header(buf, base)?;
    if payload_off == 0 {
        return Ok((RlpItem::Bytes(vec![buf[0]]), 1));
    }
    let end = payload_off
        .checked_add(payload_len)
        .ok_or(RlpError::LengthOverflow(base))?;
    if end > buf.len() {
        return Err(RlpError::Truncated { offset: base, needed: end, available: buf.len() });
    }
    let payload = &buf[payload_off..end];

    if !is_list {
        return Ok((RlpItem::Bytes(payload.to_vec()), end));
    }
    if depth >= MAX_DEPTH {
        return Err(RlpError::TooDeep(base));
    }

    let mut items = Vec::new();
    let mut pos = 0usize;
    while pos < payload.len() {
        let (item, used) = decode_item(&payload[pos..], base + payload_off + pos, depth + 1)?;
        items.push(item);
        pos += used;
    }
    Ok((RlpItem::List(items), end))
}

impl RlpItem {
    pub fn as_bytes(&self, field: usize) -> Result<&[u8], RlpError> {
        match self {
            RlpItem::Bytes(b) => Ok(b),
            RlpItem::List(_) => Err(RlpError::UnexpectedShape { field, expected: "byte string" }),
        }
    }

    pub fn as_list(&self, field: usize) -> Result<&[RlpItem], RlpError> {
        match self {
            RlpItem::List(items) => Ok(items),
            RlpItem::Bytes(_) => Err(RlpError::UnexpectedShape { field, expected: "list" }),
        }
    }

    /// Big-endian unsigned integer of at most 8 bytes.
    pub fn as_u64(&self, field: usize) -> Result<u64, RlpError> {
        let b = self.as_bytes(field)?;
        if b.len() > 8 {
            return Err(RlpError::IntegerOverflow(field));
        }
        Ok(b.iter().fold(0u64, |acc, x| (acc << 8) | *x as u64))
    }

    /// Integer payload as a hex string without prefix (`""` for zero).
    pub fn as_hex_quantity(&self, field: usize) -> Result<String, RlpError> {
        Ok(hex::encode(self.as_bytes(field)?))
    }

    /// Re-encode this item.
    pub fn encode(&self) -> Vec<u8> {
        let mut s = RlpStream::new();
        append_item(&mut s, self);
        s.out().to_vec()
    }
}

/// Append a decoded item to an encoder stream, preserving the original field bytes.
pub fn append_item(s: &mut RlpStream, item: &RlpItem) {
    match item {
        RlpItem::Bytes(b) => {
            s.append(&b.as_slice());
        }
        RlpItem::List(items) => {
            s.begin_list(items.len());
            for it in items {
                append_item(s, it);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_bytes_and_short_strings() {
        assert_eq!(decode(&[0x05]).unwrap(), RlpItem::Bytes(vec![5]));
        assert_eq!(decode(&[0x80]).unwrap(), RlpItem::Bytes(vec![]));
        assert_eq!(decode(&[0x83, b'd', b'o', b'g']).unwrap(), RlpItem::Bytes(b"dog".to_vec()));
    }

    #[test]
    fn nested_lists() {
        // [ [], [[]], [ [], [[]] ] ]
        let enc = [0xc7, 0xc0, 0xc1, 0xc0, 0xc3, 0xc0, 0xc1, 0xc0];
        let item = decode(&enc).unwrap();
        let top = item.as_list(0).unwrap();
        assert_eq!(top.len(), 3);
        assert_eq!(top[0], RlpItem::List(vec![]));
        assert_eq!(item.encode(), enc.to_vec());
    }

    #[test]
    fn long_string() {
        let payload = vec![0xaa; 60];
        let mut enc = vec![0xb8, 60];
        enc.extend_from_slice(&payload);
        assert_eq!(decode(&enc).unwrap(), RlpItem::Bytes(payload));
    }

    #[test]
    fn rejects_truncation_and_trailing_bytes() {
        assert!(matches!(decode(&[0x83, b'd', b'o']), Err(RlpError::Truncated { .. })));
        assert!(matches!(decode(&[0xc2, 0x01]), Err(RlpError::Truncated { .. })));
        assert_eq!(decode(&[0x01, 0x02]), Err(RlpError::TrailingBytes(1)));
        assert_eq!(decode(&[]), Err(RlpError::Empty));
    }

    #[test]
    fn rejects_non_canonical() {
        // single byte < 0x80 wrapped in a string header
        assert_eq!(decode(&[0x81, 0x05]), Err(RlpError::NonCanonical(0)));
        // long form used for a short payload
        let mut enc = vec![0xb8, 3];
        enc.extend_from_slice(b"dog");
        assert_eq!(decode(&enc), Err(RlpError::NonCanonical(0)));
        // length with leading zero
        assert_eq!(decode(&[0xb9, 0x00, 0x40]), Err(RlpError::NonCanonical(0)));
    }

    #[test]
    fn rejects_excessive_nesting() {
        let mut enc = Vec::new();
        for i in 0..=MAX_DEPTH {
            enc.push(0xc0 + (MAX_DEPTH - i) as u8);
        }
        assert!(matches!(decode(&enc), Err(RlpError::TooDeep(_))));
    }

    #[test]
    fn integer_accessors() {
        let item = decode(&[0x82, 0x04, 0x00]).unwrap();
        assert_eq!(item.as_u64(0).unwrap(), 1024);
        assert_eq!(item.as_hex_quantity(0).unwrap(), "0400");
        let nine = RlpItem::Bytes(vec![1; 9]);
        assert_eq!(nine.as_u64(3), Err(RlpError::IntegerOverflow(3)));
    }
}
