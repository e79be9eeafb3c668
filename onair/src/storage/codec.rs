//! Byte-level encodings shared by pages, tree keys and value containers.
//!
//! Two families live here:
//! - fixed-width big-endian integers with the sign bit flipped, so that an
//!   unsigned lexicographic byte comparison orders them like signed integers;
//! - the compact variable-length `INT` encoding used for input ids and counts
//!   inside serialized value containers.

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]

/// Sign bit mask used for order-preserving integer encoding.
pub const SIGN_FLIP: u32 = 0x8000_0000;

/// Single-byte `INT` values are strictly below this marker.
const INT_SINGLE_BYTE_LIMIT: u8 = 192;

/// Errors raised while decoding serialized data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended in the middle of a value.
    UnexpectedEof { needed: usize, available: usize },
    /// Input was structurally invalid.
    Invalid(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnexpectedEof { needed, available } => write!(
                f,
                "unexpected end of input: needed {needed} bytes, {available} available"
            ),
            Self::Invalid(msg) => write!(f, "invalid encoding: {msg}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Write `value` as 4 big-endian bytes with the sign bit flipped.
pub fn write_flipped_i32(value: i32, out: &mut [u8], offset: usize) {
    let encoded = (value as u32) ^ SIGN_FLIP;
    out[offset..offset + 4].copy_from_slice(&encoded.to_be_bytes());
}

/// Read a value written by [`write_flipped_i32`].
#[must_use]
pub fn read_flipped_i32(bytes: &[u8], offset: usize) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    (u32::from_be_bytes(raw) ^ SIGN_FLIP) as i32
}

/// Append `value` in the variable-length `INT` encoding.
///
/// Values in `0..192` take one byte. Everything else (negatives included)
/// stores the low 6 bits in a `192 + bits` lead byte, followed by 7-bit
/// groups with a continuation bit.
pub fn write_int(out: &mut Vec<u8>, value: i32) {
    let mut remaining = value as u32;
    if !(0..i32::from(INT_SINGLE_BYTE_LIMIT)).contains(&value) {
        out.push(INT_SINGLE_BYTE_LIMIT + (remaining & 0x3F) as u8);
        remaining >>= 6;
        while remaining >= 0x80 {
            out.push(((remaining & 0x7F) | 0x80) as u8);
            remaining >>= 7;
        }
    }
    out.push(remaining as u8);
}

/// Read one value written by [`write_int`], advancing `input`.
pub fn read_int(input: &mut &[u8]) -> Result<i32, CodecError> {
    let first = read_u8(input)?;
    if first < INT_SINGLE_BYTE_LIMIT {
        return Ok(i32::from(first));
    }

    let mut result = u32::from(first - INT_SINGLE_BYTE_LIMIT);
    let mut shift = 6;
    loop {
        if shift > 27 {
            return Err(CodecError::Invalid("INT longer than 5 bytes".to_string()));
        }
        let next = read_u8(input)?;
        result |= u32::from(next & 0x7F) << shift;
        if next & 0x80 == 0 {
            return Ok(result as i32);
        }
        shift += 7;
    }
}

/// Read a single byte, advancing `input`.
pub fn read_u8(input: &mut &[u8]) -> Result<u8, CodecError> {
    let (&first, rest) = input.split_first().ok_or(CodecError::UnexpectedEof {
        needed: 1,
        available: 0,
    })?;
    *input = rest;
    Ok(first)
}

/// Read exactly `len` bytes, advancing `input`.
pub fn read_bytes<'a>(input: &mut &'a [u8], len: usize) -> Result<&'a [u8], CodecError> {
    if input.len() < len {
        return Err(CodecError::UnexpectedEof {
            needed: len,
            available: input.len(),
        });
    }
    let (head, rest) = input.split_at(len);
    *input = rest;
    Ok(head)
}

/// Lowercase hex rendering of `bytes`.
#[must_use]
pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: i32) -> (i32, usize) {
        let mut out = Vec::new();
        write_int(&mut out, value);
        let len = out.len();
        let mut input = out.as_slice();
        let decoded = read_int(&mut input).expect("decode");
        assert!(input.is_empty(), "trailing bytes for {value}");
        (decoded, len)
    }

    #[test]
    fn test_int_small_values_take_one_byte() {
        for value in [0, 1, 100, 191] {
            assert_eq!(roundtrip(value), (value, 1));
        }
    }

    #[test]
    fn test_int_boundaries_and_negatives() {
        for value in [192, 255, 8_191, 1 << 20, i32::MAX, -1, -42, i32::MIN] {
            assert_eq!(roundtrip(value).0, value);
        }
        assert!(roundtrip(192).1 > 1);
        assert_eq!(roundtrip(-1).1, 5);
    }

    #[test]
    fn test_int_truncated_input() {
        let mut out = Vec::new();
        write_int(&mut out, 1 << 20);
        out.pop();
        let mut input = out.as_slice();
        assert!(matches!(
            read_int(&mut input),
            Err(CodecError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn test_flipped_i32_preserves_order() {
        let values = [i32::MIN, -17, -1, 0, 1, 17, i32::MAX];
        let encoded: Vec<[u8; 4]> = values
            .iter()
            .map(|&v| {
                let mut buf = [0u8; 4];
                write_flipped_i32(v, &mut buf, 0);
                buf
            })
            .collect();

        for pair in encoded.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        for (value, bytes) in values.iter().zip(&encoded) {
            assert_eq!(read_flipped_i32(bytes, 0), *value);
        }
    }

    #[test]
    fn test_read_bytes_advances() {
        let data = [1u8, 2, 3, 4];
        let mut input = &data[..];
        assert_eq!(read_bytes(&mut input, 3).expect("read"), &[1, 2, 3]);
        assert_eq!(input, &[4]);
        assert!(read_bytes(&mut input, 2).is_err());
    }
}
