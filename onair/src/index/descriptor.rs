//! Key and value serialization for indices.
//!
//! A [`KeyDescriptor`] turns index keys into bytes. Descriptors whose keys are
//! plain integers also expose an [`InlineKeyDescriptor`], which lets the index
//! store the integer directly in the tree key instead of hashing it.
//! A [`DataExternalizer`] does the same for values.

use crate::storage::codec::{CodecError, read_bytes, read_int, write_int};

/// Serializes values stored in an index.
pub trait DataExternalizer<V>: Send + Sync {
    /// Append the serialized form of `value` to `out`.
    fn save(&self, out: &mut Vec<u8>, value: &V);

    /// Read one value, advancing `input` past it.
    fn read(&self, input: &mut &[u8]) -> Result<V, CodecError>;
}

/// Serializes index keys.
pub trait KeyDescriptor<K>: Send + Sync {
    fn save(&self, out: &mut Vec<u8>, key: &K);

    fn read(&self, input: &mut &[u8]) -> Result<K, CodecError>;

    /// The integer view of this descriptor, if keys are integers.
    fn as_inline(&self) -> Option<&dyn InlineKeyDescriptor<K>> {
        None
    }
}

/// Keys that map one-to-one onto `i32`.
pub trait InlineKeyDescriptor<K>: Send + Sync {
    fn to_int(&self, key: &K) -> i32;

    fn from_int(&self, value: i32) -> K;
}

/// `i32` keys, stored inline.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntKeyDescriptor;

impl KeyDescriptor<i32> for IntKeyDescriptor {
    fn save(&self, out: &mut Vec<u8>, key: &i32) {
        out.extend_from_slice(&key.to_be_bytes());
    }

    fn read(&self, input: &mut &[u8]) -> Result<i32, CodecError> {
        let bytes = read_bytes(input, 4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn as_inline(&self) -> Option<&dyn InlineKeyDescriptor<i32>> {
        Some(self)
    }
}

impl InlineKeyDescriptor<i32> for IntKeyDescriptor {
    fn to_int(&self, key: &i32) -> i32 {
        *key
    }

    fn from_int(&self, value: i32) -> i32 {
        value
    }
}

/// UTF-8 string keys, stored by hash.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringKeyDescriptor;

impl KeyDescriptor<String> for StringKeyDescriptor {
    fn save(&self, out: &mut Vec<u8>, key: &String) {
        save_string(out, key);
    }

    fn read(&self, input: &mut &[u8]) -> Result<String, CodecError> {
        read_string(input)
    }
}

/// `i32` values in the variable-length `INT` encoding.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntExternalizer;

impl DataExternalizer<i32> for IntExternalizer {
    fn save(&self, out: &mut Vec<u8>, value: &i32) {
        write_int(out, *value);
    }

    fn read(&self, input: &mut &[u8]) -> Result<i32, CodecError> {
        read_int(input)
    }
}

/// Length-prefixed UTF-8 string values.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringExternalizer;

impl DataExternalizer<String> for StringExternalizer {
    fn save(&self, out: &mut Vec<u8>, value: &String) {
        save_string(out, value);
    }

    fn read(&self, input: &mut &[u8]) -> Result<String, CodecError> {
        read_string(input)
    }
}

/// Lists of non-negative ids, compact for the common single-id case:
///
/// - empty: `INT(i32::MAX)`
/// - one id: `INT(id)`
/// - otherwise: `INT(-len)` followed by `INT(id)` for each id
#[derive(Debug, Default, Clone, Copy)]
pub struct IdListExternalizer;

impl DataExternalizer<Vec<i32>> for IdListExternalizer {
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn save(&self, out: &mut Vec<u8>, value: &Vec<i32>) {
        match value.as_slice() {
            [] => write_int(out, i32::MAX),
            [single] => write_int(out, *single),
            ids => {
                write_int(out, -(ids.len() as i32));
                for id in ids {
                    write_int(out, *id);
                }
            }
        }
    }

    fn read(&self, input: &mut &[u8]) -> Result<Vec<i32>, CodecError> {
        let size = read_int(input)?;
        if size == i32::MAX {
            return Ok(Vec::new());
        }
        if size >= 0 {
            return Ok(vec![size]);
        }
        let len = size.checked_neg().ok_or_else(|| {
            CodecError::Invalid(format!("id list length {size} out of range"))
        })?;
        (0..len).map(|_| read_int(input)).collect()
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn save_string(out: &mut Vec<u8>, value: &str) {
    write_int(out, value.len() as i32);
    out.extend_from_slice(value.as_bytes());
}

fn read_string(input: &mut &[u8]) -> Result<String, CodecError> {
    let len = read_int(input)?;
    let len = usize::try_from(len)
        .map_err(|_| CodecError::Invalid(format!("negative string length {len}")))?;
    let bytes = read_bytes(input, len)?;
    String::from_utf8(bytes.to_vec()).map_err(|e| CodecError::Invalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode<V>(externalizer: &dyn DataExternalizer<V>, value: &V) -> Vec<u8> {
        let mut out = Vec::new();
        externalizer.save(&mut out, value);
        out
    }

    #[test]
    fn test_int_key_descriptor_is_inline() {
        let descriptor = IntKeyDescriptor;
        let inline = descriptor.as_inline().expect("inline");
        assert_eq!(inline.to_int(&-7), -7);
        assert_eq!(inline.from_int(42), 42);

        let mut out = Vec::new();
        descriptor.save(&mut out, &0x0102_0304);
        assert_eq!(out, vec![1, 2, 3, 4]);
        assert_eq!(descriptor.read(&mut out.as_slice()).expect("read"), 0x0102_0304);
    }

    #[test]
    fn test_string_key_descriptor_is_hashed() {
        let descriptor = StringKeyDescriptor;
        assert!(descriptor.as_inline().is_none());

        let mut out = Vec::new();
        descriptor.save(&mut out, &"héllo".to_string());
        let mut input = out.as_slice();
        assert_eq!(descriptor.read(&mut input).expect("read"), "héllo");
        assert!(input.is_empty());
    }

    #[test]
    fn test_string_rejects_invalid_utf8() {
        let bytes = [2u8, 0xff, 0xfe];
        assert!(matches!(
            StringExternalizer.read(&mut &bytes[..]),
            Err(CodecError::Invalid(_))
        ));
    }

    #[test]
    fn test_id_list_encoding() {
        assert_eq!(encode(&IdListExternalizer, &vec![5]), vec![5]);

        for ids in [vec![], vec![5], vec![3, 1_000, 70_000]] {
            let bytes = encode(&IdListExternalizer, &ids);
            let mut input = bytes.as_slice();
            assert_eq!(IdListExternalizer.read(&mut input).expect("read"), ids);
            assert!(input.is_empty());
        }
    }

    #[test]
    fn test_int_externalizer() {
        let bytes = encode(&IntExternalizer, &-300);
        assert_eq!(IntExternalizer.read(&mut bytes.as_slice()).expect("read"), -300);
    }
}
