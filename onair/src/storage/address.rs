//! Page and blob addresses.
//!
//! An address is 128 bits. Two disjoint spaces share the representation:
//!
//! - **Novelty** addresses (`high == 0`, `low < 0`) point into the local
//!   append-only write buffer; `low` is the bitwise complement of the byte
//!   offset.
//! - **Durable** addresses (`low >= 0`) are content hashes of the stored
//!   payload and are resolved through a [`Storage`](crate::storage::Storage).

use sha2::{Digest, Sha256};

use crate::storage::codec;

/// Serialized size of an address inside a page slot.
pub const BYTES_PER_ADDRESS: usize = 16;

/// A novelty or durable address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    high: i64,
    low: i64,
}

impl Address {
    /// Build an address from its raw components.
    #[must_use]
    pub const fn new(high: i64, low: i64) -> Self {
        Self { high, low }
    }

    /// Address of a record at `offset` in the novelty buffer.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn novelty(offset: u64) -> Self {
        Self {
            high: 0,
            low: !(offset as i64),
        }
    }

    /// Content address of `bytes` in durable storage.
    #[must_use]
    pub fn content(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut high = [0u8; 8];
        let mut low = [0u8; 8];
        high.copy_from_slice(&digest[..8]);
        low.copy_from_slice(&digest[8..16]);
        Self {
            high: i64::from_be_bytes(high),
            low: i64::from_be_bytes(low) & i64::MAX,
        }
    }

    #[must_use]
    pub const fn high(&self) -> i64 {
        self.high
    }

    #[must_use]
    pub const fn low(&self) -> i64 {
        self.low
    }

    /// Whether this address points into the novelty buffer.
    #[must_use]
    pub const fn is_novelty(&self) -> bool {
        self.high == 0 && self.low < 0
    }

    /// Byte offset in the novelty buffer, if this is a novelty address.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn novelty_offset(&self) -> Option<u64> {
        if self.is_novelty() {
            Some(!self.low as u64)
        } else {
            None
        }
    }

    /// Serialize as 16 bytes: `high` then `low`, both big-endian.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; BYTES_PER_ADDRESS] {
        let mut out = [0u8; BYTES_PER_ADDRESS];
        out[..8].copy_from_slice(&self.high.to_be_bytes());
        out[8..].copy_from_slice(&self.low.to_be_bytes());
        out
    }

    /// Deserialize from the first 16 bytes of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AddressError> {
        if bytes.len() < BYTES_PER_ADDRESS {
            return Err(AddressError::Truncated(bytes.len()));
        }
        let mut high = [0u8; 8];
        let mut low = [0u8; 8];
        high.copy_from_slice(&bytes[..8]);
        low.copy_from_slice(&bytes[8..BYTES_PER_ADDRESS]);
        Ok(Self {
            high: i64::from_be_bytes(high),
            low: i64::from_be_bytes(low),
        })
    }

    /// Parse the `[high, low]` decimal pair used by index manifests.
    pub fn from_strings<S: AsRef<str>>(parts: &[S]) -> Result<Self, AddressError> {
        let [high, low] = parts else {
            return Err(AddressError::WrongComponentCount(parts.len()));
        };
        let parse = |part: &S| {
            part.as_ref()
                .trim()
                .parse::<i64>()
                .map_err(|_| AddressError::InvalidComponent(part.as_ref().to_string()))
        };
        Ok(Self::new(parse(high)?, parse(low)?))
    }

    /// The `[high, low]` decimal pair used by index manifests.
    #[must_use]
    pub fn to_strings(&self) -> Vec<String> {
        vec![self.high.to_string(), self.low.to_string()]
    }

    /// Lowercase hex form, used as a key by remote storage.
    #[must_use]
    pub fn to_hex(&self) -> String {
        codec::to_hex(&self.to_bytes())
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.novelty_offset() {
            Some(offset) => write!(f, "novelty@{offset}"),
            None => write!(f, "{}:{}", self.high, self.low),
        }
    }
}

/// Errors raised when decoding an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// Fewer than 16 bytes were available.
    Truncated(usize),
    /// Textual form did not have exactly two components.
    WrongComponentCount(usize),
    /// A textual component was not a decimal `i64`.
    InvalidComponent(String),
}

impl std::fmt::Display for AddressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated(len) => {
                write!(f, "address needs {BYTES_PER_ADDRESS} bytes, got {len}")
            }
            Self::WrongComponentCount(count) => {
                write!(f, "address needs 2 components, got {count}")
            }
            Self::InvalidComponent(part) => write!(f, "invalid address component '{part}'"),
        }
    }
}

impl std::error::Error for AddressError {}
