//! B-tree page types and serialization.
//!
//! Pages are fixed-capacity slot arrays of `BASE` entries. Every slot holds a
//! key of the tree's key size followed by a 16-byte field:
//!
//! ```text
//! +----------------------------------------+------+-------+-----------------+
//! | (key_size + 16) * BASE bytes of slots  | type | count | mask (bottom)   |
//! +----------------------------------------+------+-------+-----------------+
//!                                             1B     1B     4B BE, sign-flipped
//! ```
//!
//! - Internal slots: the field is the child page [`Address`].
//! - Bottom slots: if bit `i` of the mask is set the field holds an inline
//!   value (byte 0 is the length, at most [`MAX_INLINE_VALUE_SIZE`] bytes
//!   follow); otherwise the field is the address of an out-of-line value blob.
//!
//! Decoded pages own their entries. Mutations work on the decoded form and
//! are re-encoded into fresh bytes; encoded pages are never patched.

#![allow(clippy::cast_possible_truncation)]

use crate::storage::address::{Address, AddressError, BYTES_PER_ADDRESS};
use crate::storage::codec::{read_flipped_i32, write_flipped_i32};

/// Maximum number of entries a page holds once written.
pub const BASE: usize = 32;

/// Type tag of a bottom (leaf) page.
pub const BOTTOM: u8 = 4;

/// Type tag of an internal page.
pub const INTERNAL: u8 = 5;

/// Longest value stored directly inside a bottom slot.
pub const MAX_INLINE_VALUE_SIZE: usize = BYTES_PER_ADDRESS - 1;

/// Page type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageKind {
    Bottom = BOTTOM,
    Internal = INTERNAL,
}

impl TryFrom<u8> for PageKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            BOTTOM => Ok(Self::Bottom),
            INTERNAL => Ok(Self::Internal),
            _ => Err(value),
        }
    }
}

/// Offset of the trailer for a given key size.
#[must_use]
pub const fn metadata_offset(key_size: usize) -> usize {
    (key_size + BYTES_PER_ADDRESS) * BASE
}

/// Value stored in a bottom slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueRef {
    /// Value bytes stored in the slot itself.
    Inline(Vec<u8>),
    /// Address of a blob holding the value.
    Blob(Address),
}

impl ValueRef {
    /// Whether a value of `len` bytes fits inline.
    #[must_use]
    pub const fn fits_inline(len: usize) -> bool {
        len <= MAX_INLINE_VALUE_SIZE
    }
}

/// A key/value entry of a bottom page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BottomEntry {
    pub key: Vec<u8>,
    pub value: ValueRef,
}

/// A child reference of an internal page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildRef {
    /// Smallest key reachable through this child.
    pub min_key: Vec<u8>,
    pub address: Address,
}

/// Leaf page holding key/value entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BottomPage {
    entries: Vec<BottomEntry>,
}

impl BottomPage {
    #[must_use]
    pub const fn new(entries: Vec<BottomEntry>) -> Self {
        Self { entries }
    }

    #[must_use]
    pub fn entries(&self) -> &[BottomEntry] {
        &self.entries
    }

    pub const fn entries_mut(&mut self) -> &mut Vec<BottomEntry> {
        &mut self.entries
    }

    /// Binary search for `key` by unsigned byte order.
    pub fn search(&self, key: &[u8]) -> Result<usize, usize> {
        self.entries.binary_search_by(|e| e.key.as_slice().cmp(key))
    }
}

/// Page holding child references ordered by minimum key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InternalPage {
    children: Vec<ChildRef>,
}

impl InternalPage {
    #[must_use]
    pub const fn new(children: Vec<ChildRef>) -> Self {
        Self { children }
    }

    #[must_use]
    pub fn children(&self) -> &[ChildRef] {
        &self.children
    }

    pub const fn children_mut(&mut self) -> &mut Vec<ChildRef> {
        &mut self.children
    }

    /// Index of the child whose subtree may contain `key`.
    ///
    /// Keys below the first minimum key route to the first child.
    #[must_use]
    pub fn child_index(&self, key: &[u8]) -> usize {
        match self
            .children
            .binary_search_by(|c| c.min_key.as_slice().cmp(key))
        {
            Ok(i) | Err(i @ 0) => i,
            Err(i) => i - 1,
        }
    }
}

/// A decoded page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Page {
    Bottom(BottomPage),
    Internal(InternalPage),
}

impl Page {
    #[must_use]
    pub const fn kind(&self) -> PageKind {
        match self {
            Self::Bottom(_) => PageKind::Bottom,
            Self::Internal(_) => PageKind::Internal,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Bottom(p) => p.entries.len(),
            Self::Internal(p) => p.children.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Smallest key stored in or below this page.
    #[must_use]
    pub fn min_key(&self) -> Option<&[u8]> {
        match self {
            Self::Bottom(p) => p.entries.first().map(|e| e.key.as_slice()),
            Self::Internal(p) => p.children.first().map(|c| c.min_key.as_slice()),
        }
    }

    /// Split an overfull page in half. The right half gets the extra entry.
    #[must_use]
    pub fn split(self) -> (Self, Self) {
        match self {
            Self::Bottom(mut p) => {
                let right = p.entries.split_off(p.entries.len() / 2);
                (Self::Bottom(p), Self::Bottom(BottomPage::new(right)))
            }
            Self::Internal(mut p) => {
                let right = p.children.split_off(p.children.len() / 2);
                (Self::Internal(p), Self::Internal(InternalPage::new(right)))
            }
        }
    }

    /// Concatenate two sibling pages, `self` holding the smaller keys.
    ///
    /// Returns `None` if the pages are of different kinds.
    #[must_use]
    pub fn concat(self, right: Self) -> Option<Self> {
        match (self, right) {
            (Self::Bottom(mut l), Self::Bottom(r)) => {
                l.entries.extend(r.entries);
                Some(Self::Bottom(l))
            }
            (Self::Internal(mut l), Self::Internal(r)) => {
                l.children.extend(r.children);
                Some(Self::Internal(l))
            }
            _ => None,
        }
    }

    /// Decode a page written by [`Page::encode`].
    pub fn decode(bytes: &[u8], key_size: usize) -> Result<Self, PageError> {
        let meta = metadata_offset(key_size);
        if bytes.len() < meta + 2 {
            return Err(PageError::Truncated {
                expected: meta + 2,
                actual: bytes.len(),
            });
        }
        let kind = PageKind::try_from(bytes[meta]).map_err(PageError::UnknownType)?;
        let count = usize::from(bytes[meta + 1]);
        if count > BASE {
            return Err(PageError::SizeOverflow(count));
        }
        let slot_size = key_size + BYTES_PER_ADDRESS;
        let slot = |i: usize| {
            let start = i * slot_size;
            (
                &bytes[start..start + key_size],
                &bytes[start + key_size..start + slot_size],
            )
        };

        match kind {
            PageKind::Internal => {
                let mut children = Vec::with_capacity(count);
                for i in 0..count {
                    let (key, field) = slot(i);
                    children.push(ChildRef {
                        min_key: key.to_vec(),
                        address: Address::from_bytes(field)?,
                    });
                }
                Ok(Self::Internal(InternalPage::new(children)))
            }
            PageKind::Bottom => {
                if bytes.len() < meta + 6 {
                    return Err(PageError::Truncated {
                        expected: meta + 6,
                        actual: bytes.len(),
                    });
                }
                #[allow(clippy::cast_sign_loss)]
                let mask = read_flipped_i32(bytes, meta + 2) as u32;
                let mut entries = Vec::with_capacity(count);
                for i in 0..count {
                    let (key, field) = slot(i);
                    let value = if mask & (1 << i) == 0 {
                        ValueRef::Blob(Address::from_bytes(field)?)
                    } else {
                        let len = field[0];
                        if usize::from(len) > MAX_INLINE_VALUE_SIZE {
                            return Err(PageError::InlineValueLength(len));
                        }
                        ValueRef::Inline(field[1..=usize::from(len)].to_vec())
                    };
                    entries.push(BottomEntry {
                        key: key.to_vec(),
                        value,
                    });
                }
                Ok(Self::Bottom(BottomPage::new(entries)))
            }
        }
    }

    /// Encode this page for a tree of `key_size`-byte keys.
    ///
    /// The page must hold at most `BASE` entries with keys of exactly
    /// `key_size` bytes and inline values of at most
    /// [`MAX_INLINE_VALUE_SIZE`] bytes.
    pub fn encode(&self, key_size: usize) -> Result<Vec<u8>, PageError> {
        let count = self.len();
        if count > BASE {
            return Err(PageError::SizeOverflow(count));
        }
        let meta = metadata_offset(key_size);
        let slot_size = key_size + BYTES_PER_ADDRESS;
        let trailer = match self {
            Self::Bottom(_) => 6,
            Self::Internal(_) => 2,
        };
        let mut bytes = vec![0u8; meta + trailer];
        bytes[meta] = self.kind() as u8;
        bytes[meta + 1] = count as u8;

        let mut put_key = |i: usize, key: &[u8]| -> Result<usize, PageError> {
            if key.len() != key_size {
                return Err(PageError::KeySize {
                    expected: key_size,
                    actual: key.len(),
                });
            }
            let start = i * slot_size;
            bytes[start..start + key_size].copy_from_slice(key);
            Ok(start + key_size)
        };

        let mut fields: Vec<(usize, [u8; BYTES_PER_ADDRESS])> = Vec::with_capacity(count);
        let mut mask = 0u32;
        match self {
            Self::Internal(p) => {
                for (i, child) in p.children.iter().enumerate() {
                    let at = put_key(i, &child.min_key)?;
                    fields.push((at, child.address.to_bytes()));
                }
            }
            Self::Bottom(p) => {
                for (i, entry) in p.entries.iter().enumerate() {
                    let at = put_key(i, &entry.key)?;
                    let field = match &entry.value {
                        ValueRef::Blob(address) => address.to_bytes(),
                        ValueRef::Inline(value) => {
                            if !ValueRef::fits_inline(value.len()) {
                                return Err(PageError::InlineValueLength(
                                    value.len().min(usize::from(u8::MAX)) as u8,
                                ));
                            }
                            mask |= 1 << i;
                            let mut field = [0u8; BYTES_PER_ADDRESS];
                            field[0] = value.len() as u8;
                            field[1..=value.len()].copy_from_slice(value);
                            field
                        }
                    };
                    fields.push((at, field));
                }
            }
        }

        for (at, field) in fields {
            bytes[at..at + BYTES_PER_ADDRESS].copy_from_slice(&field);
        }
        if let Self::Bottom(_) = self {
            #[allow(clippy::cast_possible_wrap)]
            write_flipped_i32(mask as i32, &mut bytes, meta + 2);
        }
        Ok(bytes)
    }
}

/// Errors raised while decoding or encoding pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageError {
    /// Page bytes are shorter than the layout requires.
    Truncated { expected: usize, actual: usize },
    /// Unknown page type tag.
    UnknownType(u8),
    /// Entry count exceeds `BASE`.
    SizeOverflow(usize),
    /// Inline value length byte is out of range.
    InlineValueLength(u8),
    /// A key does not have the tree's key size.
    KeySize { expected: usize, actual: usize },
    /// A slot field is not a valid address.
    Address(AddressError),
}

impl std::fmt::Display for PageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated { expected, actual } => {
                write!(f, "page truncated: expected {expected} bytes, got {actual}")
            }
            Self::UnknownType(tag) => write!(f, "unknown page type [{tag}]"),
            Self::SizeOverflow(count) => write!(f, "page holds {count} entries, max {BASE}"),
            Self::InlineValueLength(len) => write!(f, "invalid inline value length {len}"),
            Self::KeySize { expected, actual } => {
                write!(f, "key size mismatch: expected {expected}, got {actual}")
            }
            Self::Address(e) => write!(f, "invalid slot address: {e}"),
        }
    }
}

impl std::error::Error for PageError {}

impl From<AddressError> for PageError {
    fn from(e: AddressError) -> Self {
        Self::Address(e)
    }
}
