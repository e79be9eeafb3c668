//! Durable storage abstraction.
//!
//! A `Storage` resolves durable [`Address`]es to byte payloads. Trees read
//! committed pages through it and publish novelty-resident pages into it in
//! bulk. Implementations:
//!
//! - [`MemoryStorage`](crate::storage::MemoryStorage): in-process map
//! - [`VoidStorage`](crate::storage::VoidStorage): disconnected placeholder
//! - [`RemoteStorage`](crate::storage::RemoteStorage): network key/value cache
//!
//! # Implementation Notes
//!
//! Implementations must ensure:
//! - `lookup` returns exactly the bytes last stored under an address
//! - `alloc` is a pure function of the payload (content addressing)
//! - `bulk_store` only returns the root address once every page is stored

use crate::storage::address::Address;
use crate::storage::btree::{BTree, BTreeError, Page};
use crate::storage::novelty::Novelty;

/// Receives pages produced by a tree serialization pass.
pub trait StorageConsumer {
    fn store(&mut self, address: Address, bytes: &[u8]) -> Result<(), StorageError>;
}

/// Pages staged in memory until a bulk store commits them.
#[derive(Debug, Default)]
pub struct StagedPages {
    pages: Vec<(Address, Vec<u8>)>,
}

impl StagedPages {
    #[must_use]
    pub const fn len(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Staged pages in the order they were produced (children first).
    #[must_use]
    pub fn into_pages(self) -> Vec<(Address, Vec<u8>)> {
        self.pages
    }
}

impl StorageConsumer for StagedPages {
    fn store(&mut self, address: Address, bytes: &[u8]) -> Result<(), StorageError> {
        self.pages.push((address, bytes.to_vec()));
        Ok(())
    }
}

/// Durable backing store for committed pages.
pub trait Storage: Send + Sync {
    /// Resolve `address`, returning `None` if nothing is stored there.
    fn lookup(&self, address: Address) -> Result<Option<Vec<u8>>, StorageError>;

    /// Choose the durable address for `bytes`.
    fn alloc(&self, bytes: &[u8]) -> Address {
        Address::content(bytes)
    }

    /// Store `bytes` under `address`.
    fn store(&self, address: Address, bytes: &[u8]) -> Result<(), StorageError>;

    /// Hint that `page`, just loaded from `address`, is about to be walked.
    fn prefetch(&self, _address: Address, _page: &Page) {}

    /// Serialize every novelty-resident page reachable from `tree` into this
    /// storage and return the durable root address.
    fn bulk_store(&self, tree: &BTree, novelty: &Novelty) -> Result<Address, BTreeError> {
        let mut staged = StagedPages::default();
        let root = tree.save(novelty, &mut staged)?;
        let count = staged.len();
        for (address, bytes) in staged.into_pages() {
            self.store(address, &bytes)?;
        }
        tracing::debug!("bulk stored {count} pages, root {root}");
        Ok(root)
    }
}

/// Errors raised by storage backends.
#[derive(Debug)]
pub enum StorageError {
    /// I/O error talking to the backend.
    Io(std::io::Error),
    /// The backend replied with something unexpected.
    Protocol(String),
    /// Stored bytes failed an integrity check.
    Corruption(String),
    /// The backend does not support the operation.
    Unsupported(&'static str),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Corruption(msg) => write!(f, "corruption: {msg}"),
            Self::Unsupported(op) => write!(f, "unsupported storage operation: {op}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display() {
        let e = StorageError::Unsupported("bulk store");
        assert_eq!(e.to_string(), "unsupported storage operation: bulk store");

        let e = StorageError::Corruption("checksum mismatch".to_string());
        assert!(e.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_staged_pages_keep_order() {
        let mut staged = StagedPages::default();
        assert!(staged.is_empty());
        staged
            .store(Address::new(1, 1), b"child")
            .expect("stage child");
        staged
            .store(Address::new(2, 2), b"root")
            .expect("stage root");
        let pages = staged.into_pages();
        assert_eq!(pages[0], (Address::new(1, 1), b"child".to_vec()));
        assert_eq!(pages[1], (Address::new(2, 2), b"root".to_vec()));
    }
}
