//! In-process storage backends.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::storage::address::Address;
use crate::storage::backend::{StagedPages, Storage, StorageError};
use crate::storage::btree::{BTree, BTreeError};
use crate::storage::novelty::Novelty;

/// Durable storage held in a process-local map.
///
/// Bulk stores are committed under a single write lock, so concurrent readers
/// see either none or all of a serialized tree.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    blobs: RwLock<HashMap<Address, Vec<u8>>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl Storage for MemoryStorage {
    fn lookup(&self, address: Address) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.blobs.read().get(&address).cloned())
    }

    fn store(&self, address: Address, bytes: &[u8]) -> Result<(), StorageError> {
        self.blobs.write().insert(address, bytes.to_vec());
        Ok(())
    }

    fn bulk_store(&self, tree: &BTree, novelty: &Novelty) -> Result<Address, BTreeError> {
        let mut staged = StagedPages::default();
        let root = tree.save(novelty, &mut staged)?;
        let count = staged.len();
        self.blobs.write().extend(staged.into_pages());
        tracing::debug!("bulk stored {count} pages in memory, root {root}");
        Ok(root)
    }
}

/// Placeholder storage for disconnected sessions.
///
/// Nothing is ever found, stores are discarded, and bulk stores are refused.
/// Trees created over it live entirely in novelty.
#[derive(Debug, Default, Clone, Copy)]
pub struct VoidStorage;

impl Storage for VoidStorage {
    fn lookup(&self, _address: Address) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(None)
    }

    fn store(&self, _address: Address, _bytes: &[u8]) -> Result<(), StorageError> {
        Ok(())
    }

    fn bulk_store(&self, _tree: &BTree, _novelty: &Novelty) -> Result<Address, BTreeError> {
        Err(StorageError::Unsupported("bulk store").into())
    }
}
