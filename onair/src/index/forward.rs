//! Forward indices: input id to value, stored in one tree shared by all
//! forward indices of a manager.
//!
//! Keys are six bytes, `[index id: u16 BE][flip(input id)]`, so each index
//! occupies a contiguous key range ordered by input id.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::index::descriptor::DataExternalizer;
use crate::index::storage::IndexStorageError;
use crate::storage::codec::{read_flipped_i32, write_flipped_i32};
use crate::storage::{BTree, Novelty};

/// Physical key size of the shared forward tree.
pub const FORWARD_KEY_SIZE: usize = 6;

/// Map from input id to value for one forward index.
pub struct ForwardIndexMap<V> {
    index_id: u16,
    externalizer: Arc<dyn DataExternalizer<V>>,
    novelty: Arc<Novelty>,
    tree: Arc<Mutex<BTree>>,
}

impl<V> std::fmt::Debug for ForwardIndexMap<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardIndexMap")
            .field("index_id", &self.index_id)
            .finish_non_exhaustive()
    }
}

impl<V> ForwardIndexMap<V> {
    pub(crate) fn new(
        index_id: u16,
        externalizer: Arc<dyn DataExternalizer<V>>,
        novelty: Arc<Novelty>,
        tree: Arc<Mutex<BTree>>,
    ) -> Self {
        Self {
            index_id,
            externalizer,
            novelty,
            tree,
        }
    }

    #[must_use]
    pub const fn index_id(&self) -> u16 {
        self.index_id
    }

    pub fn put(&self, input_id: i32, value: &V) -> Result<(), IndexStorageError> {
        let mut bytes = Vec::new();
        self.externalizer.save(&mut bytes, value);
        self.tree
            .lock()
            .put(&self.novelty, &self.key(input_id), &bytes, true)?;
        Ok(())
    }

    pub fn get(&self, input_id: i32) -> Result<Option<V>, IndexStorageError> {
        let bytes = self.tree.lock().get(&self.novelty, &self.key(input_id))?;
        match bytes {
            Some(bytes) => Ok(Some(self.externalizer.read(&mut bytes.as_slice())?)),
            None => Ok(None),
        }
    }

    /// Returns whether a value was present.
    pub fn remove(&self, input_id: i32) -> Result<bool, IndexStorageError> {
        Ok(self
            .tree
            .lock()
            .delete(&self.novelty, &self.key(input_id), None)?)
    }

    /// Input ids with a value in this index, ascending.
    pub fn input_ids(&self) -> Result<Vec<i32>, IndexStorageError> {
        let prefix = self.index_id.to_be_bytes();
        let mut from = [0u8; FORWARD_KEY_SIZE];
        from[..2].copy_from_slice(&prefix);

        let mut ids = Vec::new();
        self.tree.lock().for_each_from(&self.novelty, &from, |key, _| {
            if key[..2] != prefix {
                return false;
            }
            ids.push(read_flipped_i32(key, 2));
            true
        })?;
        Ok(ids)
    }

    fn key(&self, input_id: i32) -> [u8; FORWARD_KEY_SIZE] {
        let mut key = [0u8; FORWARD_KEY_SIZE];
        key[..2].copy_from_slice(&self.index_id.to_be_bytes());
        write_flipped_i32(input_id, &mut key, 2);
        key
    }
}
