//! Common helpers for end-to-end tests.

use std::sync::Arc;

use tempfile::TempDir;

use crate::config::IndexConfig;
use crate::index::{
    BTreeIndexStorage, BTreeIndexStorageManager, IdListExternalizer, IndexManifest,
    IntExternalizer, IntKeyDescriptor, StringKeyDescriptor, ValueContainer,
};
use crate::storage::MemoryStorage;

/// Novelty size for test sessions; sparse, so large is cheap.
const TEST_NOVELTY_CAPACITY: usize = 64 * 1024 * 1024;

/// Durable storage and a manifest directory shared by consecutive sessions.
pub struct TestCluster {
    pub storage: Arc<MemoryStorage>,
    meta_dir: TempDir,
}

impl TestCluster {
    #[must_use]
    pub fn new() -> Self {
        Self {
            storage: Arc::new(MemoryStorage::new()),
            meta_dir: tempfile::tempdir().expect("Failed to create manifest directory"),
        }
    }

    pub fn config(&self, revision: Option<&str>) -> IndexConfig {
        IndexConfig {
            revision: revision.map(str::to_string),
            meta_dir: self.meta_dir.path().to_path_buf(),
            novelty_capacity: TEST_NOVELTY_CAPACITY,
            ..IndexConfig::default()
        }
    }

    /// Open a session on top of the baseline `revision`, or from scratch.
    pub fn open(&self, revision: Option<&str>) -> BTreeIndexStorageManager {
        BTreeIndexStorageManager::with_storage(&self.config(revision), self.storage.clone())
            .expect("Failed to open session")
    }

    /// Publish `manager` and record its manifest under `revision`.
    pub fn publish(&self, manager: &BTreeIndexStorageManager, revision: &str) -> IndexManifest {
        let manifest = manager.publish().expect("Failed to publish");
        manifest
            .write_to(self.meta_dir.path(), revision)
            .expect("Failed to write manifest");
        manifest
    }
}

/// Word index: string keys to occurrence counts.
pub fn words(manager: &BTreeIndexStorageManager) -> Arc<BTreeIndexStorage<String, i32>> {
    manager
        .create_index_storage::<String, i32>(
            "words",
            Arc::new(StringKeyDescriptor),
            Arc::new(IntExternalizer),
            8,
        )
        .expect("Failed to open words index")
}

/// Id index: integer keys to id lists, with the configured cache size.
pub fn ids(manager: &BTreeIndexStorageManager) -> Arc<BTreeIndexStorage<i32, Vec<i32>>> {
    manager
        .open_index_storage::<i32, Vec<i32>>(
            "ids",
            Arc::new(IntKeyDescriptor),
            Arc::new(IdListExternalizer),
        )
        .expect("Failed to open ids index")
}

/// `(value, input ids)` groups of a container, in input id order.
pub fn groups<V: Clone + PartialEq>(container: &ValueContainer<V>) -> Vec<(V, Vec<i32>)> {
    container
        .value_iterator()
        .into_iter()
        .map(|(value, ids)| (value.clone(), ids))
        .collect()
}
