//! Inverted and forward indices over on-air B-trees.
//!
//! An inverted index maps keys to the set of `(input id, value)` pairs
//! contributed by indexed inputs; a forward index maps an input id to one
//! value. Both are stored in copy-on-write trees from [`crate::storage`].
//!
//! # Architecture
//!
//! ```text
//! BTreeIndexStorageManager
//!   ├── Novelty (shared)            pages written this session
//!   ├── Storage (shared)            published pages
//!   ├── forward tree (shared) ───── ForwardIndexMap per forward index
//!   └── BTreeIndexStorage per inverted index
//!         ├── WriteBackCache<K, CompositeValueContainer<V>>
//!         ├── data tree             [revision][key] -> delta
//!         └── internary tree        hash -> key bytes (hashed keys only)
//! ```
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use onair::config::IndexConfig;
//! use onair::index::{BTreeIndexStorageManager, IntExternalizer, StringKeyDescriptor};
//! use onair::storage::MemoryStorage;
//!
//! let config = IndexConfig { novelty_capacity: 1 << 24, ..IndexConfig::default() };
//! let manager = BTreeIndexStorageManager::with_storage(&config, Arc::new(MemoryStorage::new()))
//!     .expect("manager");
//! let words = manager
//!     .create_index_storage::<String, i32>(
//!         "words",
//!         Arc::new(StringKeyDescriptor),
//!         Arc::new(IntExternalizer),
//!         64,
//!     )
//!     .expect("index");
//!
//! words.add_value(&"hello".to_string(), 1, 3).expect("add");
//! assert_eq!(words.read(&"hello".to_string()).expect("read").get(1), Some(&3));
//!
//! let manifest = manager.publish().expect("publish");
//! assert!(manifest.heads("words").expect("heads").is_some());
//! ```

mod cache;
mod container;
mod descriptor;
mod forward;
mod manager;
mod manifest;
mod storage;

pub use cache::WriteBackCache;
pub use container::{CompositeValueContainer, DeltaValueContainer, ValueContainer};
pub use descriptor::{
    DataExternalizer, IdListExternalizer, InlineKeyDescriptor, IntExternalizer, IntKeyDescriptor,
    KeyDescriptor, StringExternalizer, StringKeyDescriptor,
};
pub use forward::{FORWARD_KEY_SIZE, ForwardIndexMap};
pub use manager::{BTreeIndexStorageManager, INITIAL_REVISION, ManagerError};
pub use manifest::{
    DirectoryManifestSource, IndexHeads, IndexManifest, MANIFEST_FILE, ManifestError,
    ManifestSource,
};
pub use storage::{
    AddressPair, BTreeIndexStorage, HASH_SIZE, HASHED_KEY_SIZE, INLINE_KEY_SIZE, IndexStorageError,
    PublishableIndex, Revisions,
};
