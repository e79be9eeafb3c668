//! Page storage for on-air indices.
//!
//! Trees are built from immutable pages that live in one of two places:
//!
//! - the [`Novelty`] buffer: a local append-only memory map holding pages
//!   written since the last publish;
//! - a durable [`Storage`] backend: content-addressed pages shared between
//!   sessions, reached in memory ([`MemoryStorage`]) or over the network
//!   ([`RemoteStorage`]).
//!
//! An [`Address`] tells the two apart, so a single tree can mix freshly
//! written novelty pages with durable subtrees from a published baseline.
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use onair::storage::{BTree, MemoryStorage, Novelty};
//!
//! let storage = Arc::new(MemoryStorage::new());
//! let novelty = Novelty::anonymous(1 << 20).expect("novelty");
//! let mut tree = BTree::create(&novelty, storage.clone(), 4).expect("tree");
//! tree.put(&novelty, &[0, 0, 0, 1], b"one", true).expect("put");
//!
//! // Publish: every novelty page is copied into durable storage.
//! let root = tree.store(&novelty).expect("store");
//!
//! // A later session only needs the root address.
//! let fresh = Novelty::anonymous(1 << 20).expect("novelty");
//! let published = BTree::load(storage, 4, root);
//! assert_eq!(published.get(&fresh, &[0, 0, 0, 1]).expect("get"), Some(b"one".to_vec()));
//! ```

mod address;
mod backend;
pub mod btree;
pub mod codec;
mod memory;
mod novelty;
mod remote;

pub use address::{Address, AddressError, BYTES_PER_ADDRESS};
pub use backend::{StagedPages, Storage, StorageConsumer, StorageError};
pub use btree::{BTree, BTreeError, HexRenderer, Renderer, TreeStats};
pub use memory::{MemoryStorage, VoidStorage};
pub use novelty::{DEFAULT_CAPACITY, Novelty, NoveltyError, NoveltyReader};
pub use remote::{DEFAULT_PAGE_CACHE_SIZE, RemoteStorage};
