//! Copy-on-write B-tree used by every index.
//!
//! # Structure
//!
//! The tree consists of:
//! - Bottom pages: sorted key/value entries, small values inline
//! - Internal pages: sorted `(min key, child address)` entries
//!
//! Both page kinds share one slot layout with a fan-out of [`BASE`].
//!
//! # Key Format
//!
//! Keys are fixed-size byte strings compared in unsigned lexicographic order.
//! Integer key components are written big-endian with the sign bit flipped so
//! that byte order matches numeric order.
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use onair::storage::btree::BTree;
//! use onair::storage::{MemoryStorage, Novelty};
//!
//! let novelty = Novelty::anonymous(1 << 20).expect("novelty");
//! let mut tree = BTree::create(&novelty, Arc::new(MemoryStorage::new()), 4).expect("tree");
//!
//! tree.put(&novelty, b"key1", b"value", true).expect("put");
//! assert_eq!(tree.get(&novelty, b"key1").expect("get"), Some(b"value".to_vec()));
//! ```

mod page;
mod tree;

pub use page::{
    BASE, BOTTOM, BottomEntry, BottomPage, ChildRef, INTERNAL, InternalPage,
    MAX_INLINE_VALUE_SIZE, Page, PageError, PageKind, ValueRef, metadata_offset,
};
pub use tree::{BTree, BTreeError, HexRenderer, Renderer, TreeStats};
