//! Copy-on-write B-tree over novelty and durable storage.
//!
//! A tree is a root [`Address`] plus a key size. Pages reachable from the
//! root live either in the local [`Novelty`] buffer or in a [`Storage`]
//! backend. Pages are never modified once allocated:
//!
//! - `put` and `delete` decode the pages on the path to the affected key,
//!   modify the decoded copies, and allocate fresh novelty pages bottom-up
//!   up to a new root;
//! - untouched subtrees, including durable ones, are shared by address.
//!
//! Any root address handed out earlier therefore stays a valid snapshot for
//! as long as the novelty buffer and storage it points into are alive.
//!
//! # Invariants
//!
//! - Keys within a page are strictly increasing in unsigned byte order.
//! - An internal entry's minimum key equals the smallest key of its subtree.
//! - Every page other than the root holds between `BASE / 2` and `BASE`
//!   entries after any `put` or `delete`.
//! - All bottom pages are at the same depth.

use std::sync::Arc;

use crate::storage::address::Address;
use crate::storage::backend::{Storage, StorageConsumer, StorageError};
use crate::storage::btree::page::{
    BASE, BottomEntry, BottomPage, ChildRef, InternalPage, Page, PageError, ValueRef,
};
use crate::storage::codec::to_hex;
use crate::storage::novelty::{Novelty, NoveltyError};

/// A copy-on-write B-tree.
#[derive(Clone)]
pub struct BTree {
    storage: Arc<dyn Storage>,
    key_size: usize,
    root: Address,
}

impl std::fmt::Debug for BTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTree")
            .field("key_size", &self.key_size)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

/// Outcome of inserting into a subtree.
enum PutResult {
    /// Nothing changed; the parent keeps its child address.
    Unchanged,
    /// The subtree was rewritten under a new address.
    Replaced(ChildRef),
    /// The subtree overflowed and was rewritten as two siblings.
    Split(ChildRef, ChildRef),
}

/// Shape summary of a tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Number of page levels, 1 for a lone bottom root.
    pub depth: usize,
    pub bottom_pages: usize,
    pub internal_pages: usize,
    /// Number of key/value entries.
    pub entries: usize,
}

/// Renders keys and values for [`BTree::dump`].
pub trait Renderer {
    fn render_key(&self, key: &[u8]) -> String;
    fn render_value(&self, value: &[u8]) -> String;
}

/// Renders keys and values as lowercase hex.
#[derive(Debug, Default, Clone, Copy)]
pub struct HexRenderer;

impl Renderer for HexRenderer {
    fn render_key(&self, key: &[u8]) -> String {
        to_hex(key)
    }

    fn render_value(&self, value: &[u8]) -> String {
        to_hex(value)
    }
}

impl BTree {
    /// Create an empty tree whose root is a fresh bottom page in `novelty`.
    pub fn create(
        novelty: &Novelty,
        storage: Arc<dyn Storage>,
        key_size: usize,
    ) -> Result<Self, BTreeError> {
        let bytes = Page::Bottom(BottomPage::default()).encode(key_size)?;
        let root = novelty.alloc(&bytes)?;
        Ok(Self {
            storage,
            key_size,
            root,
        })
    }

    /// Bind a tree to an existing root address.
    #[must_use]
    pub fn load(storage: Arc<dyn Storage>, key_size: usize, root: Address) -> Self {
        Self {
            storage,
            key_size,
            root,
        }
    }

    /// Current root address.
    #[must_use]
    pub const fn root(&self) -> Address {
        self.root
    }

    #[must_use]
    pub const fn key_size(&self) -> usize {
        self.key_size
    }

    #[must_use]
    pub const fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Look up the value stored under `key`.
    pub fn get(&self, novelty: &Novelty, key: &[u8]) -> Result<Option<Vec<u8>>, BTreeError> {
        self.check_key(key)?;
        let mut address = self.root;
        loop {
            match self.load_page(novelty, address)? {
                Page::Internal(page) => {
                    let Some(child) = page.children().get(page.child_index(key)) else {
                        return Ok(None);
                    };
                    address = child.address;
                }
                Page::Bottom(page) => {
                    return match page.search(key) {
                        Ok(i) => self.load_value(novelty, &page.entries()[i].value).map(Some),
                        Err(_) => Ok(None),
                    };
                }
            }
        }
    }

    /// Insert or replace the value under `key`.
    ///
    /// With `overwrite == false` an existing value is kept. Returns whether
    /// the tree changed; storing a value equal to the current one is not a
    /// change.
    pub fn put(
        &mut self,
        novelty: &Novelty,
        key: &[u8],
        value: &[u8],
        overwrite: bool,
    ) -> Result<bool, BTreeError> {
        self.check_key(key)?;
        match self.put_into(novelty, self.root, key, value, overwrite)? {
            PutResult::Unchanged => Ok(false),
            PutResult::Replaced(root) => {
                self.root = root.address;
                Ok(true)
            }
            PutResult::Split(left, right) => {
                let root = Page::Internal(InternalPage::new(vec![left, right]));
                self.root = self.write(novelty, &root)?.address;
                Ok(true)
            }
        }
    }

    /// Remove `key`, or only the exact `key`/`value` pair when `value` is
    /// given. Returns whether an entry was removed.
    pub fn delete(
        &mut self,
        novelty: &Novelty,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<bool, BTreeError> {
        self.check_key(key)?;
        let Some(root) = self.delete_from(novelty, self.root, key, value)? else {
            return Ok(false);
        };
        self.root = self.merge_with_children(novelty, root)?;
        Ok(true)
    }

    /// Visit every entry in key order until `consumer` returns `false`.
    ///
    /// Returns `false` iff the consumer stopped the walk.
    pub fn for_each<F>(&self, novelty: &Novelty, mut consumer: F) -> Result<bool, BTreeError>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        self.walk(novelty, self.root, None, &mut consumer)
    }

    /// Like [`BTree::for_each`], starting at the first key `>= from_key`.
    pub fn for_each_from<F>(
        &self,
        novelty: &Novelty,
        from_key: &[u8],
        mut consumer: F,
    ) -> Result<bool, BTreeError>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        self.walk(novelty, self.root, Some(from_key), &mut consumer)
    }

    /// Publish every novelty-resident page into the tree's storage and
    /// return the durable root address.
    pub fn store(&self, novelty: &Novelty) -> Result<Address, BTreeError> {
        self.storage.bulk_store(self, novelty)
    }

    /// Serialize every novelty-resident page and out-of-line value into
    /// `consumer`, children before parents, and return the durable root.
    ///
    /// Durable subtrees are referenced by address and not visited.
    pub fn save(
        &self,
        novelty: &Novelty,
        consumer: &mut dyn StorageConsumer,
    ) -> Result<Address, BTreeError> {
        self.save_page(novelty, self.root, consumer)
    }

    /// Write an indented dump of the tree to `out`.
    pub fn dump(
        &self,
        novelty: &Novelty,
        out: &mut dyn std::io::Write,
        renderer: &dyn Renderer,
    ) -> Result<(), BTreeError> {
        self.dump_page(novelty, self.root, out, 0, renderer)
    }

    /// Collect depth, page and entry counts.
    pub fn stats(&self, novelty: &Novelty) -> Result<TreeStats, BTreeError> {
        let mut stats = TreeStats::default();
        self.collect_stats(novelty, self.root, 1, &mut stats)?;
        Ok(stats)
    }

    /// Load and decode the page at `address`.
    ///
    /// Durable loads give the storage a chance to prefetch children.
    pub(crate) fn load_page(&self, novelty: &Novelty, address: Address) -> Result<Page, BTreeError> {
        if address.is_novelty() {
            let bytes = novelty.lookup(address)?;
            return Ok(Page::decode(&bytes, self.key_size)?);
        }
        let bytes = self
            .storage
            .lookup(address)?
            .ok_or(BTreeError::PageNotFound(address))?;
        let page = Page::decode(&bytes, self.key_size)?;
        self.storage.prefetch(address, &page);
        Ok(page)
    }

    fn load_value(&self, novelty: &Novelty, value: &ValueRef) -> Result<Vec<u8>, BTreeError> {
        match value {
            ValueRef::Inline(bytes) => Ok(bytes.clone()),
            ValueRef::Blob(address) if address.is_novelty() => Ok(novelty.lookup(*address)?),
            ValueRef::Blob(address) => self
                .storage
                .lookup(*address)?
                .ok_or(BTreeError::PageNotFound(*address)),
        }
    }

    fn new_value(novelty: &Novelty, value: &[u8]) -> Result<ValueRef, BTreeError> {
        if ValueRef::fits_inline(value.len()) {
            Ok(ValueRef::Inline(value.to_vec()))
        } else {
            Ok(ValueRef::Blob(novelty.alloc(value)?))
        }
    }

    fn check_key(&self, key: &[u8]) -> Result<(), BTreeError> {
        if key.len() == self.key_size {
            Ok(())
        } else {
            Err(BTreeError::KeySize {
                expected: self.key_size,
                actual: key.len(),
            })
        }
    }

    /// Encode `page` into a fresh novelty record.
    fn write(&self, novelty: &Novelty, page: &Page) -> Result<ChildRef, BTreeError> {
        let bytes = page.encode(self.key_size)?;
        let address = novelty.alloc(&bytes)?;
        Ok(ChildRef {
            min_key: page.min_key().map(<[u8]>::to_vec).unwrap_or_default(),
            address,
        })
    }

    fn write_split(&self, novelty: &Novelty, page: Page) -> Result<PutResult, BTreeError> {
        if page.len() > BASE {
            let (left, right) = page.split();
            Ok(PutResult::Split(
                self.write(novelty, &left)?,
                self.write(novelty, &right)?,
            ))
        } else {
            Ok(PutResult::Replaced(self.write(novelty, &page)?))
        }
    }

    fn put_into(
        &self,
        novelty: &Novelty,
        address: Address,
        key: &[u8],
        value: &[u8],
        overwrite: bool,
    ) -> Result<PutResult, BTreeError> {
        match self.load_page(novelty, address)? {
            Page::Bottom(mut page) => {
                match page.search(key) {
                    Ok(i) => {
                        if !overwrite
                            || self.load_value(novelty, &page.entries()[i].value)? == value
                        {
                            return Ok(PutResult::Unchanged);
                        }
                        page.entries_mut()[i].value = Self::new_value(novelty, value)?;
                    }
                    Err(i) => {
                        let value = Self::new_value(novelty, value)?;
                        page.entries_mut().insert(
                            i,
                            BottomEntry {
                                key: key.to_vec(),
                                value,
                            },
                        );
                    }
                }
                self.write_split(novelty, Page::Bottom(page))
            }
            Page::Internal(mut page) => {
                if page.children().is_empty() {
                    return Err(BTreeError::Corrupted(format!(
                        "empty internal page at {address}"
                    )));
                }
                let i = page.child_index(key);
                let child = page.children()[i].address;
                match self.put_into(novelty, child, key, value, overwrite)? {
                    PutResult::Unchanged => return Ok(PutResult::Unchanged),
                    PutResult::Replaced(child) => page.children_mut()[i] = child,
                    PutResult::Split(left, right) => {
                        page.children_mut()[i] = left;
                        page.children_mut().insert(i + 1, right);
                    }
                }
                self.write_split(novelty, Page::Internal(page))
            }
        }
    }

    /// Delete from the subtree at `address`, returning the modified page
    /// (not yet written) or `None` if nothing matched.
    fn delete_from(
        &self,
        novelty: &Novelty,
        address: Address,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<Option<Page>, BTreeError> {
        match self.load_page(novelty, address)? {
            Page::Bottom(mut page) => {
                let Ok(i) = page.search(key) else {
                    return Ok(None);
                };
                if let Some(expected) = value {
                    if self.load_value(novelty, &page.entries()[i].value)? != expected {
                        return Ok(None);
                    }
                }
                page.entries_mut().remove(i);
                Ok(Some(Page::Bottom(page)))
            }
            Page::Internal(mut page) => {
                if page.children().is_empty() {
                    return Ok(None);
                }
                let i = page.child_index(key);
                let child = page.children()[i].address;
                let Some(child) = self.delete_from(novelty, child, key, value)? else {
                    return Ok(None);
                };
                self.rebalance(novelty, &mut page, i, child)?;
                Ok(Some(Page::Internal(page)))
            }
        }
    }

    /// Put the modified child `i` back into `parent`.
    ///
    /// Empty children are dropped. An under-full child is concatenated with
    /// a neighbour: the pair becomes one page if it fits, otherwise it is
    /// split evenly.
    fn rebalance(
        &self,
        novelty: &Novelty,
        parent: &mut InternalPage,
        i: usize,
        child: Page,
    ) -> Result<(), BTreeError> {
        let children = parent.children_mut();
        if child.is_empty() {
            children.remove(i);
            return Ok(());
        }
        if child.len() >= BASE / 2 || children.len() == 1 {
            children[i] = self.write(novelty, &child)?;
            return Ok(());
        }

        let (first, left, right) = if i + 1 < children.len() {
            let neighbour = self.load_page(novelty, children[i + 1].address)?;
            (i, child, neighbour)
        } else {
            let neighbour = self.load_page(novelty, children[i - 1].address)?;
            (i - 1, neighbour, child)
        };
        let merged = left
            .concat(right)
            .ok_or_else(|| BTreeError::Corrupted("sibling pages differ in kind".to_string()))?;

        if merged.len() <= BASE {
            children[first] = self.write(novelty, &merged)?;
            children.remove(first + 1);
        } else {
            let (left, right) = merged.split();
            children[first] = self.write(novelty, &left)?;
            children[first + 1] = self.write(novelty, &right)?;
        }
        Ok(())
    }

    /// Write the new root, collapsing internal roots with at most one child.
    fn merge_with_children(&self, novelty: &Novelty, root: Page) -> Result<Address, BTreeError> {
        let mut root = root;
        loop {
            let Page::Internal(page) = &root else {
                break;
            };
            match page.children() {
                [] => root = Page::Bottom(BottomPage::default()),
                [only] => {
                    let address = only.address;
                    let child = self.load_page(novelty, address)?;
                    match &child {
                        Page::Internal(inner) if inner.children().len() <= 1 => root = child,
                        _ => return Ok(address),
                    }
                }
                _ => break,
            }
        }
        Ok(self.write(novelty, &root)?.address)
    }

    fn walk<F>(
        &self,
        novelty: &Novelty,
        address: Address,
        from: Option<&[u8]>,
        consumer: &mut F,
    ) -> Result<bool, BTreeError>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        match self.load_page(novelty, address)? {
            Page::Bottom(page) => {
                let start = from.map_or(0, |key| match page.search(key) {
                    Ok(i) | Err(i) => i,
                });
                for entry in &page.entries()[start..] {
                    let value = self.load_value(novelty, &entry.value)?;
                    if !consumer(&entry.key, &value) {
                        return Ok(false);
                    }
                }
            }
            Page::Internal(page) => {
                let start = from.map_or(0, |key| page.child_index(key));
                for (n, child) in page.children().iter().skip(start).enumerate() {
                    let from = if n == 0 { from } else { None };
                    if !self.walk(novelty, child.address, from, consumer)? {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    fn save_page(
        &self,
        novelty: &Novelty,
        address: Address,
        consumer: &mut dyn StorageConsumer,
    ) -> Result<Address, BTreeError> {
        if !address.is_novelty() {
            return Ok(address);
        }
        let mut page = self.load_page(novelty, address)?;
        match &mut page {
            Page::Bottom(bottom) => {
                for entry in bottom.entries_mut().iter_mut() {
                    if let ValueRef::Blob(blob) = &mut entry.value {
                        if blob.is_novelty() {
                            let bytes = novelty.lookup(*blob)?;
                            let durable = self.storage.alloc(&bytes);
                            consumer.store(durable, &bytes)?;
                            *blob = durable;
                        }
                    }
                }
            }
            Page::Internal(internal) => {
                for child in internal.children_mut().iter_mut() {
                    child.address = self.save_page(novelty, child.address, consumer)?;
                }
            }
        }
        let bytes = page.encode(self.key_size)?;
        let durable = self.storage.alloc(&bytes);
        consumer.store(durable, &bytes)?;
        Ok(durable)
    }

    fn dump_page(
        &self,
        novelty: &Novelty,
        address: Address,
        out: &mut dyn std::io::Write,
        depth: usize,
        renderer: &dyn Renderer,
    ) -> Result<(), BTreeError> {
        let indent = "  ".repeat(depth);
        match self.load_page(novelty, address)? {
            Page::Bottom(page) => {
                writeln!(out, "{indent}bottom {address} ({} entries)", page.entries().len())?;
                for entry in page.entries() {
                    let value = self.load_value(novelty, &entry.value)?;
                    writeln!(
                        out,
                        "{indent}  {} -> {}",
                        renderer.render_key(&entry.key),
                        renderer.render_value(&value)
                    )?;
                }
            }
            Page::Internal(page) => {
                writeln!(
                    out,
                    "{indent}internal {address} ({} children)",
                    page.children().len()
                )?;
                for child in page.children() {
                    writeln!(out, "{indent}  [{}]", renderer.render_key(&child.min_key))?;
                    self.dump_page(novelty, child.address, out, depth + 2, renderer)?;
                }
            }
        }
        Ok(())
    }

    fn collect_stats(
        &self,
        novelty: &Novelty,
        address: Address,
        depth: usize,
        stats: &mut TreeStats,
    ) -> Result<(), BTreeError> {
        stats.depth = stats.depth.max(depth);
        match self.load_page(novelty, address)? {
            Page::Bottom(page) => {
                stats.bottom_pages += 1;
                stats.entries += page.entries().len();
            }
            Page::Internal(page) => {
                stats.internal_pages += 1;
                for child in page.children() {
                    self.collect_stats(novelty, child.address, depth + 1, stats)?;
                }
            }
        }
        Ok(())
    }
}

/// Errors that can occur during B-tree operations.
#[derive(Debug)]
pub enum BTreeError {
    /// Novelty buffer error.
    Novelty(NoveltyError),
    /// Durable storage error.
    Storage(StorageError),
    /// Page encoding error.
    Page(PageError),
    /// A referenced page or value is missing from storage.
    PageNotFound(Address),
    /// Key length does not match the tree's key size.
    KeySize { expected: usize, actual: usize },
    /// Tree structure is inconsistent.
    Corrupted(String),
    /// I/O error writing a dump.
    Io(std::io::Error),
}

impl std::fmt::Display for BTreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Novelty(e) => write!(f, "novelty error: {e}"),
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Page(e) => write!(f, "page error: {e}"),
            Self::PageNotFound(address) => write!(f, "page not found at {address}"),
            Self::KeySize { expected, actual } => {
                write!(f, "key size mismatch: expected {expected}, got {actual}")
            }
            Self::Corrupted(msg) => write!(f, "corrupted tree: {msg}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for BTreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Novelty(e) => Some(e),
            Self::Storage(e) => Some(e),
            Self::Page(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<NoveltyError> for BTreeError {
    fn from(e: NoveltyError) -> Self {
        Self::Novelty(e)
    }
}

impl From<StorageError> for BTreeError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<PageError> for BTreeError {
    fn from(e: PageError) -> Self {
        Self::Page(e)
    }
}

impl From<std::io::Error> for BTreeError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::storage::codec::write_flipped_i32;
    use crate::storage::memory::{MemoryStorage, VoidStorage};

    const KEY_SIZE: usize = 4;
    const NOVELTY_CAPACITY: usize = 64 * 1024 * 1024;

    fn key(i: i32) -> [u8; KEY_SIZE] {
        let mut out = [0u8; KEY_SIZE];
        write_flipped_i32(i, &mut out, 0);
        out
    }

    fn setup() -> (Novelty, Arc<MemoryStorage>, BTree) {
        let novelty = Novelty::anonymous(NOVELTY_CAPACITY).expect("create novelty");
        let storage = Arc::new(MemoryStorage::new());
        let tree = BTree::create(&novelty, storage.clone(), KEY_SIZE).expect("create tree");
        (novelty, storage, tree)
    }

    fn collect(tree: &BTree, novelty: &Novelty) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        tree.for_each(novelty, |k, v| {
            out.push((k.to_vec(), v.to_vec()));
            true
        })
        .expect("for_each");
        out
    }

    /// Check ordering, fill and min-key invariants. Returns the tree depth.
    fn check_invariants(tree: &BTree, novelty: &Novelty) -> usize {
        fn visit(tree: &BTree, novelty: &Novelty, address: Address, is_root: bool) -> usize {
            let page = tree.load_page(novelty, address).expect("load page");
            assert!(page.len() <= BASE, "page overflow at {address}");
            if !is_root {
                assert!(page.len() >= BASE / 2, "under-full page at {address}");
            }
            match page {
                Page::Bottom(bottom) => {
                    for pair in bottom.entries().windows(2) {
                        assert!(pair[0].key < pair[1].key, "unsorted bottom page");
                    }
                    1
                }
                Page::Internal(internal) => {
                    let mut depths = Vec::new();
                    for pair in internal.children().windows(2) {
                        assert!(pair[0].min_key < pair[1].min_key, "unsorted internal page");
                    }
                    for child in internal.children() {
                        let child_page = tree.load_page(novelty, child.address).expect("child");
                        assert_eq!(child_page.min_key(), Some(child.min_key.as_slice()));
                        depths.push(visit(tree, novelty, child.address, false));
                    }
                    assert!(depths.windows(2).all(|d| d[0] == d[1]), "unbalanced tree");
                    depths.first().copied().unwrap_or(0) + 1
                }
            }
        }
        visit(tree, novelty, tree.root(), true)
    }

    #[test]
    fn test_put_get_hundred_keys() {
        let (novelty, _storage, mut tree) = setup();
        for i in 0..100 {
            assert!(tree.put(&novelty, &key(i), &key(i * 2), true).expect("put"));
        }
        for i in 0..100 {
            assert_eq!(
                tree.get(&novelty, &key(i)).expect("get"),
                Some(key(i * 2).to_vec())
            );
        }
        assert_eq!(tree.get(&novelty, &key(100)).expect("get missing"), None);

        let entries = collect(&tree, &novelty);
        assert_eq!(entries.len(), 100);
        assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
        check_invariants(&tree, &novelty);
    }

    #[test]
    fn test_negative_keys_sort_before_positive() {
        let (novelty, _storage, mut tree) = setup();
        for i in [5, -3, 0, i32::MIN, i32::MAX, -1] {
            tree.put(&novelty, &key(i), b"v", true).expect("put");
        }
        let keys: Vec<Vec<u8>> = collect(&tree, &novelty).into_iter().map(|(k, _)| k).collect();
        let expected: Vec<Vec<u8>> = [i32::MIN, -3, -1, 0, 5, i32::MAX]
            .into_iter()
            .map(|i| key(i).to_vec())
            .collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn test_put_overwrite_semantics() {
        let (novelty, _storage, mut tree) = setup();
        let k = key(7);
        assert!(tree.put(&novelty, &k, b"first", true).expect("put"));
        assert!(!tree.put(&novelty, &k, b"second", false).expect("put keep"));
        assert_eq!(tree.get(&novelty, &k).expect("get"), Some(b"first".to_vec()));

        assert!(tree.put(&novelty, &k, b"second", true).expect("put overwrite"));
        assert_eq!(tree.get(&novelty, &k).expect("get"), Some(b"second".to_vec()));

        let root = tree.root();
        assert!(!tree.put(&novelty, &k, b"second", true).expect("put same"));
        assert_eq!(tree.root(), root);
    }

    #[test]
    fn test_large_values_are_stored_out_of_line() {
        let (novelty, _storage, mut tree) = setup();
        let small = vec![1u8; 15];
        let large = vec![2u8; 100];
        tree.put(&novelty, &key(1), &small, true).expect("put small");
        tree.put(&novelty, &key(2), &large, true).expect("put large");
        tree.put(&novelty, &key(3), b"", true).expect("put empty");

        assert_eq!(tree.get(&novelty, &key(1)).expect("get"), Some(small));
        assert_eq!(tree.get(&novelty, &key(2)).expect("get"), Some(large));
        assert_eq!(tree.get(&novelty, &key(3)).expect("get"), Some(Vec::new()));
    }

    #[test]
    fn test_split_creates_internal_root() {
        let (novelty, _storage, mut tree) = setup();
        for i in 0..32 {
            tree.put(&novelty, &key(i), b"v", true).expect("put");
        }
        assert_eq!(tree.stats(&novelty).expect("stats").depth, 1);

        tree.put(&novelty, &key(32), b"v", true).expect("put");
        let stats = tree.stats(&novelty).expect("stats");
        assert_eq!(
            stats,
            TreeStats {
                depth: 2,
                bottom_pages: 2,
                internal_pages: 1,
                entries: 33,
            }
        );
        check_invariants(&tree, &novelty);
    }

    #[test]
    fn test_delete_and_rebalance() {
        let (novelty, _storage, mut tree) = setup();
        for i in 0..1000 {
            tree.put(&novelty, &key(i), &key(i), true).expect("put");
        }
        assert_eq!(check_invariants(&tree, &novelty), 3);

        for i in (0..1000).step_by(2) {
            assert!(tree.delete(&novelty, &key(i), None).expect("delete"));
        }
        assert!(!tree.delete(&novelty, &key(0), None).expect("delete again"));
        check_invariants(&tree, &novelty);

        for i in 0..1000 {
            let expected = (i % 2 == 1).then(|| key(i).to_vec());
            assert_eq!(tree.get(&novelty, &key(i)).expect("get"), expected);
        }
        assert_eq!(tree.stats(&novelty).expect("stats").entries, 500);
    }

    #[test]
    fn test_delete_everything_collapses_root() {
        let (novelty, _storage, mut tree) = setup();
        for i in 0..200 {
            tree.put(&novelty, &key(i), b"v", true).expect("put");
        }
        for i in (0..200).rev() {
            assert!(tree.delete(&novelty, &key(i), None).expect("delete"));
            check_invariants(&tree, &novelty);
        }
        assert_eq!(
            tree.stats(&novelty).expect("stats"),
            TreeStats {
                depth: 1,
                bottom_pages: 1,
                internal_pages: 0,
                entries: 0,
            }
        );
        assert!(collect(&tree, &novelty).is_empty());

        tree.put(&novelty, &key(5), b"again", true).expect("put after drain");
        assert_eq!(tree.get(&novelty, &key(5)).expect("get"), Some(b"again".to_vec()));
    }

    #[test]
    fn test_delete_with_value_requires_match() {
        let (novelty, _storage, mut tree) = setup();
        tree.put(&novelty, &key(1), b"one", true).expect("put");

        let root = tree.root();
        assert!(!tree.delete(&novelty, &key(1), Some(b"two")).expect("mismatch"));
        assert_eq!(tree.root(), root);
        assert_eq!(tree.get(&novelty, &key(1)).expect("get"), Some(b"one".to_vec()));

        assert!(tree.delete(&novelty, &key(1), Some(b"one")).expect("match"));
        assert_eq!(tree.get(&novelty, &key(1)).expect("get"), None);
    }

    #[test]
    fn test_old_roots_remain_snapshots() {
        let (novelty, storage, mut tree) = setup();
        for i in 0..50 {
            tree.put(&novelty, &key(i), b"old", true).expect("put");
        }
        let snapshot_root = tree.root();
        let before = collect(&tree, &novelty);

        for i in 0..50 {
            tree.put(&novelty, &key(i), b"new", true).expect("overwrite");
        }
        for i in 50..300 {
            tree.put(&novelty, &key(i), b"more", true).expect("put");
        }
        for i in 0..25 {
            tree.delete(&novelty, &key(i), None).expect("delete");
        }

        let snapshot = BTree::load(storage, KEY_SIZE, snapshot_root);
        assert_eq!(collect(&snapshot, &novelty), before);
    }

    #[test]
    fn test_for_each_from_and_early_stop() {
        let (novelty, _storage, mut tree) = setup();
        for i in (0..200).map(|i| i * 3) {
            tree.put(&novelty, &key(i), b"v", true).expect("put");
        }

        let mut seen = Vec::new();
        let completed = tree
            .for_each_from(&novelty, &key(100), |k, _| {
                seen.push(k.to_vec());
                true
            })
            .expect("for_each_from");
        assert!(completed);
        assert_eq!(seen.first(), Some(&key(102).to_vec()));
        assert_eq!(seen.len(), (102..600).step_by(3).count());

        let mut count = 0;
        let completed = tree
            .for_each(&novelty, |_, _| {
                count += 1;
                count < 10
            })
            .expect("for_each");
        assert!(!completed);
        assert_eq!(count, 10);
    }

    #[test]
    fn test_bulk_store_and_reload() {
        let (novelty, storage, mut tree) = setup();
        for i in 0..500 {
            let value = if i % 10 == 0 { vec![9u8; 64] } else { key(i).to_vec() };
            tree.put(&novelty, &key(i), &value, true).expect("put");
        }
        let expected = collect(&tree, &novelty);

        let durable = tree.store(&novelty).expect("store");
        assert!(!durable.is_novelty());
        let stored = storage.len();
        assert!(stored > 0);

        let fresh = Novelty::anonymous(NOVELTY_CAPACITY).expect("fresh novelty");
        let reloaded = BTree::load(storage.clone(), KEY_SIZE, durable);
        assert_eq!(collect(&reloaded, &fresh), expected);
        check_invariants(&reloaded, &fresh);

        // Storing an already durable tree writes nothing new.
        assert_eq!(reloaded.store(&fresh).expect("store again"), durable);
        assert_eq!(storage.len(), stored);
    }

    #[test]
    fn test_incremental_store_shares_durable_pages() {
        let (novelty, storage, mut tree) = setup();
        for i in 0..300 {
            tree.put(&novelty, &key(i), b"base", true).expect("put");
        }
        let base = tree.store(&novelty).expect("store base");
        let base_pages = storage.len();

        let fresh = Novelty::anonymous(NOVELTY_CAPACITY).expect("fresh novelty");
        let mut next = BTree::load(storage.clone(), KEY_SIZE, base);
        next.put(&fresh, &key(1000), b"delta", true).expect("put delta");
        let updated = next.store(&fresh).expect("store delta");
        assert_ne!(updated, base);

        // Only the path to the new key is rewritten.
        let written = storage.len() - base_pages;
        let depth = next.stats(&fresh).expect("stats").depth;
        assert!(written <= depth, "wrote {written} pages for depth {depth}");

        let old = BTree::load(storage.clone(), KEY_SIZE, base);
        assert_eq!(old.get(&fresh, &key(1000)).expect("get"), None);
        assert_eq!(
            next.get(&fresh, &key(1000)).expect("get"),
            Some(b"delta".to_vec())
        );
    }

    #[test]
    fn test_void_storage_refuses_bulk_store() {
        let novelty = Novelty::anonymous(NOVELTY_CAPACITY).expect("create novelty");
        let mut tree = BTree::create(&novelty, Arc::new(VoidStorage), KEY_SIZE).expect("create");
        tree.put(&novelty, &key(1), b"v", true).expect("put");
        assert!(matches!(
            tree.store(&novelty),
            Err(BTreeError::Storage(StorageError::Unsupported(_)))
        ));
    }

    #[test]
    fn test_missing_durable_page() {
        let novelty = Novelty::anonymous(NOVELTY_CAPACITY).expect("create novelty");
        let tree = BTree::load(Arc::new(MemoryStorage::new()), KEY_SIZE, Address::new(1, 2));
        assert!(matches!(
            tree.get(&novelty, &key(1)),
            Err(BTreeError::PageNotFound(_))
        ));
    }

    #[test]
    fn test_key_size_is_checked() {
        let (novelty, _storage, mut tree) = setup();
        assert!(matches!(
            tree.put(&novelty, &[1, 2], b"v", true),
            Err(BTreeError::KeySize {
                expected: KEY_SIZE,
                actual: 2
            })
        ));
        assert!(tree.get(&novelty, &[0u8; 8]).is_err());
    }

    #[test]
    fn test_dump_renders_entries() {
        let (novelty, _storage, mut tree) = setup();
        tree.put(&novelty, &[0, 0, 0, 1], b"\x0a", true).expect("put");
        let mut out = Vec::new();
        tree.dump(&novelty, &mut out, &HexRenderer).expect("dump");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.starts_with("bottom novelty@"));
        assert!(text.contains("00000001 -> 0a"));
    }

    #[test]
    fn test_twenty_byte_keys_delete_middle() {
        const WIDE: usize = 20;
        let wide_key = |i: u32| {
            let mut k = [0xabu8; WIDE];
            k[WIDE - 4..].copy_from_slice(&i.to_be_bytes());
            k
        };

        let novelty = Novelty::anonymous(NOVELTY_CAPACITY).expect("create novelty");
        let mut tree =
            BTree::create(&novelty, Arc::new(MemoryStorage::new()), WIDE).expect("create tree");
        for i in 1..=100 {
            tree.put(&novelty, &wide_key(i), format!("v{i}").as_bytes(), true)
                .expect("put");
        }

        let expected: Vec<(Vec<u8>, Vec<u8>)> = (1..=100)
            .map(|i| (wide_key(i).to_vec(), format!("v{i}").into_bytes()))
            .collect();
        assert_eq!(collect(&tree, &novelty), expected);

        assert!(tree.delete(&novelty, &wide_key(50), None).expect("delete"));
        let keys: Vec<Vec<u8>> = collect(&tree, &novelty).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys.len(), 99);
        assert!(!keys.contains(&wide_key(50).to_vec()));
        for i in (1..=100).filter(|i| *i != 50) {
            assert_eq!(
                tree.get(&novelty, &wide_key(i)).expect("get"),
                Some(format!("v{i}").into_bytes())
            );
        }
        check_invariants(&tree, &novelty);
    }

    #[test]
    fn test_random_workload_matches_model() {
        let (novelty, _storage, mut tree) = setup();
        let mut model = BTreeMap::new();
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..5000 {
            let k = key(rng.random_range(-300..300));
            if rng.random_bool(0.35) {
                let removed = model.remove(&k).is_some();
                assert_eq!(tree.delete(&novelty, &k, None).expect("delete"), removed);
            } else {
                let len = rng.random_range(0..40);
                let value: Vec<u8> = (0..len).map(|_| rng.random()).collect();
                let changed = model.get(&k) != Some(&value);
                model.insert(k, value.clone());
                assert_eq!(tree.put(&novelty, &k, &value, true).expect("put"), changed);
            }
        }

        check_invariants(&tree, &novelty);
        let expected: Vec<(Vec<u8>, Vec<u8>)> =
            model.into_iter().map(|(k, v)| (k.to_vec(), v)).collect();
        assert_eq!(collect(&tree, &novelty), expected);
    }
}
