//! Inverted index storage over a copy-on-write B-tree.
//!
//! Every key owns a [`CompositeValueContainer`] held in a write-back LRU
//! cache. Mutations only touch the cached delta; the tree is written when an
//! entry is evicted, flushed, or the index is stored.
//!
//! # Revisions
//!
//! Physical tree keys carry a revision prefix. A session writes its deltas at
//! [`Revisions::current`], each relative to the committed state at
//! [`Revisions::base`], so a published baseline is never rewritten by later
//! sessions. Baselines chain: the tree a session opens holds only revisions of
//! the sessions it descends from, so the committed state of a key is every
//! delta recorded for it at or below the base, applied in revision order.
//!
//! # Key Encoding
//!
//! ```text
//! inline:  [flip(revision)][flip(int key)]            8 bytes
//! hashed:  [flip(revision)][sha256(key bytes)[..16]] 20 bytes
//! ```
//!
//! Hashed indices keep a second "internary" tree mapping the 16-byte hash to
//! the original key bytes, which is how [`BTreeIndexStorage::process_keys`]
//! recovers logical keys.
//!
//! # Locking
//!
//! The cache lock is always taken before the tree lock, and the tree lock
//! before the novelty map. Loads and write-backs run inside the cache lock
//! and only touch the trees, so eviction never re-enters the cache.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::index::cache::WriteBackCache;
use crate::index::container::{CompositeValueContainer, DeltaValueContainer, ValueContainer};
use crate::index::descriptor::{DataExternalizer, KeyDescriptor};
use crate::storage::codec::{CodecError, read_flipped_i32, to_hex, write_flipped_i32};
use crate::storage::{Address, BTree, BTreeError, Novelty, Storage};

/// Bytes of revision prefix on every physical key.
const REVISION_SIZE: usize = 4;

/// Bytes of key digest kept for hashed keys.
pub const HASH_SIZE: usize = 16;

/// Physical key size for integer keys.
pub const INLINE_KEY_SIZE: usize = REVISION_SIZE + 4;

/// Physical key size for hashed keys.
pub const HASHED_KEY_SIZE: usize = REVISION_SIZE + HASH_SIZE;

/// Cache entries kept per unit of configured cache size.
const CACHE_SIZE_FACTOR: usize = 10;

/// Root addresses of an index's trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPair {
    pub data: Address,
    /// Hash to original key tree; absent for integer-keyed indices.
    pub internary: Option<Address>,
}

/// Revision written by this session and the revision its base is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Revisions {
    pub current: i32,
    /// Negative when there is no committed base.
    pub base: i32,
}

impl Revisions {
    #[must_use]
    pub const fn new(current: i32, base: i32) -> Self {
        Self { current, base }
    }
}

struct Trees {
    data: BTree,
    internary: Option<BTree>,
}

/// An index that can be flushed and published by the manager.
pub trait PublishableIndex: Send + Sync {
    /// Write back every dirty delta into the trees.
    fn flush(&self) -> Result<(), IndexStorageError>;

    /// Flush, then copy the trees into durable storage.
    fn store(&self) -> Result<AddressPair, IndexStorageError>;
}

/// Key to value-container storage with a write-back cache.
pub struct BTreeIndexStorage<K: Hash + Eq, V> {
    key_descriptor: Arc<dyn KeyDescriptor<K>>,
    externalizer: Arc<dyn DataExternalizer<V>>,
    novelty: Arc<Novelty>,
    storage: Arc<dyn Storage>,
    cache: Mutex<WriteBackCache<K, CompositeValueContainer<V>>>,
    trees: Mutex<Trees>,
    revisions: Revisions,
    /// Revisions with data at or below the base, ascending.
    committed: Vec<i32>,
}

impl<K: Hash + Eq, V> std::fmt::Debug for BTreeIndexStorage<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTreeIndexStorage")
            .field("revisions", &self.revisions)
            .finish_non_exhaustive()
    }
}

impl<K, V> BTreeIndexStorage<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + PartialEq,
{
    /// Open an index, starting from `head` or from empty trees.
    pub fn new(
        key_descriptor: Arc<dyn KeyDescriptor<K>>,
        externalizer: Arc<dyn DataExternalizer<V>>,
        storage: Arc<dyn Storage>,
        novelty: Arc<Novelty>,
        head: Option<AddressPair>,
        cache_size: usize,
        revisions: Revisions,
    ) -> Result<Self, IndexStorageError> {
        let hashed = key_descriptor.as_inline().is_none();
        let key_size = if hashed {
            HASHED_KEY_SIZE
        } else {
            INLINE_KEY_SIZE
        };

        let (trees, committed) = match head {
            Some(head) => {
                let internary = match (hashed, head.internary) {
                    (true, Some(root)) => Some(BTree::load(storage.clone(), HASH_SIZE, root)),
                    (true, None) => {
                        return Err(IndexStorageError::Corrupted(format!(
                            "hashed index at {} has no internary tree",
                            head.data
                        )));
                    }
                    (false, _) => None,
                };
                let data = BTree::load(storage.clone(), key_size, head.data);
                let committed = committed_revisions(&novelty, &data, revisions.base)?;
                (Trees { data, internary }, committed)
            }
            None => {
                let trees = Trees {
                    data: BTree::create(&novelty, storage.clone(), key_size)?,
                    internary: if hashed {
                        Some(BTree::create(&novelty, storage.clone(), HASH_SIZE)?)
                    } else {
                        None
                    },
                };
                (trees, Vec::new())
            }
        };

        Ok(Self {
            key_descriptor,
            externalizer,
            novelty,
            storage,
            cache: Mutex::new(WriteBackCache::new(cache_size.saturating_mul(CACHE_SIZE_FACTOR))),
            trees: Mutex::new(trees),
            revisions,
            committed,
        })
    }

    #[must_use]
    pub const fn revisions(&self) -> Revisions {
        self.revisions
    }

    /// Earlier revisions this index was opened with, ascending.
    #[must_use]
    pub fn committed_revisions(&self) -> &[i32] {
        &self.committed
    }

    /// Containers the write-back cache holds before evicting.
    #[must_use]
    pub fn cache_capacity(&self) -> usize {
        self.cache.lock().capacity()
    }

    /// Associate `value` with `input_id` under `key`, replacing any earlier
    /// value from the same input.
    pub fn add_value(&self, key: &K, input_id: i32, value: V) -> Result<(), IndexStorageError> {
        check_input_id(input_id)?;
        let mut cache = self.cache.lock();
        self.cached(&mut cache, key)?.add_value(input_id, value);
        Ok(())
    }

    /// Drop whatever value `input_id` associated with `key`.
    pub fn remove_all_values(&self, key: &K, input_id: i32) -> Result<(), IndexStorageError> {
        check_input_id(input_id)?;
        let mut cache = self.cache.lock();
        self.cached(&mut cache, key)?
            .remove_associated_value(input_id);
        Ok(())
    }

    /// Snapshot of the merged associations for `key`.
    pub fn read(&self, key: &K) -> Result<ValueContainer<V>, IndexStorageError> {
        let mut cache = self.cache.lock();
        let container = self.cached(&mut cache, key)?;
        let merged = container.merged_with(|| self.load_base(key))?;
        Ok(merged.clone())
    }

    /// Visit every key with stored data, each once, until `processor`
    /// returns `false`. Returns `false` iff stopped early.
    pub fn process_keys(
        &self,
        mut processor: impl FnMut(&K) -> bool,
    ) -> Result<bool, IndexStorageError> {
        self.flush()?;

        let keys = {
            let trees = self.trees.lock();
            let mut seen = HashSet::new();
            let mut logical = Vec::new();
            trees.data.for_each(&self.novelty, |key, _| {
                let suffix = &key[REVISION_SIZE..];
                if seen.insert(suffix.to_vec()) {
                    logical.push(suffix.to_vec());
                }
                true
            })?;
            logical
                .iter()
                .map(|suffix| self.decode_key(&trees, suffix))
                .collect::<Result<Vec<K>, _>>()?
        };

        Ok(keys.iter().all(&mut processor))
    }

    /// Structural clearing of a copy-on-write tree is not supported; rebuild
    /// the index instead.
    #[allow(clippy::unused_self)]
    pub const fn clear(&self) -> Result<(), IndexStorageError> {
        Err(IndexStorageError::Unsupported("clear"))
    }

    /// Write back and evict every cached container.
    pub fn clear_caches(&self) -> Result<(), IndexStorageError> {
        let mut cache = self.cache.lock();
        cache.drain(|key, container| self.write_back(key, container))
    }

    /// Write back dirty containers, keeping them cached.
    pub fn flush(&self) -> Result<(), IndexStorageError> {
        let mut cache = self.cache.lock();
        let mut written = 0usize;
        for (key, container) in cache.iter_mut() {
            if container.delta().is_dirty() {
                self.write_back(key, container)?;
                container.delta_mut().mark_clean();
                written += 1;
            }
        }
        if written > 0 {
            tracing::debug!("flushed {written} dirty containers");
        }
        Ok(())
    }

    pub fn close(&self) -> Result<(), IndexStorageError> {
        self.flush()
    }

    /// Current roots of the index trees.
    #[must_use]
    pub fn heads(&self) -> AddressPair {
        let trees = self.trees.lock();
        AddressPair {
            data: trees.data.root(),
            internary: trees.internary.as_ref().map(BTree::root),
        }
    }

    /// Flush and bulk store both trees, rebinding them to their durable
    /// roots.
    pub fn store(&self) -> Result<AddressPair, IndexStorageError> {
        self.flush()?;
        let mut trees = self.trees.lock();

        let data = trees.data.store(&self.novelty)?;
        trees.data = BTree::load(self.storage.clone(), trees.data.key_size(), data);

        let internary = match &trees.internary {
            Some(tree) => {
                let root = tree.store(&self.novelty)?;
                Some(BTree::load(self.storage.clone(), HASH_SIZE, root))
            }
            None => None,
        };
        trees.internary = internary;

        let heads = AddressPair {
            data,
            internary: trees.internary.as_ref().map(BTree::root),
        };
        tracing::debug!("stored index at revision {}: {heads:?}", self.revisions.current);
        Ok(heads)
    }

    fn cached<'c>(
        &self,
        cache: &'c mut WriteBackCache<K, CompositeValueContainer<V>>,
        key: &K,
    ) -> Result<&'c mut CompositeValueContainer<V>, IndexStorageError> {
        cache.get_or_load(
            key,
            || self.load_delta(key),
            |evicted, container| self.write_back(evicted, container),
        )
    }

    /// Cache miss: the delta already written at the current revision.
    fn load_delta(&self, key: &K) -> Result<CompositeValueContainer<V>, IndexStorageError> {
        let (physical, _) = self.encode_key(self.revisions.current, key);
        let bytes = self.trees.lock().data.get(&self.novelty, &physical)?;
        let delta = match bytes {
            Some(bytes) => DeltaValueContainer::read_from(&bytes, self.externalizer.as_ref())?,
            None => DeltaValueContainer::new(),
        };
        Ok(CompositeValueContainer::new(delta))
    }

    /// The committed associations at the base revision: every earlier delta
    /// for `key`, oldest first.
    fn load_base(&self, key: &K) -> Result<ValueContainer<V>, IndexStorageError> {
        let mut base = ValueContainer::new();
        let Some(&first) = self.committed.first() else {
            return Ok(base);
        };
        let (mut physical, _) = self.encode_key(first, key);
        let trees = self.trees.lock();
        for &revision in &self.committed {
            write_flipped_i32(revision, &mut physical, 0);
            if let Some(bytes) = trees.data.get(&self.novelty, &physical)? {
                DeltaValueContainer::read_from(&bytes, self.externalizer.as_ref())?
                    .apply_to(&mut base);
            }
        }
        drop(trees);
        Ok(base)
    }

    fn write_back(
        &self,
        key: &K,
        container: &CompositeValueContainer<V>,
    ) -> Result<(), IndexStorageError> {
        let delta = container.delta();
        if !delta.is_dirty() {
            return Ok(());
        }
        let mut bytes = Vec::new();
        delta.save_to(&mut bytes, self.externalizer.as_ref());
        let (physical, original) = self.encode_key(self.revisions.current, key);

        let mut trees = self.trees.lock();
        trees.data.put(&self.novelty, &physical, &bytes, true)?;
        if let (Some(internary), Some(original)) = (trees.internary.as_mut(), original) {
            internary.put(&self.novelty, &physical[REVISION_SIZE..], &original, false)?;
        }
        tracing::debug!(
            "wrote back {} byte delta at revision {}",
            bytes.len(),
            self.revisions.current
        );
        Ok(())
    }

    /// Physical tree key, plus the serialized key for hashed indices.
    fn encode_key(&self, revision: i32, key: &K) -> (Vec<u8>, Option<Vec<u8>>) {
        if let Some(inline) = self.key_descriptor.as_inline() {
            let mut physical = vec![0u8; INLINE_KEY_SIZE];
            write_flipped_i32(revision, &mut physical, 0);
            write_flipped_i32(inline.to_int(key), &mut physical, REVISION_SIZE);
            return (physical, None);
        }

        let mut original = Vec::new();
        self.key_descriptor.save(&mut original, key);
        let digest = Sha256::digest(&original);
        let mut physical = vec![0u8; HASHED_KEY_SIZE];
        write_flipped_i32(revision, &mut physical, 0);
        physical[REVISION_SIZE..].copy_from_slice(&digest[..HASH_SIZE]);
        (physical, Some(original))
    }

    /// Recover a logical key from a physical key without its revision.
    fn decode_key(&self, trees: &Trees, suffix: &[u8]) -> Result<K, IndexStorageError> {
        if let Some(inline) = self.key_descriptor.as_inline() {
            return Ok(inline.from_int(read_flipped_i32(suffix, 0)));
        }
        let internary = trees.internary.as_ref().ok_or_else(|| {
            IndexStorageError::Corrupted("hashed index has no internary tree".to_string())
        })?;
        let original = internary.get(&self.novelty, suffix)?.ok_or_else(|| {
            IndexStorageError::Corrupted(format!(
                "no original key recorded for hash {}",
                to_hex(suffix)
            ))
        })?;
        Ok(self.key_descriptor.read(&mut original.as_slice())?)
    }
}

impl<K, V> PublishableIndex for BTreeIndexStorage<K, V>
where
    K: Hash + Eq + Clone + Send,
    V: Clone + PartialEq + Send,
{
    fn flush(&self) -> Result<(), IndexStorageError> {
        Self::flush(self)
    }

    fn store(&self) -> Result<AddressPair, IndexStorageError> {
        Self::store(self)
    }
}

/// Distinct revision prefixes in `tree` at or below `base`, ascending. Each
/// step seeks straight past the revision just found.
fn committed_revisions(novelty: &Novelty, tree: &BTree, base: i32) -> Result<Vec<i32>, BTreeError> {
    let mut revisions = Vec::new();
    let mut from = vec![0u8; tree.key_size()];
    loop {
        let mut next = None;
        tree.for_each_from(novelty, &from, |key, _| {
            next = Some(read_flipped_i32(key, 0));
            false
        })?;
        let Some(revision) = next.filter(|revision| *revision <= base) else {
            break;
        };
        revisions.push(revision);
        let Some(following) = revision.checked_add(1) else {
            break;
        };
        write_flipped_i32(following, &mut from, 0);
    }
    Ok(revisions)
}

const fn check_input_id(input_id: i32) -> Result<(), IndexStorageError> {
    if input_id > 0 {
        Ok(())
    } else {
        Err(IndexStorageError::InvalidInputId(input_id))
    }
}

/// Errors from index storage operations.
#[derive(Debug)]
pub enum IndexStorageError {
    Tree(BTreeError),
    Codec(CodecError),
    /// Input ids must be positive.
    InvalidInputId(i32),
    Corrupted(String),
    Unsupported(&'static str),
}

impl std::fmt::Display for IndexStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tree(e) => write!(f, "tree error: {e}"),
            Self::Codec(e) => write!(f, "codec error: {e}"),
            Self::InvalidInputId(id) => write!(f, "invalid input id {id}: must be positive"),
            Self::Corrupted(msg) => write!(f, "corrupted index: {msg}"),
            Self::Unsupported(op) => write!(f, "operation not supported: {op}"),
        }
    }
}

impl std::error::Error for IndexStorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Tree(e) => Some(e),
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BTreeError> for IndexStorageError {
    fn from(e: BTreeError) -> Self {
        Self::Tree(e)
    }
}

impl From<CodecError> for IndexStorageError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}
