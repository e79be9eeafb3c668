//! Bootstrap and publication of a set of indices.
//!
//! A [`BTreeIndexStorageManager`] owns what every index of a session shares:
//! the durable storage backend, one novelty buffer, and the tree holding all
//! forward indices. It opens the baseline named by the configuration (if
//! any) and hands out index storages layered over it.
//!
//! New writes land at the manager's new revision; reads of untouched keys
//! fall back to the baseline revision. [`BTreeIndexStorageManager::publish`]
//! stores every registered index and yields the manifest of the next
//! baseline.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::IndexConfig;
use crate::index::descriptor::{DataExternalizer, KeyDescriptor};
use crate::index::forward::{FORWARD_KEY_SIZE, ForwardIndexMap};
use crate::index::manifest::{DirectoryManifestSource, IndexManifest, ManifestError, ManifestSource};
use crate::index::storage::{BTreeIndexStorage, IndexStorageError, PublishableIndex, Revisions};
use crate::storage::{
    BTree, BTreeError, Novelty, NoveltyError, RemoteStorage, Storage, StorageError, VoidStorage,
};

/// Revision written by a session that starts without a baseline.
pub const INITIAL_REVISION: i32 = 17;

/// Base revision of a session that starts without a baseline.
const NO_BASE_REVISION: i32 = -1;

/// Shared state and registry of the indices of one session.
pub struct BTreeIndexStorageManager {
    storage: Arc<dyn Storage>,
    novelty: Arc<Novelty>,
    manifest: Option<IndexManifest>,
    forward: Arc<Mutex<BTree>>,
    base_revision: i32,
    new_revision: i32,
    cache_size: usize,
    indices: Mutex<BTreeMap<String, Arc<dyn PublishableIndex>>>,
}

impl std::fmt::Debug for BTreeIndexStorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTreeIndexStorageManager")
            .field("base_revision", &self.base_revision)
            .field("new_revision", &self.new_revision)
            .finish_non_exhaustive()
    }
}

impl BTreeIndexStorageManager {
    /// Open a manager with the storage backend the configuration names:
    /// remote when a cache host is set, otherwise [`VoidStorage`].
    pub fn from_config(config: &IndexConfig) -> Result<Self, ManagerError> {
        let storage: Arc<dyn Storage> = match &config.cache_host {
            Some(host) => Arc::new(RemoteStorage::connect((host.as_str(), config.cache_port))?),
            None => {
                tracing::info!("no cache host configured, pages stay in novelty");
                Arc::new(VoidStorage)
            }
        };
        Self::with_storage(config, storage)
    }

    /// Open a manager over `storage`, reading manifests from
    /// `config.meta_dir`.
    pub fn with_storage(config: &IndexConfig, storage: Arc<dyn Storage>) -> Result<Self, ManagerError> {
        let source = DirectoryManifestSource::new(config.meta_dir.clone());
        Self::with_source(config, storage, &source)
    }

    /// Open a manager over `storage`, reading manifests from `source`.
    pub fn with_source(
        config: &IndexConfig,
        storage: Arc<dyn Storage>,
        source: &dyn ManifestSource,
    ) -> Result<Self, ManagerError> {
        let novelty = Arc::new(Novelty::temporary(config.novelty_capacity)?);

        let (manifest, forward, base_revision) = match &config.revision {
            Some(revision) => {
                let manifest = source.fetch(revision)?;
                let base_revision = manifest.revision()?;
                let forward = BTree::load(storage.clone(), FORWARD_KEY_SIZE, manifest.forward_root()?);
                tracing::info!(
                    "opened baseline {revision} at revision {base_revision} with {} indices",
                    manifest.inverted_indices.len()
                );
                (Some(manifest), forward, base_revision)
            }
            None => {
                let forward = BTree::create(&novelty, storage.clone(), FORWARD_KEY_SIZE)?;
                (None, forward, NO_BASE_REVISION)
            }
        };

        let new_revision = match (config.new_revision, &manifest) {
            (Some(revision), _) => revision,
            (None, Some(_)) => base_revision.saturating_add(1),
            (None, None) => INITIAL_REVISION,
        };
        if new_revision <= base_revision {
            return Err(ManagerError::Revision {
                base: base_revision,
                new: new_revision,
            });
        }

        Ok(Self {
            storage,
            novelty,
            manifest,
            forward: Arc::new(Mutex::new(forward)),
            base_revision,
            new_revision,
            cache_size: config.cache_size,
            indices: Mutex::new(BTreeMap::new()),
        })
    }

    /// Open the named inverted index at the manager's revisions and register
    /// it for publication.
    pub fn create_index_storage<K, V>(
        &self,
        name: &str,
        key_descriptor: Arc<dyn KeyDescriptor<K>>,
        externalizer: Arc<dyn DataExternalizer<V>>,
        cache_size: usize,
    ) -> Result<Arc<BTreeIndexStorage<K, V>>, ManagerError>
    where
        K: Hash + Eq + Clone + Send + 'static,
        V: Clone + PartialEq + Send + 'static,
    {
        let head = match &self.manifest {
            Some(manifest) => manifest.heads(name)?,
            None => None,
        };
        if self.manifest.is_some() && head.is_none() {
            tracing::debug!("index {name} is not in the baseline, starting empty");
        }

        let index = Arc::new(BTreeIndexStorage::new(
            key_descriptor,
            externalizer,
            self.storage.clone(),
            self.novelty.clone(),
            head,
            cache_size,
            Revisions::new(self.new_revision, self.base_revision),
        )?);

        let publishable: Arc<dyn PublishableIndex> = index.clone();
        if self
            .indices
            .lock()
            .insert(name.to_string(), publishable)
            .is_some()
        {
            tracing::warn!("index {name} opened twice, the earlier instance will not be published");
        }
        Ok(index)
    }

    /// Open the named inverted index with the configured cache size.
    pub fn open_index_storage<K, V>(
        &self,
        name: &str,
        key_descriptor: Arc<dyn KeyDescriptor<K>>,
        externalizer: Arc<dyn DataExternalizer<V>>,
    ) -> Result<Arc<BTreeIndexStorage<K, V>>, ManagerError>
    where
        K: Hash + Eq + Clone + Send + 'static,
        V: Clone + PartialEq + Send + 'static,
    {
        self.create_index_storage(name, key_descriptor, externalizer, self.cache_size)
    }

    /// A forward index over the shared forward tree.
    #[must_use]
    pub fn create_forward_index_storage<V>(
        &self,
        index_id: u16,
        externalizer: Arc<dyn DataExternalizer<V>>,
    ) -> ForwardIndexMap<V> {
        ForwardIndexMap::new(index_id, externalizer, self.novelty.clone(), self.forward.clone())
    }

    /// Write back every registered index without storing it.
    pub fn flush(&self) -> Result<(), ManagerError> {
        for index in self.indices.lock().values() {
            index.flush()?;
        }
        Ok(())
    }

    /// Store every registered index and the forward tree, returning the
    /// manifest of the resulting baseline.
    ///
    /// Baseline indices that were not opened this session keep their heads.
    pub fn publish(&self) -> Result<IndexManifest, ManagerError> {
        let indices = self.indices.lock();

        let forward_root = {
            let mut forward = self.forward.lock();
            let root = forward.store(&self.novelty)?;
            *forward = BTree::load(self.storage.clone(), FORWARD_KEY_SIZE, root);
            root
        };

        let mut manifest = IndexManifest::new(self.new_revision, forward_root);
        for (name, index) in indices.iter() {
            manifest.insert(name.clone(), index.store()?);
        }
        let mut carried = 0usize;
        if let Some(baseline) = &self.manifest {
            for (name, heads) in &baseline.inverted_indices {
                if let Entry::Vacant(slot) = manifest.inverted_indices.entry(name.clone()) {
                    slot.insert(heads.clone());
                    carried += 1;
                }
            }
        }
        tracing::info!(
            "published {} indices at revision {} ({carried} carried over unchanged)",
            indices.len(),
            self.new_revision
        );
        Ok(manifest)
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    #[must_use]
    pub fn novelty(&self) -> &Arc<Novelty> {
        &self.novelty
    }

    /// The baseline manifest this session started from.
    #[must_use]
    pub const fn manifest(&self) -> Option<&IndexManifest> {
        self.manifest.as_ref()
    }

    #[must_use]
    pub const fn base_revision(&self) -> i32 {
        self.base_revision
    }

    #[must_use]
    pub const fn new_revision(&self) -> i32 {
        self.new_revision
    }

    /// Cache size used by [`Self::open_index_storage`].
    #[must_use]
    pub const fn cache_size(&self) -> usize {
        self.cache_size
    }

    /// Snapshot of the forward tree.
    #[must_use]
    pub fn forward_tree(&self) -> BTree {
        self.forward.lock().clone()
    }

    /// Names of the registered inverted indices, sorted.
    #[must_use]
    pub fn index_names(&self) -> Vec<String> {
        self.indices.lock().keys().cloned().collect()
    }
}

/// Errors from bootstrapping or publishing indices.
#[derive(Debug)]
pub enum ManagerError {
    Storage(StorageError),
    Novelty(NoveltyError),
    Tree(BTreeError),
    Index(IndexStorageError),
    Manifest(ManifestError),
    /// New writes must land above the base revision.
    Revision { base: i32, new: i32 },
}

impl std::fmt::Display for ManagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Novelty(e) => write!(f, "novelty error: {e}"),
            Self::Tree(e) => write!(f, "tree error: {e}"),
            Self::Index(e) => write!(f, "index error: {e}"),
            Self::Manifest(e) => write!(f, "manifest error: {e}"),
            Self::Revision { base, new } => {
                write!(f, "new revision {new} must be greater than base revision {base}")
            }
        }
    }
}

impl std::error::Error for ManagerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Novelty(e) => Some(e),
            Self::Tree(e) => Some(e),
            Self::Index(e) => Some(e),
            Self::Manifest(e) => Some(e),
            Self::Revision { .. } => None,
        }
    }
}

impl From<StorageError> for ManagerError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<NoveltyError> for ManagerError {
    fn from(e: NoveltyError) -> Self {
        Self::Novelty(e)
    }
}

impl From<BTreeError> for ManagerError {
    fn from(e: BTreeError) -> Self {
        Self::Tree(e)
    }
}

impl From<IndexStorageError> for ManagerError {
    fn from(e: IndexStorageError) -> Self {
        Self::Index(e)
    }
}

impl From<ManifestError> for ManagerError {
    fn from(e: ManifestError) -> Self {
        Self::Manifest(e)
    }
}
