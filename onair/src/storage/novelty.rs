//! Novelty: the append-only write buffer for uncommitted pages.
//!
//! Every record is a 4-byte big-endian length prefix followed by the payload.
//! Records are never moved or reclaimed; the buffer only grows until the
//! process exits.
//!
//! # Design
//!
//! - Backed by a memory map (anonymous, or over a scratch file)
//! - Space is reserved with a single atomic `fetch_add` on the append cursor,
//!   so concurrent allocations never hand out overlapping ranges
//! - Byte copies go through a `RwLock` over the map: lookups share it, writes
//!   exclude
//! - [`NoveltyReader`] shares the same map for read-only access from other
//!   threads while a writer keeps appending
//!
//! # Invariants
//!
//! - Offsets returned by `alloc` are strictly increasing
//! - The length prefix of an allocated record never changes

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::MmapMut;
use parking_lot::RwLock;

use crate::storage::address::Address;

/// Default capacity (just under 2 GiB).
pub const DEFAULT_CAPACITY: usize = 2047 * 1024 * 1024;

/// Size of the per-record length prefix.
const LENGTH_PREFIX: usize = 4;

struct Shared {
    map: RwLock<MmapMut>,
    /// Append cursor: total bytes reserved so far.
    size: AtomicU64,
    capacity: usize,
    /// Keeps the backing file open for file-backed buffers.
    file: Option<File>,
}

/// The novelty write buffer.
pub struct Novelty {
    shared: Arc<Shared>,
}

/// Read-only view over a [`Novelty`] buffer.
#[derive(Clone)]
pub struct NoveltyReader {
    shared: Arc<Shared>,
}

impl Novelty {
    /// Create a buffer over anonymous memory.
    pub fn anonymous(capacity: usize) -> Result<Self, NoveltyError> {
        Self::check_capacity(capacity)?;
        let map = MmapMut::map_anon(capacity)?;
        Ok(Self::from_parts(map, capacity, None))
    }

    /// Create a buffer backed by a scratch file that is removed on drop.
    pub fn temporary(capacity: usize) -> Result<Self, NoveltyError> {
        Self::check_capacity(capacity)?;
        let file = tempfile::tempfile()?;
        Self::from_file(file, capacity)
    }

    /// Create a buffer backed by the file at `path`, truncating it.
    pub fn create(path: &Path, capacity: usize) -> Result<Self, NoveltyError> {
        Self::check_capacity(capacity)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Self::from_file(file, capacity)
    }

    #[allow(unsafe_code)]
    fn from_file(file: File, capacity: usize) -> Result<Self, NoveltyError> {
        file.set_len(capacity as u64)?;
        // SAFETY: the file is created or truncated by us and is only ever
        // accessed through this mapping for the lifetime of the buffer.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self::from_parts(map, capacity, Some(file)))
    }

    fn from_parts(map: MmapMut, capacity: usize, file: Option<File>) -> Self {
        Self {
            shared: Arc::new(Shared {
                map: RwLock::new(map),
                size: AtomicU64::new(0),
                capacity,
                file,
            }),
        }
    }

    const fn check_capacity(capacity: usize) -> Result<(), NoveltyError> {
        if capacity <= LENGTH_PREFIX {
            return Err(NoveltyError::InvalidCapacity(capacity));
        }
        Ok(())
    }

    /// Append `bytes` and return their address.
    ///
    /// # Errors
    ///
    /// Returns `OutOfSpace` once the buffer is exhausted. The reserved range
    /// is not given back, so every later allocation fails too.
    #[allow(clippy::cast_possible_truncation)]
    pub fn alloc(&self, bytes: &[u8]) -> Result<Address, NoveltyError> {
        let len = u32::try_from(bytes.len()).map_err(|_| NoveltyError::RecordTooLarge(bytes.len()))?;
        let total = LENGTH_PREFIX + bytes.len();
        let offset = self.shared.size.fetch_add(total as u64, Ordering::AcqRel);
        let start = offset as usize;

        if start.checked_add(total).is_none_or(|end| end > self.shared.capacity) {
            return Err(NoveltyError::OutOfSpace {
                offset,
                requested: total,
                capacity: self.shared.capacity,
            });
        }

        let mut map = self.shared.map.write();
        map[start..start + LENGTH_PREFIX].copy_from_slice(&len.to_be_bytes());
        map[start + LENGTH_PREFIX..start + total].copy_from_slice(bytes);
        Ok(Address::novelty(offset))
    }

    /// Return the bytes previously allocated at `address`.
    pub fn lookup(&self, address: Address) -> Result<Vec<u8>, NoveltyError> {
        self.shared.lookup(address)
    }

    /// Overwrite the record at `address` in place.
    ///
    /// # Errors
    ///
    /// Returns `LengthMismatch` if `bytes` differs in length from the
    /// originally allocated record.
    pub fn update(&self, address: Address, bytes: &[u8]) -> Result<(), NoveltyError> {
        let start = self.shared.record_start(address)?;
        let mut map = self.shared.map.write();
        let len = read_length(&map, start);
        if len != bytes.len() {
            return Err(NoveltyError::LengthMismatch {
                address,
                expected: len,
                actual: bytes.len(),
            });
        }
        map[start + LENGTH_PREFIX..start + LENGTH_PREFIX + len].copy_from_slice(bytes);
        Ok(())
    }

    /// Release a record. Space is never reclaimed, so this does nothing.
    pub const fn free(&self, _address: Address) {}

    /// A read-only accessor sharing this buffer.
    #[must_use]
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn reader(&self) -> NoveltyReader {
        NoveltyReader {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Flush a file-backed buffer to its file.
    pub fn flush(&self) -> Result<(), NoveltyError> {
        if self.shared.file.is_some() {
            self.shared.map.read().flush()?;
        }
        Ok(())
    }

    /// Bytes reserved so far, length prefixes included.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.shared.size.load(Ordering::Acquire)
    }

    /// Bytes still available for allocation.
    #[must_use]
    pub fn free_space(&self) -> u64 {
        (self.shared.capacity as u64).saturating_sub(self.size())
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl NoveltyReader {
    /// Return the bytes previously allocated at `address`.
    pub fn lookup(&self, address: Address) -> Result<Vec<u8>, NoveltyError> {
        self.shared.lookup(address)
    }
}

impl Shared {
    #[allow(clippy::cast_possible_truncation)]
    fn record_start(&self, address: Address) -> Result<usize, NoveltyError> {
        let offset = address
            .novelty_offset()
            .ok_or(NoveltyError::InvalidAddress(address))?;
        let size = self.size.load(Ordering::Acquire).min(self.capacity as u64);
        if offset + LENGTH_PREFIX as u64 > size {
            return Err(NoveltyError::InvalidAddress(address));
        }
        Ok(offset as usize)
    }

    fn lookup(&self, address: Address) -> Result<Vec<u8>, NoveltyError> {
        let start = self.record_start(address)?;
        let map = self.map.read();
        let len = read_length(&map, start);
        let end = start + LENGTH_PREFIX + len;
        if end > self.capacity {
            return Err(NoveltyError::InvalidAddress(address));
        }
        Ok(map[start + LENGTH_PREFIX..end].to_vec())
    }
}

fn read_length(map: &[u8], start: usize) -> usize {
    let mut raw = [0u8; LENGTH_PREFIX];
    raw.copy_from_slice(&map[start..start + LENGTH_PREFIX]);
    u32::from_be_bytes(raw) as usize
}

/// Errors raised by the novelty buffer.
#[derive(Debug)]
pub enum NoveltyError {
    /// Creating or flushing the backing map failed.
    Io(std::io::Error),
    /// Capacity too small to hold a single record.
    InvalidCapacity(usize),
    /// The buffer is exhausted.
    OutOfSpace {
        offset: u64,
        requested: usize,
        capacity: usize,
    },
    /// A single record does not fit the 4-byte length prefix.
    RecordTooLarge(usize),
    /// The address is not a novelty address or was never allocated.
    InvalidAddress(Address),
    /// In-place update with a different length.
    LengthMismatch {
        address: Address,
        expected: usize,
        actual: usize,
    },
}

impl std::fmt::Display for NoveltyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "novelty I/O error: {e}"),
            Self::InvalidCapacity(capacity) => write!(f, "invalid novelty capacity {capacity}"),
            Self::OutOfSpace {
                offset,
                requested,
                capacity,
            } => write!(
                f,
                "not enough memory in novelty storage: {requested} bytes at {offset}, capacity {capacity}"
            ),
            Self::RecordTooLarge(len) => write!(f, "novelty record of {len} bytes is too large"),
            Self::InvalidAddress(address) => write!(f, "no novelty record at {address}"),
            Self::LengthMismatch {
                address,
                expected,
                actual,
            } => write!(
                f,
                "buffer overrun at {address}: expected {expected} bytes, got {actual}"
            ),
        }
    }
}

impl std::error::Error for NoveltyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for NoveltyError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
