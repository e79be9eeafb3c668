//! Index storage configuration.
//!
//! This module loads the settings of a [`BTreeIndexStorageManager`] from
//! environment variables.
//!
//! # Environment Variables
//!
//! - `ONAIR_INDEX_REVISION`: Baseline revision to start from (default: none, start empty)
//! - `ONAIR_INDEX_CACHE_HOST`: Host of the remote page cache (default: none, no durable storage)
//! - `ONAIR_INDEX_CACHE_PORT`: Port of the remote page cache (default: `11211`)
//! - `ONAIR_INDEX_META_DIR`: Directory holding baseline manifests (default: `./index-meta`)
//! - `ONAIR_INDEX_NEW_REVISION`: Revision new writes go to (default: derived from the baseline)
//! - `ONAIR_NOVELTY_CAPACITY`: Novelty buffer size in bytes (default: 2047 MiB)
//! - `ONAIR_INDEX_CACHE_SIZE`: Default per-index cache size (default: `1024`)
//!
//! # Invariants
//!
//! - `revision` and `cache_host`, when present, are non-empty
//! - `novelty_capacity` is non-zero
//!
//! [`BTreeIndexStorageManager`]: crate::index::BTreeIndexStorageManager

use std::path::PathBuf;

use crate::storage::DEFAULT_CAPACITY;

const REVISION: &str = "ONAIR_INDEX_REVISION";
const CACHE_HOST: &str = "ONAIR_INDEX_CACHE_HOST";
const CACHE_PORT: &str = "ONAIR_INDEX_CACHE_PORT";
const META_DIR: &str = "ONAIR_INDEX_META_DIR";
const NEW_REVISION: &str = "ONAIR_INDEX_NEW_REVISION";
const NOVELTY_CAPACITY: &str = "ONAIR_NOVELTY_CAPACITY";
const CACHE_SIZE: &str = "ONAIR_INDEX_CACHE_SIZE";

/// Index storage configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexConfig {
    /// Baseline revision whose manifest seeds the indices.
    pub revision: Option<String>,
    /// Host of the remote page cache. Without it pages never leave novelty.
    pub cache_host: Option<String>,
    pub cache_port: u16,
    /// Manifests live at `{meta_dir}/{revision}/meta`.
    pub meta_dir: PathBuf,
    /// Overrides the revision new writes are recorded at.
    pub new_revision: Option<i32>,
    pub novelty_capacity: usize,
    /// Cache size of indices opened without an explicit one.
    pub cache_size: usize,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            revision: None,
            cache_host: None,
            cache_port: Self::DEFAULT_CACHE_PORT,
            meta_dir: PathBuf::from(Self::DEFAULT_META_DIR),
            new_revision: None,
            novelty_capacity: DEFAULT_CAPACITY,
            cache_size: Self::DEFAULT_CACHE_SIZE,
        }
    }
}

impl IndexConfig {
    /// Default port of the remote page cache.
    pub const DEFAULT_CACHE_PORT: u16 = 11211;
    /// Default manifest directory.
    pub const DEFAULT_META_DIR: &'static str = "./index-meta";
    /// Default per-index cache size.
    pub const DEFAULT_CACHE_SIZE: usize = 1024;

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric variable is set but does not parse, or
    /// if `ONAIR_NOVELTY_CAPACITY` is zero.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let novelty_capacity = parse(&lookup, NOVELTY_CAPACITY)?.unwrap_or(DEFAULT_CAPACITY);
        if novelty_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                name: NOVELTY_CAPACITY.to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            revision: non_empty(REVISION),
            cache_host: non_empty(CACHE_HOST),
            cache_port: parse(&lookup, CACHE_PORT)?.unwrap_or(Self::DEFAULT_CACHE_PORT),
            meta_dir: non_empty(META_DIR)
                .map_or_else(|| PathBuf::from(Self::DEFAULT_META_DIR), PathBuf::from),
            new_revision: parse(&lookup, NEW_REVISION)?,
            novelty_capacity,
            cache_size: parse(&lookup, CACHE_SIZE)?.unwrap_or(Self::DEFAULT_CACHE_SIZE),
        })
    }
}

/// Parse an optional variable, rejecting values that are set but malformed.
fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                name: name.to_string(),
                message: format!("'{value}': {e}"),
            }),
        None => Ok(None),
    }
}
