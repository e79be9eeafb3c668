//! Baseline manifests.
//!
//! A published baseline is described by a JSON document naming the root
//! addresses of every index at one revision:
//!
//! ```json
//! {
//!   "inverted-indices": {
//!     "words": { "inverted": ["12", "34"], "internary": ["56", "78"] }
//!   },
//!   "forward-indices": ["90", "12"],
//!   "revision-int": "17"
//! }
//! ```
//!
//! Addresses are `[high, low]` pairs of decimal strings.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::index::storage::AddressPair;
use crate::storage::{Address, AddressError};

/// File name of a manifest inside its revision directory.
pub const MANIFEST_FILE: &str = "meta";

/// Root addresses of one inverted index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexHeads {
    pub inverted: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internary: Option<Vec<String>>,
}

impl From<AddressPair> for IndexHeads {
    fn from(pair: AddressPair) -> Self {
        Self {
            inverted: pair.data.to_strings(),
            internary: pair.internary.as_ref().map(Address::to_strings),
        }
    }
}

/// Root addresses of every index at one published revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexManifest {
    #[serde(rename = "inverted-indices", default)]
    pub inverted_indices: BTreeMap<String, IndexHeads>,
    #[serde(rename = "forward-indices")]
    pub forward_indices: Vec<String>,
    #[serde(rename = "revision-int")]
    pub revision_int: String,
}

impl IndexManifest {
    #[must_use]
    pub fn new(revision: i32, forward_root: Address) -> Self {
        Self {
            inverted_indices: BTreeMap::new(),
            forward_indices: forward_root.to_strings(),
            revision_int: revision.to_string(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, heads: AddressPair) {
        self.inverted_indices.insert(name.into(), heads.into());
    }

    /// The revision this baseline was published at.
    pub fn revision(&self) -> Result<i32, ManifestError> {
        self.revision_int
            .trim()
            .parse()
            .map_err(|_| ManifestError::InvalidRevision(self.revision_int.clone()))
    }

    pub fn forward_root(&self) -> Result<Address, ManifestError> {
        Ok(Address::from_strings(self.forward_indices.as_slice())?)
    }

    /// Roots of the named index, or `None` if the baseline lacks it.
    pub fn heads(&self, name: &str) -> Result<Option<AddressPair>, ManifestError> {
        let Some(heads) = self.inverted_indices.get(name) else {
            return Ok(None);
        };
        let internary = match &heads.internary {
            Some(parts) => Some(Address::from_strings(parts.as_slice())?),
            None => None,
        };
        Ok(Some(AddressPair {
            data: Address::from_strings(heads.inverted.as_slice())?,
            internary,
        }))
    }

    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, ManifestError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write to `<dir>/<revision>/meta`, creating directories as needed.
    pub fn write_to(&self, dir: &Path, revision: &str) -> Result<PathBuf, ManifestError> {
        let revision_dir = dir.join(revision);
        fs::create_dir_all(&revision_dir)?;
        let path = revision_dir.join(MANIFEST_FILE);
        let file = File::create(&path)?;
        serde_json::to_writer_pretty(file, self)?;
        tracing::info!("wrote manifest for revision {revision} to {}", path.display());
        Ok(path)
    }
}

/// Where baseline manifests come from.
pub trait ManifestSource: Send + Sync {
    fn fetch(&self, revision: &str) -> Result<IndexManifest, ManifestError>;
}

/// Manifests laid out as `<root>/<revision>/meta`.
#[derive(Debug, Clone)]
pub struct DirectoryManifestSource {
    root: PathBuf,
}

impl DirectoryManifestSource {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ManifestSource for DirectoryManifestSource {
    fn fetch(&self, revision: &str) -> Result<IndexManifest, ManifestError> {
        let path = self.root.join(revision.trim()).join(MANIFEST_FILE);
        if !path.exists() {
            return Err(ManifestError::NotFound(path));
        }
        let file = File::open(&path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

/// Errors reading or writing manifests.
#[derive(Debug)]
pub enum ManifestError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Address(AddressError),
    InvalidRevision(String),
    NotFound(PathBuf),
}

impl std::fmt::Display for ManifestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Json(e) => write!(f, "malformed manifest: {e}"),
            Self::Address(e) => write!(f, "bad address in manifest: {e}"),
            Self::InvalidRevision(rev) => write!(f, "invalid revision '{rev}'"),
            Self::NotFound(path) => write!(f, "no manifest at {}", path.display()),
        }
    }
}

impl std::error::Error for ManifestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Json(e) => Some(e),
            Self::Address(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ManifestError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for ManifestError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

impl From<AddressError> for ManifestError {
    fn from(e: AddressError) -> Self {
        Self::Address(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "inverted-indices": {
            "ids": { "inverted": ["1", "2"] },
            "words": { "inverted": ["3", "4"], "internary": ["5", "-6"] }
        },
        "forward-indices": ["7", "8"],
        "revision-int": "41"
    }"#;

    #[test]
    fn test_parse_manifest() {
        let manifest = IndexManifest::from_json(SAMPLE).expect("parse");
        assert_eq!(manifest.revision().expect("revision"), 41);
        assert_eq!(manifest.forward_root().expect("forward"), Address::new(7, 8));
        assert_eq!(
            manifest.heads("ids").expect("heads"),
            Some(AddressPair {
                data: Address::new(1, 2),
                internary: None
            })
        );
        assert_eq!(
            manifest.heads("words").expect("heads"),
            Some(AddressPair {
                data: Address::new(3, 4),
                internary: Some(Address::new(5, -6))
            })
        );
        assert_eq!(manifest.heads("missing").expect("heads"), None);
    }

    #[test]
    fn test_serialized_field_names() {
        let mut manifest = IndexManifest::new(3, Address::new(1, 1));
        manifest.insert(
            "ids",
            AddressPair {
                data: Address::new(2, 2),
                internary: None,
            },
        );
        let json = manifest.to_json().expect("json");
        assert!(json.contains("\"inverted-indices\""));
        assert!(json.contains("\"forward-indices\""));
        assert!(json.contains("\"revision-int\": \"3\""));
        assert!(!json.contains("internary"));
        assert_eq!(IndexManifest::from_json(&json).expect("parse"), manifest);
    }

    #[test]
    fn test_invalid_revision() {
        let mut manifest = IndexManifest::from_json(SAMPLE).expect("parse");
        manifest.revision_int = "tip".to_string();
        assert!(matches!(
            manifest.revision(),
            Err(ManifestError::InvalidRevision(_))
        ));
    }

    #[test]
    fn test_directory_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manifest = IndexManifest::from_json(SAMPLE).expect("parse");
        let path = manifest.write_to(dir.path(), "r41").expect("write");
        assert_eq!(path, dir.path().join("r41").join(MANIFEST_FILE));

        let source = DirectoryManifestSource::new(dir.path());
        assert_eq!(source.fetch("r41").expect("fetch"), manifest);
        assert!(matches!(
            source.fetch("r42"),
            Err(ManifestError::NotFound(_))
        ));
    }
}
