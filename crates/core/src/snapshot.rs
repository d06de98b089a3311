//! Snapshot: an immutable, path-ordered view of a directory tree

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::hash::Fingerprint;

/// Revision identifier assigned by the store on commit.
///
/// Identifiers start at 1 and increase by one per commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RevisionId(pub u64);

impl RevisionId {
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for RevisionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Metadata for a single regular file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Relative path from the tree root, `/`-separated
    pub path: PathBuf,
    /// File size in bytes
    pub size: u64,
    /// Modification time
    pub modified: SystemTime,
    /// Content fingerprint (BLAKE3)
    pub fingerprint: Fingerprint,
    /// Permission bits (`mode & 0o7777`)
    pub mode: u32,
}

/// A snapshot of a directory tree at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Set once committed to a store
    pub revision: Option<RevisionId>,
    /// When the snapshot was taken
    pub created: SystemTime,
    /// All files, keyed and ordered by relative path
    pub files: BTreeMap<PathBuf, FileRecord>,
}

impl Snapshot {
    /// Create an uncommitted snapshot from records.
    ///
    /// Later records replace earlier ones with the same path.
    #[must_use]
    pub fn from_records(records: impl IntoIterator<Item = FileRecord>) -> Self {
        let files = records.into_iter().map(|r| (r.path.clone(), r)).collect();
        Self {
            revision: None,
            created: SystemTime::now(),
            files,
        }
    }

    /// Create an empty snapshot
    #[must_use]
    pub fn empty() -> Self {
        Self::from_records(Vec::new())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    #[must_use]
    pub fn get(&self, path: &Path) -> Option<&FileRecord> {
        self.files.get(path)
    }

    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    /// Records in path order
    pub fn records(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.values()
    }

    /// Sum of all file sizes
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|r| r.size).sum()
    }

    /// Digest over (path, fingerprint) pairs.
    ///
    /// Two snapshots with the same digest describe the same tree content,
    /// regardless of revision, timestamps or permission bits.
    #[must_use]
    pub fn digest(&self) -> Fingerprint {
        let mut hasher = blake3::Hasher::new();
        for (path, record) in &self.files {
            let path = path.to_string_lossy();
            hasher.update(&(path.len() as u64).to_be_bytes());
            hasher.update(path.as_bytes());
            hasher.update(record.fingerprint.as_bytes());
        }
        Fingerprint::from_raw(*hasher.finalize().as_bytes())
    }

    /// Whether both snapshots hold the same paths with the same content
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.files.len() == other.files.len()
            && self
                .files
                .iter()
                .zip(other.files.iter())
                .all(|((pa, ra), (pb, rb))| pa == pb && ra.fingerprint == rb.fingerprint)
    }
}
