//! Move-aware structural diff between two snapshots
//!
//! `diff(a, b)` describes how to turn `a` into `b`:
//!
//! 1. Paths only in `a` are removal candidates, paths only in `b` are
//!    addition candidates, paths in both are unchanged or modified.
//! 2. Candidates are indexed by fingerprint.
//! 3. For every fingerprint present on both sides, removal and addition
//!    candidates are paired by rank in path order. Each pair is a move.
//! 4. Whatever is left unpaired is a plain removal or addition.
//!
//! Pairing by rank means that with duplicate content the lowest removed
//! path always becomes the move source.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::hash::Fingerprint;
use crate::snapshot::{FileRecord, Snapshot};

/// Whether a move stayed in its directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveKind {
    /// Same parent directory, new file name
    Rename,
    /// Different parent directory
    Relocate,
}

/// Content that changed path but not bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MovedPair {
    pub from: PathBuf,
    pub to: PathBuf,
    pub fingerprint: Fingerprint,
}

impl MovedPair {
    #[must_use]
    pub fn kind(&self) -> MoveKind {
        if self.from.parent() == self.to.parent() {
            MoveKind::Rename
        } else {
            MoveKind::Relocate
        }
    }
}

/// A path whose content changed in place
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Modified {
    pub path: PathBuf,
    pub old: Fingerprint,
    pub new: Fingerprint,
}

/// Difference between two snapshots. All lists are sorted by path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffResult {
    /// Only in the old snapshot, content found nowhere new
    pub removed: Vec<FileRecord>,
    /// Only in the new snapshot, content not moved from anywhere
    pub added: Vec<FileRecord>,
    pub modified: Vec<Modified>,
    /// Sorted by source path
    pub moved: Vec<MovedPair>,
    /// Same path, same content
    pub unchanged: Vec<PathBuf>,
}

impl DiffResult {
    /// No removals, additions, modifications or moves
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
            && self.added.is_empty()
            && self.modified.is_empty()
            && self.moved.is_empty()
    }

    /// Number of changes, not counting unchanged paths
    #[must_use]
    pub fn len(&self) -> usize {
        self.removed.len() + self.added.len() + self.modified.len() + self.moved.len()
    }
}

/// Compute the changes that turn `old` into `new`
#[must_use]
pub fn diff(old: &Snapshot, new: &Snapshot) -> DiffResult {
    let mut result = DiffResult::default();
    let mut removal_candidates: Vec<&FileRecord> = Vec::new();
    let mut addition_candidates: Vec<&FileRecord> = Vec::new();

    for (path, old_record) in &old.files {
        match new.files.get(path) {
            None => removal_candidates.push(old_record),
            Some(new_record) if new_record.fingerprint == old_record.fingerprint => {
                result.unchanged.push(path.clone());
            }
            Some(new_record) => result.modified.push(Modified {
                path: path.clone(),
                old: old_record.fingerprint,
                new: new_record.fingerprint,
            }),
        }
    }
    addition_candidates.extend(
        new.files
            .iter()
            .filter(|(path, _)| !old.files.contains_key(*path))
            .map(|(_, record)| record),
    );

    // Candidates are already in path order, so index lists are too
    let removed_by_fp = index_by_fingerprint(&removal_candidates);
    let added_by_fp = index_by_fingerprint(&addition_candidates);

    let mut removal_paired = vec![false; removal_candidates.len()];
    let mut addition_paired = vec![false; addition_candidates.len()];

    for (fingerprint, removed_idx) in &removed_by_fp {
        let Some(added_idx) = added_by_fp.get(fingerprint) else {
            continue;
        };
        for (&r, &a) in removed_idx.iter().zip(added_idx) {
            removal_paired[r] = true;
            addition_paired[a] = true;
            result.moved.push(MovedPair {
                from: removal_candidates[r].path.clone(),
                to: addition_candidates[a].path.clone(),
                fingerprint: *fingerprint,
            });
        }
    }
    result.moved.sort_by(|a, b| a.from.cmp(&b.from));

    result.removed = removal_candidates
        .iter()
        .zip(&removal_paired)
        .filter(|(_, paired)| !**paired)
        .map(|(record, _)| (*record).clone())
        .collect();
    result.added = addition_candidates
        .iter()
        .zip(&addition_paired)
        .filter(|(_, paired)| !**paired)
        .map(|(record, _)| (*record).clone())
        .collect();

    result
}

fn index_by_fingerprint(records: &[&FileRecord]) -> HashMap<Fingerprint, Vec<usize>> {
    let mut index: HashMap<Fingerprint, Vec<usize>> = HashMap::new();
    for (i, record) in records.iter().enumerate() {
        index.entry(record.fingerprint).or_default().push(i);
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::tests::snapshot;

    fn paths(records: &[FileRecord]) -> Vec<&str> {
        records.iter().map(|r| r.path.to_str().unwrap()).collect()
    }

    #[test]
    fn test_diff_with_itself_is_empty() {
        let snap = snapshot(&[("a.txt", b"a"), ("dir/b.txt", b"b"), ("dup", b"a")]);
        let result = diff(&snap, &snap);
        assert!(result.is_empty());
        assert_eq!(result.len(), 0);
        assert_eq!(result.unchanged.len(), 3);
    }

    #[test]
    fn test_added_removed_modified() {
        let old = snapshot(&[("keep", b"k"), ("gone", b"g"), ("edit", b"v1")]);
        let new = snapshot(&[("keep", b"k"), ("fresh", b"f"), ("edit", b"v2")]);

        let result = diff(&old, &new);
        assert_eq!(paths(&result.removed), vec!["gone"]);
        assert_eq!(paths(&result.added), vec!["fresh"]);
        assert_eq!(
            result.modified,
            vec![Modified {
                path: PathBuf::from("edit"),
                old: Fingerprint::from_bytes(b"v1"),
                new: Fingerprint::from_bytes(b"v2"),
            }]
        );
        assert!(result.moved.is_empty());
        assert_eq!(result.unchanged, vec![PathBuf::from("keep")]);
    }

    #[test]
    fn test_single_rename_is_one_move() {
        let old = snapshot(&[("b.txt", b"hello")]);
        let new = snapshot(&[("a.txt", b"hello")]);

        let result = diff(&old, &new);
        assert_eq!(
            result.moved,
            vec![MovedPair {
                from: PathBuf::from("b.txt"),
                to: PathBuf::from("a.txt"),
                fingerprint: Fingerprint::from_bytes(b"hello"),
            }]
        );
        assert!(result.added.is_empty());
        assert!(result.removed.is_empty());
        assert_eq!(result.moved[0].kind(), MoveKind::Rename);
    }

    #[test]
    fn test_relocate_kind() {
        let old = snapshot(&[("docs/a.md", b"x")]);
        let new = snapshot(&[("archive/a.md", b"x")]);
        let result = diff(&old, &new);
        assert_eq!(result.moved[0].kind(), MoveKind::Relocate);
    }

    #[test]
    fn test_duplicate_content_pairs_lowest_path() {
        let old = snapshot(&[("x2", b"same"), ("x1", b"same")]);
        let new = snapshot(&[("y", b"same")]);

        for _ in 0..5 {
            let result = diff(&old, &new);
            assert_eq!(result.moved.len(), 1);
            assert_eq!(result.moved[0].from, PathBuf::from("x1"));
            assert_eq!(paths(&result.removed), vec!["x2"]);
            assert!(result.added.is_empty());
        }
    }

    #[test]
    fn test_duplicate_pairs_by_rank() {
        let old = snapshot(&[("a1", b"d"), ("a2", b"d"), ("a3", b"d")]);
        let new = snapshot(&[("b2", b"d"), ("b1", b"d")]);

        let result = diff(&old, &new);
        let pairs: Vec<_> = result
            .moved
            .iter()
            .map(|m| (m.from.to_str().unwrap(), m.to.to_str().unwrap()))
            .collect();
        assert_eq!(pairs, vec![("a1", "b1"), ("a2", "b2")]);
        assert_eq!(paths(&result.removed), vec!["a3"]);
    }

    #[test]
    fn test_modified_paths_are_not_move_candidates() {
        // Content of "a" moved to "b" while "a" got new content
        let old = snapshot(&[("a", b"one")]);
        let new = snapshot(&[("a", b"two"), ("b", b"one")]);

        let result = diff(&old, &new);
        assert_eq!(result.modified.len(), 1);
        assert_eq!(paths(&result.added), vec!["b"]);
        assert!(result.moved.is_empty());
    }

    #[test]
    fn test_swap_is_two_modifications() {
        let old = snapshot(&[("a", b"A"), ("b", b"B")]);
        let new = snapshot(&[("a", b"B"), ("b", b"A")]);
        let result = diff(&old, &new);
        assert_eq!(result.modified.len(), 2);
        assert!(result.moved.is_empty());
    }

    #[test]
    fn test_every_record_in_one_category() {
        let old = snapshot(&[("p", b"1"), ("q", b"2"), ("r", b"3"), ("s", b"4")]);
        let new = snapshot(&[("p", b"1"), ("q", b"9"), ("t", b"3"), ("u", b"5")]);

        let result = diff(&old, &new);
        let from_old = result.removed.len()
            + result.modified.len()
            + result.moved.len()
            + result.unchanged.len();
        let from_new = result.added.len()
            + result.modified.len()
            + result.moved.len()
            + result.unchanged.len();
        assert_eq!(from_old, old.len());
        assert_eq!(from_new, new.len());
    }
}
