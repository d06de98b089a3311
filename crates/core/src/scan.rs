//! Directory scanning into snapshots
//!
//! Traversal is an explicit worklist of pending directories. Fingerprinting
//! runs on a bounded rayon pool, and the results are merged into a single
//! path-ordered [`Snapshot`] at the end.

use std::fmt;
use std::fs::Metadata;
use std::path::{Path, PathBuf};

use color_eyre::Result;
use color_eyre::eyre::{WrapErr as _, bail};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::config::DirdiffConfig;
use crate::hash::Fingerprint;
use crate::snapshot::{FileRecord, Snapshot};
use crate::store::STORE_DIR;

/// What to include in a scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOptions {
    /// Scan dot-files and dot-directories
    pub include_hidden: bool,
    /// Extra gitignore-style patterns
    pub ignore: Vec<String>,
    /// Hashing threads; `None` uses available parallelism
    pub hash_workers: Option<usize>,
}

impl ScanOptions {
    #[must_use]
    pub fn from_config(config: &DirdiffConfig) -> Self {
        Self {
            include_hidden: config.include_hidden,
            ignore: config.ignore.clone(),
            hash_workers: config.hash_workers,
        }
    }
}

/// Why an entry was left out of a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Symlink,
    SpecialFile,
    NonUtf8Name,
    ChangedDuringScan,
    Unreadable(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Symlink => f.write_str("symlink"),
            Self::SpecialFile => f.write_str("special file"),
            Self::NonUtf8Name => f.write_str("non-UTF-8 name"),
            Self::ChangedDuringScan => f.write_str("changed during scan"),
            Self::Unreadable(e) => write!(f, "unreadable: {e}"),
        }
    }
}

/// An entry that was seen but not recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub path: PathBuf,
    pub reason: SkipReason,
}

/// Result of a scan: the snapshot plus everything that was skipped
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub snapshot: Snapshot,
    /// Skipped entries in path order
    pub skipped: Vec<SkippedEntry>,
}

/// Scanner for a directory tree
pub struct Scanner {
    root: PathBuf,
    options: ScanOptions,
}

impl Scanner {
    /// Create a scanner with default options
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            options: ScanOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    /// Include dot-entries
    #[must_use]
    pub fn include_hidden(mut self, include: bool) -> Self {
        self.options.include_hidden = include;
        self
    }

    /// Add an extra ignore pattern
    #[must_use]
    pub fn ignore(mut self, pattern: impl Into<String>) -> Self {
        self.options.ignore.push(pattern.into());
        self
    }

    #[must_use]
    pub fn hash_workers(mut self, workers: usize) -> Self {
        self.options.hash_workers = Some(workers.max(1));
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Root `.gitignore` plus configured patterns
    fn ignore_matcher(&self) -> Result<Gitignore> {
        let mut builder = GitignoreBuilder::new(&self.root);

        let gitignore = self.root.join(".gitignore");
        if gitignore.is_file()
            && let Some(err) = builder.add(&gitignore)
        {
            warn!("Ignoring malformed lines in {}: {err}", gitignore.display());
        }

        for pattern in &self.options.ignore {
            builder
                .add_line(None, pattern)
                .wrap_err_with(|| format!("invalid ignore pattern `{pattern}`"))?;
        }

        Ok(builder.build()?)
    }

    /// Scan the tree
    ///
    /// Per-entry failures are reported in [`ScanOutcome::skipped`]; only an
    /// unreadable root aborts the scan.
    ///
    /// # Errors
    /// Returns an error if the root is not a readable directory or the
    /// ignore patterns are invalid
    pub fn scan(&self) -> Result<ScanOutcome> {
        let root_meta = std::fs::metadata(&self.root)
            .wrap_err_with(|| format!("cannot read {}", self.root.display()))?;
        if !root_meta.is_dir() {
            bail!("{} is not a directory", self.root.display());
        }

        let matcher = self.ignore_matcher()?;
        let (candidates, mut skipped) = self.walk(&matcher)?;
        debug!(
            "Walked {}: {} files to hash, {} skipped",
            self.root.display(),
            candidates.len(),
            skipped.len()
        );

        let mut pool = rayon::ThreadPoolBuilder::new();
        if let Some(workers) = self.options.hash_workers {
            pool = pool.num_threads(workers.max(1));
        }
        let pool = pool.build()?;

        let hashed: Vec<_> = pool.install(|| {
            candidates
                .par_iter()
                .map(|rel| hash_entry(&self.root, rel))
                .collect()
        });

        let mut records = Vec::with_capacity(hashed.len());
        for result in hashed {
            match result {
                Ok(record) => records.push(record),
                Err(entry) => skipped.push(entry),
            }
        }
        skipped.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(ScanOutcome {
            snapshot: Snapshot::from_records(records),
            skipped,
        })
    }

    /// Collect regular files to hash, iteratively
    fn walk(&self, matcher: &Gitignore) -> Result<(Vec<PathBuf>, Vec<SkippedEntry>)> {
        let mut files = Vec::new();
        let mut skipped = Vec::new();
        let mut pending = vec![PathBuf::new()];

        while let Some(rel_dir) = pending.pop() {
            let dir = self.root.join(&rel_dir);
            let read_dir = match std::fs::read_dir(&dir) {
                Ok(rd) => rd,
                Err(e) if rel_dir.as_os_str().is_empty() => {
                    return Err(e).wrap_err_with(|| format!("cannot list {}", dir.display()));
                }
                Err(e) => {
                    skipped.push(SkippedEntry {
                        path: rel_dir,
                        reason: SkipReason::Unreadable(e.to_string()),
                    });
                    continue;
                }
            };

            for entry in read_dir {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        skipped.push(SkippedEntry {
                            path: rel_dir.clone(),
                            reason: SkipReason::Unreadable(e.to_string()),
                        });
                        continue;
                    }
                };

                let file_name = entry.file_name();
                let rel_path = rel_dir.join(&file_name);
                let Some(name) = file_name.to_str() else {
                    skipped.push(SkippedEntry {
                        path: rel_path,
                        reason: SkipReason::NonUtf8Name,
                    });
                    continue;
                };

                if name == STORE_DIR || name == ".git" {
                    continue;
                }
                if !self.options.include_hidden && name.starts_with('.') {
                    continue;
                }

                let file_type = match entry.file_type() {
                    Ok(ft) => ft,
                    Err(e) => {
                        skipped.push(SkippedEntry {
                            path: rel_path,
                            reason: SkipReason::Unreadable(e.to_string()),
                        });
                        continue;
                    }
                };

                if matcher.matched(&rel_path, file_type.is_dir()).is_ignore() {
                    continue;
                }

                if file_type.is_dir() {
                    pending.push(rel_path);
                } else if file_type.is_file() {
                    files.push(rel_path);
                } else if file_type.is_symlink() {
                    skipped.push(SkippedEntry {
                        path: rel_path,
                        reason: SkipReason::Symlink,
                    });
                } else {
                    skipped.push(SkippedEntry {
                        path: rel_path,
                        reason: SkipReason::SpecialFile,
                    });
                }
            }
        }

        Ok((files, skipped))
    }
}

/// Fingerprint one file, re-reading once if it changes underneath us
fn hash_entry(root: &Path, rel: &Path) -> std::result::Result<FileRecord, SkippedEntry> {
    let full = root.join(rel);
    let unreadable = |e: std::io::Error| SkippedEntry {
        path: rel.to_path_buf(),
        reason: SkipReason::Unreadable(e.to_string()),
    };

    for _ in 0..2 {
        let before = std::fs::symlink_metadata(&full).map_err(unreadable)?;
        let fingerprint = Fingerprint::from_file(&full).map_err(unreadable)?;
        let after = std::fs::symlink_metadata(&full).map_err(unreadable)?;

        if before.len() == after.len() && before.modified().ok() == after.modified().ok() {
            return Ok(FileRecord {
                path: rel.to_path_buf(),
                size: after.len(),
                modified: after.modified().map_err(unreadable)?,
                fingerprint,
                mode: permission_bits(&after),
            });
        }
        debug!("{} changed while hashing, retrying", rel.display());
    }

    Err(SkippedEntry {
        path: rel.to_path_buf(),
        reason: SkipReason::ChangedDuringScan,
    })
}

#[cfg(unix)]
fn permission_bits(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(metadata: &Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn paths(outcome: &ScanOutcome) -> Vec<PathBuf> {
        outcome.snapshot.files.keys().cloned().collect()
    }

    #[test]
    fn test_scan_simple_directory() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("file1.txt"), "hello").unwrap();
        fs::write(dir.path().join("file2.txt"), "world").unwrap();

        let outcome = Scanner::new(dir.path()).scan().unwrap();

        assert_eq!(
            paths(&outcome),
            vec![PathBuf::from("file1.txt"), PathBuf::from("file2.txt")]
        );
        let record = outcome.snapshot.get(Path::new("file1.txt")).unwrap();
        assert_eq!(record.size, 5);
        assert_eq!(record.fingerprint, Fingerprint::from_bytes(b"hello"));
        assert!(outcome.skipped.is_empty());
    }

    #[test]
    fn test_scan_nested_directories() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sub/dir")).unwrap();
        fs::write(dir.path().join("root.txt"), "root").unwrap();
        fs::write(dir.path().join("sub/nested.txt"), "nested").unwrap();
        fs::write(dir.path().join("sub/dir/deep.txt"), "deep").unwrap();

        let outcome = Scanner::new(dir.path()).hash_workers(2).scan().unwrap();

        assert_eq!(outcome.snapshot.len(), 3);
        assert!(outcome.snapshot.contains(Path::new("sub/dir/deep.txt")));
    }

    #[test]
    fn test_hidden_entries_skipped_by_default() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".env"), "SECRET=1").unwrap();
        fs::create_dir(dir.path().join(".cache")).unwrap();
        fs::write(dir.path().join(".cache/blob"), "x").unwrap();
        fs::write(dir.path().join("visible.txt"), "v").unwrap();

        let outcome = Scanner::new(dir.path()).scan().unwrap();
        assert_eq!(paths(&outcome), vec![PathBuf::from("visible.txt")]);

        let outcome = Scanner::new(dir.path()).include_hidden(true).scan().unwrap();
        assert_eq!(
            paths(&outcome),
            vec![
                PathBuf::from(".cache/blob"),
                PathBuf::from(".env"),
                PathBuf::from("visible.txt")
            ]
        );
    }

    #[test]
    fn test_store_and_git_dirs_never_scanned() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(STORE_DIR).join("revisions")).unwrap();
        fs::write(dir.path().join(STORE_DIR).join("HEAD"), "1").unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/config"), "").unwrap();
        fs::write(dir.path().join("keep.txt"), "keep").unwrap();

        let outcome = Scanner::new(dir.path()).include_hidden(true).scan().unwrap();
        assert_eq!(paths(&outcome), vec![PathBuf::from("keep.txt")]);
    }

    #[test]
    fn test_scan_respects_gitignore_and_patterns() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".gitignore"), "*.log\n").unwrap();
        fs::write(dir.path().join("keep.txt"), "keep").unwrap();
        fs::write(dir.path().join("drop.log"), "drop").unwrap();
        fs::create_dir(dir.path().join("target")).unwrap();
        fs::write(dir.path().join("target/out.bin"), "bin").unwrap();

        let outcome = Scanner::new(dir.path()).ignore("target/").scan().unwrap();
        assert_eq!(paths(&outcome), vec![PathBuf::from("keep.txt")]);
    }

    #[test]
    fn test_invalid_pattern_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(Scanner::new(dir.path()).ignore("a[").scan().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_reported_not_followed() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("real.txt"), "real").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("link.txt"))
            .unwrap();

        let outcome = Scanner::new(dir.path()).scan().unwrap();
        assert_eq!(paths(&outcome), vec![PathBuf::from("real.txt")]);
        assert_eq!(
            outcome.skipped,
            vec![SkippedEntry {
                path: PathBuf::from("link.txt"),
                reason: SkipReason::Symlink,
            }]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_permission_bits_recorded() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let script = dir.path().join("run.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let outcome = Scanner::new(dir.path()).scan().unwrap();
        assert_eq!(outcome.snapshot.get(Path::new("run.sh")).unwrap().mode, 0o755);
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(Scanner::new(dir.path().join("nope")).scan().is_err());
    }

    #[test]
    fn test_mtime_recorded() {
        use std::time::{Duration, UNIX_EPOCH};

        let dir = TempDir::new().unwrap();
        let file = dir.path().join("old.txt");
        fs::write(&file, "old").unwrap();
        let mtime = UNIX_EPOCH + Duration::from_secs(1_704_067_200);
        filetime::set_file_mtime(&file, filetime::FileTime::from_system_time(mtime)).unwrap();

        let outcome = Scanner::new(dir.path()).scan().unwrap();
        assert_eq!(outcome.snapshot.get(Path::new("old.txt")).unwrap().modified, mtime);
    }
}
