//! Append-only revision history stored next to the tree
//!
//! Layout under `<root>/.dirdiff/`:
//!
//! ```text
//! HEAD                       decimal id of the newest published revision
//! revisions/<id>.snap        encoded snapshots, one per revision
//! tmp/                       scratch space for atomic writes
//! resume/                    resume logs for interrupted syncs
//! ```
//!
//! A commit writes the revision file first and publishes it by rewriting
//! `HEAD`. Both writes go through [`atomic_write`], so a crash leaves the
//! store at the previous head; an unpublished revision file is simply
//! overwritten by the next commit.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::codec::{decode_snapshot, encode_snapshot};
use crate::error::StoreError;
use crate::snapshot::{RevisionId, Snapshot};

/// Store directory name at the tree root
pub const STORE_DIR: &str = ".dirdiff";

const HEAD_FILE: &str = "HEAD";
const REVISIONS_DIR: &str = "revisions";
const TMP_DIR: &str = "tmp";
const RESUME_DIR: &str = "resume";

/// Summary of one stored revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionInfo {
    pub id: RevisionId,
    pub created: SystemTime,
    pub file_count: usize,
    pub total_size: u64,
}

/// Ordered snapshot history for one tree.
///
/// Commits are serialized; reads only take the head lock briefly and may
/// run concurrently with each other and with a commit.
pub struct RevisionStore {
    root: PathBuf,
    dir: PathBuf,
    head: RwLock<Option<RevisionId>>,
    commit_lock: Mutex<()>,
}

impl RevisionStore {
    /// Open (or initialize) the store for the tree at `root`
    ///
    /// # Errors
    /// Returns an error if the store directory cannot be created or `HEAD`
    /// is unreadable
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let dir = root.join(STORE_DIR);

        fs::create_dir_all(dir.join(REVISIONS_DIR))?;
        fs::create_dir_all(dir.join(RESUME_DIR))?;
        clear_dir(&dir.join(TMP_DIR))?;

        let head = read_head(&dir)?;
        if let Some(id) = head
            && !revision_path(&dir, id).is_file()
        {
            return Err(StoreError::Corruption {
                path: dir.join(HEAD_FILE),
                reason: format!("HEAD names {id} but its file is missing"),
            });
        }

        debug!(
            "Opened store at {} (head: {})",
            dir.display(),
            head.map_or_else(|| "none".to_string(), |id| id.to_string())
        );

        Ok(Self {
            root,
            dir,
            head: RwLock::new(head),
            commit_lock: Mutex::new(()),
        })
    }

    /// Tree root this store belongs to
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The `.dirdiff` directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn tmp_dir(&self) -> PathBuf {
        self.dir.join(TMP_DIR)
    }

    pub(crate) fn resume_dir(&self) -> PathBuf {
        self.dir.join(RESUME_DIR)
    }

    #[must_use]
    pub fn head_id(&self) -> Option<RevisionId> {
        *self.head.read()
    }

    /// Persist a snapshot as the new head
    ///
    /// # Errors
    /// Returns an error if writing fails; the previous head stays valid
    pub fn commit(&self, snapshot: &Snapshot) -> Result<RevisionId, StoreError> {
        let _guard = self.commit_lock.lock();

        let id = self.head_id().map_or(RevisionId(1), RevisionId::next);
        let mut snapshot = snapshot.clone();
        snapshot.revision = Some(id);

        let tmp = self.tmp_dir();
        atomic_write(&tmp, &revision_path(&self.dir, id), &encode_snapshot(&snapshot))?;
        atomic_write(&tmp, &self.dir.join(HEAD_FILE), format!("{}\n", id.get()).as_bytes())?;

        *self.head.write() = Some(id);
        info!("Committed {id} ({} files)", snapshot.len());
        Ok(id)
    }

    /// Commit only if the snapshot differs from head.
    ///
    /// Returns the head id and whether a new revision was written.
    ///
    /// # Errors
    /// Returns an error if head cannot be read or the commit fails
    pub fn commit_if_changed(&self, snapshot: &Snapshot) -> Result<(RevisionId, bool), StoreError> {
        if self.head_id().is_some() {
            let head = self.head()?;
            if head.files == snapshot.files
                && let Some(id) = head.revision
            {
                debug!("Tree unchanged since {id}");
                return Ok((id, false));
            }
        }
        Ok((self.commit(snapshot)?, true))
    }

    /// Load a revision
    ///
    /// # Errors
    /// `NotFound` for ids that were never published, `Corruption` if the
    /// stored bytes fail validation
    pub fn get(&self, id: RevisionId) -> Result<Snapshot, StoreError> {
        match self.head_id() {
            Some(head) if id.get() >= 1 && id <= head => {}
            _ => return Err(StoreError::NotFound(id)),
        }

        let path = revision_path(&self.dir, id);
        let bytes = fs::read(&path).map_err(|e| StoreError::Corruption {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let snapshot = decode_snapshot(&bytes).map_err(|e| StoreError::Corruption {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        if snapshot.revision != Some(id) {
            return Err(StoreError::Corruption {
                path,
                reason: format!("file holds {:?}, expected {id}", snapshot.revision),
            });
        }
        Ok(snapshot)
    }

    /// Load the newest revision
    ///
    /// # Errors
    /// `Empty` if nothing has been committed
    pub fn head(&self) -> Result<Snapshot, StoreError> {
        let id = self.head_id().ok_or(StoreError::Empty)?;
        self.get(id)
    }

    /// Summaries for every published revision, oldest first.
    ///
    /// A corrupted revision yields an error entry without hiding the rest.
    #[must_use]
    pub fn list(&self) -> Vec<Result<RevisionInfo, StoreError>> {
        let Some(head) = self.head_id() else {
            return Vec::new();
        };
        (1..=head.get())
            .map(|n| {
                self.get(RevisionId(n)).map(|snapshot| RevisionInfo {
                    id: RevisionId(n),
                    created: snapshot.created,
                    file_count: snapshot.len(),
                    total_size: snapshot.total_size(),
                })
            })
            .collect()
    }

    /// Resolve `N`, `rN`, `HEAD` or `HEAD~K` to a published revision id
    ///
    /// # Errors
    /// `InvalidSpec` for unparseable input, `Empty`/`NotFound` when the
    /// revision does not exist
    pub fn resolve(&self, spec: &str) -> Result<RevisionId, StoreError> {
        let spec = spec.trim();
        let invalid = || StoreError::InvalidSpec(spec.to_string());

        let id = if let Some(rest) = spec.strip_prefix("HEAD") {
            let head = self.head_id().ok_or(StoreError::Empty)?.get();
            let back = match rest {
                "" => 0,
                _ => rest
                    .strip_prefix('~')
                    .and_then(|n| n.parse::<u64>().ok())
                    .ok_or_else(invalid)?,
            };
            RevisionId(head.saturating_sub(back))
        } else {
            let digits = spec.strip_prefix('r').unwrap_or(spec);
            RevisionId(digits.parse::<u64>().map_err(|_| invalid())?)
        };

        match self.head_id() {
            Some(head) if id.get() >= 1 && id <= head => Ok(id),
            _ => Err(StoreError::NotFound(id)),
        }
    }

    /// Release the store, discarding scratch files
    ///
    /// # Errors
    /// Returns an error if the scratch directory cannot be cleaned
    pub fn close(self) -> Result<(), StoreError> {
        let _guard = self.commit_lock.lock();
        clear_dir(&self.tmp_dir())?;
        debug!("Closed store at {}", self.dir.display());
        Ok(())
    }
}

fn revision_path(dir: &Path, id: RevisionId) -> PathBuf {
    dir.join(REVISIONS_DIR).join(format!("{:020}.snap", id.get()))
}

fn read_head(dir: &Path) -> Result<Option<RevisionId>, StoreError> {
    let path = dir.join(HEAD_FILE);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match content.trim().parse::<u64>() {
        Ok(0) | Err(_) => Err(StoreError::Corruption {
            path,
            reason: format!("invalid HEAD contents {:?}", content.trim()),
        }),
        Ok(n) => Ok(Some(RevisionId(n))),
    }
}

fn clear_dir(dir: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not clear {}: {e}", dir.display()),
    }
    fs::create_dir_all(dir)
}

/// Write `data` to `target` atomically.
///
/// Data goes to a uniquely named file in `tmp_dir`, is fsynced, renamed over
/// the target, and the target's directory is fsynced.
///
/// # Errors
/// Returns an error if any step fails; the target is then untouched
pub fn atomic_write(tmp_dir: &Path, target: &Path, data: &[u8]) -> std::io::Result<()> {
    fs::create_dir_all(tmp_dir)?;
    let temp_path = tmp_dir.join(uuid::Uuid::new_v4().to_string());

    let mut temp_file = fs::File::create(&temp_path)?;
    temp_file.write_all(data)?;
    temp_file.sync_all()?;
    drop(temp_file);

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    if let Err(e) = fs::rename(&temp_path, target) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    if let Some(parent) = target.parent()
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::tests::snapshot;
    use tempfile::TempDir;

    #[test]
    fn test_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = RevisionStore::open(dir.path()).unwrap();

        assert_eq!(store.head_id(), None);
        assert!(matches!(store.head(), Err(StoreError::Empty)));
        assert!(matches!(
            store.get(RevisionId(1)),
            Err(StoreError::NotFound(RevisionId(1)))
        ));
        assert!(store.list().is_empty());
    }

    #[test]
    fn test_commit_and_get() {
        let dir = TempDir::new().unwrap();
        let store = RevisionStore::open(dir.path()).unwrap();

        let first = snapshot(&[("a.txt", b"one")]);
        let second = snapshot(&[("a.txt", b"one"), ("b.txt", b"two")]);

        assert_eq!(store.commit(&first).unwrap(), RevisionId(1));
        assert_eq!(store.commit(&second).unwrap(), RevisionId(2));

        let loaded = store.get(RevisionId(1)).unwrap();
        assert_eq!(loaded.revision, Some(RevisionId(1)));
        assert_eq!(loaded.files, first.files);
        assert_eq!(store.head().unwrap().files, second.files);
        assert!(matches!(
            store.get(RevisionId(3)),
            Err(StoreError::NotFound(RevisionId(3)))
        ));
    }

    #[test]
    fn test_reopen_sees_history() {
        let dir = TempDir::new().unwrap();
        {
            let store = RevisionStore::open(dir.path()).unwrap();
            store.commit(&snapshot(&[("a", b"1")])).unwrap();
            store.commit(&snapshot(&[("b", b"2")])).unwrap();
            store.close().unwrap();
        }

        let store = RevisionStore::open(dir.path()).unwrap();
        assert_eq!(store.head_id(), Some(RevisionId(2)));
        let infos: Vec<_> = store.list().into_iter().map(Result::unwrap).collect();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[1].file_count, 1);
    }

    #[test]
    fn test_unpublished_revision_is_invisible() {
        let dir = TempDir::new().unwrap();
        let store = RevisionStore::open(dir.path()).unwrap();
        store.commit(&snapshot(&[("a", b"1")])).unwrap();

        // Simulate a crash after writing revision 2 but before HEAD moved
        let mut orphan = snapshot(&[("zzz", b"orphan")]);
        orphan.revision = Some(RevisionId(2));
        fs::write(
            revision_path(store.dir(), RevisionId(2)),
            encode_snapshot(&orphan),
        )
        .unwrap();
        drop(store);

        let store = RevisionStore::open(dir.path()).unwrap();
        assert_eq!(store.head_id(), Some(RevisionId(1)));
        assert!(store.get(RevisionId(2)).is_err());

        let id = store.commit(&snapshot(&[("b", b"2")])).unwrap();
        assert_eq!(id, RevisionId(2));
        assert!(store.get(id).unwrap().contains(Path::new("b")));
    }

    #[test]
    fn test_corruption_is_scoped_to_one_revision() {
        let dir = TempDir::new().unwrap();
        let store = RevisionStore::open(dir.path()).unwrap();
        store.commit(&snapshot(&[("a", b"1")])).unwrap();
        store.commit(&snapshot(&[("b", b"2")])).unwrap();

        let path = revision_path(store.dir(), RevisionId(1));
        let mut bytes = fs::read(&path).unwrap();
        bytes[10] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            store.get(RevisionId(1)),
            Err(StoreError::Corruption { .. })
        ));
        assert!(store.get(RevisionId(2)).is_ok());

        let listed = store.list();
        assert!(listed[0].is_err());
        assert!(listed[1].is_ok());
    }

    #[test]
    fn test_garbage_head_is_corruption() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(STORE_DIR)).unwrap();
        fs::write(dir.path().join(STORE_DIR).join(HEAD_FILE), "banana").unwrap();

        assert!(matches!(
            RevisionStore::open(dir.path()),
            Err(StoreError::Corruption { .. })
        ));
    }

    #[test]
    fn test_commit_if_changed() {
        let dir = TempDir::new().unwrap();
        let store = RevisionStore::open(dir.path()).unwrap();
        let snap = snapshot(&[("a", b"1")]);

        assert_eq!(store.commit_if_changed(&snap).unwrap(), (RevisionId(1), true));
        assert_eq!(store.commit_if_changed(&snap).unwrap(), (RevisionId(1), false));

        let changed = snapshot(&[("a", b"2")]);
        assert_eq!(
            store.commit_if_changed(&changed).unwrap(),
            (RevisionId(2), true)
        );
    }

    #[test]
    fn test_resolve() {
        let dir = TempDir::new().unwrap();
        let store = RevisionStore::open(dir.path()).unwrap();
        assert!(matches!(store.resolve("HEAD"), Err(StoreError::Empty)));

        for n in 0..3u8 {
            store.commit(&snapshot(&[("f", &[n])])).unwrap();
        }

        assert_eq!(store.resolve("HEAD").unwrap(), RevisionId(3));
        assert_eq!(store.resolve("HEAD~1").unwrap(), RevisionId(2));
        assert_eq!(store.resolve("r1").unwrap(), RevisionId(1));
        assert_eq!(store.resolve(" 2 ").unwrap(), RevisionId(2));
        assert!(matches!(store.resolve("HEAD~3"), Err(StoreError::NotFound(_))));
        assert!(matches!(store.resolve("7"), Err(StoreError::NotFound(_))));
        assert!(matches!(store.resolve("HEAD^"), Err(StoreError::InvalidSpec(_))));
        assert!(matches!(store.resolve("abc"), Err(StoreError::InvalidSpec(_))));
    }

    #[test]
    fn test_concurrent_commits_get_distinct_ids() {
        let dir = TempDir::new().unwrap();
        let store = RevisionStore::open(dir.path()).unwrap();

        let mut ids: Vec<RevisionId> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8u8)
                .map(|n| {
                    let store = &store;
                    s.spawn(move || store.commit(&snapshot(&[("f", &[n])])).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        ids.sort();

        assert_eq!(ids, (1..=8).map(RevisionId).collect::<Vec<_>>());
        assert_eq!(store.head_id(), Some(RevisionId(8)));
    }

    #[test]
    fn test_atomic_write_replaces_target() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("nested/file");
        atomic_write(&dir.path().join("tmp"), &target, b"first").unwrap();
        atomic_write(&dir.path().join("tmp"), &target, b"second").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"second");
        assert_eq!(fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }
}
