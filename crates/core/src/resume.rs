//! Crash-safe progress log for interrupted syncs
//!
//! Each remote gets a directory under `.dirdiff/resume/`, named after a
//! digest of the remote's description:
//!
//! - `plan.rkyv`: the plan being executed and the digest of the target
//!   snapshot, written atomically before the first operation runs
//! - `progress.log`: one big-endian `u32` operation index per completed
//!   operation, appended and fsynced as operations finish
//!
//! A log is only resumed while the target digest still equals the local
//! head's; the directory is removed once a sync completes.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use rkyv::rancor::Error as RkyvError;
use rkyv::{Archive, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::hash::{FINGERPRINT_LEN, Fingerprint};
use crate::plan::{Operation, PlanSummary, SyncPlan};
use crate::store::{RevisionStore, atomic_write};

const PLAN_FILE: &str = "plan.rkyv";
const PROGRESS_FILE: &str = "progress.log";

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
enum PersistedOp {
    Keep {
        path: String,
    },
    Move {
        src: String,
        dst: String,
    },
    Copy {
        existing: String,
        dst: String,
    },
    Transfer {
        local_path: String,
        dst: String,
        fingerprint: [u8; FINGERPRINT_LEN],
        size: u64,
        mode: u32,
    },
    Delete {
        path: String,
    },
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
struct PersistedPlan {
    remote: String,
    target_digest: [u8; FINGERPRINT_LEN],
    operations: Vec<PersistedOp>,
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl From<&Operation> for PersistedOp {
    fn from(op: &Operation) -> Self {
        match op {
            Operation::Keep { path } => Self::Keep {
                path: path_string(path),
            },
            Operation::Move { src, dst } => Self::Move {
                src: path_string(src),
                dst: path_string(dst),
            },
            Operation::CopyFromExisting { existing, dst } => Self::Copy {
                existing: path_string(existing),
                dst: path_string(dst),
            },
            Operation::Transfer {
                local_path,
                dst,
                fingerprint,
                size,
                mode,
            } => Self::Transfer {
                local_path: path_string(local_path),
                dst: path_string(dst),
                fingerprint: *fingerprint.as_bytes(),
                size: *size,
                mode: *mode,
            },
            Operation::Delete { path } => Self::Delete {
                path: path_string(path),
            },
        }
    }
}

impl From<PersistedOp> for Operation {
    fn from(op: PersistedOp) -> Self {
        match op {
            PersistedOp::Keep { path } => Self::Keep { path: path.into() },
            PersistedOp::Move { src, dst } => Self::Move {
                src: src.into(),
                dst: dst.into(),
            },
            PersistedOp::Copy { existing, dst } => Self::CopyFromExisting {
                existing: existing.into(),
                dst: dst.into(),
            },
            PersistedOp::Transfer {
                local_path,
                dst,
                fingerprint,
                size,
                mode,
            } => Self::Transfer {
                local_path: local_path.into(),
                dst: dst.into(),
                fingerprint: Fingerprint::from_raw(fingerprint),
                size,
                mode,
            },
            PersistedOp::Delete { path } => Self::Delete { path: path.into() },
        }
    }
}

/// Directory name for a remote's resume state
#[must_use]
pub fn resume_key(remote: &str) -> String {
    Fingerprint::from_bytes(remote.as_bytes()).short()
}

/// An in-progress sync persisted next to the revision store
#[derive(Debug)]
pub struct ResumeLog {
    dir: PathBuf,
    plan: SyncPlan,
    target_digest: Fingerprint,
    completed: BTreeSet<usize>,
    progress: File,
}

impl ResumeLog {
    fn dir_for(store: &RevisionStore, remote: &str) -> PathBuf {
        store.resume_dir().join(resume_key(remote))
    }

    /// Start a fresh log for `plan`, replacing any previous one for this remote
    ///
    /// # Errors
    /// Fails if the plan cannot be persisted
    pub fn create(
        store: &RevisionStore,
        remote: &str,
        plan: &SyncPlan,
        target_digest: Fingerprint,
    ) -> Result<Self, SyncError> {
        let dir = Self::dir_for(store, remote);
        remove_dir(&dir)?;
        fs::create_dir_all(&dir)?;

        let persisted = PersistedPlan {
            remote: remote.to_string(),
            target_digest: *target_digest.as_bytes(),
            operations: plan.operations.iter().map(PersistedOp::from).collect(),
        };
        let bytes = rkyv::to_bytes::<RkyvError>(&persisted)
            .map_err(|e| SyncError::ResumeLog(format!("failed to serialize plan: {e}")))?;
        atomic_write(&store.tmp_dir(), &dir.join(PLAN_FILE), &bytes)?;

        let progress = File::create(dir.join(PROGRESS_FILE))?;
        progress.sync_all()?;

        debug!("Created resume log in {}", dir.display());
        Ok(Self {
            dir,
            plan: plan.clone(),
            target_digest,
            completed: BTreeSet::new(),
            progress,
        })
    }

    /// Load the log for `remote`, if one exists.
    ///
    /// A log that cannot be read back is discarded with a warning.
    ///
    /// # Errors
    /// Fails only on I/O errors while discarding or opening the log
    pub fn load(store: &RevisionStore, remote: &str) -> Result<Option<Self>, SyncError> {
        let dir = Self::dir_for(store, remote);
        let bytes = match fs::read(dir.join(PLAN_FILE)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                remove_dir(&dir)?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let persisted = match decode_plan(&bytes) {
            Ok(p) if p.remote == remote => p,
            Ok(p) => {
                warn!("Resume log belongs to {}, discarding", p.remote);
                remove_dir(&dir)?;
                return Ok(None);
            }
            Err(e) => {
                warn!("Discarding unreadable resume log: {e}");
                remove_dir(&dir)?;
                return Ok(None);
            }
        };

        let plan = SyncPlan {
            operations: persisted.operations.into_iter().map(Operation::from).collect(),
        };

        let progress_path = dir.join(PROGRESS_FILE);
        let raw = match fs::read(&progress_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let mut completed = BTreeSet::new();
        // A torn final record is ignored
        for chunk in raw.chunks_exact(4) {
            let index = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as usize;
            if index < plan.len() {
                completed.insert(index);
            } else {
                warn!("Ignoring out-of-range progress record {index}");
            }
        }

        // Rewrite without any torn tail so appends stay aligned
        let mut clean = Vec::with_capacity(completed.len() * 4);
        for &index in &completed {
            clean.extend_from_slice(&index_bytes(index)?);
        }
        atomic_write(&store.tmp_dir(), &progress_path, &clean)?;
        let progress = OpenOptions::new().append(true).open(&progress_path)?;

        debug!(
            "Loaded resume log with {}/{} operations done",
            completed.len(),
            plan.len()
        );
        Ok(Some(Self {
            dir,
            plan,
            target_digest: Fingerprint::from_raw(persisted.target_digest),
            completed,
            progress,
        }))
    }

    /// Remove any log for `remote`; returns whether one existed
    ///
    /// # Errors
    /// Fails if the directory cannot be removed
    pub fn abandon(store: &RevisionStore, remote: &str) -> Result<bool, SyncError> {
        let dir = Self::dir_for(store, remote);
        let existed = dir.exists();
        remove_dir(&dir)?;
        Ok(existed)
    }

    #[must_use]
    pub fn plan(&self) -> &SyncPlan {
        &self.plan
    }

    #[must_use]
    pub fn target_digest(&self) -> Fingerprint {
        self.target_digest
    }

    #[must_use]
    pub fn is_done(&self, index: usize) -> bool {
        self.completed.contains(&index)
    }

    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Counts of the operations not yet done
    #[must_use]
    pub fn pending_summary(&self) -> PlanSummary {
        self.plan
            .operations
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.is_done(*i))
            .map(|(_, op)| op)
            .collect()
    }

    /// Durably mark an operation as done
    ///
    /// # Errors
    /// Fails if the record cannot be written and synced
    pub fn record(&mut self, index: usize) -> Result<(), SyncError> {
        if !self.completed.insert(index) {
            return Ok(());
        }
        self.progress.write_all(&index_bytes(index)?)?;
        self.progress.sync_data()?;
        Ok(())
    }

    /// Delete the log after a completed sync
    ///
    /// # Errors
    /// Fails if the directory cannot be removed
    pub fn finish(self) -> Result<(), SyncError> {
        remove_dir(&self.dir)
    }
}

fn index_bytes(index: usize) -> Result<[u8; 4], SyncError> {
    u32::try_from(index)
        .map(u32::to_be_bytes)
        .map_err(|_| SyncError::ResumeLog(format!("operation index {index} out of range")))
}

fn decode_plan(bytes: &[u8]) -> Result<PersistedPlan, RkyvError> {
    // Archived data must be aligned; a plain Vec gives no such guarantee
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);
    let archived = rkyv::access::<ArchivedPersistedPlan, RkyvError>(&aligned)?;
    rkyv::deserialize::<PersistedPlan, RkyvError>(archived)
}

fn remove_dir(dir: &Path) -> Result<(), SyncError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::plan;
    use crate::snapshot::tests::snapshot;
    use tempfile::TempDir;

    fn sample_plan() -> SyncPlan {
        let local = snapshot(&[("a.txt", b"one"), ("new.bin", b"fresh"), ("same", b"s")]);
        let remote = snapshot(&[("b.txt", b"one"), ("old", b"gone"), ("same", b"s")]);
        plan(&local, &remote).unwrap()
    }

    #[test]
    fn test_create_then_load() {
        let temp = TempDir::new().unwrap();
        let store = RevisionStore::open(temp.path()).unwrap();
        let plan = sample_plan();
        let digest = Fingerprint::from_bytes(b"target");

        let mut log = ResumeLog::create(&store, "ssh://host/tree", &plan, digest).unwrap();
        log.record(0).unwrap();
        log.record(2).unwrap();
        log.record(2).unwrap();
        drop(log);

        let loaded = ResumeLog::load(&store, "ssh://host/tree").unwrap().unwrap();
        assert_eq!(loaded.plan(), &plan);
        assert_eq!(loaded.target_digest(), digest);
        assert!(loaded.is_done(0));
        assert!(!loaded.is_done(1));
        assert!(loaded.is_done(2));
        assert_eq!(loaded.completed_count(), 2);
    }

    #[test]
    fn test_pending_summary_excludes_done() {
        let temp = TempDir::new().unwrap();
        let store = RevisionStore::open(temp.path()).unwrap();
        let plan = sample_plan();
        let transfer = plan
            .operations
            .iter()
            .position(|op| matches!(op, Operation::Transfer { .. }))
            .unwrap();

        let mut log = ResumeLog::create(&store, "local:/x", &plan, Fingerprint::from_bytes(b"t"))
            .unwrap();
        assert_eq!(log.pending_summary(), plan.summary());

        log.record(transfer).unwrap();
        let pending = log.pending_summary();
        assert_eq!(pending.transfers, 0);
        assert_eq!(pending.transfer_bytes, 0);
        assert_eq!(pending.moves, 1);
        assert_eq!(pending.deletes, 1);
    }

    #[test]
    fn test_load_missing_is_none() {
        let temp = TempDir::new().unwrap();
        let store = RevisionStore::open(temp.path()).unwrap();
        assert!(ResumeLog::load(&store, "local:/x").unwrap().is_none());
    }

    #[test]
    fn test_logs_are_per_remote() {
        let temp = TempDir::new().unwrap();
        let store = RevisionStore::open(temp.path()).unwrap();
        let digest = Fingerprint::from_bytes(b"t");
        ResumeLog::create(&store, "remote-a", &sample_plan(), digest).unwrap();

        assert!(ResumeLog::load(&store, "remote-b").unwrap().is_none());
        assert!(ResumeLog::load(&store, "remote-a").unwrap().is_some());
    }

    #[test]
    fn test_torn_progress_record_ignored() {
        let temp = TempDir::new().unwrap();
        let store = RevisionStore::open(temp.path()).unwrap();
        let mut log =
            ResumeLog::create(&store, "r", &sample_plan(), Fingerprint::from_bytes(b"t")).unwrap();
        log.record(1).unwrap();
        drop(log);

        let progress = store
            .resume_dir()
            .join(resume_key("r"))
            .join(PROGRESS_FILE);
        let mut file = OpenOptions::new().append(true).open(&progress).unwrap();
        file.write_all(&[0, 0]).unwrap();
        drop(file);

        let mut loaded = ResumeLog::load(&store, "r").unwrap().unwrap();
        assert_eq!(loaded.completed_count(), 1);
        loaded.record(0).unwrap();
        drop(loaded);

        let reloaded = ResumeLog::load(&store, "r").unwrap().unwrap();
        assert!(reloaded.is_done(0));
        assert!(reloaded.is_done(1));
    }

    #[test]
    fn test_corrupt_plan_discarded() {
        let temp = TempDir::new().unwrap();
        let store = RevisionStore::open(temp.path()).unwrap();
        ResumeLog::create(&store, "r", &sample_plan(), Fingerprint::from_bytes(b"t")).unwrap();

        let plan_path = store.resume_dir().join(resume_key("r")).join(PLAN_FILE);
        fs::write(&plan_path, b"not an archive").unwrap();

        assert!(ResumeLog::load(&store, "r").unwrap().is_none());
        assert!(!plan_path.exists());
    }

    #[test]
    fn test_finish_and_abandon() {
        let temp = TempDir::new().unwrap();
        let store = RevisionStore::open(temp.path()).unwrap();
        let digest = Fingerprint::from_bytes(b"t");

        let log = ResumeLog::create(&store, "r", &sample_plan(), digest).unwrap();
        log.finish().unwrap();
        assert!(ResumeLog::load(&store, "r").unwrap().is_none());

        ResumeLog::create(&store, "r", &sample_plan(), digest).unwrap();
        assert!(ResumeLog::abandon(&store, "r").unwrap());
        assert!(!ResumeLog::abandon(&store, "r").unwrap());
    }
}
