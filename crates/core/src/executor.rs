//! Plan execution against a transport
//!
//! Operations are grouped into waves. An operation joins the first wave
//! after every earlier operation that touches the same path, or a parent or
//! child of it, so any order inside a wave is equivalent to the plan's
//! sequential order. Waves run one after another; inside a wave up to
//! `concurrency` operations are in flight.
//!
//! A `Transfer` holds the whole file in memory while it is in flight, and
//! is refused up front when the file exceeds the transport's write limit.
//!
//! Each completed operation is recorded in the resume log before the next
//! wave starts. Transient transport failures are retried with exponential
//! backoff; once retries run out the executor finishes the current wave
//! and stops.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::error::{SyncError, TransportError};
use crate::hash::Fingerprint;
use crate::plan::{Operation, SyncPlan};
use crate::resume::ResumeLog;
use crate::scan::ScanOptions;
use crate::snapshot::Snapshot;
use crate::transport::Transport;

/// Called after each operation completes with the operation and the bytes
/// it sent
pub type ProgressFn = Arc<dyn Fn(&Operation, u64) + Send + Sync>;

/// Execution tuning
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Operations in flight at once
    pub concurrency: usize,
    pub retry: RetryConfig,
    /// Rules for the verification scan; must match the local scan
    pub scan: ScanOptions,
    /// Checked before each operation starts
    pub cancel: CancellationToken,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry: RetryConfig::default(),
            scan: ScanOptions::default(),
            cancel: CancellationToken::new(),
        }
    }
}

/// The operation that stopped execution
#[derive(Debug)]
pub struct OperationFailure {
    pub index: usize,
    pub operation: Operation,
    pub error: SyncError,
}

/// Differences between the target snapshot and the remote after a sync
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    /// In the target, absent remotely
    pub missing: Vec<PathBuf>,
    /// Present remotely, not in the target
    pub unexpected: Vec<PathBuf>,
    /// Present on both sides with different content
    pub mismatched: Vec<PathBuf>,
}

impl VerificationReport {
    /// Compare the remote snapshot against the target
    #[must_use]
    pub fn compare(target: &Snapshot, remote: &Snapshot) -> Self {
        let mut report = Self::default();
        for (path, record) in &target.files {
            match remote.get(path) {
                None => report.missing.push(path.clone()),
                Some(actual) if actual.fingerprint != record.fingerprint => {
                    report.mismatched.push(path.clone());
                }
                Some(_) => {}
            }
        }
        report.unexpected = remote
            .files
            .keys()
            .filter(|path| !target.contains(path))
            .cloned()
            .collect();
        report
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }
}

/// What an execution achieved
#[derive(Debug, Default)]
pub struct ExecutionOutcome {
    /// Operations done, including `Keep`s and ones done by an earlier attempt
    pub completed: usize,
    /// Indices of operations not yet done, in plan order
    pub remaining: Vec<usize>,
    pub failure: Option<OperationFailure>,
    /// Bytes sent by `Transfer`s in this run
    pub bytes_transferred: u64,
    pub cancelled: bool,
    /// Set once every operation is done
    pub verification: Option<VerificationReport>,
}

impl ExecutionOutcome {
    /// All operations done and the remote verified equal to the target
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.remaining.is_empty()
            && self.failure.is_none()
            && !self.cancelled
            && self
                .verification
                .as_ref()
                .is_some_and(VerificationReport::is_clean)
    }
}

/// Group operation indices into waves of mutually independent operations
#[must_use]
pub fn waves(plan: &SyncPlan) -> Vec<Vec<usize>> {
    // First wave free of conflicts with ops touching exactly this path
    let mut at: HashMap<&Path, usize> = HashMap::new();
    // ... and with ops touching anything beneath this directory
    let mut beneath: HashMap<&Path, usize> = HashMap::new();
    let mut waves: Vec<Vec<usize>> = Vec::new();

    for (index, op) in plan.operations.iter().enumerate() {
        if op.is_keep() {
            continue;
        }
        let paths = op.remote_paths();

        let mut wave = 0;
        for path in &paths {
            for ancestor in path.ancestors() {
                if let Some(&free) = at.get(ancestor) {
                    wave = wave.max(free);
                }
            }
            if let Some(&free) = beneath.get(path) {
                wave = wave.max(free);
            }
        }

        for path in paths {
            at.insert(path, wave + 1);
            for ancestor in path.ancestors().skip(1) {
                let free = beneath.entry(ancestor).or_default();
                *free = (*free).max(wave + 1);
            }
        }

        if waves.len() <= wave {
            waves.resize_with(wave + 1, Vec::new);
        }
        waves[wave].push(index);
    }

    waves
}

/// Retry `f` on transient transport errors with exponential backoff
async fn with_retry<T, F, Fut>(retry: &RetryConfig, what: &str, mut f: F) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let attempts = retry.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(operation = what, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() && attempt + 1 < attempts => {
                let delay = retry.delay_for(attempt);
                warn!(
                    operation = what,
                    attempt,
                    ?delay,
                    error = %err,
                    "Transient error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Runs a plan against a transport
pub struct SyncExecutor<'a> {
    transport: &'a dyn Transport,
    local_root: PathBuf,
    options: ExecutorOptions,
    progress: Option<ProgressFn>,
}

impl<'a> SyncExecutor<'a> {
    /// `local_root` is where `Transfer` sources are read from
    pub fn new(transport: &'a dyn Transport, local_root: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            local_root: local_root.into(),
            options: ExecutorOptions::default(),
            progress: None,
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Execute the plan held by `log`, skipping operations it records as
    /// done, then verify the remote against `target`
    ///
    /// # Errors
    /// Fails if progress cannot be recorded or the verification scan fails.
    /// Operation failures are reported in the outcome instead.
    pub async fn execute(
        &self,
        log: &mut ResumeLog,
        target: &Snapshot,
    ) -> Result<ExecutionOutcome, SyncError> {
        let plan = log.plan().clone();
        let mut outcome = ExecutionOutcome::default();
        let concurrency = self.options.concurrency.max(1);

        for (number, wave) in waves(&plan).into_iter().enumerate() {
            let pending: Vec<usize> = wave.into_iter().filter(|i| !log.is_done(*i)).collect();
            if pending.is_empty() {
                continue;
            }
            if self.options.cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            debug!("Wave {number}: {} operations", pending.len());

            let mut results = stream::iter(pending)
                .map(|index| self.run(index, &plan.operations[index]))
                .buffer_unordered(concurrency);

            while let Some((index, result)) = results.next().await {
                let operation = &plan.operations[index];
                match result {
                    Ok(Some(bytes)) => {
                        log.record(index)?;
                        outcome.bytes_transferred += bytes;
                        if let Some(progress) = &self.progress {
                            progress(operation, bytes);
                        }
                    }
                    Ok(None) => outcome.cancelled = true,
                    Err(error) => {
                        warn!("{operation} failed: {error}");
                        if outcome.failure.is_none() {
                            outcome.failure = Some(OperationFailure {
                                index,
                                operation: operation.clone(),
                                error,
                            });
                        }
                    }
                }
            }

            if outcome.failure.is_some() || outcome.cancelled {
                break;
            }
        }

        outcome.remaining = (0..plan.len())
            .filter(|&i| !plan.operations[i].is_keep() && !log.is_done(i))
            .collect();
        outcome.completed = plan.len() - outcome.remaining.len();

        if outcome.remaining.is_empty() {
            let scan = &self.options.scan;
            let remote = with_retry(&self.options.retry, "verify", || {
                self.transport.list_snapshot(scan)
            })
            .await?;
            let report = VerificationReport::compare(target, &remote);
            if !report.is_clean() {
                warn!(
                    "Verification found {} missing, {} unexpected, {} mismatched",
                    report.missing.len(),
                    report.unexpected.len(),
                    report.mismatched.len()
                );
            }
            outcome.verification = Some(report);
        }

        Ok(outcome)
    }

    /// Apply one operation; `None` means it was skipped for cancellation
    async fn run(&self, index: usize, op: &Operation) -> (usize, Result<Option<u64>, SyncError>) {
        if self.options.cancel.is_cancelled() {
            return (index, Ok(None));
        }
        (index, self.apply(op).await.map(Some))
    }

    async fn apply(&self, op: &Operation) -> Result<u64, SyncError> {
        let retry = &self.options.retry;
        let transport = self.transport;

        match op {
            Operation::Keep { .. } => Ok(0),
            Operation::Move { src, dst } => {
                with_retry(retry, "move", || transport.move_file(src, dst)).await?;
                Ok(0)
            }
            Operation::CopyFromExisting { existing, dst } => {
                with_retry(retry, "copy", || transport.copy_file(existing, dst)).await?;
                Ok(0)
            }
            Operation::Transfer {
                local_path,
                dst,
                fingerprint,
                size,
                mode,
            } => {
                if let Some(limit) = transport.max_write_len()
                    && *size > limit
                {
                    return Err(SyncError::TooLarge {
                        path: local_path.clone(),
                        size: *size,
                        limit,
                    });
                }
                let data = self.read_source(local_path, *fingerprint).await?;
                let len = data.len() as u64;
                with_retry(retry, "transfer", || {
                    transport.write_bytes(dst, data.clone(), *mode)
                })
                .await?;
                Ok(len)
            }
            Operation::Delete { path } => {
                with_retry(retry, "delete", || transport.delete(path)).await?;
                Ok(0)
            }
        }
    }

    /// Read a local file and make sure it still has the planned content
    async fn read_source(&self, path: &Path, expected: Fingerprint) -> Result<Bytes, SyncError> {
        let full = self.local_root.join(path);
        let data = match tokio::fs::read(&full).await {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SyncError::SourceChanged {
                    path: path.to_path_buf(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let (data, actual) = tokio::task::spawn_blocking(move || {
            let fp = Fingerprint::from_bytes(&data);
            (data, fp)
        })
        .await
        .map_err(std::io::Error::other)?;

        if actual != expected {
            return Err(SyncError::SourceChanged {
                path: path.to_path_buf(),
            });
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_ops;
    use crate::plan::plan;
    use crate::scan::Scanner;
    use crate::store::RevisionStore;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Transport over a local directory that can inject failures
    struct TestTransport {
        root: PathBuf,
        /// Fail this many mutating calls with a connection error first
        flaky: AtomicUsize,
        /// Fail every write to this path with a remote error
        broken: Option<PathBuf>,
        max_write: Option<u64>,
        calls: AtomicUsize,
    }

    impl TestTransport {
        fn new(root: &Path) -> Self {
            Self {
                root: root.to_path_buf(),
                flaky: AtomicUsize::new(0),
                broken: None,
                max_write: None,
                calls: AtomicUsize::new(0),
            }
        }

        fn check(&self, path: &Path) -> Result<(), TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .flaky
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TransportError::Connection("connection reset".into()));
            }
            if self.broken.as_deref() == Some(path) {
                return Err(TransportError::Remote("permission denied".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Transport for TestTransport {
        fn describe(&self) -> String {
            format!("test:{}", self.root.display())
        }

        async fn list_snapshot(&self, options: &ScanOptions) -> Result<Snapshot, TransportError> {
            Scanner::new(&self.root)
                .with_options(options.clone())
                .scan()
                .map(|outcome| outcome.snapshot)
                .map_err(|e| TransportError::Remote(e.to_string()))
        }

        async fn move_file(&self, src: &Path, dst: &Path) -> Result<(), TransportError> {
            self.check(dst)?;
            Ok(fs_ops::move_file(&self.root, src, dst)?)
        }

        async fn copy_file(&self, src: &Path, dst: &Path) -> Result<(), TransportError> {
            self.check(dst)?;
            Ok(fs_ops::copy_file(&self.root, src, dst)?)
        }

        async fn write_bytes(&self, dst: &Path, data: Bytes, mode: u32) -> Result<(), TransportError> {
            self.check(dst)?;
            Ok(fs_ops::write_file(&self.root, dst, &data, mode)?)
        }

        async fn delete(&self, path: &Path) -> Result<(), TransportError> {
            self.check(path)?;
            Ok(fs_ops::delete_file(&self.root, path)?)
        }

        fn max_write_len(&self) -> Option<u64> {
            self.max_write
        }
    }

    struct Fixture {
        local: TempDir,
        remote: TempDir,
        store: RevisionStore,
    }

    impl Fixture {
        fn new(local_files: &[(&str, &str)], remote_files: &[(&str, &str)]) -> Self {
            let local = TempDir::new().unwrap();
            let remote = TempDir::new().unwrap();
            for (dir, files) in [(&local, local_files), (&remote, remote_files)] {
                for (path, content) in files {
                    let full = dir.path().join(path);
                    fs::create_dir_all(full.parent().unwrap()).unwrap();
                    fs::write(full, content).unwrap();
                }
            }
            let store = RevisionStore::open(local.path()).unwrap();
            Self {
                local,
                remote,
                store,
            }
        }

        fn target(&self) -> Snapshot {
            Scanner::new(self.local.path()).scan().unwrap().snapshot
        }

        fn log(&self, transport: &TestTransport) -> ResumeLog {
            let target = self.target();
            let remote = Scanner::new(self.remote.path()).scan().unwrap().snapshot;
            let plan = plan(&target, &remote).unwrap();
            ResumeLog::create(&self.store, &transport.describe(), &plan, target.digest()).unwrap()
        }
    }

    fn fast_retry() -> ExecutorOptions {
        ExecutorOptions {
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_ms: 5,
            },
            ..ExecutorOptions::default()
        }
    }

    #[test]
    fn test_waves_separate_conflicting_paths() {
        let plan = SyncPlan {
            operations: vec![
                Operation::Keep {
                    path: PathBuf::from("k"),
                },
                Operation::Move {
                    src: PathBuf::from("b"),
                    dst: PathBuf::from("stage"),
                },
                Operation::Move {
                    src: PathBuf::from("a"),
                    dst: PathBuf::from("b"),
                },
                Operation::Move {
                    src: PathBuf::from("stage"),
                    dst: PathBuf::from("a"),
                },
                Operation::Delete {
                    path: PathBuf::from("x/y"),
                },
                Operation::Delete {
                    path: PathBuf::from("x"),
                },
                Operation::Delete {
                    path: PathBuf::from("z"),
                },
            ],
        };
        assert_eq!(waves(&plan), vec![vec![1, 4, 6], vec![2, 5], vec![3]]);
    }

    #[tokio::test]
    async fn test_execute_and_verify() {
        let fixture = Fixture::new(
            &[("a.txt", "hello"), ("dir/new.txt", "fresh"), ("same", "s")],
            &[("b.txt", "hello"), ("old.txt", "junk"), ("same", "s")],
        );
        let transport = TestTransport::new(fixture.remote.path());
        let mut log = fixture.log(&transport);

        let outcome = SyncExecutor::new(&transport, fixture.local.path())
            .execute(&mut log, &fixture.target())
            .await
            .unwrap();

        assert!(outcome.is_success(), "{outcome:?}");
        assert_eq!(outcome.bytes_transferred, 5);
        assert_eq!(
            fs::read_to_string(fixture.remote.path().join("a.txt")).unwrap(),
            "hello"
        );
        assert!(!fixture.remote.path().join("b.txt").exists());
        assert!(!fixture.remote.path().join("old.txt").exists());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let fixture = Fixture::new(&[("a", "1"), ("b", "2")], &[]);
        let transport = TestTransport::new(fixture.remote.path());
        transport.flaky.store(2, Ordering::SeqCst);
        let mut log = fixture.log(&transport);

        let outcome = SyncExecutor::new(&transport, fixture.local.path())
            .with_options(fast_retry())
            .execute(&mut log, &fixture.target())
            .await
            .unwrap();

        assert!(outcome.is_success(), "{outcome:?}");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_failure_stops_and_reports() {
        let fixture = Fixture::new(&[("a", "1"), ("z/b", "2")], &[("z", "in the way")]);
        let mut transport = TestTransport::new(fixture.remote.path());
        transport.broken = Some(PathBuf::from("z"));
        let mut log = fixture.log(&transport);

        let outcome = SyncExecutor::new(&transport, fixture.local.path())
            .with_options(fast_retry())
            .execute(&mut log, &fixture.target())
            .await
            .unwrap();

        assert!(!outcome.is_success());
        let failure = outcome.failure.as_ref().unwrap();
        assert!(matches!(
            failure.error,
            SyncError::Transport(TransportError::Remote(_))
        ));
        assert!(!outcome.remaining.is_empty());
        assert!(outcome.verification.is_none());
        // Remote errors are not retried
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_changed_source_is_not_sent() {
        let fixture = Fixture::new(&[("a", "planned")], &[]);
        let transport = TestTransport::new(fixture.remote.path());
        let mut log = fixture.log(&transport);
        fs::write(fixture.local.path().join("a"), "edited").unwrap();

        let outcome = SyncExecutor::new(&transport, fixture.local.path())
            .execute(&mut log, &fixture.target())
            .await
            .unwrap();

        let failure = outcome.failure.unwrap();
        assert!(matches!(failure.error, SyncError::SourceChanged { .. }));
        assert!(!fixture.remote.path().join("a").exists());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let fixture = Fixture::new(&[("a", "1")], &[]);
        let transport = TestTransport::new(fixture.remote.path());
        let mut log = fixture.log(&transport);
        let options = ExecutorOptions::default();
        options.cancel.cancel();

        let outcome = SyncExecutor::new(&transport, fixture.local.path())
            .with_options(options)
            .execute(&mut log, &fixture.target())
            .await
            .unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.remaining, vec![0]);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_midway_then_resume() {
        let fixture = Fixture::new(&[("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")], &[]);
        let transport = TestTransport::new(fixture.remote.path());
        let remote = transport.describe();
        let mut log = fixture.log(&transport);

        let options = ExecutorOptions {
            concurrency: 1,
            ..ExecutorOptions::default()
        };
        let cancel = options.cancel.clone();
        let done = Arc::new(AtomicUsize::new(0));
        let on_progress: ProgressFn = {
            let done = done.clone();
            Arc::new(move |_: &Operation, _: u64| {
                if done.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                    cancel.cancel();
                }
            })
        };

        let outcome = SyncExecutor::new(&transport, fixture.local.path())
            .with_options(options)
            .with_progress(on_progress)
            .execute(&mut log, &fixture.target())
            .await
            .unwrap();

        assert!(outcome.cancelled);
        assert!(outcome.failure.is_none());
        assert!(outcome.verification.is_none());
        assert_eq!(outcome.remaining.len(), 2);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        drop(log);

        // Pick up from the persisted progress
        let mut log = ResumeLog::load(&fixture.store, &remote).unwrap().unwrap();
        assert_eq!(log.completed_count(), 2);
        let outcome = SyncExecutor::new(&transport, fixture.local.path())
            .execute(&mut log, &fixture.target())
            .await
            .unwrap();

        assert!(outcome.is_success(), "{outcome:?}");
        assert_eq!(outcome.bytes_transferred, 2);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 4);
        for (name, content) in [("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")] {
            assert_eq!(
                fs::read_to_string(fixture.remote.path().join(name)).unwrap(),
                content
            );
        }
    }

    #[tokio::test]
    async fn test_oversized_transfer_is_refused() {
        let fixture = Fixture::new(&[("big", "0123456789"), ("small", "ok")], &[]);
        let mut transport = TestTransport::new(fixture.remote.path());
        transport.max_write = Some(4);
        let mut log = fixture.log(&transport);

        let outcome = SyncExecutor::new(&transport, fixture.local.path())
            .execute(&mut log, &fixture.target())
            .await
            .unwrap();

        let failure = outcome.failure.as_ref().unwrap();
        assert!(matches!(
            failure.error,
            SyncError::TooLarge {
                size: 10,
                limit: 4,
                ..
            }
        ));
        assert_eq!(outcome.remaining.len(), 1);
        assert!(!fixture.remote.path().join("big").exists());
        assert_eq!(
            fs::read_to_string(fixture.remote.path().join("small")).unwrap(),
            "ok"
        );
        // Only the small file reached the transport
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recorded_operations_are_skipped() {
        let fixture = Fixture::new(&[("a", "1"), ("b", "2")], &[]);
        let transport = TestTransport::new(fixture.remote.path());
        let mut log = fixture.log(&transport);

        // First operation was applied by an earlier attempt
        fs::write(fixture.remote.path().join("a"), "1").unwrap();
        log.record(0).unwrap();

        let outcome = SyncExecutor::new(&transport, fixture.local.path())
            .execute(&mut log, &fixture.target())
            .await
            .unwrap();

        assert!(outcome.is_success(), "{outcome:?}");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.bytes_transferred, 1);
    }

    #[test]
    fn test_verification_report() {
        use crate::snapshot::tests::snapshot;

        let target = snapshot(&[("a", b"1"), ("b", b"2"), ("c", b"3")]);
        let remote = snapshot(&[("a", b"1"), ("b", b"x"), ("d", b"4")]);
        let report = VerificationReport::compare(&target, &remote);
        assert_eq!(report.missing, vec![PathBuf::from("c")]);
        assert_eq!(report.mismatched, vec![PathBuf::from("b")]);
        assert_eq!(report.unexpected, vec![PathBuf::from("d")]);
        assert!(!report.is_clean());
    }
}
