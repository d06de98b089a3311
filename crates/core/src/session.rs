//! One sync of the store's head revision to a remote

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{StoreError, SyncError};
use crate::executor::{ExecutionOutcome, ExecutorOptions, ProgressFn, SyncExecutor};
use crate::plan::{PlanSummary, SyncPlan, plan};
use crate::resume::ResumeLog;
use crate::snapshot::{RevisionId, Snapshot};
use crate::store::RevisionStore;
use crate::transport::Transport;

/// Session settings
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub executor: ExecutorOptions,
    /// Ignore any interrupted sync and plan from scratch
    pub fresh: bool,
}

/// Result of a session
#[derive(Debug)]
pub struct SyncReport {
    /// Revision the remote was synced to
    pub revision: RevisionId,
    /// Work this run started with; excludes operations done by an earlier
    /// attempt
    pub summary: PlanSummary,
    /// Operations an interrupted attempt had already done
    pub already_done: usize,
    pub outcome: ExecutionOutcome,
    /// Continued an interrupted sync instead of planning anew
    pub resumed: bool,
}

impl SyncReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

/// Plan summary as shown to users before execution starts
#[derive(Debug, Clone, Serialize)]
pub struct PlanPreview {
    pub summary: PlanSummary,
    pub resumed: bool,
    pub already_done: usize,
}

/// Syncs the head revision of a store to a transport
pub struct SyncSession<'a> {
    store: &'a RevisionStore,
    transport: &'a dyn Transport,
    options: SyncOptions,
    progress: Option<ProgressFn>,
}

impl<'a> SyncSession<'a> {
    pub fn new(store: &'a RevisionStore, transport: &'a dyn Transport, options: SyncOptions) -> Self {
        Self {
            store,
            transport,
            options,
            progress: None,
        }
    }

    #[must_use]
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Load a matching resume log or plan from scratch
    async fn prepare(&self, remote: &str, target: &Snapshot) -> Result<(ResumeLog, bool), SyncError> {
        let target_digest = target.digest();
        if self.options.fresh && ResumeLog::abandon(self.store, remote)? {
            info!("Discarded interrupted sync to {remote}");
        }

        if let Some(log) = ResumeLog::load(self.store, remote)? {
            if log.target_digest() == target_digest {
                log.plan().validate()?;
                info!(
                    "Resuming sync to {remote}: {}/{} operations already done",
                    log.completed_count(),
                    log.plan().len()
                );
                return Ok((log, true));
            }
            warn!("Interrupted sync to {remote} targeted another revision, planning again");
            log.finish()?;
        }

        let remote_snapshot = self
            .transport
            .list_snapshot(&self.options.executor.scan)
            .await?;
        let new_plan = plan(target, &remote_snapshot)?;
        let log = ResumeLog::create(self.store, remote, &new_plan, target_digest)?;
        Ok((log, false))
    }

    /// Run the sync. Operation failures are reported in the outcome; the
    /// resume log is kept until a run completes.
    ///
    /// # Errors
    /// Fails if there is no head revision, the remote cannot be listed, the
    /// plan is invalid, or progress cannot be recorded
    pub async fn run(&self) -> Result<SyncReport, SyncError> {
        let target = self.store.head()?;
        let revision = target.revision.ok_or(StoreError::Empty)?;
        let remote = self.transport.describe();

        let (mut log, resumed) = self.prepare(&remote, &target).await?;
        let summary = log.pending_summary();
        let already_done = log.completed_count();
        info!(
            "Syncing {revision} to {remote}: {} moves, {} copies, {} transfers, {} deletes",
            summary.moves, summary.copies, summary.transfers, summary.deletes
        );

        let mut executor = SyncExecutor::new(self.transport, self.store.root())
            .with_options(self.options.executor.clone());
        if let Some(progress) = &self.progress {
            executor = executor.with_progress(progress.clone());
        }
        let outcome = executor.execute(&mut log, &target).await?;

        if outcome.remaining.is_empty() {
            log.finish()?;
        }

        Ok(SyncReport {
            revision,
            summary,
            already_done,
            outcome,
            resumed,
        })
    }

    /// Plan without executing, reusing a matching resume log
    ///
    /// # Errors
    /// Same as [`SyncSession::run`]
    pub async fn preview(&self) -> Result<(SyncPlan, PlanPreview), SyncError> {
        let target = self.store.head()?;
        let remote = self.transport.describe();

        if !self.options.fresh
            && let Some(log) = ResumeLog::load(self.store, &remote)?
            && log.target_digest() == target.digest()
        {
            let preview = PlanPreview {
                summary: log.pending_summary(),
                resumed: true,
                already_done: log.completed_count(),
            };
            return Ok((log.plan().clone(), preview));
        }

        let remote_snapshot = self
            .transport
            .list_snapshot(&self.options.executor.scan)
            .await?;
        let new_plan = plan(&target, &remote_snapshot)?;
        let preview = PlanPreview {
            summary: new_plan.summary(),
            resumed: false,
            already_done: 0,
        };
        Ok((new_plan, preview))
    }
}
