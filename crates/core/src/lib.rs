//! dirdiff-core: revision tracking and move-aware directory sync
//!
//! Provides scanning, snapshot storage, diffing, sync planning and plan
//! execution over an abstract transport.

pub mod codec;
pub mod config;
pub mod diff;
pub mod error;
pub mod executor;
pub mod fs_ops;
pub mod hash;
pub mod plan;
pub mod protocol;
pub mod resume;
pub mod scan;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod transport;

pub use config::{DirdiffConfig, RetryConfig};
pub use diff::{DiffResult, MoveKind, MovedPair, diff};
pub use error::{CodecError, PlanConflict, StoreError, SyncError, TransportError};
pub use executor::{ExecutionOutcome, ExecutorOptions, SyncExecutor, VerificationReport};
pub use hash::Fingerprint;
pub use plan::{Operation, PlanSummary, SyncPlan, plan};
pub use protocol::{Message, ProtocolReader, ProtocolWriter};
pub use resume::ResumeLog;
pub use scan::{ScanOptions, ScanOutcome, Scanner, SkipReason};
pub use session::{SyncOptions, SyncReport, SyncSession};
pub use snapshot::{FileRecord, RevisionId, Snapshot};
pub use store::{RevisionInfo, RevisionStore};
pub use transport::Transport;
