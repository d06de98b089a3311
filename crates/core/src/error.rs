//! Error taxonomy for revision storage, planning, transport and sync

use std::path::PathBuf;

use thiserror::Error;

use crate::snapshot::RevisionId;

/// Failure decoding a serialized snapshot
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of data")]
    Truncated,
    #[error("bad magic bytes")]
    BadMagic,
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u8),
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("path is not valid UTF-8")]
    InvalidPath,
    #[error("path `{0}` is out of order or duplicated")]
    Unordered(PathBuf),
    #[error("{0} trailing bytes after snapshot")]
    TrailingBytes(usize),
}

/// Revision store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("revision {0} not found")]
    NotFound(RevisionId),

    #[error("no revisions have been committed yet")]
    Empty,

    #[error("invalid revision `{0}` (expected N, rN, HEAD or HEAD~N)")]
    InvalidSpec(String),

    #[error("corrupted store entry {}: {reason}", path.display())]
    Corruption { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A plan that cannot be executed safely
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanConflict {
    #[error("operations #{first} and #{second} both write {}", path.display())]
    SharedDestination {
        path: PathBuf,
        first: usize,
        second: usize,
    },

    #[error("could not break dependency cycle among {remaining} operations")]
    UnresolvableCycle { remaining: usize },
}

/// Failure of a single transport primitive
#[derive(Debug, Error)]
pub enum TransportError {
    /// Link to the remote dropped or could not be established
    #[error("connection error: {0}")]
    Connection(String),

    /// The remote side ran the request and reported a failure
    #[error("remote error: {0}")]
    Remote(String),

    /// Malformed or unexpected reply
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether retrying the same request may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        use std::io::ErrorKind;

        match self {
            Self::Connection(_) => true,
            Self::Remote(_) | Self::Protocol(_) => false,
            Self::Io(e) => matches!(
                e.kind(),
                ErrorKind::Interrupted
                    | ErrorKind::TimedOut
                    | ErrorKind::WouldBlock
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::ConnectionRefused
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
            ),
        }
    }
}

/// Sync session failures
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Plan(#[from] PlanConflict),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Local file no longer matches the fingerprint the plan was built from
    #[error("{} changed since it was scanned; take a new snapshot", path.display())]
    SourceChanged { path: PathBuf },

    /// File exceeds what the transport can write in one request
    #[error("{} is {size} bytes; the remote accepts at most {limit}", path.display())]
    TooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("resume log: {0}")]
    ResumeLog(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
