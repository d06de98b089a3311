//! Abstract access to a remote tree

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportError;
use crate::scan::ScanOptions;
use crate::snapshot::Snapshot;

/// Primitive operations on a remote tree, all paths relative to its root.
///
/// Implementations make `move_file` and `delete` idempotent: moving a
/// source that is gone while the destination exists succeeds, and deleting
/// a missing file succeeds. Operations are safe to retry after a transient
/// failure.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable description of the remote, e.g. `ssh:me@host:22:/srv/data`
    fn describe(&self) -> String;

    /// Scan the remote tree with the given rules
    async fn list_snapshot(&self, options: &ScanOptions) -> Result<Snapshot, TransportError>;

    /// Rename `src` to `dst`, creating parent directories
    async fn move_file(&self, src: &Path, dst: &Path) -> Result<(), TransportError>;

    /// Duplicate `src` at `dst`, creating parent directories
    async fn copy_file(&self, src: &Path, dst: &Path) -> Result<(), TransportError>;

    /// Replace `dst` with `data`, setting permission bits
    async fn write_bytes(&self, dst: &Path, data: Bytes, mode: u32) -> Result<(), TransportError>;

    /// Remove a file and any parent directories left empty
    async fn delete(&self, path: &Path) -> Result<(), TransportError>;

    /// Largest file `write_bytes` accepts, if bounded
    fn max_write_len(&self) -> Option<u64> {
        None
    }

    /// Release the connection
    async fn shutdown(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
