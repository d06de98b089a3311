//! Transport for a tree on the local filesystem
//!
//! Applies operations directly with the same primitives the remote agent
//! uses. Useful for syncing to mounted volumes and for testing.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use dirdiff_core::fs_ops;
use dirdiff_core::{ScanOptions, Scanner, Snapshot, Transport, TransportError};

/// Local transport (no SSH, operates on the local filesystem)
pub struct LocalTransport {
    root: PathBuf,
}

impl LocalTransport {
    /// Open a tree, creating the root directory if needed
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> io::Result<T> + Send + 'static,
    {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || op(&root))
            .await
            .map_err(io::Error::other)?
            .map_err(TransportError::from)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }

    async fn list_snapshot(&self, options: &ScanOptions) -> Result<Snapshot, TransportError> {
        let scanner = Scanner::new(&self.root).with_options(options.clone());
        let outcome = tokio::task::spawn_blocking(move || scanner.scan())
            .await
            .map_err(io::Error::other)?
            .map_err(|e| TransportError::Remote(format!("{e:#}")))?;

        for skipped in &outcome.skipped {
            debug!("Skipped {}: {}", skipped.path.display(), skipped.reason);
        }
        Ok(outcome.snapshot)
    }

    async fn move_file(&self, src: &Path, dst: &Path) -> Result<(), TransportError> {
        let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
        self.blocking(move |root| fs_ops::move_file(root, &src, &dst))
            .await
    }

    async fn copy_file(&self, src: &Path, dst: &Path) -> Result<(), TransportError> {
        let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
        self.blocking(move |root| fs_ops::copy_file(root, &src, &dst))
            .await
    }

    async fn write_bytes(&self, dst: &Path, data: Bytes, mode: u32) -> Result<(), TransportError> {
        let dst = dst.to_path_buf();
        self.blocking(move |root| fs_ops::write_file(root, &dst, &data, mode))
            .await
    }

    async fn delete(&self, path: &Path) -> Result<(), TransportError> {
        let path = path.to_path_buf();
        self.blocking(move |root| fs_ops::delete_file(root, &path))
            .await
    }
}
