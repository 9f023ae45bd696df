//! Backend capability trait.
//!
//! A backend is the storage engine behind the bridge. Every operation is
//! target-based (no inodes, no open state) and asynchronous; the bridge
//! never holds backend resources across calls except through a
//! directory-listing stream.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::path::Path;

use super::error::{BackendError, BackendResult};
use super::types::{DirBatch, Metadata, Target};

/// Storage capability used by the bridge.
#[async_trait]
pub trait Backend: Send + Sync {
    // ========================================================================
    // Path cracking
    // ========================================================================

    /// Turn a URL string into a concrete target, or `None` if this backend
    /// cannot interpret it.
    fn crack_path(&self, url: &str) -> Option<Target> {
        Target::parse(url)
    }

    /// Whether this backend serves the target's storage type.
    fn can_handle(&self, target: &Target) -> bool;

    // ========================================================================
    // Metadata and namespace
    // ========================================================================

    /// Create an empty file. With `exclusive`, fail if it already exists;
    /// otherwise an existing file is left as is.
    async fn create_file(&self, target: &Target, exclusive: bool) -> BackendResult<Metadata>;

    /// Create a directory.
    ///
    /// With `exclusive`, an existing directory is an error. With `recursive`,
    /// missing parents are created too.
    async fn create_directory(
        &self,
        target: &Target,
        exclusive: bool,
        recursive: bool,
    ) -> BackendResult<()>;

    /// Get metadata for a target.
    async fn get_metadata(&self, target: &Target) -> BackendResult<Metadata>;

    /// Remove an empty directory.
    async fn remove_directory(&self, target: &Target) -> BackendResult<()>;

    /// Remove a file.
    async fn remove_file(&self, target: &Target) -> BackendResult<()>;

    /// Truncate (or extend with zeros) a file to `length` bytes.
    async fn truncate(&self, target: &Target, length: u64) -> BackendResult<()>;

    // ========================================================================
    // Data
    // ========================================================================

    /// Read up to `length` bytes at `offset`. Short reads signal EOF.
    async fn read(&self, target: &Target, offset: u64, length: u32) -> BackendResult<Vec<u8>>;

    /// Write `data` at `offset`, returning the number of bytes written.
    async fn write(&self, target: &Target, data: &[u8], offset: u64) -> BackendResult<u64>;

    /// Stream the entries of a directory in one or more batches.
    ///
    /// The stream ends after a batch with `has_more == false` or an error.
    fn list_directory(&self, target: &Target) -> BoxStream<'static, DirBatch>;

    // ========================================================================
    // Mounts
    // ========================================================================

    /// Expose a local directory as a new volume named `name`.
    ///
    /// Returns the URL prefix (no trailing slash) under which the directory
    /// is now reachable.
    fn register_mount(&self, name: &str, root: &Path) -> BackendResult<String> {
        let _ = (name, root);
        Err(BackendError::Unsupported("register_mount"))
    }

    /// Revoke a volume previously created with [`register_mount`](Self::register_mount).
    fn revoke_mount(&self, name: &str) -> BackendResult<()> {
        let _ = name;
        Err(BackendError::Unsupported("revoke_mount"))
    }
}
