//! Local filesystem backend.
//!
//! Serves `local://<mount>/<path>` targets from real directories registered
//! as mounts, with path security to prevent escaping a mount root.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::vfs::error::{BackendError, BackendResult};
use crate::vfs::ops::Backend;
use crate::vfs::types::{DirBatch, DirEntry, FileType, Metadata, Target};

/// Scheme served by [`LocalBackend`].
pub const LOCAL_SCHEME: &str = "local";

/// Default number of entries per listing batch.
const DEFAULT_BATCH_SIZE: usize = 128;

/// Local filesystem backend.
///
/// Each mount maps a volume name to a root directory. For example, with
/// mount `work` rooted at `/home/amy/project`, the target
/// `local://work/src/main.rs` reads `/home/amy/project/src/main.rs`.
#[derive(Debug)]
pub struct LocalBackend {
    mounts: RwLock<BTreeMap<String, PathBuf>>,
    batch_size: usize,
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBackend {
    /// Create a backend with no mounts.
    pub fn new() -> Self {
        Self {
            mounts: RwLock::new(BTreeMap::new()),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Set the number of entries per listing batch (minimum 1).
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Names of the current mounts.
    pub fn mounts(&self) -> Vec<String> {
        self.mounts.read().keys().cloned().collect()
    }

    /// Join a target onto its mount root without touching the filesystem.
    fn host_path(&self, target: &Target) -> BackendResult<(PathBuf, PathBuf)> {
        let mounts = self.mounts.read();
        let root = mounts
            .get(target.volume())
            .ok_or_else(|| BackendError::not_found(target.url()))?
            .clone();
        let full = if target.is_root() {
            root.clone()
        } else {
            root.join(target.path())
        };
        Ok((root, full))
    }

    /// Resolve a target to a host path inside its mount root.
    ///
    /// Returns an error if symlinks lead outside the root.
    async fn resolve(&self, target: &Target) -> BackendResult<PathBuf> {
        let (root, full) = self.host_path(target)?;

        let canonical = if fs::try_exists(&full).await.unwrap_or(false) {
            fs::canonicalize(&full).await?
        } else {
            // For new entries, canonicalize the parent and append the name
            let parent = full
                .parent()
                .ok_or_else(|| BackendError::invalid("no parent"))?;
            let name = full
                .file_name()
                .ok_or_else(|| BackendError::invalid("no file name"))?;
            if fs::try_exists(parent).await.unwrap_or(false) {
                fs::canonicalize(parent).await?.join(name)
            } else {
                // Parent doesn't exist, will fail on the actual operation
                full
            }
        };

        confine(&root, canonical)
    }

    fn kind_of(file_type: std::fs::FileType) -> FileType {
        if file_type.is_dir() {
            FileType::Directory
        } else if file_type.is_symlink() {
            FileType::Symlink
        } else {
            FileType::File
        }
    }

    fn metadata_to_meta(meta: &std::fs::Metadata) -> Metadata {
        Metadata {
            size: meta.len(),
            kind: Self::kind_of(meta.file_type()),
            perm: meta.permissions().mode() & 0o7777,
            mtime: meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH),
            atime: meta.accessed().ok(),
            ctime: meta.created().ok(),
        }
    }
}

/// Accept `canonical` only if it lies under `root`.
fn confine(root: &Path, canonical: PathBuf) -> BackendResult<PathBuf> {
    if canonical.starts_with(root) {
        Ok(canonical)
    } else {
        Err(BackendError::PathEscapesRoot(format!(
            "{} is not under {}",
            canonical.display(),
            root.display()
        )))
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn can_handle(&self, target: &Target) -> bool {
        target.scheme() == LOCAL_SCHEME
    }

    async fn create_file(&self, target: &Target, exclusive: bool) -> BackendResult<Metadata> {
        let path = self.resolve(target).await?;
        let mut options = fs::OpenOptions::new();
        options.write(true);
        if exclusive {
            options.create_new(true);
        } else {
            options.create(true);
        }
        let file = options.open(&path).await?;
        let meta = file.metadata().await?;
        Ok(Self::metadata_to_meta(&meta))
    }

    async fn create_directory(
        &self,
        target: &Target,
        exclusive: bool,
        recursive: bool,
    ) -> BackendResult<()> {
        let path = self.resolve(target).await?;
        if let Ok(meta) = fs::metadata(&path).await {
            return if meta.is_dir() && !exclusive {
                Ok(())
            } else {
                Err(BackendError::already_exists(target.url()))
            };
        }
        if recursive {
            fs::create_dir_all(&path).await?;
        } else {
            fs::create_dir(&path).await?;
        }
        Ok(())
    }

    async fn get_metadata(&self, target: &Target) -> BackendResult<Metadata> {
        let path = self.resolve(target).await?;
        let meta = fs::symlink_metadata(&path).await?;
        Ok(Self::metadata_to_meta(&meta))
    }

    async fn remove_directory(&self, target: &Target) -> BackendResult<()> {
        if target.is_root() {
            return Err(BackendError::permission_denied("cannot remove mount root"));
        }
        let path = self.resolve(target).await?;
        fs::remove_dir(&path).await?;
        Ok(())
    }

    async fn remove_file(&self, target: &Target) -> BackendResult<()> {
        let path = self.resolve(target).await?;
        fs::remove_file(&path).await?;
        Ok(())
    }

    async fn truncate(&self, target: &Target, length: u64) -> BackendResult<()> {
        let path = self.resolve(target).await?;
        let file = fs::OpenOptions::new().write(true).open(&path).await?;
        file.set_len(length).await?;
        Ok(())
    }

    async fn read(&self, target: &Target, offset: u64, length: u32) -> BackendResult<Vec<u8>> {
        let path = self.resolve(target).await?;
        let mut file = fs::File::open(&path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;

        let mut buffer = Vec::with_capacity(length as usize);
        file.take(u64::from(length)).read_to_end(&mut buffer).await?;
        Ok(buffer)
    }

    async fn write(&self, target: &Target, data: &[u8], offset: u64) -> BackendResult<u64> {
        let path = self.resolve(target).await?;
        let mut file = fs::OpenOptions::new().write(true).open(&path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(data.len() as u64)
    }

    fn list_directory(&self, target: &Target) -> BoxStream<'static, DirBatch> {
        enum State {
            Start { root: PathBuf, full: PathBuf },
            Reading(fs::ReadDir),
            Done,
        }

        let (root, full) = match self.host_path(target) {
            Ok(paths) => paths,
            Err(e) => return stream::once(async move { DirBatch::failed(e) }).boxed(),
        };
        let batch_size = self.batch_size;

        stream::unfold(State::Start { root, full }, move |state| async move {
            let mut dir = match state {
                State::Done => return None,
                State::Start { root, full } => {
                    let opened = match fs::canonicalize(&full).await {
                        Ok(canonical) => match confine(&root, canonical) {
                            Ok(path) => fs::read_dir(&path).await.map_err(BackendError::from),
                            Err(e) => Err(e),
                        },
                        Err(e) => Err(e.into()),
                    };
                    match opened {
                        Ok(dir) => dir,
                        Err(e) => return Some((DirBatch::failed(e), State::Done)),
                    }
                }
                State::Reading(dir) => dir,
            };

            let mut entries = Vec::new();
            while entries.len() < batch_size {
                match dir.next_entry().await {
                    Ok(Some(entry)) => {
                        let kind = match entry.file_type().await {
                            Ok(ft) => Self::kind_of(ft),
                            Err(_) => FileType::File,
                        };
                        entries.push(DirEntry::new(
                            entry.file_name().to_string_lossy().into_owned(),
                            kind,
                        ));
                    }
                    Ok(None) => return Some((DirBatch::last(entries), State::Done)),
                    Err(e) => {
                        let batch = DirBatch {
                            entries,
                            has_more: false,
                            error: Some(e.into()),
                        };
                        return Some((batch, State::Done));
                    }
                }
            }
            Some((DirBatch::more(entries), State::Reading(dir)))
        })
        .boxed()
    }

    fn register_mount(&self, name: &str, root: &Path) -> BackendResult<String> {
        if name.is_empty() || name.contains('/') {
            return Err(BackendError::invalid(format!("bad mount name: {name:?}")));
        }
        let root = root.canonicalize()?;
        if !root.is_dir() {
            return Err(BackendError::not_a_directory(root.display().to_string()));
        }
        self.mounts.write().insert(name.to_string(), root);
        Ok(format!("{LOCAL_SCHEME}://{name}"))
    }

    fn revoke_mount(&self, name: &str) -> BackendResult<()> {
        self.mounts
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| BackendError::not_found(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn t(url: &str) -> Target {
        Target::parse(url).unwrap()
    }

    fn setup() -> (TempDir, LocalBackend) {
        let dir = TempDir::new().unwrap();
        let fs = LocalBackend::new().with_batch_size(2);
        assert_eq!(fs.register_mount("work", dir.path()).unwrap(), "local://work");
        (dir, fs)
    }

    #[tokio::test]
    async fn test_create_write_read() {
        let (_dir, fs) = setup();
        fs.create_file(&t("local://work/a.txt"), true).await.unwrap();
        fs.write(&t("local://work/a.txt"), b"hello world", 0).await.unwrap();
        let data = fs.read(&t("local://work/a.txt"), 6, 100).await.unwrap();
        assert_eq!(data, b"world");
        let meta = fs.get_metadata(&t("local://work/a.txt")).await.unwrap();
        assert_eq!(meta.size, 11);
        assert!(meta.is_file());
    }

    #[tokio::test]
    async fn test_exclusive_create_fails_when_present() {
        let (_dir, fs) = setup();
        fs.create_file(&t("local://work/a"), true).await.unwrap();
        let err = fs.create_file(&t("local://work/a"), true).await.unwrap_err();
        assert_eq!(err.errno(), crate::errno::Errno::Eexist);
        assert!(fs.create_file(&t("local://work/a"), false).await.is_ok());
    }

    #[tokio::test]
    async fn test_mkdir_rmdir_unlink_truncate() {
        let (dir, fs) = setup();
        fs.create_directory(&t("local://work/x/y"), true, true).await.unwrap();
        assert!(dir.path().join("x/y").is_dir());
        fs.create_file(&t("local://work/x/y/f"), true).await.unwrap();
        fs.write(&t("local://work/x/y/f"), b"abcdef", 0).await.unwrap();
        fs.truncate(&t("local://work/x/y/f"), 3).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("x/y/f")).unwrap(), b"abc");
        assert!(fs.remove_directory(&t("local://work/x/y")).await.is_err());
        fs.remove_file(&t("local://work/x/y/f")).await.unwrap();
        fs.remove_directory(&t("local://work/x/y")).await.unwrap();
        assert!(!dir.path().join("x/y").exists());
    }

    #[tokio::test]
    async fn test_list_directory_batches() {
        let (dir, fs) = setup();
        for name in ["a", "b", "c"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let batches: Vec<DirBatch> = fs.list_directory(&t("local://work")).collect().await;
        assert!(batches.iter().all(|b| b.error.is_none()));
        assert!(!batches.last().unwrap().has_more);
        let mut names: Vec<_> = batches
            .iter()
            .flat_map(|b| b.entries.iter().map(|e| e.name.clone()))
            .collect();
        names.sort();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_list_missing_directory() {
        let (_dir, fs) = setup();
        let batches: Vec<DirBatch> = fs.list_directory(&t("local://work/nope")).collect().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].error.as_ref().unwrap().errno(), crate::errno::Errno::Enoent);
    }

    #[tokio::test]
    async fn test_symlink_escape_blocked() {
        let (dir, fs) = setup();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), b"s").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let result = fs.read(&t("local://work/link/secret"), 0, 10).await;
        assert!(matches!(result, Err(BackendError::PathEscapesRoot(_))));
    }

    #[tokio::test]
    async fn test_symlink_listing_escape_blocked() {
        let (dir, fs) = setup();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret.txt"), b"s").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        let batches: Vec<DirBatch> = fs.list_directory(&t("local://work/link")).collect().await;
        assert_eq!(batches.len(), 1);
        assert!(batches[0].entries.is_empty());
        assert!(!batches[0].has_more);
        assert!(matches!(batches[0].error, Some(BackendError::PathEscapesRoot(_))));

        // Links that stay inside the mount still list.
        std::fs::create_dir(dir.path().join("inner")).unwrap();
        std::fs::write(dir.path().join("inner/f"), b"").unwrap();
        std::os::unix::fs::symlink(dir.path().join("inner"), dir.path().join("alias")).unwrap();
        let batches: Vec<DirBatch> = fs.list_directory(&t("local://work/alias")).collect().await;
        assert_eq!(batches.len(), 1);
        assert!(batches[0].error.is_none());
        assert_eq!(batches[0].entries[0].name, "f");
    }

    #[tokio::test]
    async fn test_revoke_mount() {
        let (_dir, fs) = setup();
        fs.revoke_mount("work").unwrap();
        assert!(fs.mounts().is_empty());
        assert!(fs.get_metadata(&t("local://work")).await.is_err());
        assert!(fs.revoke_mount("work").is_err());
    }
}
