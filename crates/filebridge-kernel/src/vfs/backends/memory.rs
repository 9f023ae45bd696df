//! In-memory backend.
//!
//! Used for scratch volumes and testing. All data is ephemeral.
//!
//! Storage is keyed by `(volume, path)`; the scheme only decides whether
//! the backend accepts a target, so `mem://v/x` and `mtp://v/x` name the
//! same file when both schemes are enabled.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::time::SystemTime;

use crate::vfs::error::{BackendError, BackendResult};
use crate::vfs::ops::Backend;
use crate::vfs::types::{DirBatch, DirEntry, FileType, Metadata, Target};

/// Default number of entries per listing batch.
const DEFAULT_BATCH_SIZE: usize = 64;

#[derive(Debug, Clone)]
enum Entry {
    File { data: Vec<u8>, meta: Metadata },
    Directory { meta: Metadata },
}

impl Entry {
    fn meta(&self) -> &Metadata {
        match self {
            Entry::File { meta, .. } => meta,
            Entry::Directory { meta } => meta,
        }
    }
}

type Key = (String, String);

fn key(target: &Target) -> Key {
    (target.volume().to_string(), target.path().to_string())
}

/// In-memory backend.
///
/// Thread-safe via an internal `RwLock`. All data is lost when dropped.
#[derive(Debug)]
pub struct MemoryBackend {
    schemes: BTreeSet<String>,
    entries: RwLock<BTreeMap<Key, Entry>>,
    batch_size: usize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty backend serving the `mem` scheme.
    pub fn new() -> Self {
        Self::with_schemes(["mem"])
    }

    /// Create an empty backend serving the given schemes.
    pub fn with_schemes<I, S>(schemes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            schemes: schemes
                .into_iter()
                .map(|s| s.into().to_ascii_lowercase())
                .collect(),
            entries: RwLock::new(BTreeMap::new()),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Set the number of entries per listing batch (minimum 1).
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Add a volume (its root directory). Existing volumes are kept.
    pub fn add_volume(&self, name: impl Into<String>) {
        self.entries
            .write()
            .entry((name.into(), String::new()))
            .or_insert_with(|| Entry::Directory {
                meta: Metadata::directory(0o755),
            });
    }

    /// Builder form of [`add_volume`](Self::add_volume).
    pub fn with_volume(self, name: impl Into<String>) -> Self {
        self.add_volume(name);
        self
    }

    /// Schemes this backend accepts.
    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.schemes.iter().map(String::as_str)
    }

    fn require_parent_dir(entries: &BTreeMap<Key, Entry>, target: &Target) -> BackendResult<()> {
        match entries.get(&key(&target.parent())) {
            Some(Entry::Directory { .. }) => Ok(()),
            Some(Entry::File { .. }) => Err(BackendError::not_a_directory(target.parent().url())),
            None => Err(BackendError::not_found(target.parent().url())),
        }
    }

    fn children(entries: &BTreeMap<Key, Entry>, dir: &Target) -> Vec<DirEntry> {
        let volume = dir.volume();
        let prefix = if dir.is_root() {
            String::new()
        } else {
            format!("{}/", dir.path())
        };
        entries
            .iter()
            .filter(|((v, p), _)| v == volume && !p.is_empty() && p.starts_with(&prefix))
            .filter_map(|((_, p), entry)| {
                let rest = &p[prefix.len()..];
                if rest.contains('/') {
                    return None;
                }
                let kind = match entry {
                    Entry::File { .. } => FileType::File,
                    Entry::Directory { .. } => FileType::Directory,
                };
                Some(DirEntry::new(rest, kind))
            })
            .collect()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn can_handle(&self, target: &Target) -> bool {
        self.schemes.contains(target.scheme())
    }

    async fn create_file(&self, target: &Target, exclusive: bool) -> BackendResult<Metadata> {
        if target.is_root() {
            return Err(BackendError::is_a_directory(target.url()));
        }
        let mut entries = self.entries.write();
        match entries.get(&key(target)) {
            Some(Entry::File { meta, .. }) if !exclusive => return Ok(meta.clone()),
            Some(Entry::Directory { .. }) if !exclusive => {
                return Err(BackendError::is_a_directory(target.url()));
            }
            Some(_) => return Err(BackendError::already_exists(target.url())),
            None => {}
        }
        Self::require_parent_dir(&entries, target)?;

        let meta = Metadata::file(0, 0o644);
        entries.insert(
            key(target),
            Entry::File {
                data: Vec::new(),
                meta: meta.clone(),
            },
        );
        Ok(meta)
    }

    async fn create_directory(
        &self,
        target: &Target,
        exclusive: bool,
        recursive: bool,
    ) -> BackendResult<()> {
        let mut entries = self.entries.write();
        match entries.get(&key(target)) {
            Some(Entry::Directory { .. }) if !exclusive => return Ok(()),
            Some(_) => return Err(BackendError::already_exists(target.url())),
            None => {}
        }
        if target.is_root() {
            // Volumes are only created through `add_volume`.
            return Err(BackendError::not_found(target.url()));
        }

        if recursive {
            let mut missing = Vec::new();
            let mut cursor = target.parent();
            loop {
                match entries.get(&key(&cursor)) {
                    Some(Entry::Directory { .. }) => break,
                    Some(Entry::File { .. }) => {
                        return Err(BackendError::not_a_directory(cursor.url()));
                    }
                    None if cursor.is_root() => {
                        return Err(BackendError::not_found(cursor.url()));
                    }
                    None => {
                        let parent = cursor.parent();
                        missing.push(cursor);
                        cursor = parent;
                    }
                }
            }
            for dir in missing.into_iter().rev() {
                entries.insert(
                    key(&dir),
                    Entry::Directory {
                        meta: Metadata::directory(0o755),
                    },
                );
            }
        } else {
            Self::require_parent_dir(&entries, target)?;
        }

        entries.insert(
            key(target),
            Entry::Directory {
                meta: Metadata::directory(0o755),
            },
        );
        Ok(())
    }

    async fn get_metadata(&self, target: &Target) -> BackendResult<Metadata> {
        self.entries
            .read()
            .get(&key(target))
            .map(|e| e.meta().clone())
            .ok_or_else(|| BackendError::not_found(target.url()))
    }

    async fn remove_directory(&self, target: &Target) -> BackendResult<()> {
        if target.is_root() {
            return Err(BackendError::permission_denied("cannot remove volume root"));
        }
        let mut entries = self.entries.write();
        match entries.get(&key(target)) {
            Some(Entry::Directory { .. }) => {}
            Some(Entry::File { .. }) => return Err(BackendError::not_a_directory(target.url())),
            None => return Err(BackendError::not_found(target.url())),
        }
        if !Self::children(&entries, target).is_empty() {
            return Err(BackendError::directory_not_empty(target.url()));
        }
        entries.remove(&key(target));
        Ok(())
    }

    async fn remove_file(&self, target: &Target) -> BackendResult<()> {
        let mut entries = self.entries.write();
        match entries.get(&key(target)) {
            Some(Entry::File { .. }) => {
                entries.remove(&key(target));
                Ok(())
            }
            Some(Entry::Directory { .. }) => Err(BackendError::is_a_directory(target.url())),
            None => Err(BackendError::not_found(target.url())),
        }
    }

    async fn truncate(&self, target: &Target, length: u64) -> BackendResult<()> {
        let mut entries = self.entries.write();
        match entries.get_mut(&key(target)) {
            Some(Entry::File { data, meta }) => {
                let length = usize::try_from(length).map_err(|_| BackendError::NoSpace)?;
                data.resize(length, 0);
                meta.size = data.len() as u64;
                meta.mtime = SystemTime::now();
                Ok(())
            }
            Some(Entry::Directory { .. }) => Err(BackendError::is_a_directory(target.url())),
            None => Err(BackendError::not_found(target.url())),
        }
    }

    async fn read(&self, target: &Target, offset: u64, length: u32) -> BackendResult<Vec<u8>> {
        let entries = self.entries.read();
        match entries.get(&key(target)) {
            Some(Entry::File { data, .. }) => {
                let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
                let end = start.saturating_add(length as usize).min(data.len());
                Ok(data[start..end].to_vec())
            }
            Some(Entry::Directory { .. }) => Err(BackendError::is_a_directory(target.url())),
            None => Err(BackendError::not_found(target.url())),
        }
    }

    async fn write(&self, target: &Target, data: &[u8], offset: u64) -> BackendResult<u64> {
        let mut entries = self.entries.write();
        match entries.get_mut(&key(target)) {
            Some(Entry::File {
                data: file_data,
                meta,
            }) => {
                let offset = usize::try_from(offset).map_err(|_| BackendError::NoSpace)?;
                let end = offset.checked_add(data.len()).ok_or(BackendError::NoSpace)?;
                if end > file_data.len() {
                    file_data.resize(end, 0);
                }
                file_data[offset..end].copy_from_slice(data);
                meta.size = file_data.len() as u64;
                meta.mtime = SystemTime::now();
                Ok(data.len() as u64)
            }
            Some(Entry::Directory { .. }) => Err(BackendError::is_a_directory(target.url())),
            None => Err(BackendError::not_found(target.url())),
        }
    }

    fn list_directory(&self, target: &Target) -> BoxStream<'static, DirBatch> {
        let entries = self.entries.read();
        let listing = match entries.get(&key(target)) {
            Some(Entry::Directory { .. }) => Ok(Self::children(&entries, target)),
            Some(Entry::File { .. }) => Err(BackendError::not_a_directory(target.url())),
            None => Err(BackendError::not_found(target.url())),
        };
        drop(entries);

        let batches = match listing {
            Ok(children) if children.is_empty() => vec![DirBatch::last(Vec::new())],
            Ok(children) => {
                let chunks: Vec<Vec<DirEntry>> = children
                    .chunks(self.batch_size)
                    .map(<[DirEntry]>::to_vec)
                    .collect();
                let count = chunks.len();
                chunks
                    .into_iter()
                    .enumerate()
                    .map(|(i, chunk)| {
                        if i + 1 == count {
                            DirBatch::last(chunk)
                        } else {
                            DirBatch::more(chunk)
                        }
                    })
                    .collect()
            }
            Err(e) => vec![DirBatch::failed(e)],
        };
        stream::iter(batches).boxed()
    }
}
