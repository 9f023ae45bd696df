//! Core backend types.
//!
//! These types are RPC-friendly (serializable, no inode numbers) and are
//! shared between backends, the bridge, and the server surface.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

use super::error::BackendError;

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

impl FileType {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }
}

/// Metadata snapshot for a backend target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Size in bytes.
    pub size: u64,
    /// File type.
    pub kind: FileType,
    /// Unix permission bits (e.g. 0o644).
    pub perm: u32,
    /// Last modification time.
    pub mtime: SystemTime,
    /// Last access time, when the backend tracks it.
    pub atime: Option<SystemTime>,
    /// Creation time, when the backend tracks it.
    pub ctime: Option<SystemTime>,
}

impl Metadata {
    /// Metadata for a file.
    pub fn file(size: u64, perm: u32) -> Self {
        let now = SystemTime::now();
        Self {
            size,
            kind: FileType::File,
            perm,
            mtime: now,
            atime: Some(now),
            ctime: Some(now),
        }
    }

    /// Metadata for a directory.
    pub fn directory(perm: u32) -> Self {
        let now = SystemTime::now();
        Self {
            size: 0,
            kind: FileType::Directory,
            perm,
            mtime: now,
            atime: Some(now),
            ctime: Some(now),
        }
    }

    /// The same snapshot with all write bits cleared.
    pub fn read_only(mut self) -> Self {
        self.perm &= !0o222;
        self
    }

    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }
}

/// Directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name (not full path).
    pub name: String,
    /// Entry type.
    pub kind: FileType,
}

impl DirEntry {
    /// Create a new directory entry.
    pub fn new(name: impl Into<String>, kind: FileType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// Create a file entry.
    pub fn file(name: impl Into<String>) -> Self {
        Self::new(name, FileType::File)
    }

    /// Create a directory entry.
    pub fn directory(name: impl Into<String>) -> Self {
        Self::new(name, FileType::Directory)
    }
}

/// One batch of a streamed directory listing.
///
/// A stream ends after the first batch with `has_more == false`. A batch
/// carrying an error is always the last one.
#[derive(Debug)]
pub struct DirBatch {
    /// Entries in this batch, in backend order.
    pub entries: Vec<DirEntry>,
    /// Whether the backend will deliver further batches.
    pub has_more: bool,
    /// Failure reported alongside (or instead of) entries.
    pub error: Option<BackendError>,
}

impl DirBatch {
    /// A non-final batch.
    pub fn more(entries: Vec<DirEntry>) -> Self {
        Self {
            entries,
            has_more: true,
            error: None,
        }
    }

    /// The final batch.
    pub fn last(entries: Vec<DirEntry>) -> Self {
        Self {
            entries,
            has_more: false,
            error: None,
        }
    }

    /// A terminal failure.
    pub fn failed(error: BackendError) -> Self {
        Self {
            entries: Vec::new(),
            has_more: false,
            error: Some(error),
        }
    }
}

/// Requested access for `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFlags {
    /// Read access requested.
    pub read: bool,
    /// Write access requested.
    pub write: bool,
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self::read()
    }
}

impl OpenFlags {
    /// Read-only access.
    pub fn read() -> Self {
        Self {
            read: true,
            write: false,
        }
    }

    /// Write-only access.
    pub fn write() -> Self {
        Self {
            read: false,
            write: true,
        }
    }

    /// Read and write access.
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
        }
    }
}

/// A concrete backend target: `scheme://volume/path`.
///
/// The path is normalized: no empty, `.` or `..` components and no
/// leading or trailing slash. An empty path names the volume root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Target {
    scheme: String,
    volume: String,
    path: String,
}

impl Target {
    /// Parse and normalize a target URL.
    ///
    /// Returns `None` for malformed URLs and for paths that climb above the
    /// volume root with `..`.
    pub fn parse(url: &str) -> Option<Self> {
        let (scheme, rest) = url.split_once("://")?;
        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        {
            return None;
        }
        let (volume, raw_path) = match rest.split_once('/') {
            Some((v, p)) => (v, p),
            None => (rest, ""),
        };
        if volume.is_empty() {
            return None;
        }
        let path = normalize(raw_path)?;
        Some(Self {
            scheme: scheme.to_ascii_lowercase(),
            volume: volume.to_string(),
            path,
        })
    }

    /// URL scheme, lowercased.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Volume (mount) name.
    pub fn volume(&self) -> &str {
        &self.volume
    }

    /// Normalized path within the volume.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether this names the volume root.
    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    /// Last path component, if any.
    pub fn name(&self) -> Option<&str> {
        if self.path.is_empty() {
            None
        } else {
            self.path.rsplit('/').next()
        }
    }

    /// Target of the containing directory. The root is its own parent.
    pub fn parent(&self) -> Self {
        let path = match self.path.rsplit_once('/') {
            Some((parent, _)) => parent.to_string(),
            None => String::new(),
        };
        Self {
            scheme: self.scheme.clone(),
            volume: self.volume.clone(),
            path,
        }
    }

    /// Full URL form.
    pub fn url(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}://{}", self.scheme, self.volume)
        } else {
            write!(f, "{}://{}/{}", self.scheme, self.volume, self.path)
        }
    }
}

fn normalize(raw: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for component in raw.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            name => parts.push(name),
        }
    }
    Some(parts.join("/"))
}
