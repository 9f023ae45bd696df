//! Backend error types.

use std::io;
use thiserror::Error;

use crate::errno::Errno;

/// Error reported by a [`Backend`](super::Backend) operation.
#[derive(Debug, Error)]
pub enum BackendError {
    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Target already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Permission denied.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Directory not empty.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Target escapes its mount root.
    #[error("path escapes root: {0}")]
    PathEscapesRoot(String),

    /// Malformed target or argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No backend registered for a scheme.
    #[error("no backend for scheme: {0}")]
    NoBackend(String),

    /// Operation spans two backends.
    #[error("cross-backend operation")]
    CrossBackend,

    /// Backend out of space.
    #[error("no space left")]
    NoSpace,

    /// The backend does not implement this operation.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Create a NotFound error.
    pub fn not_found(target: impl Into<String>) -> Self {
        Self::NotFound(target.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(target: impl Into<String>) -> Self {
        Self::AlreadyExists(target.into())
    }

    /// Create a PermissionDenied error.
    pub fn permission_denied(target: impl Into<String>) -> Self {
        Self::PermissionDenied(target.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(target: impl Into<String>) -> Self {
        Self::NotADirectory(target.into())
    }

    /// Create an IsADirectory error.
    pub fn is_a_directory(target: impl Into<String>) -> Self {
        Self::IsADirectory(target.into())
    }

    /// Create a DirectoryNotEmpty error.
    pub fn directory_not_empty(target: impl Into<String>) -> Self {
        Self::DirectoryNotEmpty(target.into())
    }

    /// Create an InvalidArgument error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an Other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// POSIX code for this error. Every variant maps to exactly one code.
    pub fn errno(&self) -> Errno {
        match self {
            Self::NotFound(_) | Self::NoBackend(_) => Errno::Enoent,
            Self::AlreadyExists(_) => Errno::Eexist,
            Self::PermissionDenied(_) | Self::PathEscapesRoot(_) => Errno::Eacces,
            Self::NotADirectory(_) => Errno::Enotdir,
            Self::IsADirectory(_) => Errno::Eisdir,
            Self::DirectoryNotEmpty(_) => Errno::Enotempty,
            Self::InvalidArgument(_) => Errno::Einval,
            Self::CrossBackend => Errno::Exdev,
            Self::NoSpace => Errno::Enospc,
            Self::Unsupported(_) => Errno::Enosys,
            Self::Io(e) => io_errno(e),
            Self::Other(_) => Errno::Eio,
        }
    }

    /// Raw response code for this error.
    pub fn code(&self) -> i32 {
        self.errno().code()
    }
}

fn io_errno(e: &io::Error) -> Errno {
    match e.kind() {
        io::ErrorKind::NotFound => Errno::Enoent,
        io::ErrorKind::PermissionDenied => Errno::Eacces,
        io::ErrorKind::AlreadyExists => Errno::Eexist,
        io::ErrorKind::NotADirectory => Errno::Enotdir,
        io::ErrorKind::IsADirectory => Errno::Eisdir,
        io::ErrorKind::DirectoryNotEmpty => Errno::Enotempty,
        io::ErrorKind::InvalidInput => Errno::Einval,
        io::ErrorKind::StorageFull => Errno::Enospc,
        io::ErrorKind::CrossesDevices => Errno::Exdev,
        io::ErrorKind::Unsupported => Errno::Enosys,
        _ => Errno::Eio,
    }
}

/// Backend result type.
pub type BackendResult<T> = Result<T, BackendError>;
