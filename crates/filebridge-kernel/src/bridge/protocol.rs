//! Typed responses (and the one structured request) of the bridge surface.
//!
//! Every response carries a POSIX-style `error_code` (0 = success) next to
//! its payload. Payload fields are meaningful only when `error_code == 0`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errno::Errno;
use crate::vfs::{BackendError, DirEntry, Metadata};

/// Reply to `stat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatResponse {
    pub error_code: i32,
    pub metadata: Option<Metadata>,
}

impl StatResponse {
    pub fn ok(metadata: Metadata) -> Self {
        Self {
            error_code: 0,
            metadata: Some(metadata),
        }
    }

    pub fn error(code: impl Into<i32>) -> Self {
        Self {
            error_code: code.into(),
            metadata: None,
        }
    }
}

/// Reply to operations with no payload (mkdir, rmdir, unlink, truncate, close).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub error_code: i32,
}

impl StatusResponse {
    pub fn ok() -> Self {
        Self { error_code: 0 }
    }

    pub fn error(code: impl Into<i32>) -> Self {
        Self {
            error_code: code.into(),
        }
    }

    /// Translate a backend result.
    pub fn from_result(result: Result<(), BackendError>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(e) => Self::error(e.errno()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error_code == 0
    }
}

/// Reply to `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenResponse {
    pub error_code: i32,
    pub handle: u64,
}

impl OpenResponse {
    pub fn ok(handle: u64) -> Self {
        Self {
            error_code: 0,
            handle,
        }
    }

    pub fn error(code: impl Into<i32>) -> Self {
        Self {
            error_code: code.into(),
            handle: 0,
        }
    }
}

/// Reply to `create`: the new handle plus a metadata snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateResponse {
    pub error_code: i32,
    pub handle: u64,
    pub metadata: Option<Metadata>,
}

impl CreateResponse {
    pub fn ok(handle: u64, metadata: Metadata) -> Self {
        Self {
            error_code: 0,
            handle,
            metadata: Some(metadata),
        }
    }

    pub fn error(code: impl Into<i32>) -> Self {
        Self {
            error_code: code.into(),
            handle: 0,
            metadata: None,
        }
    }
}

/// Reply to `read`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadResponse {
    pub error_code: i32,
    pub data: Vec<u8>,
}

impl ReadResponse {
    pub fn ok(data: Vec<u8>) -> Self {
        Self {
            error_code: 0,
            data,
        }
    }

    pub fn error(code: impl Into<i32>) -> Self {
        Self {
            error_code: code.into(),
            data: Vec::new(),
        }
    }
}

/// Reply to `write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResponse {
    pub error_code: i32,
    pub bytes_written: u64,
}

impl WriteResponse {
    pub fn ok(bytes_written: u64) -> Self {
        Self {
            error_code: 0,
            bytes_written,
        }
    }

    pub fn error(code: impl Into<i32>) -> Self {
        Self {
            error_code: code.into(),
            bytes_written: 0,
        }
    }
}

/// One round trip of a paginated directory listing.
///
/// Start a listing with `cookie == 0`; continue it with the cookie from the
/// previous reply. A nonzero `cancel_error_code` cancels the listing and is
/// echoed back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadDirRequest {
    pub path: String,
    #[serde(default)]
    pub cookie: u64,
    #[serde(default)]
    pub cancel_error_code: i32,
}

impl ReadDirRequest {
    /// First request of a new listing.
    pub fn start(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            cookie: 0,
            cancel_error_code: 0,
        }
    }

    /// Follow-up request for the next page.
    pub fn next(path: impl Into<String>, cookie: u64) -> Self {
        Self {
            path: path.into(),
            cookie,
            cancel_error_code: 0,
        }
    }

    /// Cancel a listing with the given (nonzero) code.
    pub fn cancel(path: impl Into<String>, cookie: u64, code: impl Into<i32>) -> Self {
        Self {
            path: path.into(),
            cookie,
            cancel_error_code: code.into(),
        }
    }
}

/// Reply to a listing request.
///
/// `cookie` is nonzero only while the listing continues (`has_more`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadDirResponse {
    pub error_code: i32,
    pub cookie: u64,
    pub entries: Vec<DirEntry>,
    pub has_more: bool,
}

impl ReadDirResponse {
    /// Acknowledge a new listing.
    pub fn ack(cookie: u64) -> Self {
        Self {
            error_code: 0,
            cookie,
            entries: Vec::new(),
            has_more: true,
        }
    }

    /// A page of entries; the cookie is dropped once the listing is done.
    pub fn page(cookie: u64, entries: Vec<DirEntry>, has_more: bool) -> Self {
        Self {
            error_code: 0,
            cookie: if has_more { cookie } else { 0 },
            entries,
            has_more,
        }
    }

    /// Final, empty reply.
    pub fn done() -> Self {
        Self::page(0, Vec::new(), false)
    }

    /// Terminal failure.
    pub fn error(code: impl Into<i32>) -> Self {
        Self {
            error_code: code.into(),
            cookie: 0,
            entries: Vec::new(),
            has_more: false,
        }
    }

    /// Whether this reply ends its listing.
    pub fn is_terminal(&self) -> bool {
        self.error_code != 0 || !self.has_more
    }
}

/// Reply to `make_temp_dir`.
///
/// On failure `error_message` is set and both paths are empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempDirResponse {
    pub error_message: String,
    pub virtual_path: String,
    pub backing_path: PathBuf,
}

impl TempDirResponse {
    pub fn ok(virtual_path: impl Into<String>, backing_path: impl Into<PathBuf>) -> Self {
        Self {
            error_message: String::new(),
            virtual_path: virtual_path.into(),
            backing_path: backing_path.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: message.into(),
            ..Self::default()
        }
    }
}

impl From<Errno> for StatusResponse {
    fn from(e: Errno) -> Self {
        Self::error(e)
    }
}
