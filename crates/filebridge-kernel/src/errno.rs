//! POSIX-flavored error codes carried in every bridge response.
//!
//! Values are the Linux numbers. `0` always means success and is not a
//! variant; responses carry a plain `i32` so backend codes pass through
//! untouched.

use serde::{Deserialize, Serialize};
use strum::{Display, IntoStaticStr};

/// Error codes the bridge produces itself or maps backend failures onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, Serialize, Deserialize)]
#[strum(serialize_all = "UPPERCASE")]
#[repr(i32)]
pub enum Errno {
    /// No such file, moniker, prefix, handle or cookie.
    Enoent = 2,
    /// Backend I/O failure.
    Eio = 5,
    /// Write against a read-only target or handle.
    Eacces = 13,
    /// Queued operation invalidated by `close`.
    Ebusy = 16,
    /// Target already exists (exclusive create/mkdir).
    Eexist = 17,
    /// Cross-backend operation.
    Exdev = 18,
    /// Expected a directory.
    Enotdir = 20,
    /// Expected a file.
    Eisdir = 21,
    /// Malformed path or request.
    Einval = 22,
    /// Backend out of space.
    Enospc = 28,
    /// Operation not supported by the backend.
    Enosys = 38,
    /// Directory not empty.
    Enotempty = 39,
    /// Write payload above the configured maximum.
    Emsgsize = 90,
    /// Operation was cancelled.
    Ecanceled = 125,
}

impl Errno {
    /// The raw integer carried on the wire.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map a raw code back to a known variant, if any.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            2 => Self::Enoent,
            5 => Self::Eio,
            13 => Self::Eacces,
            16 => Self::Ebusy,
            17 => Self::Eexist,
            18 => Self::Exdev,
            20 => Self::Enotdir,
            21 => Self::Eisdir,
            22 => Self::Einval,
            28 => Self::Enospc,
            38 => Self::Enosys,
            39 => Self::Enotempty,
            90 => Self::Emsgsize,
            125 => Self::Ecanceled,
            _ => return None,
        })
    }
}

impl From<Errno> for i32 {
    fn from(e: Errno) -> i32 {
        e.code()
    }
}

/// Log-friendly name for a raw response code.
pub fn describe(code: i32) -> &'static str {
    match code {
        0 => "OK",
        _ => Errno::from_code(code).map(<&'static str>::from).unwrap_or("UNKNOWN"),
    }
}
