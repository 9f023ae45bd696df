//! Virtual path resolution.
//!
//! A virtual path is either `moniker/<token>` or `<subdir>[/<rest>]`. The
//! resolver turns it into a concrete backend [`Target`] plus a read-only flag,
//! consulting the moniker and prefix registries.

use crate::errno::Errno;
use crate::vfs::{Backend, Target};

use super::moniker::{MONIKER_ROOT, Moniker, MonikerMap};
use super::prefix::PrefixMap;

/// A resolved virtual path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub target: Target,
    pub read_only: bool,
}

/// Why a virtual path did not resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("invalid path")]
    InvalidArgument,
    #[error("no such path")]
    NotFound,
    /// The bare moniker root. Not a backend target, but stat and listing
    /// treat it as an empty directory.
    #[error("moniker root")]
    MonikerRoot,
}

impl ResolveError {
    /// POSIX code for operations that cannot act on the moniker root.
    pub fn errno(self) -> Errno {
        match self {
            ResolveError::InvalidArgument => Errno::Einval,
            ResolveError::NotFound | ResolveError::MonikerRoot => Errno::Enoent,
        }
    }
}

/// Resolve `path` against the registries.
///
/// Leading slashes are ignored. Pure: the same path resolves the same way
/// until a registry changes.
pub fn resolve(
    path: &str,
    monikers: &MonikerMap,
    prefixes: &PrefixMap,
    backend: &dyn Backend,
) -> Result<Resolved, ResolveError> {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return Err(ResolveError::InvalidArgument);
    }

    let (head, rest) = match path.split_once('/') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };

    if head == MONIKER_ROOT {
        return match rest {
            None | Some("") => Err(ResolveError::MonikerRoot),
            // Monikers address a single target; nothing lives below them.
            Some(token) if token.contains('/') => Err(ResolveError::NotFound),
            Some(token) => {
                let entry = Moniker::parse(token)
                    .and_then(|m| monikers.resolve(&m))
                    .ok_or(ResolveError::NotFound)?;
                Ok(Resolved {
                    target: entry.target.clone(),
                    read_only: entry.read_only,
                })
            }
        };
    }

    let entry = prefixes.lookup(head).ok_or(ResolveError::NotFound)?;
    // Paths stay below their prefix.
    if rest.is_some_and(|rest| rest.split('/').any(|part| part == "..")) {
        return Err(ResolveError::InvalidArgument);
    }
    let url = match rest {
        None | Some("") => entry.backend_prefix.clone(),
        Some(rest) => format!("{}/{}", entry.backend_prefix, rest),
    };

    let target = backend
        .crack_path(&url)
        .ok_or(ResolveError::InvalidArgument)?;
    if !backend.can_handle(&target) {
        return Err(ResolveError::InvalidArgument);
    }

    Ok(Resolved {
        target,
        read_only: entry.read_only,
    })
}
