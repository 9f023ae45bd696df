//! Prefix registry: single-segment namespace names mapped to backend prefixes.
//!
//! Registration changes are published as [`StorageEvent`]s on a broadcast
//! channel so the owner can emit "storage attached/detached" signals.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;

use super::moniker::MONIKER_ROOT;

/// One registered prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixMapEntry {
    pub subdir: String,
    pub backend_prefix: String,
    pub read_only: bool,
}

/// Attach/detach notification for a prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "subdir", rename_all = "snake_case")]
pub enum StorageEvent {
    Attached(String),
    Detached(String),
}

/// Why a prefix could not be registered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PrefixError {
    #[error("subdir must be a single non-empty path segment: {0:?}")]
    InvalidSubdir(String),
    #[error("subdir is reserved: {0:?}")]
    Reserved(String),
}

/// Subdir → backend prefix registry. Confined to the bridge actor.
#[derive(Debug)]
pub struct PrefixMap {
    entries: BTreeMap<String, PrefixMapEntry>,
    events: broadcast::Sender<StorageEvent>,
}

impl PrefixMap {
    /// Create an empty map publishing on `events`.
    pub fn new(events: broadcast::Sender<StorageEvent>) -> Self {
        Self {
            entries: BTreeMap::new(),
            events,
        }
    }

    /// Register (or replace) a prefix.
    ///
    /// Trailing slashes are trimmed from `backend_prefix`.
    pub fn register(
        &mut self,
        subdir: &str,
        backend_prefix: &str,
        read_only: bool,
    ) -> Result<(), PrefixError> {
        if subdir.is_empty() || subdir.contains('/') || subdir == "." || subdir == ".." {
            return Err(PrefixError::InvalidSubdir(subdir.to_string()));
        }
        if subdir == MONIKER_ROOT {
            return Err(PrefixError::Reserved(subdir.to_string()));
        }

        let entry = PrefixMapEntry {
            subdir: subdir.to_string(),
            backend_prefix: backend_prefix.trim_end_matches('/').to_string(),
            read_only,
        };
        tracing::info!(
            subdir,
            prefix = %entry.backend_prefix,
            read_only,
            "prefix registered"
        );
        self.entries.insert(subdir.to_string(), entry);
        // No receivers is fine.
        let _ = self.events.send(StorageEvent::Attached(subdir.to_string()));
        Ok(())
    }

    /// Remove a prefix. Returns `false` if it was not registered.
    pub fn unregister(&mut self, subdir: &str) -> bool {
        if self.entries.remove(subdir).is_none() {
            return false;
        }
        tracing::info!(subdir, "prefix unregistered");
        let _ = self.events.send(StorageEvent::Detached(subdir.to_string()));
        true
    }

    pub fn lookup(&self, subdir: &str) -> Option<&PrefixMapEntry> {
        self.entries.get(subdir)
    }

    /// Registered subdirs, sorted.
    pub fn list_active(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PrefixMapEntry> {
        self.entries.values()
    }
}
