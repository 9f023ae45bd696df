//! Moniker registry: opaque capability tokens standing in for targets.
//!
//! A moniker is a random UUIDv4, so it cannot be guessed from the outside.
//! It appears in virtual paths as `moniker/<token>`, but only privileged
//! callers can mint or revoke one.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::vfs::Target;

/// Reserved first path segment for moniker-addressed paths.
pub const MONIKER_ROOT: &str = "moniker";

/// An opaque capability token.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Moniker(uuid::Uuid);

impl Moniker {
    /// Mint a fresh random token.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Parse the textual form (hyphenated or simple hex).
    pub fn parse(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s).ok().map(Self)
    }

    /// Virtual path addressing this moniker.
    pub fn virtual_path(&self) -> String {
        format!("{MONIKER_ROOT}/{self}")
    }
}

impl Default for Moniker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Moniker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl fmt::Debug for Moniker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Moniker({})", self.0.hyphenated())
    }
}

/// What a moniker resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonikerEntry {
    pub target: Target,
    pub read_only: bool,
}

/// Token → target registry. Confined to the bridge actor.
#[derive(Debug, Default)]
pub struct MonikerMap {
    entries: HashMap<Moniker, MonikerEntry>,
}

impl MonikerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a moniker for `target`.
    pub fn create(&mut self, target: Target, read_only: bool) -> Moniker {
        let mut moniker = Moniker::new();
        while self.entries.contains_key(&moniker) {
            moniker = Moniker::new();
        }
        self.entries
            .insert(moniker, MonikerEntry { target, read_only });
        moniker
    }

    pub fn resolve(&self, moniker: &Moniker) -> Option<&MonikerEntry> {
        self.entries.get(moniker)
    }

    /// Revoke a moniker. Returns `false` if it was unknown.
    pub fn destroy(&mut self, moniker: &Moniker) -> bool {
        self.entries.remove(moniker).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Moniker, &MonikerEntry)> {
        self.entries.iter()
    }
}
