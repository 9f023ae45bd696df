//! Bridge configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default maximum write payload (1 MiB).
pub const DEFAULT_MAX_WRITE_SIZE: usize = 1 << 20;

/// Default number of consecutive empty listing batches before a heartbeat.
pub const DEFAULT_HEARTBEAT_BATCHES: usize = 1024;

/// Tunables for a bridge instance.
///
/// Every field has a default, so an empty TOML table is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Largest accepted write payload; bigger writes fail with `EMSGSIZE`.
    pub max_write_size: usize,

    /// Target schemes whose backends forbid incremental writes. Handles on
    /// such targets coalesce writes in a local staging file.
    pub staging_schemes: Vec<String>,

    /// Directory under which temp mounts are allocated.
    /// `None` means the system temp directory.
    pub temp_root: Option<PathBuf>,

    /// Name prefix for temp mount directories.
    pub temp_prefix: String,

    /// Consecutive empty `has_more` listing batches after which a held
    /// listing request gets an empty, non-final reply. `0` disables this.
    pub listing_heartbeat_batches: usize,

    /// Capacity of the storage attach/detach event channel.
    pub event_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_write_size: DEFAULT_MAX_WRITE_SIZE,
            staging_schemes: vec!["mtp".to_string()],
            temp_root: None,
            temp_prefix: ".filebridge-".to_string(),
            listing_heartbeat_batches: DEFAULT_HEARTBEAT_BATCHES,
            event_capacity: 64,
        }
    }
}

impl BridgeConfig {
    /// Set the maximum write size.
    pub fn with_max_write_size(mut self, size: usize) -> Self {
        self.max_write_size = size;
        self
    }

    /// Replace the staging scheme list.
    pub fn with_staging_schemes<I, S>(mut self, schemes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.staging_schemes = schemes.into_iter().map(Into::into).collect();
        self
    }

    /// Set the temp mount root directory.
    pub fn with_temp_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(root.into());
        self
    }

    /// Set the listing heartbeat threshold.
    pub fn with_listing_heartbeat(mut self, batches: usize) -> Self {
        self.listing_heartbeat_batches = batches;
        self
    }

    /// Whether targets with this scheme need a staging file.
    pub fn uses_staging(&self, scheme: &str) -> bool {
        self.staging_schemes
            .iter()
            .any(|s| s.eq_ignore_ascii_case(scheme))
    }

    /// Resolved temp mount root.
    pub fn temp_root(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.max_write_size, DEFAULT_MAX_WRITE_SIZE);
        assert!(config.uses_staging("mtp"));
        assert!(config.uses_staging("MTP"));
        assert!(!config.uses_staging("mem"));
        assert_eq!(config.temp_root(), std::env::temp_dir());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: BridgeConfig =
            serde_json::from_str(r#"{"max_write_size": 16, "staging_schemes": []}"#).unwrap();
        assert_eq!(config.max_write_size, 16);
        assert!(!config.uses_staging("mtp"));
        assert_eq!(config.temp_prefix, ".filebridge-");
    }
}
