//! Server configuration file.
//!
//! ```toml
//! [bridge]
//! max_write_size = 1048576
//! staging_schemes = ["mtp"]
//!
//! [[volume]]
//! name = "vol1"
//!
//! [[mount]]
//! name = "home"
//! path = "/home/me/shared"
//!
//! [[prefix]]
//! subdir = "docs"
//! target = "mem://vol1"
//!
//! [[prefix]]
//! subdir = "shared"
//! target = "local://home"
//! read_only = true
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use filebridge_kernel::vfs::LOCAL_SCHEME;
use filebridge_kernel::{Backend, BridgeConfig, LocalBackend, MemoryBackend, SchemeRouter};

/// In-memory volume created at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct VolumeConfig {
    pub name: String,
}

/// Local directory exposed as `local://<name>`.
#[derive(Debug, Clone, Deserialize)]
pub struct MountConfig {
    pub name: String,
    pub path: PathBuf,
}

/// Prefix registered at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct PrefixConfig {
    pub subdir: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bridge: BridgeConfig,
    pub volume: Vec<VolumeConfig>,
    pub mount: Vec<MountConfig>,
    pub prefix: Vec<PrefixConfig>,
}

impl ServerConfig {
    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid server config")
    }

    /// Load from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Build the backend set: one memory backend serving `mem://` plus every
    /// staging scheme, and a local backend for mounts and temp dirs.
    pub fn build_backend(&self) -> Result<Arc<dyn Backend>> {
        let mut schemes: BTreeSet<String> = BTreeSet::from(["mem".to_string()]);
        schemes.extend(
            self.bridge
                .staging_schemes
                .iter()
                .map(|s| s.to_ascii_lowercase()),
        );
        schemes.remove(LOCAL_SCHEME);

        let memory = MemoryBackend::with_schemes(schemes.iter().cloned());
        for volume in &self.volume {
            memory.add_volume(&volume.name);
        }
        let memory: Arc<dyn Backend> = Arc::new(memory);

        let local = Arc::new(LocalBackend::new());
        for mount in &self.mount {
            local
                .register_mount(&mount.name, &mount.path)
                .with_context(|| format!("failed to mount {}", mount.path.display()))?;
        }

        let mut router = SchemeRouter::new().route_mount_host(LOCAL_SCHEME, local);
        for scheme in schemes {
            router = router.route(scheme, Arc::clone(&memory));
        }
        Ok(Arc::new(router))
    }
}
