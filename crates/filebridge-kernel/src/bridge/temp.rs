//! Temporary directory mounts.
//!
//! Each temp mount is a fresh local directory exposed in the virtual
//! namespace under its own subdir. The directory is removed when the mount
//! is removed (or the bridge shuts down).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// One live temp mount.
#[derive(Debug)]
pub struct TempMount {
    pub dir: TempDir,
    /// Backend prefix the mount was registered under.
    pub backend_prefix: String,
}

impl TempMount {
    pub fn backing_path(&self) -> &Path {
        self.dir.path()
    }
}

/// Subdir → temp mount registry.
#[derive(Debug, Default)]
pub struct TempMountRegistry {
    mounts: BTreeMap<String, TempMount>,
}

impl TempMountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, subdir: String, mount: TempMount) {
        self.mounts.insert(subdir, mount);
    }

    /// Remove the mount for a virtual path (`subdir` or `/subdir`).
    pub fn remove(&mut self, virtual_path: &str) -> Option<(String, TempMount)> {
        let subdir = virtual_path.trim_matches('/');
        self.mounts.remove_entry(subdir)
    }

    #[cfg(test)]
    pub fn contains(&self, subdir: &str) -> bool {
        self.mounts.contains_key(subdir)
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TempMount)> {
        self.mounts.iter()
    }

    /// Take every mount out of the registry.
    pub fn drain(&mut self) -> Vec<(String, TempMount)> {
        std::mem::take(&mut self.mounts).into_iter().collect()
    }
}

/// Namespace subdir for a freshly created temp directory: its base name
/// without leading dots, so hidden directory names stay visible.
pub fn subdir_for(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?.trim_start_matches('.');
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Create a temp directory under `root`. Blocking; run off the actor.
pub fn create_dir(root: PathBuf, prefix: String) -> std::io::Result<TempDir> {
    std::fs::create_dir_all(&root)?;
    tempfile::Builder::new().prefix(&prefix).tempdir_in(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subdir_strips_leading_dots() {
        assert_eq!(
            subdir_for(Path::new("/tmp/.filebridge-abc")).as_deref(),
            Some("filebridge-abc")
        );
        assert_eq!(subdir_for(Path::new("/tmp/plain")).as_deref(), Some("plain"));
        assert_eq!(subdir_for(Path::new("/tmp/...")), None);
        assert_eq!(subdir_for(Path::new("/")), None);
    }

    #[test]
    fn test_registry_lifecycle() {
        let root = tempfile::tempdir().unwrap();
        let dir = create_dir(root.path().to_path_buf(), ".fb-".into()).unwrap();
        let path = dir.path().to_path_buf();
        let subdir = subdir_for(&path).unwrap();
        assert!(subdir.starts_with("fb-"));

        let mut registry = TempMountRegistry::new();
        registry.insert(
            subdir.clone(),
            TempMount {
                dir,
                backend_prefix: format!("local://{subdir}"),
            },
        );
        assert!(registry.contains(&subdir));
        assert!(registry.remove("/nope").is_none());

        let (name, mount) = registry.remove(&format!("/{subdir}")).unwrap();
        assert_eq!(name, subdir);
        assert_eq!(mount.backing_path(), path);
        mount.dir.close().unwrap();
        assert!(!path.exists());
        assert!(registry.is_empty());
    }
}
