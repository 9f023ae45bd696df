//! Scheme router.
//!
//! Routes backend operations to the backend registered for a target's URL
//! scheme, so the bridge can sit in front of several storage engines at
//! once (e.g. `mem://` scratch volumes next to `local://` temp mounts).

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use super::error::{BackendError, BackendResult};
use super::ops::Backend;
use super::types::{DirBatch, Metadata, Target};

/// Routes operations to per-scheme backends.
#[derive(Default)]
pub struct SchemeRouter {
    routes: BTreeMap<String, Arc<dyn Backend>>,
    /// Backend that hosts `register_mount` volumes.
    mount_host: Option<Arc<dyn Backend>>,
}

impl std::fmt::Debug for SchemeRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemeRouter")
            .field("schemes", &self.routes.keys().collect::<Vec<_>>())
            .field("mount_host", &self.mount_host.is_some())
            .finish()
    }
}

impl SchemeRouter {
    /// Create a router with no routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `scheme` to `backend`, replacing any previous route.
    pub fn route(mut self, scheme: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        self.routes.insert(scheme.into().to_ascii_lowercase(), backend);
        self
    }

    /// Route `scheme` to `backend` and make it the host for new mounts.
    pub fn route_mount_host(self, scheme: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        let mut router = self.route(scheme, Arc::clone(&backend));
        router.mount_host = Some(backend);
        router
    }

    /// Schemes with a route.
    pub fn schemes(&self) -> Vec<String> {
        self.routes.keys().cloned().collect()
    }

    fn backend_for(&self, target: &Target) -> BackendResult<&Arc<dyn Backend>> {
        self.routes
            .get(target.scheme())
            .ok_or_else(|| BackendError::NoBackend(target.scheme().to_string()))
    }
}

#[async_trait]
impl Backend for SchemeRouter {
    fn crack_path(&self, url: &str) -> Option<Target> {
        let parsed = Target::parse(url)?;
        self.routes.get(parsed.scheme())?.crack_path(url)
    }

    fn can_handle(&self, target: &Target) -> bool {
        self.routes
            .get(target.scheme())
            .is_some_and(|b| b.can_handle(target))
    }

    async fn create_file(&self, target: &Target, exclusive: bool) -> BackendResult<Metadata> {
        self.backend_for(target)?.create_file(target, exclusive).await
    }

    async fn create_directory(
        &self,
        target: &Target,
        exclusive: bool,
        recursive: bool,
    ) -> BackendResult<()> {
        self.backend_for(target)?
            .create_directory(target, exclusive, recursive)
            .await
    }

    async fn get_metadata(&self, target: &Target) -> BackendResult<Metadata> {
        self.backend_for(target)?.get_metadata(target).await
    }

    async fn remove_directory(&self, target: &Target) -> BackendResult<()> {
        self.backend_for(target)?.remove_directory(target).await
    }

    async fn remove_file(&self, target: &Target) -> BackendResult<()> {
        self.backend_for(target)?.remove_file(target).await
    }

    async fn truncate(&self, target: &Target, length: u64) -> BackendResult<()> {
        self.backend_for(target)?.truncate(target, length).await
    }

    async fn read(&self, target: &Target, offset: u64, length: u32) -> BackendResult<Vec<u8>> {
        self.backend_for(target)?.read(target, offset, length).await
    }

    async fn write(&self, target: &Target, data: &[u8], offset: u64) -> BackendResult<u64> {
        self.backend_for(target)?.write(target, data, offset).await
    }

    fn list_directory(&self, target: &Target) -> BoxStream<'static, DirBatch> {
        match self.backend_for(target) {
            Ok(backend) => backend.list_directory(target),
            Err(e) => stream::once(async move { DirBatch::failed(e) }).boxed(),
        }
    }

    fn register_mount(&self, name: &str, root: &Path) -> BackendResult<String> {
        match &self.mount_host {
            Some(host) => host.register_mount(name, root),
            None => Err(BackendError::Unsupported("register_mount")),
        }
    }

    fn revoke_mount(&self, name: &str) -> BackendResult<()> {
        match &self.mount_host {
            Some(host) => host.revoke_mount(name),
            None => Err(BackendError::Unsupported("revoke_mount")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::backends::{LocalBackend, MemoryBackend};

    fn router() -> SchemeRouter {
        let mem = Arc::new(MemoryBackend::new().with_volume("v"));
        SchemeRouter::new()
            .route("mem", mem)
            .route_mount_host("local", Arc::new(LocalBackend::new()))
    }

    #[tokio::test]
    async fn test_routes_by_scheme() {
        let router = router();
        let target = router.crack_path("mem://v/a").unwrap();
        router.create_file(&target, true).await.unwrap();
        router.write(&target, b"data", 0).await.unwrap();
        assert_eq!(router.read(&target, 0, 10).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_unknown_scheme() {
        let router = router();
        assert!(router.crack_path("ftp://host/x").is_none());
        let target = Target::parse("ftp://host/x").unwrap();
        assert!(!router.can_handle(&target));
        assert!(matches!(
            router.get_metadata(&target).await,
            Err(BackendError::NoBackend(_))
        ));
        let batches: Vec<DirBatch> = router.list_directory(&target).collect().await;
        assert!(batches[0].error.is_some());
    }

    #[tokio::test]
    async fn test_mounts_go_to_host() {
        let router = router();
        let dir = tempfile::tempdir().unwrap();
        let prefix = router.register_mount("tmp1", dir.path()).unwrap();
        assert_eq!(prefix, "local://tmp1");
        let target = router.crack_path("local://tmp1/f").unwrap();
        router.create_file(&target, true).await.unwrap();
        assert!(dir.path().join("f").exists());
        router.revoke_mount("tmp1").unwrap();
        assert!(router.get_metadata(&target).await.is_err());

        let bare = SchemeRouter::new();
        assert!(matches!(
            bare.register_mount("x", dir.path()),
            Err(BackendError::Unsupported(_))
        ));
    }
}
