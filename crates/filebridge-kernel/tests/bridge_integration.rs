//! End-to-end tests of the bridge against a scripted backend.
//!
//! The scripted backend records every call, tracks how many I/O calls
//! overlap, can hold I/O behind a gate, and streams listing batches that the
//! test feeds by hand.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use futures::{FutureExt, poll};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};

use filebridge_kernel::{
    Backend, BackendError, BackendResult, BridgeConfig, BridgeHandle, DirBatch, DirEntry, Errno,
    LocalBackend, MemoryBackend, Metadata, OpenFlags, ReadDirRequest, SchemeRouter, Target,
    spawn_bridge,
};

// ============================================================================
// Scripted backend
// ============================================================================

struct Scripted {
    log: parking_lot::Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    gate: Semaphore,
    io_delay: Duration,
    listing: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<DirBatch>>>,
}

impl Scripted {
    fn new() -> Self {
        Self {
            log: parking_lot::Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            gate: Semaphore::new(Semaphore::MAX_PERMITS),
            io_delay: Duration::from_millis(2),
            listing: parking_lot::Mutex::new(None),
        }
    }

    /// I/O waits until the test calls `open_gate`.
    fn gated() -> Self {
        Self {
            gate: Semaphore::new(0),
            ..Self::new()
        }
    }

    fn open_gate(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    /// Install a hand-fed listing stream for the next `list_directory`.
    fn feed_listing(&self) -> mpsc::UnboundedSender<DirBatch> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.listing.lock() = Some(rx);
        tx
    }

    fn record(&self, entry: String) {
        self.log.lock().push(entry);
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    async fn io<T>(&self, entry: String, value: T) -> BackendResult<T> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| BackendError::other("gate closed"))?;
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.record(entry);
        tokio::time::sleep(self.io_delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(value)
    }
}

#[async_trait]
impl Backend for Scripted {
    fn can_handle(&self, target: &Target) -> bool {
        matches!(target.scheme(), "scr" | "mtp")
    }

    async fn create_file(&self, target: &Target, exclusive: bool) -> BackendResult<Metadata> {
        self.record(format!("create:{}:{exclusive}", target.path()));
        Ok(Metadata::file(0, 0o644))
    }

    async fn create_directory(
        &self,
        target: &Target,
        _exclusive: bool,
        _recursive: bool,
    ) -> BackendResult<()> {
        self.record(format!("mkdir:{}", target.path()));
        Ok(())
    }

    async fn get_metadata(&self, target: &Target) -> BackendResult<Metadata> {
        match target.path() {
            "missing" => Err(BackendError::not_found(target.url())),
            "dir" => Ok(Metadata::directory(0o755)),
            _ => Ok(Metadata::file(4, 0o644)),
        }
    }

    async fn remove_directory(&self, target: &Target) -> BackendResult<()> {
        self.record(format!("rmdir:{}", target.path()));
        Ok(())
    }

    async fn remove_file(&self, target: &Target) -> BackendResult<()> {
        self.record(format!("unlink:{}", target.path()));
        Ok(())
    }

    async fn truncate(&self, target: &Target, length: u64) -> BackendResult<()> {
        self.record(format!("truncate:{}:{length}", target.path()));
        Ok(())
    }

    async fn read(&self, _target: &Target, offset: u64, length: u32) -> BackendResult<Vec<u8>> {
        self.io(format!("read:{offset}"), vec![b'r'; length.min(4) as usize])
            .await
    }

    async fn write(&self, _target: &Target, data: &[u8], offset: u64) -> BackendResult<u64> {
        self.io(format!("write:{offset}:{}", data.len()), data.len() as u64)
            .await
    }

    fn list_directory(&self, _target: &Target) -> BoxStream<'static, DirBatch> {
        match self.listing.lock().take() {
            Some(rx) => stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|batch| (batch, rx))
            })
            .boxed(),
            None => stream::once(async { DirBatch::last(Vec::new()) }).boxed(),
        }
    }
}

async fn scripted_bridge(backend: Arc<Scripted>, config: BridgeConfig) -> BridgeHandle {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let bridge = spawn_bridge(backend, config);
    bridge.register_prefix("scr", "scr://vol", false).await.unwrap();
    bridge.register_prefix("phone", "mtp://device/", false).await.unwrap();
    bridge
}

fn names(entries: &[DirEntry]) -> Vec<String> {
    entries.iter().map(|e| e.name.clone()).collect()
}

// ============================================================================
// Handles
// ============================================================================

#[tokio::test]
async fn test_per_handle_ops_run_in_order_without_overlap() {
    let backend = Arc::new(Scripted::new());
    let bridge = scripted_bridge(backend.clone(), BridgeConfig::default()).await;
    let h = bridge
        .open("scr/file", OpenFlags::read_write())
        .await
        .unwrap()
        .handle;

    let ops = (0..8u64).map(|i| {
        let bridge = bridge.clone();
        async move {
            if i % 2 == 0 {
                bridge.read(h, i, 4).await.unwrap().error_code
            } else {
                bridge.write(h, i, vec![1, 2]).await.unwrap().error_code
            }
        }
    });
    let codes = futures::future::join_all(ops).await;
    assert!(codes.iter().all(|c| *c == 0));

    let expected: Vec<String> = (0..8u64)
        .map(|i| {
            if i % 2 == 0 {
                format!("read:{i}")
            } else {
                format!("write:{i}:2")
            }
        })
        .collect();
    assert_eq!(backend.log(), expected);
    assert_eq!(backend.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_handles_do_not_serialize_each_other() {
    let backend = Arc::new(Scripted::gated());
    let bridge = scripted_bridge(backend.clone(), BridgeConfig::default()).await;
    let a = bridge.open("scr/a", OpenFlags::read()).await.unwrap().handle;
    let b = bridge.open("scr/b", OpenFlags::read()).await.unwrap().handle;

    let mut ra = Box::pin(bridge.read(a, 0, 1));
    let mut rb = Box::pin(bridge.read(b, 0, 1));
    assert!(poll!(&mut ra).is_pending());
    assert!(poll!(&mut rb).is_pending());
    // Round trip so both reads have been dispatched.
    bridge.debug_tables().await.unwrap();

    backend.open_gate();
    let (ra, rb) = tokio::join!(ra, rb);
    assert_eq!(ra.unwrap().error_code, 0);
    assert_eq!(rb.unwrap().error_code, 0);
    assert_eq!(backend.max_active.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_close_fails_queued_ops_with_busy() {
    let backend = Arc::new(Scripted::gated());
    let bridge = scripted_bridge(backend.clone(), BridgeConfig::default()).await;
    let h = bridge.open("scr/file", OpenFlags::read()).await.unwrap().handle;

    // The first read is dispatched and held at the gate; three more queue.
    let mut first = Box::pin(bridge.read(h, 0, 1));
    assert!(poll!(&mut first).is_pending());
    let mut queued: Vec<_> = (1..=3u64).map(|i| Box::pin(bridge.read(h, i, 1))).collect();
    for fut in &mut queued {
        assert!(poll!(fut).is_pending());
    }

    assert!(bridge.close(h).await.unwrap().is_ok());
    for fut in queued {
        let resp = fut.now_or_never().expect("busy reply sent before close reply");
        assert_eq!(resp.unwrap().error_code, Errno::Ebusy.code());
    }

    // The dispatched read still runs to completion.
    backend.open_gate();
    assert_eq!(first.await.unwrap().error_code, 0);
    assert_eq!(backend.log(), ["read:0"]);

    // The handle is gone.
    assert_eq!(
        bridge.read(h, 0, 1).await.unwrap().error_code,
        Errno::Enoent.code()
    );
}

#[tokio::test]
async fn test_open_checks_existence() {
    let backend = Arc::new(Scripted::new());
    let bridge = scripted_bridge(backend, BridgeConfig::default()).await;
    assert_eq!(
        bridge.open("scr/missing", OpenFlags::read()).await.unwrap().error_code,
        Errno::Enoent.code()
    );
    assert_eq!(
        bridge.open("scr/dir", OpenFlags::read()).await.unwrap().error_code,
        Errno::Eisdir.code()
    );
    assert_eq!(
        bridge.open("nowhere/x", OpenFlags::read()).await.unwrap().error_code,
        Errno::Enoent.code()
    );
    assert_eq!(bridge.stat("").await.unwrap().error_code, Errno::Einval.code());
}

#[tokio::test]
async fn test_oversized_write_is_rejected_without_backend_call() {
    let backend = Arc::new(Scripted::new());
    let config = BridgeConfig::default().with_max_write_size(4);
    let bridge = scripted_bridge(backend.clone(), config).await;
    let h = bridge.create("scr/f").await.unwrap().handle;

    let resp = bridge.write(h, 0, vec![0; 5]).await.unwrap();
    assert_eq!(resp.error_code, Errno::Emsgsize.code());
    let resp = bridge.write(h, 0, vec![0; 4]).await.unwrap();
    assert_eq!(resp.bytes_written, 4);
    assert_eq!(backend.log(), ["create:f:true", "write:0:4"]);
}

#[tokio::test]
async fn test_create_reports_metadata_read_after_creation() {
    let backend = Arc::new(Scripted::new());
    let bridge = scripted_bridge(backend.clone(), BridgeConfig::default()).await;

    // The scripted create reports size 0; the follow-up metadata query reports 4.
    let created = bridge.create("scr/f").await.unwrap();
    assert_eq!(created.error_code, 0);
    assert_eq!(created.metadata.unwrap().size, 4);
}

// ============================================================================
// Staging
// ============================================================================

#[tokio::test]
async fn test_staging_create_defers_backend_until_close() {
    let backend = Arc::new(Scripted::new());
    let bridge = scripted_bridge(backend.clone(), BridgeConfig::default()).await;

    let created = bridge.create("phone/new.txt").await.unwrap();
    assert_eq!(created.error_code, 0);
    let h = created.handle;

    let read = bridge.read(h, 0, 16).await.unwrap();
    assert_eq!(read.error_code, 0);
    assert!(read.data.is_empty());

    bridge.write(h, 0, b"abc".to_vec()).await.unwrap();
    bridge.write(h, 3, b"def".to_vec()).await.unwrap();
    assert_eq!(bridge.read(h, 1, 4).await.unwrap().data, b"bcde");
    assert!(backend.log().is_empty());

    assert!(bridge.close(h).await.unwrap().is_ok());
    assert_eq!(
        backend.log(),
        ["create:new.txt:false", "truncate:new.txt:0", "write:0:6"]
    );
}

#[tokio::test]
async fn test_staging_open_seeds_from_backend_on_first_write() {
    let backend = Arc::new(Scripted::new());
    let bridge = scripted_bridge(backend.clone(), BridgeConfig::default()).await;

    let h = bridge
        .open("phone/photo.jpg", OpenFlags::read_write())
        .await
        .unwrap()
        .handle;
    assert_eq!(bridge.read(h, 0, 4).await.unwrap().data, b"rrrr");
    bridge.write(h, 0, b"xy".to_vec()).await.unwrap();
    assert_eq!(bridge.read(h, 0, 4).await.unwrap().data, b"xyrr");
    bridge.close(h).await.unwrap();

    assert_eq!(
        backend.log(),
        [
            "read:0",
            "read:0",
            "create:photo.jpg:false",
            "truncate:photo.jpg:0",
            "write:0:4"
        ]
    );
}

#[tokio::test]
async fn test_staging_partial_overwrite_keeps_rest_of_file() {
    let backend = Arc::new(MemoryBackend::with_schemes(["mem", "mtp"]).with_volume("v"));
    let original = Target::parse("mem://v/f").unwrap();
    backend.create_file(&original, true).await.unwrap();
    backend.write(&original, b"original", 0).await.unwrap();

    let bridge = spawn_bridge(backend.clone(), BridgeConfig::default());
    bridge.register_prefix("phone", "mtp://v", false).await.unwrap();

    let h = bridge
        .open("phone/f", OpenFlags::read_write())
        .await
        .unwrap()
        .handle;
    assert_eq!(bridge.write(h, 3, b"X".to_vec()).await.unwrap().bytes_written, 1);
    assert_eq!(bridge.read(h, 0, 64).await.unwrap().data, b"oriXinal");
    assert!(bridge.close(h).await.unwrap().is_ok());

    let staged = Target::parse("mtp://v/f").unwrap();
    assert_eq!(backend.read(&staged, 0, 64).await.unwrap(), b"oriXinal");
}

#[tokio::test]
async fn test_staging_close_without_writes_touches_nothing() {
    let backend = Arc::new(Scripted::new());
    let bridge = scripted_bridge(backend.clone(), BridgeConfig::default()).await;
    let h = bridge.open("phone/x", OpenFlags::read()).await.unwrap().handle;
    assert!(bridge.close(h).await.unwrap().is_ok());
    assert!(backend.log().is_empty());
}

// ============================================================================
// Listing
// ============================================================================

#[tokio::test]
async fn test_listing_two_batches() {
    let backend = Arc::new(Scripted::new());
    let feed = backend.feed_listing();
    let bridge = scripted_bridge(backend, BridgeConfig::default()).await;

    let ack = bridge.read_dir(ReadDirRequest::start("scr/d")).await.unwrap();
    assert_eq!(ack.error_code, 0);
    assert!(ack.entries.is_empty());
    assert!(ack.has_more);
    let cookie = ack.cookie;
    assert_ne!(cookie, 0);

    feed.send(DirBatch::more(vec![DirEntry::file("a"), DirEntry::file("b")]))
        .unwrap();
    let page = bridge
        .read_dir(ReadDirRequest::next("scr/d", cookie))
        .await
        .unwrap();
    assert_eq!(names(&page.entries), ["a", "b"]);
    assert!(page.has_more);

    feed.send(DirBatch::last(vec![DirEntry::directory("c")]))
        .unwrap();
    let page = bridge
        .read_dir(ReadDirRequest::next("scr/d", cookie))
        .await
        .unwrap();
    assert_eq!(names(&page.entries), ["c"]);
    assert!(!page.has_more);
    assert_eq!(page.cookie, 0);

    // The cookie is dead now.
    let stale = bridge
        .read_dir(ReadDirRequest::next("scr/d", cookie))
        .await
        .unwrap();
    assert_eq!(stale.error_code, Errno::Einval.code());
}

#[tokio::test]
async fn test_listing_follow_up_waits_instead_of_spinning() {
    let backend = Arc::new(Scripted::new());
    let feed = backend.feed_listing();
    let bridge = scripted_bridge(backend, BridgeConfig::default()).await;
    let cookie = bridge
        .read_dir(ReadDirRequest::start("scr/d"))
        .await
        .unwrap()
        .cookie;

    let mut parked = Box::pin(bridge.read_dir(ReadDirRequest::next("scr/d", cookie)));
    assert!(
        tokio::time::timeout(Duration::from_millis(50), &mut parked)
            .await
            .is_err()
    );

    // A concurrent follow-up on the same cookie is refused.
    let busy = bridge
        .read_dir(ReadDirRequest::next("scr/d", cookie))
        .await
        .unwrap();
    assert_eq!(busy.error_code, Errno::Ebusy.code());

    feed.send(DirBatch::last(vec![DirEntry::file("late")]))
        .unwrap();
    let page = parked.await.unwrap();
    assert_eq!(names(&page.entries), ["late"]);
    assert!(!page.has_more);
}

#[tokio::test]
async fn test_listing_heartbeat() {
    let backend = Arc::new(Scripted::new());
    let feed = backend.feed_listing();
    let config = BridgeConfig::default().with_listing_heartbeat(2);
    let bridge = scripted_bridge(backend, config).await;
    let cookie = bridge
        .read_dir(ReadDirRequest::start("scr/d"))
        .await
        .unwrap()
        .cookie;

    let mut parked = Box::pin(bridge.read_dir(ReadDirRequest::next("scr/d", cookie)));
    assert!(poll!(&mut parked).is_pending());
    bridge.debug_tables().await.unwrap();

    feed.send(DirBatch::more(Vec::new())).unwrap();
    feed.send(DirBatch::more(Vec::new())).unwrap();
    let beat = parked.await.unwrap();
    assert_eq!(beat.error_code, 0);
    assert!(beat.entries.is_empty());
    assert!(beat.has_more);
    assert_eq!(beat.cookie, cookie);
}

#[tokio::test]
async fn test_listing_cancel() {
    let backend = Arc::new(Scripted::new());
    let _feed = backend.feed_listing();
    let bridge = scripted_bridge(backend, BridgeConfig::default()).await;
    let cookie = bridge
        .read_dir(ReadDirRequest::start("scr/d"))
        .await
        .unwrap()
        .cookie;

    let mut parked = Box::pin(bridge.read_dir(ReadDirRequest::next("scr/d", cookie)));
    assert!(poll!(&mut parked).is_pending());

    let code = Errno::Ecanceled.code();
    let cancelled = bridge
        .read_dir(ReadDirRequest::cancel("scr/d", cookie, code))
        .await
        .unwrap();
    assert_eq!(cancelled.error_code, code);
    assert_eq!(parked.await.unwrap().error_code, code);

    let tables = bridge.debug_tables().await.unwrap();
    assert_eq!(tables["listing_sessions"], 0);
}

#[tokio::test]
async fn test_listing_error_is_terminal() {
    let backend = Arc::new(Scripted::new());
    let feed = backend.feed_listing();
    let bridge = scripted_bridge(backend, BridgeConfig::default()).await;
    let cookie = bridge
        .read_dir(ReadDirRequest::start("scr/d"))
        .await
        .unwrap()
        .cookie;

    feed.send(DirBatch::failed(BackendError::not_a_directory("scr://vol/d")))
        .unwrap();
    let resp = bridge
        .read_dir(ReadDirRequest::next("scr/d", cookie))
        .await
        .unwrap();
    assert_eq!(resp.error_code, Errno::Enotdir.code());
    assert!(!resp.has_more);
}

#[tokio::test]
async fn test_listing_delivers_every_entry_once() {
    let backend = Arc::new(MemoryBackend::new().with_volume("v").with_batch_size(2));
    let bridge = spawn_bridge(backend.clone(), BridgeConfig::default());
    bridge.register_prefix("m", "mem://v", false).await.unwrap();
    for i in 0..7 {
        let h = bridge.create(&format!("m/f{i}")).await.unwrap().handle;
        bridge.close(h).await.unwrap();
    }

    let mut seen = Vec::new();
    let mut resp = bridge.read_dir(ReadDirRequest::start("m")).await.unwrap();
    while resp.error_code == 0 && resp.has_more {
        resp = bridge
            .read_dir(ReadDirRequest::next("m", resp.cookie))
            .await
            .unwrap();
        seen.extend(names(&resp.entries));
    }
    assert_eq!(resp.error_code, 0);
    let expected: Vec<String> = (0..7).map(|i| format!("f{i}")).collect();
    assert_eq!(seen, expected);
}

// ============================================================================
// Registries
// ============================================================================

#[tokio::test]
async fn test_moniker_lifecycle() {
    let backend = Arc::new(MemoryBackend::new().with_volume("vol1"));
    let bridge = spawn_bridge(backend.clone(), BridgeConfig::default());
    bridge.register_prefix("docs", "mem://vol1", false).await.unwrap();
    let h = bridge.create("docs/secret").await.unwrap().handle;
    bridge.close(h).await.unwrap();

    let target = Target::parse("mem://vol1/secret").unwrap();
    let moniker = bridge.create_moniker(target.clone(), true).await.unwrap();
    let path = moniker.virtual_path();

    let resolved = bridge.resolve(&path).await.unwrap().unwrap();
    assert_eq!(resolved.target, target);
    assert!(resolved.read_only);
    assert_eq!(bridge.stat(&path).await.unwrap().error_code, 0);
    assert_eq!(
        bridge.unlink(&path).await.unwrap().error_code,
        Errno::Eacces.code()
    );

    assert!(bridge.destroy_moniker(moniker).await.unwrap());
    assert_eq!(
        bridge.stat(&path).await.unwrap().error_code,
        Errno::Enoent.code()
    );
    assert!(!bridge.destroy_moniker(moniker).await.unwrap());
}

#[tokio::test]
async fn test_prefix_resolution() {
    let backend = Arc::new(MemoryBackend::new().with_volume("vol1"));
    let bridge = spawn_bridge(backend, BridgeConfig::default());
    bridge.register_prefix("docs", "mem://vol1", false).await.unwrap();

    let resolved = bridge.resolve("docs/a/b.txt").await.unwrap().unwrap();
    assert_eq!(resolved.target.url(), "mem://vol1/a/b.txt");
    assert!(!resolved.read_only);
    assert_eq!(
        bridge.resolve("docs/a/b.txt").await.unwrap(),
        Ok(resolved)
    );
    assert_eq!(
        bridge.resolve("other/x").await.unwrap(),
        Err(filebridge_kernel::ResolveError::NotFound)
    );

    bridge
        .register_prefix("pub", "mem://vol1/public", true)
        .await
        .unwrap();
    assert_eq!(
        bridge.resolve("pub/../private/secret").await.unwrap(),
        Err(filebridge_kernel::ResolveError::InvalidArgument)
    );
    assert_eq!(
        bridge.stat("pub/../private/secret").await.unwrap().error_code,
        Errno::Einval.code()
    );

    bridge.unregister_prefix("docs").await.unwrap();
    assert_eq!(
        bridge.resolve("docs/a/b.txt").await.unwrap(),
        Err(filebridge_kernel::ResolveError::NotFound)
    );
}

// ============================================================================
// Temp mounts
// ============================================================================

#[tokio::test]
async fn test_temp_dir_lifecycle() {
    let root = tempfile::tempdir().unwrap();
    let router = SchemeRouter::new()
        .route("mem", Arc::new(MemoryBackend::new()))
        .route_mount_host("local", Arc::new(LocalBackend::new()));
    let config = BridgeConfig::default().with_temp_root(root.path());
    let bridge = spawn_bridge(Arc::new(router), config);

    let made = bridge.make_temp_dir().await.unwrap();
    assert!(made.error_message.is_empty(), "{}", made.error_message);
    assert!(!made.virtual_path.starts_with('.'));
    assert!(made.backing_path.starts_with(root.path()));
    assert!(made.backing_path.is_dir());
    assert!(
        bridge
            .list_storages()
            .await
            .unwrap()
            .contains(&made.virtual_path)
    );

    let h = bridge
        .create(&format!("{}/out.txt", made.virtual_path))
        .await
        .unwrap()
        .handle;
    bridge.write(h, 0, b"scratch".to_vec()).await.unwrap();
    bridge.close(h).await.unwrap();
    assert_eq!(
        std::fs::read(made.backing_path.join("out.txt")).unwrap(),
        b"scratch"
    );

    bridge.remove_temp_dir(&made.virtual_path).await.unwrap();
    assert!(!made.backing_path.exists());
    assert_eq!(bridge.list_storages().await.unwrap(), ["moniker"]);

    // Unknown paths are ignored.
    bridge.remove_temp_dir("no-such-mount").await.unwrap();
}

#[tokio::test]
async fn test_temp_dir_without_mount_host_reports_error() {
    let root = tempfile::tempdir().unwrap();
    let config = BridgeConfig::default().with_temp_root(root.path());
    let bridge = spawn_bridge(Arc::new(MemoryBackend::new()), config);

    let made = bridge.make_temp_dir().await.unwrap();
    assert!(!made.error_message.is_empty());
    assert!(made.virtual_path.is_empty());
    assert!(made.backing_path.as_os_str().is_empty());
}
