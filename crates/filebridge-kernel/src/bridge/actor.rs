//! Bridge actor: the single owner of every registry.
//!
//! Provides a cloneable `Send + Sync` [`BridgeHandle`]. The actor runs as one
//! tokio task that processes commands sequentially. Backend calls run in
//! their own tasks; stateless ones reply directly, stateful ones report back
//! to the actor as events so only the actor ever touches its tables.
//!
//! ```text
//!   BridgeHandle (Send+Sync)    mpsc       BridgeActor (one task)
//!   ┌─────────────────────┐  ────────▶  ┌──────────────────────────────┐
//!   │ .stat() .open()     │             │ MonikerMap  PrefixMap        │
//!   │ .read() .write()    │  ◀────────  │ FileHandleTable  listings    │
//!   │ .read_dir()         │   oneshot   │ temp mounts                  │
//!   └─────────────────────┘             └──────────────▲───────────────┘
//!                                                      │ events
//!                                       backend tasks ─┘
//! ```

use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use futures::FutureExt;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::errno::Errno;
use crate::vfs::{Backend, BackendResult, DirBatch, Metadata, OpenFlags, Target};

use super::handles::{FileHandleTable, PendingOp, Staging};
use super::listing::ListingSessions;
use super::moniker::{MONIKER_ROOT, Moniker, MonikerMap};
use super::prefix::{PrefixError, PrefixMap, StorageEvent};
use super::protocol::{
    CreateResponse, OpenResponse, ReadDirRequest, ReadDirResponse, ReadResponse, StatResponse,
    StatusResponse, TempDirResponse, WriteResponse,
};
use super::resolve::{self, ResolveError, Resolved};
use super::temp::{self, TempMount, TempMountRegistry};

/// Permission bits reported for the moniker root.
const MONIKER_ROOT_PERM: u32 = 0o555;

/// Permission bits reported for files created on staging targets.
const STAGED_FILE_PERM: u32 = 0o644;

// ============================================================================
// Error Type
// ============================================================================

/// Errors from the bridge handle itself. Filesystem failures are never
/// reported here; they travel as `error_code` inside responses.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge shut down")]
    Shutdown,
    #[error(transparent)]
    Prefix(#[from] PrefixError),
}

// ============================================================================
// Commands and events (internal)
// ============================================================================

enum Command {
    // Registries
    CreateMoniker {
        target: Target,
        read_only: bool,
        reply: oneshot::Sender<Moniker>,
    },
    DestroyMoniker {
        moniker: Moniker,
        reply: oneshot::Sender<bool>,
    },
    RegisterPrefix {
        subdir: String,
        backend_prefix: String,
        read_only: bool,
        reply: oneshot::Sender<Result<(), PrefixError>>,
    },
    UnregisterPrefix {
        subdir: String,
        reply: oneshot::Sender<bool>,
    },
    Resolve {
        path: String,
        reply: oneshot::Sender<Result<Resolved, ResolveError>>,
    },
    ListStorages {
        reply: oneshot::Sender<Vec<String>>,
    },
    DebugTables {
        reply: oneshot::Sender<serde_json::Value>,
    },

    // Stateless
    Stat {
        path: String,
        reply: oneshot::Sender<StatResponse>,
    },
    Mkdir {
        path: String,
        reply: oneshot::Sender<StatusResponse>,
    },
    Rmdir {
        path: String,
        reply: oneshot::Sender<StatusResponse>,
    },
    Unlink {
        path: String,
        reply: oneshot::Sender<StatusResponse>,
    },
    Truncate {
        path: String,
        length: u64,
        reply: oneshot::Sender<StatusResponse>,
    },

    // Handles
    Open {
        path: String,
        flags: OpenFlags,
        reply: oneshot::Sender<OpenResponse>,
    },
    Create {
        path: String,
        reply: oneshot::Sender<CreateResponse>,
    },
    Read {
        handle: u64,
        offset: u64,
        length: u32,
        reply: oneshot::Sender<ReadResponse>,
    },
    Write {
        handle: u64,
        offset: u64,
        data: Vec<u8>,
        reply: oneshot::Sender<WriteResponse>,
    },
    Close {
        handle: u64,
        reply: oneshot::Sender<StatusResponse>,
    },

    // Listing
    ReadDir {
        request: ReadDirRequest,
        reply: oneshot::Sender<ReadDirResponse>,
    },

    // Temp mounts
    MakeTempDir {
        reply: oneshot::Sender<TempDirResponse>,
    },
    RemoveTempDir {
        virtual_path: String,
        reply: oneshot::Sender<()>,
    },
}

/// Completions marshalled back onto the actor.
enum Event {
    Opened {
        handle: u64,
        result: BackendResult<Metadata>,
        reply: oneshot::Sender<OpenResponse>,
    },
    Created {
        handle: u64,
        result: BackendResult<Metadata>,
        reply: oneshot::Sender<CreateResponse>,
    },
    ReadDone {
        handle: u64,
        result: BackendResult<Vec<u8>>,
        reply: oneshot::Sender<ReadResponse>,
    },
    WriteDone {
        handle: u64,
        result: BackendResult<u64>,
        reply: oneshot::Sender<WriteResponse>,
    },
    ListingBatch {
        cookie: u64,
        batch: DirBatch,
    },
    TempDirCreated {
        result: std::io::Result<TempDir>,
        reply: oneshot::Sender<TempDirResponse>,
    },
}

// ============================================================================
// BridgeHandle (Send + Sync public API)
// ============================================================================

/// Cloneable handle to a running bridge.
///
/// Each method sends a command and awaits the reply. The bridge stops once
/// every handle has been dropped.
#[derive(Clone)]
pub struct BridgeHandle {
    tx: mpsc::UnboundedSender<Command>,
    storage_events: broadcast::Sender<StorageEvent>,
}

impl std::fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Spawn a bridge over `backend` on the current tokio runtime.
pub fn spawn_bridge(backend: Arc<dyn Backend>, config: BridgeConfig) -> BridgeHandle {
    let (tx, commands) = mpsc::unbounded_channel();
    let (events_tx, events) = mpsc::unbounded_channel();
    let (storage_events, _) = broadcast::channel(config.event_capacity.max(1));

    let actor = BridgeActor {
        listings: ListingSessions::new(config.listing_heartbeat_batches),
        prefixes: PrefixMap::new(storage_events.clone()),
        monikers: MonikerMap::new(),
        handles: FileHandleTable::new(),
        closing: HashMap::new(),
        temp_mounts: TempMountRegistry::new(),
        backend,
        config,
        events: events_tx,
    };
    tokio::spawn(actor.run(commands, events));

    BridgeHandle { tx, storage_events }
}

impl BridgeHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| BridgeError::Shutdown)?;
        rx.await.map_err(|_| BridgeError::Shutdown)
    }

    /// Subscribe to prefix attach/detach notifications.
    pub fn subscribe_storage_events(&self) -> broadcast::Receiver<StorageEvent> {
        self.storage_events.subscribe()
    }

    // ── Registries ───────────────────────────────────────────────────────

    /// Mint a moniker for `target`.
    pub async fn create_moniker(
        &self,
        target: Target,
        read_only: bool,
    ) -> Result<Moniker, BridgeError> {
        self.call(|reply| Command::CreateMoniker {
            target,
            read_only,
            reply,
        })
        .await
    }

    /// Revoke a moniker. Returns `false` if it was unknown.
    pub async fn destroy_moniker(&self, moniker: Moniker) -> Result<bool, BridgeError> {
        self.call(|reply| Command::DestroyMoniker { moniker, reply })
            .await
    }

    /// Expose `backend_prefix` under the top-level name `subdir`.
    pub async fn register_prefix(
        &self,
        subdir: &str,
        backend_prefix: &str,
        read_only: bool,
    ) -> Result<(), BridgeError> {
        self.call(|reply| Command::RegisterPrefix {
            subdir: subdir.to_string(),
            backend_prefix: backend_prefix.to_string(),
            read_only,
            reply,
        })
        .await??;
        Ok(())
    }

    /// Remove a prefix. Returns `false` if it was not registered.
    pub async fn unregister_prefix(&self, subdir: &str) -> Result<bool, BridgeError> {
        self.call(|reply| Command::UnregisterPrefix {
            subdir: subdir.to_string(),
            reply,
        })
        .await
    }

    /// Resolve a virtual path without touching the backend.
    pub async fn resolve(&self, path: &str) -> Result<Result<Resolved, ResolveError>, BridgeError> {
        self.call(|reply| Command::Resolve {
            path: path.to_string(),
            reply,
        })
        .await
    }

    /// Active top-level names, including the moniker root.
    pub async fn list_storages(&self) -> Result<Vec<String>, BridgeError> {
        self.call(|reply| Command::ListStorages { reply }).await
    }

    /// Snapshot of the bridge's tables for diagnostics.
    pub async fn debug_tables(&self) -> Result<serde_json::Value, BridgeError> {
        self.call(|reply| Command::DebugTables { reply }).await
    }

    // ── Stateless operations ─────────────────────────────────────────────

    pub async fn stat(&self, path: &str) -> Result<StatResponse, BridgeError> {
        self.call(|reply| Command::Stat {
            path: path.to_string(),
            reply,
        })
        .await
    }

    pub async fn mkdir(&self, path: &str) -> Result<StatusResponse, BridgeError> {
        self.call(|reply| Command::Mkdir {
            path: path.to_string(),
            reply,
        })
        .await
    }

    pub async fn rmdir(&self, path: &str) -> Result<StatusResponse, BridgeError> {
        self.call(|reply| Command::Rmdir {
            path: path.to_string(),
            reply,
        })
        .await
    }

    pub async fn unlink(&self, path: &str) -> Result<StatusResponse, BridgeError> {
        self.call(|reply| Command::Unlink {
            path: path.to_string(),
            reply,
        })
        .await
    }

    pub async fn truncate(&self, path: &str, length: u64) -> Result<StatusResponse, BridgeError> {
        self.call(|reply| Command::Truncate {
            path: path.to_string(),
            length,
            reply,
        })
        .await
    }

    // ── Handles ──────────────────────────────────────────────────────────

    /// Open an existing file.
    pub async fn open(&self, path: &str, flags: OpenFlags) -> Result<OpenResponse, BridgeError> {
        self.call(|reply| Command::Open {
            path: path.to_string(),
            flags,
            reply,
        })
        .await
    }

    /// Create a new file (exclusive) and open it read-write.
    pub async fn create(&self, path: &str) -> Result<CreateResponse, BridgeError> {
        self.call(|reply| Command::Create {
            path: path.to_string(),
            reply,
        })
        .await
    }

    pub async fn read(
        &self,
        handle: u64,
        offset: u64,
        length: u32,
    ) -> Result<ReadResponse, BridgeError> {
        self.call(|reply| Command::Read {
            handle,
            offset,
            length,
            reply,
        })
        .await
    }

    pub async fn write(
        &self,
        handle: u64,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<WriteResponse, BridgeError> {
        self.call(|reply| Command::Write {
            handle,
            offset,
            data,
            reply,
        })
        .await
    }

    /// Close a handle. Queued ops on it fail with `EBUSY`.
    pub async fn close(&self, handle: u64) -> Result<StatusResponse, BridgeError> {
        self.call(|reply| Command::Close { handle, reply }).await
    }

    // ── Listing ──────────────────────────────────────────────────────────

    pub async fn read_dir(&self, request: ReadDirRequest) -> Result<ReadDirResponse, BridgeError> {
        self.call(|reply| Command::ReadDir { request, reply })
            .await
    }

    // ── Temp mounts ──────────────────────────────────────────────────────

    pub async fn make_temp_dir(&self) -> Result<TempDirResponse, BridgeError> {
        self.call(|reply| Command::MakeTempDir { reply }).await
    }

    /// Remove a temp mount. Unknown paths are ignored.
    pub async fn remove_temp_dir(&self, virtual_path: &str) -> Result<(), BridgeError> {
        self.call(|reply| Command::RemoveTempDir {
            virtual_path: virtual_path.to_string(),
            reply,
        })
        .await
    }
}

// ============================================================================
// BridgeActor
// ============================================================================

/// Close of a staging handle waiting for its in-flight op.
struct PendingClose {
    target: Target,
    staging: Arc<Staging>,
    reply: oneshot::Sender<StatusResponse>,
}

struct BridgeActor {
    backend: Arc<dyn Backend>,
    config: BridgeConfig,
    monikers: MonikerMap,
    prefixes: PrefixMap,
    handles: FileHandleTable,
    closing: HashMap<u64, PendingClose>,
    listings: ListingSessions,
    temp_mounts: TempMountRegistry,
    events: mpsc::UnboundedSender<Event>,
}

impl BridgeActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        tracing::debug!("bridge actor started");
        loop {
            tokio::select! {
                biased;
                Some(event) = events.recv() => self.handle_event(event),
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
        }
        self.shutdown();
        tracing::debug!("bridge actor stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::CreateMoniker {
                target,
                read_only,
                reply,
            } => {
                let moniker = self.monikers.create(target, read_only);
                tracing::info!(%moniker, read_only, "moniker created");
                let _ = reply.send(moniker);
            }
            Command::DestroyMoniker { moniker, reply } => {
                let existed = self.monikers.destroy(&moniker);
                tracing::info!(%moniker, existed, "moniker destroyed");
                let _ = reply.send(existed);
            }
            Command::RegisterPrefix {
                subdir,
                backend_prefix,
                read_only,
                reply,
            } => {
                let _ = reply.send(self.prefixes.register(&subdir, &backend_prefix, read_only));
            }
            Command::UnregisterPrefix { subdir, reply } => {
                let _ = reply.send(self.prefixes.unregister(&subdir));
            }
            Command::Resolve { path, reply } => {
                let _ = reply.send(self.resolve(&path));
            }
            Command::ListStorages { reply } => {
                let mut names = self.prefixes.list_active();
                names.push(MONIKER_ROOT.to_string());
                let _ = reply.send(names);
            }
            Command::DebugTables { reply } => {
                let _ = reply.send(self.debug_tables());
            }

            Command::Stat { path, reply } => self.stat(&path, reply),
            Command::Mkdir { path, reply } => self.run_status(&path, reply, |backend, target| {
                async move { backend.create_directory(&target, true, false).await }.boxed()
            }),
            Command::Rmdir { path, reply } => self.run_status(&path, reply, |backend, target| {
                async move { backend.remove_directory(&target).await }.boxed()
            }),
            Command::Unlink { path, reply } => self.run_status(&path, reply, |backend, target| {
                async move { backend.remove_file(&target).await }.boxed()
            }),
            Command::Truncate {
                path,
                length,
                reply,
            } => self.run_status(&path, reply, move |backend, target| {
                async move { backend.truncate(&target, length).await }.boxed()
            }),

            Command::Open { path, flags, reply } => self.open(&path, flags, reply),
            Command::Create { path, reply } => self.create(&path, reply),
            Command::Read {
                handle,
                offset,
                length,
                reply,
            } => self.read(handle, offset, length, reply),
            Command::Write {
                handle,
                offset,
                data,
                reply,
            } => self.write(handle, offset, data, reply),
            Command::Close { handle, reply } => self.close(handle, reply),

            Command::ReadDir { request, reply } => self.read_dir(request, reply),

            Command::MakeTempDir { reply } => self.make_temp_dir(reply),
            Command::RemoveTempDir {
                virtual_path,
                reply,
            } => self.remove_temp_dir(&virtual_path, reply),
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Opened {
                handle,
                result,
                reply,
            } => self.on_opened(handle, result, reply),
            Event::Created {
                handle,
                result,
                reply,
            } => self.on_created(handle, result, reply),
            Event::ReadDone {
                handle,
                result,
                reply,
            } => {
                let response = match result {
                    Ok(data) => ReadResponse::ok(data),
                    Err(e) => {
                        tracing::warn!(handle, error = %e, "read failed");
                        ReadResponse::error(e.errno())
                    }
                };
                let _ = reply.send(response);
                self.finish_op(handle);
            }
            Event::WriteDone {
                handle,
                result,
                reply,
            } => {
                let response = match result {
                    Ok(n) => WriteResponse::ok(n),
                    Err(e) => {
                        tracing::warn!(handle, error = %e, "write failed");
                        WriteResponse::error(e.errno())
                    }
                };
                let _ = reply.send(response);
                self.finish_op(handle);
            }
            Event::ListingBatch { cookie, batch } => self.listings.on_batch(cookie, batch),
            Event::TempDirCreated { result, reply } => self.on_temp_dir_created(result, reply),
        }
    }

    // ── Resolution ───────────────────────────────────────────────────────

    fn resolve(&self, path: &str) -> Result<Resolved, ResolveError> {
        resolve::resolve(path, &self.monikers, &self.prefixes, self.backend.as_ref())
    }

    /// Resolve for an operation that modifies the target.
    fn resolve_writable(&self, path: &str) -> Result<Target, Errno> {
        let resolved = self.resolve(path).map_err(ResolveError::errno)?;
        if resolved.read_only {
            return Err(Errno::Eacces);
        }
        Ok(resolved.target)
    }

    // ── Stateless operations ─────────────────────────────────────────────

    fn stat(&self, path: &str, reply: oneshot::Sender<StatResponse>) {
        let resolved = match self.resolve(path) {
            Ok(resolved) => resolved,
            Err(ResolveError::MonikerRoot) => {
                let _ = reply.send(StatResponse::ok(Metadata::directory(MONIKER_ROOT_PERM)));
                return;
            }
            Err(e) => {
                let _ = reply.send(StatResponse::error(e.errno()));
                return;
            }
        };

        tracing::debug!(url = %resolved.target, "stat");
        let backend = Arc::clone(&self.backend);
        tokio::spawn(async move {
            let response = match backend.get_metadata(&resolved.target).await {
                Ok(meta) if resolved.read_only => StatResponse::ok(meta.read_only()),
                Ok(meta) => StatResponse::ok(meta),
                Err(e) => StatResponse::error(e.errno()),
            };
            let _ = reply.send(response);
        });
    }

    /// Run a mutating, payload-free backend call and reply from its task.
    fn run_status<F>(&self, path: &str, reply: oneshot::Sender<StatusResponse>, op: F)
    where
        F: FnOnce(Arc<dyn Backend>, Target) -> BoxFuture<'static, BackendResult<()>>,
    {
        let target = match self.resolve_writable(path) {
            Ok(target) => target,
            Err(code) => {
                let _ = reply.send(StatusResponse::error(code));
                return;
            }
        };

        tracing::debug!(url = %target, "namespace op");
        let fut = op(Arc::clone(&self.backend), target);
        tokio::spawn(async move {
            let result = fut.await;
            if let Err(e) = &result {
                tracing::debug!(error = %e, "namespace op failed");
            }
            let _ = reply.send(StatusResponse::from_result(result));
        });
    }

    // ── Open / Create ────────────────────────────────────────────────────

    fn open(&mut self, path: &str, flags: OpenFlags, reply: oneshot::Sender<OpenResponse>) {
        if !flags.read && !flags.write {
            let _ = reply.send(OpenResponse::error(Errno::Einval));
            return;
        }
        let resolved = match self.resolve(path) {
            Ok(resolved) => resolved,
            Err(e) => {
                let _ = reply.send(OpenResponse::error(e.errno()));
                return;
            }
        };
        let writable = flags.write && !resolved.read_only;
        if !flags.read && !writable {
            let _ = reply.send(OpenResponse::error(Errno::Eacces));
            return;
        }

        let target = resolved.target;
        if self.config.uses_staging(target.scheme()) {
            let staging = Arc::new(Staging::new(false));
            let handle = self
                .handles
                .insert(target, flags.read, writable, Some(staging), false);
            tracing::debug!(handle, "opened staging handle");
            let _ = reply.send(OpenResponse::ok(handle));
            return;
        }

        // Insert now; roll back if the existence check fails.
        let handle = self
            .handles
            .insert(target.clone(), flags.read, writable, None, true);
        let backend = Arc::clone(&self.backend);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = backend.get_metadata(&target).await;
            let _ = events.send(Event::Opened {
                handle,
                result,
                reply,
            });
        });
    }

    fn on_opened(
        &mut self,
        handle: u64,
        result: BackendResult<Metadata>,
        reply: oneshot::Sender<OpenResponse>,
    ) {
        let outcome = match result {
            Ok(meta) if meta.is_dir() => Err(Errno::Eisdir),
            Ok(_) => Ok(()),
            Err(e) => Err(e.errno()),
        };
        match outcome {
            Ok(()) if self.handles.get(handle).is_some() => {
                tracing::debug!(handle, "opened");
                self.finish_op(handle);
                let _ = reply.send(OpenResponse::ok(handle));
            }
            Ok(()) => {
                let _ = reply.send(OpenResponse::error(Errno::Enoent));
            }
            Err(code) => {
                self.discard_handle(handle);
                let _ = reply.send(OpenResponse::error(code));
            }
        }
    }

    fn create(&mut self, path: &str, reply: oneshot::Sender<CreateResponse>) {
        let target = match self.resolve_writable(path) {
            Ok(target) => target,
            Err(code) => {
                let _ = reply.send(CreateResponse::error(code));
                return;
            }
        };

        if self.config.uses_staging(target.scheme()) {
            // Nothing reaches the backend until close.
            let staging = Arc::new(Staging::new(true));
            let handle = self.handles.insert(target, true, true, Some(staging), false);
            tracing::debug!(handle, "created staging handle");
            let _ = reply.send(CreateResponse::ok(
                handle,
                Metadata::file(0, STAGED_FILE_PERM),
            ));
            return;
        }

        let handle = self.handles.insert(target.clone(), true, true, None, true);
        let backend = Arc::clone(&self.backend);
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = match backend.create_file(&target, true).await {
                Ok(_) => backend.get_metadata(&target).await,
                Err(e) => Err(e),
            };
            let _ = events.send(Event::Created {
                handle,
                result,
                reply,
            });
        });
    }

    fn on_created(
        &mut self,
        handle: u64,
        result: BackendResult<Metadata>,
        reply: oneshot::Sender<CreateResponse>,
    ) {
        match result {
            Ok(meta) if self.handles.get(handle).is_some() => {
                tracing::debug!(handle, "created");
                self.finish_op(handle);
                let _ = reply.send(CreateResponse::ok(handle, meta));
            }
            Ok(_) => {
                let _ = reply.send(CreateResponse::error(Errno::Enoent));
            }
            Err(e) => {
                self.discard_handle(handle);
                let _ = reply.send(CreateResponse::error(e.errno()));
            }
        }
    }

    /// Roll back a handle whose open/create failed.
    fn discard_handle(&mut self, handle: u64) {
        if let Some(mut file) = self.handles.remove(handle) {
            for op in file.take_pending() {
                op.reject(Errno::Ebusy.code());
            }
        }
    }

    // ── Read / Write / Close ─────────────────────────────────────────────

    fn read(&mut self, handle: u64, offset: u64, length: u32, reply: oneshot::Sender<ReadResponse>) {
        match self.handles.get(handle) {
            None => {
                let _ = reply.send(ReadResponse::error(Errno::Enoent));
                return;
            }
            Some(file) if !file.readable => {
                let _ = reply.send(ReadResponse::error(Errno::Eacces));
                return;
            }
            Some(_) => {}
        }
        self.submit(
            handle,
            PendingOp::Read {
                offset,
                length,
                reply,
            },
        );
    }

    fn write(
        &mut self,
        handle: u64,
        offset: u64,
        data: Vec<u8>,
        reply: oneshot::Sender<WriteResponse>,
    ) {
        if data.len() > self.config.max_write_size {
            let _ = reply.send(WriteResponse::error(Errno::Emsgsize));
            return;
        }
        match self.handles.get(handle) {
            None => {
                let _ = reply.send(WriteResponse::error(Errno::Enoent));
                return;
            }
            Some(file) if !file.writable => {
                let _ = reply.send(WriteResponse::error(Errno::Eacces));
                return;
            }
            Some(_) => {}
        }
        self.submit(
            handle,
            PendingOp::Write {
                offset,
                data,
                reply,
            },
        );
    }

    fn submit(&mut self, handle: u64, op: PendingOp) {
        match self.handles.submit(handle, op) {
            Ok(Some(op)) => self.dispatch(handle, op),
            Ok(None) => {}
            Err(op) => op.reject(Errno::Enoent.code()),
        }
    }

    /// Start `op` against the backend. The handle must already be marked busy.
    fn dispatch(&self, handle: u64, op: PendingOp) {
        let Some(file) = self.handles.get(handle) else {
            op.reject(Errno::Enoent.code());
            return;
        };
        let target = file.target.clone();
        let staging = file.staging.clone();
        let backend = Arc::clone(&self.backend);
        let events = self.events.clone();

        match op {
            PendingOp::Read {
                offset,
                length,
                reply,
            } => {
                tracing::debug!(handle, offset, length, "dispatch read");
                tokio::spawn(async move {
                    let result = match &staging {
                        Some(staging) => {
                            staging.read(backend.as_ref(), &target, offset, length).await
                        }
                        None => backend.read(&target, offset, length).await,
                    };
                    let _ = events.send(Event::ReadDone {
                        handle,
                        result,
                        reply,
                    });
                });
            }
            PendingOp::Write {
                offset,
                data,
                reply,
            } => {
                tracing::debug!(handle, offset, len = data.len(), "dispatch write");
                tokio::spawn(async move {
                    let result = match &staging {
                        Some(staging) => {
                            staging.write(backend.as_ref(), &target, &data, offset).await
                        }
                        None => backend.write(&target, &data, offset).await,
                    };
                    let _ = events.send(Event::WriteDone {
                        handle,
                        result,
                        reply,
                    });
                });
            }
        }
    }

    /// The in-flight op on `handle` finished: start the next queued op, or
    /// run a close that was waiting for it.
    fn finish_op(&mut self, handle: u64) {
        if let Some(next) = self.handles.complete(handle) {
            self.dispatch(handle, next);
        } else if let Some(close) = self.closing.remove(&handle) {
            self.spawn_flush(handle, close);
        }
    }

    fn close(&mut self, handle: u64, reply: oneshot::Sender<StatusResponse>) {
        let Some(mut file) = self.handles.remove(handle) else {
            let _ = reply.send(StatusResponse::error(Errno::Enoent));
            return;
        };

        let pending = file.take_pending();
        let busy = file.in_flight();
        tracing::debug!(handle, failed = pending.len(), "close");
        for op in pending {
            op.reject(Errno::Ebusy.code());
        }

        match file.staging {
            Some(staging) if file.writable => {
                let close = PendingClose {
                    target: file.target,
                    staging,
                    reply,
                };
                if busy {
                    // Flush after the dispatched op lands in the staging file.
                    self.closing.insert(handle, close);
                } else {
                    self.spawn_flush(handle, close);
                }
            }
            _ => {
                let _ = reply.send(StatusResponse::ok());
            }
        }
    }

    fn spawn_flush(&self, handle: u64, close: PendingClose) {
        let backend = Arc::clone(&self.backend);
        tokio::spawn(async move {
            let result = close.staging.flush(backend.as_ref(), &close.target).await;
            if let Err(e) = &result {
                tracing::warn!(handle, url = %close.target, error = %e, "staging flush failed");
            }
            let _ = close.reply.send(StatusResponse::from_result(result));
        });
    }

    // ── Listing ──────────────────────────────────────────────────────────

    fn read_dir(&mut self, request: ReadDirRequest, reply: oneshot::Sender<ReadDirResponse>) {
        if request.cancel_error_code != 0 {
            self.listings
                .cancel(request.cookie, request.cancel_error_code, reply);
            return;
        }
        if request.cookie != 0 {
            self.listings.next_page(request.cookie, reply);
            return;
        }

        let target = match self.resolve(&request.path) {
            Ok(resolved) => resolved.target,
            Err(ResolveError::MonikerRoot) => {
                let _ = reply.send(ReadDirResponse::done());
                return;
            }
            Err(e) => {
                let _ = reply.send(ReadDirResponse::error(e.errno()));
                return;
            }
        };

        let cancel = CancellationToken::new();
        let cookie = self.listings.start(cancel.clone());
        tracing::debug!(cookie, url = %target, "listing started");
        let stream = self.backend.list_directory(&target);
        tokio::spawn(pump_listing(cookie, stream, cancel, self.events.clone()));
        let _ = reply.send(ReadDirResponse::ack(cookie));
    }

    // ── Temp mounts ──────────────────────────────────────────────────────

    fn make_temp_dir(&self, reply: oneshot::Sender<TempDirResponse>) {
        let root = self.config.temp_root();
        let prefix = self.config.temp_prefix.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || temp::create_dir(root, prefix))
                .await
                .unwrap_or_else(|e| Err(std::io::Error::other(e)));
            let _ = events.send(Event::TempDirCreated { result, reply });
        });
    }

    fn on_temp_dir_created(
        &mut self,
        result: std::io::Result<TempDir>,
        reply: oneshot::Sender<TempDirResponse>,
    ) {
        let dir = match result {
            Ok(dir) => dir,
            Err(e) => {
                tracing::warn!(error = %e, "temp dir creation failed");
                let _ = reply.send(TempDirResponse::error(format!(
                    "failed to create temp dir: {e}"
                )));
                return;
            }
        };

        let subdir = match temp::subdir_for(dir.path()) {
            Some(subdir) if self.prefixes.lookup(&subdir).is_none() => subdir,
            _ => {
                let message = format!("unusable temp dir name: {}", dir.path().display());
                delete_in_background(dir);
                let _ = reply.send(TempDirResponse::error(message));
                return;
            }
        };

        let backend_prefix = match self.backend.register_mount(&subdir, dir.path()) {
            Ok(prefix) => prefix,
            Err(e) => {
                tracing::warn!(error = %e, "temp mount registration failed");
                delete_in_background(dir);
                let _ = reply.send(TempDirResponse::error(format!(
                    "failed to mount temp dir: {e}"
                )));
                return;
            }
        };

        if let Err(e) = self.prefixes.register(&subdir, &backend_prefix, false) {
            let _ = self.backend.revoke_mount(&subdir);
            delete_in_background(dir);
            let _ = reply.send(TempDirResponse::error(e.to_string()));
            return;
        }

        let backing_path = dir.path().to_path_buf();
        tracing::info!(%subdir, path = %backing_path.display(), "temp mount created");
        self.temp_mounts.insert(
            subdir.clone(),
            TempMount {
                dir,
                backend_prefix,
            },
        );
        let _ = reply.send(TempDirResponse::ok(subdir, backing_path));
    }

    fn remove_temp_dir(&mut self, virtual_path: &str, reply: oneshot::Sender<()>) {
        let Some((subdir, mount)) = self.temp_mounts.remove(virtual_path) else {
            let _ = reply.send(());
            return;
        };

        self.prefixes.unregister(&subdir);
        if let Err(e) = self.backend.revoke_mount(&subdir) {
            tracing::warn!(%subdir, error = %e, "temp mount revoke failed");
        }
        tracing::info!(%subdir, "temp mount removed");

        tokio::spawn(async move {
            let path = mount.backing_path().to_path_buf();
            match tokio::task::spawn_blocking(move || mount.dir.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(path = %path.display(), error = %e, "temp dir removal failed")
                }
                Err(e) => tracing::warn!(error = %e, "temp dir removal task failed"),
            }
            let _ = reply.send(());
        });
    }

    // ── Introspection / shutdown ─────────────────────────────────────────

    fn debug_tables(&self) -> serde_json::Value {
        let prefixes: Vec<_> = self
            .prefixes
            .iter()
            .map(|e| {
                json!({
                    "subdir": e.subdir,
                    "backend_prefix": e.backend_prefix,
                    "read_only": e.read_only,
                })
            })
            .collect();

        let mut monikers: Vec<_> = self
            .monikers
            .iter()
            .map(|(m, e)| {
                json!({
                    "moniker": m.to_string(),
                    "target": e.target.url(),
                    "read_only": e.read_only,
                })
            })
            .collect();
        monikers.sort_by(|a, b| a["moniker"].as_str().cmp(&b["moniker"].as_str()));

        let temp_mounts: Vec<_> = self
            .temp_mounts
            .iter()
            .map(|(subdir, m)| {
                json!({
                    "subdir": subdir,
                    "backend_prefix": m.backend_prefix,
                    "backing_path": m.backing_path().display().to_string(),
                })
            })
            .collect();

        json!({
            "prefixes": prefixes,
            "monikers": monikers,
            "open_handles": self.handles.len(),
            "listing_sessions": self.listings.len(),
            "temp_mounts": temp_mounts,
        })
    }

    fn shutdown(&mut self) {
        self.listings.cancel_all();
        for (subdir, mount) in self.temp_mounts.drain() {
            self.prefixes.unregister(&subdir);
            let _ = self.backend.revoke_mount(&subdir);
            delete_in_background(mount.dir);
        }
    }
}

/// Forward a backend listing stream to the actor until it ends or the
/// session is cancelled.
async fn pump_listing(
    cookie: u64,
    mut stream: BoxStream<'static, DirBatch>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<Event>,
) {
    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => return,
            next = stream.next() => next.unwrap_or_else(|| DirBatch::last(Vec::new())),
        };
        let last = !batch.has_more || batch.error.is_some();
        if events.send(Event::ListingBatch { cookie, batch }).is_err() || last {
            return;
        }
    }
}

/// Delete a temp dir without blocking the actor.
fn delete_in_background(dir: TempDir) {
    tokio::task::spawn_blocking(move || {
        if let Err(e) = dir.close() {
            tracing::warn!(error = %e, "temp dir cleanup failed");
        }
    });
}
