//! Filebridge kernel: a virtual file-operation bridge.
//!
//! Exposes a unified namespace of virtual paths (`<subdir>/<rest>` and
//! `moniker/<token>`) over pluggable storage backends, with open-handle
//! semantics, serialized per-handle I/O and paginated directory listings.
//!
//! ```no_run
//! use std::sync::Arc;
//! use filebridge_kernel::{BridgeConfig, MemoryBackend, OpenFlags, spawn_bridge};
//!
//! # async fn demo() -> Result<(), filebridge_kernel::BridgeError> {
//! let backend = Arc::new(MemoryBackend::new().with_volume("vol1"));
//! let bridge = spawn_bridge(backend, BridgeConfig::default());
//! bridge.register_prefix("docs", "mem://vol1", false).await?;
//!
//! let created = bridge.create("docs/notes.txt").await?;
//! bridge.write(created.handle, 0, b"hello".to_vec()).await?;
//! bridge.close(created.handle).await?;
//!
//! let opened = bridge.open("docs/notes.txt", OpenFlags::read()).await?;
//! let read = bridge.read(opened.handle, 0, 64).await?;
//! assert_eq!(read.data, b"hello");
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod errno;
pub mod vfs;

pub use bridge::{
    BridgeError, BridgeHandle, CreateResponse, Moniker, OpenResponse, ReadDirRequest,
    ReadDirResponse, ReadResponse, ResolveError, Resolved, StatResponse, StatusResponse,
    StorageEvent, TempDirResponse, WriteResponse, spawn_bridge,
};
pub use config::BridgeConfig;
pub use errno::Errno;
pub use vfs::{
    Backend, BackendError, BackendResult, DirBatch, DirEntry, FileType, LocalBackend,
    MemoryBackend, Metadata, OpenFlags, SchemeRouter, Target,
};
