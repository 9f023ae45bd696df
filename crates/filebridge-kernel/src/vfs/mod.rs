//! Backend abstraction.
//!
//! The bridge talks to storage only through the [`Backend`] trait.
//! Key components:
//!
//! - [`Backend`] - Asynchronous, target-based storage capability
//! - [`Target`] - Parsed `scheme://volume/path` backend target
//! - [`SchemeRouter`] - Routes targets to backends by URL scheme
//! - [`MemoryBackend`] - In-memory storage (scratch volumes, testing)
//! - [`LocalBackend`] - Local directories exposed as mounts
//!
//! ## Design Decisions
//!
//! - **Target-based, no handles**: Backends never see bridge handles; open
//!   state lives entirely in the bridge.
//! - **Streamed listings**: Directory listings arrive as a stream of
//!   batches so large directories never need to be buffered whole.

pub mod backends;
mod error;
mod ops;
mod router;
mod types;

pub use backends::{LocalBackend, MemoryBackend, LOCAL_SCHEME};
pub use error::{BackendError, BackendResult};
pub use ops::Backend;
pub use router::SchemeRouter;
pub use types::{DirBatch, DirEntry, FileType, Metadata, OpenFlags, Target};
