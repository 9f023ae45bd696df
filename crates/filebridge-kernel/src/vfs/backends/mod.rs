//! Backends.
//!
//! Backends implement [`Backend`](super::Backend) for different storage types.

mod local;
mod memory;

pub use local::{LocalBackend, LOCAL_SCHEME};
pub use memory::MemoryBackend;
