//! The bridge: a virtual namespace over backend targets.
//!
//! Key components:
//!
//! - [`BridgeHandle`] - Cloneable entry point; every operation goes through it
//! - [`MonikerMap`] - Opaque capability tokens for single targets
//! - [`PrefixMap`] - Top-level names mapped to backend prefixes
//! - [`resolve()`] - Virtual path to backend target resolution
//! - [`FileHandleTable`] - Open handles with one op in flight each
//! - [`ListingSessions`] - Cookie-based paginated directory listings
//! - [`TempMountRegistry`] - Ephemeral local directories exposed as prefixes
//!
//! ## Design Decisions
//!
//! - **Single owner**: one actor task owns every table, so none of them
//!   need locks. Backend completions are sent back to it as events.
//! - **Errors as data**: filesystem failures travel as POSIX codes inside
//!   responses; [`BridgeError`] only reports a stopped bridge.

mod actor;
mod handles;
mod listing;
mod moniker;
mod prefix;
pub mod protocol;
mod resolve;
mod temp;

pub use actor::{BridgeError, BridgeHandle, spawn_bridge};
pub use handles::{FileHandleTable, OpenFile, PendingOp, Staging};
pub use listing::ListingSessions;
pub use moniker::{MONIKER_ROOT, Moniker, MonikerEntry, MonikerMap};
pub use prefix::{PrefixError, PrefixMap, PrefixMapEntry, StorageEvent};
pub use protocol::{
    CreateResponse, OpenResponse, ReadDirRequest, ReadDirResponse, ReadResponse, StatResponse,
    StatusResponse, TempDirResponse, WriteResponse,
};
pub use resolve::{ResolveError, Resolved, resolve};
pub use temp::{TempMount, TempMountRegistry};
