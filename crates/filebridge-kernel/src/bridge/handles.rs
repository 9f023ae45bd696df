//! Open file handles: capabilities, per-handle op queues, and staging files.
//!
//! The table itself is plain data owned by the bridge actor. It enforces the
//! one-op-in-flight rule: [`FileHandleTable::submit`] hands back an op only
//! when the handle is idle, and [`FileHandleTable::complete`] pops the next
//! queued op once the current one finishes.

use std::collections::{HashMap, VecDeque};
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, oneshot};

use crate::vfs::{Backend, BackendError, BackendResult, Target};

/// Chunk size used when copying a backend file into a staging file.
const SEED_CHUNK: u32 = 64 * 1024;

use super::protocol::{ReadResponse, WriteResponse};

/// A read or write waiting for its turn on a handle.
#[derive(Debug)]
pub enum PendingOp {
    Read {
        offset: u64,
        length: u32,
        reply: oneshot::Sender<ReadResponse>,
    },
    Write {
        offset: u64,
        data: Vec<u8>,
        reply: oneshot::Sender<WriteResponse>,
    },
}

impl PendingOp {
    /// Answer the op without running it.
    pub fn reject(self, code: i32) {
        match self {
            PendingOp::Read { reply, .. } => {
                let _ = reply.send(ReadResponse::error(code));
            }
            PendingOp::Write { reply, .. } => {
                let _ = reply.send(WriteResponse::error(code));
            }
        }
    }
}

/// Per-handle state.
#[derive(Debug)]
pub struct OpenFile {
    pub target: Target,
    pub readable: bool,
    pub writable: bool,
    /// Present when the target's backend forbids incremental writes.
    pub staging: Option<Arc<Staging>>,
    in_flight: bool,
    pending: VecDeque<PendingOp>,
}

impl OpenFile {
    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    #[cfg(test)]
    pub fn queued(&self) -> usize {
        self.pending.len()
    }

    /// Drain queued ops, leaving the queue empty.
    pub fn take_pending(&mut self) -> VecDeque<PendingOp> {
        std::mem::take(&mut self.pending)
    }
}

/// Handle → open file table.
#[derive(Debug)]
pub struct FileHandleTable {
    files: HashMap<u64, OpenFile>,
    next_handle: u64,
}

impl Default for FileHandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FileHandleTable {
    pub fn new() -> Self {
        Self {
            files: HashMap::new(),
            next_handle: 1,
        }
    }

    /// Allocate a handle for `target`.
    ///
    /// With `busy`, the handle starts with an op in flight (an existence
    /// check or create that must finish before any read or write runs).
    pub fn insert(
        &mut self,
        target: Target,
        readable: bool,
        writable: bool,
        staging: Option<Arc<Staging>>,
        busy: bool,
    ) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        // Handles stay in the low half so they survive a signed round trip.
        debug_assert!(handle >> 63 == 0, "handle space exhausted");

        self.files.insert(
            handle,
            OpenFile {
                target,
                readable,
                writable,
                staging,
                in_flight: busy,
                pending: VecDeque::new(),
            },
        );
        handle
    }

    pub fn get(&self, handle: u64) -> Option<&OpenFile> {
        self.files.get(&handle)
    }

    pub fn remove(&mut self, handle: u64) -> Option<OpenFile> {
        self.files.remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Queue `op` on `handle`.
    ///
    /// Returns the op back when the handle was idle: the caller must start it
    /// now. Returns `None` when it was queued behind the in-flight op.
    /// Unknown handles hand the op back as `Err`.
    pub fn submit(&mut self, handle: u64, op: PendingOp) -> Result<Option<PendingOp>, PendingOp> {
        let Some(file) = self.files.get_mut(&handle) else {
            return Err(op);
        };
        if file.in_flight {
            file.pending.push_back(op);
            Ok(None)
        } else {
            file.in_flight = true;
            Ok(Some(op))
        }
    }

    /// Mark the in-flight op on `handle` finished and pop the next one.
    ///
    /// A returned op is already marked in flight.
    pub fn complete(&mut self, handle: u64) -> Option<PendingOp> {
        let file = self.files.get_mut(&handle)?;
        match file.pending.pop_front() {
            Some(next) => Some(next),
            None => {
                file.in_flight = false;
                None
            }
        }
    }
}

// ============================================================================
// Staging
// ============================================================================

#[derive(Debug, Default)]
struct StagingState {
    file: Option<tokio::fs::File>,
    dirty: bool,
}

/// Local scratch file that absorbs writes for backends that only accept
/// whole-file replacement. Created lazily on the first write and pushed to
/// the backend on close.
#[derive(Debug)]
pub struct Staging {
    /// Set for handles from `create`: the file is known to be empty, so
    /// reads before the first write must not reach the backend and the
    /// staging file starts empty.
    fresh: bool,
    state: Mutex<StagingState>,
}

impl Staging {
    pub fn new(fresh: bool) -> Self {
        Self {
            fresh,
            state: Mutex::new(StagingState::default()),
        }
    }

    #[cfg(test)]
    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.dirty
    }

    /// Read from the staging file if it exists, else from the backend.
    pub async fn read(
        &self,
        backend: &dyn Backend,
        target: &Target,
        offset: u64,
        length: u32,
    ) -> BackendResult<Vec<u8>> {
        let mut state = self.state.lock().await;
        if let Some(file) = state.file.as_mut() {
            file.seek(SeekFrom::Start(offset)).await?;
            let mut buf = Vec::with_capacity(length as usize);
            file.take(u64::from(length)).read_to_end(&mut buf).await?;
            return Ok(buf);
        }
        drop(state);

        if self.fresh {
            return Ok(Vec::new());
        }
        backend.read(target, offset, length).await
    }

    /// Write into the staging file, creating it on first use.
    ///
    /// A staging file for an existing target starts as a copy of the
    /// backend contents, so partial writes keep the rest of the file.
    pub async fn write(
        &self,
        backend: &dyn Backend,
        target: &Target,
        data: &[u8],
        offset: u64,
    ) -> BackendResult<u64> {
        let mut state = self.state.lock().await;
        let file = match state.file.take() {
            Some(file) => file,
            None => {
                let std_file = tokio::task::spawn_blocking(tempfile::tempfile)
                    .await
                    .map_err(|e| BackendError::other(format!("staging task failed: {e}")))??;
                let mut file = tokio::fs::File::from_std(std_file);
                if !self.fresh {
                    let copied = seed(&mut file, backend, target).await?;
                    tracing::debug!(url = %target, bytes = copied, "staging file seeded");
                } else {
                    tracing::debug!("staging file created");
                }
                file
            }
        };
        let file = state.file.insert(file);
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        state.dirty = true;
        Ok(data.len() as u64)
    }

    /// Replace the backend file with the staged contents, if anything was
    /// written. Waits for any op still holding the staging file.
    pub async fn flush(&self, backend: &dyn Backend, target: &Target) -> BackendResult<()> {
        let mut state = self.state.lock().await;
        if !state.dirty {
            return Ok(());
        }
        let Some(file) = state.file.as_mut() else {
            return Ok(());
        };

        file.seek(SeekFrom::Start(0)).await?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).await?;

        backend.create_file(target, false).await?;
        backend.truncate(target, 0).await?;
        if !data.is_empty() {
            backend.write(target, &data, 0).await?;
        }
        state.dirty = false;
        tracing::debug!(url = %target, bytes = data.len(), "staging file flushed");
        Ok(())
    }
}

/// Copy the backend's current contents of `target` into `file`.
/// A missing target leaves the file empty.
async fn seed(
    file: &mut tokio::fs::File,
    backend: &dyn Backend,
    target: &Target,
) -> BackendResult<u64> {
    let size = match backend.get_metadata(target).await {
        Ok(meta) => meta.size,
        Err(BackendError::NotFound(_)) => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut copied = 0u64;
    while copied < size {
        let want = (size - copied).min(u64::from(SEED_CHUNK)) as u32;
        let chunk = backend.read(target, copied, want).await?;
        if chunk.is_empty() {
            break;
        }
        file.write_all(&chunk).await?;
        copied += chunk.len() as u64;
    }
    Ok(copied)
}
