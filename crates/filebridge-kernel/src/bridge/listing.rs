//! Paginated directory listing sessions.
//!
//! A listing runs as a background stream task feeding [`DirBatch`]es to the
//! bridge actor. Entries accumulate in the session until the caller asks for
//! the next page. A page request that finds nothing to deliver is parked and
//! answered as soon as data, an error, or end-of-listing arrives, so callers
//! never have to poll.

use std::collections::HashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::errno::Errno;
use crate::vfs::{DirBatch, DirEntry};

use super::protocol::ReadDirResponse;

/// One active listing.
#[derive(Debug)]
struct Session {
    entries: Vec<DirEntry>,
    /// First error reported by the stream; later ones are dropped.
    error_code: i32,
    has_more: bool,
    parked: Option<oneshot::Sender<ReadDirResponse>>,
    cancel: CancellationToken,
    /// Consecutive empty non-final batches since a request parked.
    empty_batches: usize,
}

impl Session {
    fn ready(&self) -> bool {
        !self.entries.is_empty() || self.error_code != 0 || !self.has_more
    }

    fn take_page(&mut self, cookie: u64) -> ReadDirResponse {
        self.empty_batches = 0;
        if self.error_code != 0 {
            return ReadDirResponse::error(self.error_code);
        }
        ReadDirResponse::page(cookie, std::mem::take(&mut self.entries), self.has_more)
    }
}

/// Cookie → listing session table.
#[derive(Debug)]
pub struct ListingSessions {
    sessions: HashMap<u64, Session>,
    next_cookie: u64,
    heartbeat_batches: usize,
}

impl ListingSessions {
    /// `heartbeat_batches` consecutive empty batches answer a parked request
    /// with an empty non-final page; 0 disables that.
    pub fn new(heartbeat_batches: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            next_cookie: 1,
            heartbeat_batches,
        }
    }

    /// Open a session and return its cookie. `cancel` stops the stream task.
    pub fn start(&mut self, cancel: CancellationToken) -> u64 {
        let cookie = self.next_cookie;
        self.next_cookie += 1;
        self.sessions.insert(
            cookie,
            Session {
                entries: Vec::new(),
                error_code: 0,
                has_more: true,
                parked: None,
                cancel,
                empty_batches: 0,
            },
        );
        cookie
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Cookies of live sessions, with whether a request is parked.
    #[cfg(test)]
    pub fn snapshot(&self) -> Vec<(u64, bool)> {
        let mut out: Vec<_> = self
            .sessions
            .iter()
            .map(|(cookie, s)| (*cookie, s.parked.is_some()))
            .collect();
        out.sort_unstable();
        out
    }

    /// Handle a follow-up page request.
    pub fn next_page(&mut self, cookie: u64, reply: oneshot::Sender<ReadDirResponse>) {
        let Some(session) = self.sessions.get_mut(&cookie) else {
            let _ = reply.send(ReadDirResponse::error(Errno::Einval));
            return;
        };
        if session.parked.is_some() {
            let _ = reply.send(ReadDirResponse::error(Errno::Ebusy));
            return;
        }
        if session.ready() {
            let page = session.take_page(cookie);
            self.deliver(cookie, page, reply);
        } else {
            session.empty_batches = 0;
            session.parked = Some(reply);
        }
    }

    /// Cancel a listing, echoing `code` to the canceller and to any parked
    /// request. Unknown cookies only get the echo.
    pub fn cancel(&mut self, cookie: u64, code: i32, reply: oneshot::Sender<ReadDirResponse>) {
        if let Some(session) = self.sessions.remove(&cookie) {
            session.cancel.cancel();
            if let Some(parked) = session.parked {
                let _ = parked.send(ReadDirResponse::error(code));
            }
            tracing::debug!(cookie, code, "listing cancelled");
        }
        let _ = reply.send(ReadDirResponse::error(code));
    }

    /// Fold a batch from the stream task into its session.
    ///
    /// Batches for sessions that are already gone are dropped.
    pub fn on_batch(&mut self, cookie: u64, batch: DirBatch) {
        let heartbeat = self.heartbeat_batches;
        let Some(session) = self.sessions.get_mut(&cookie) else {
            return;
        };

        let empty_progress = batch.entries.is_empty() && batch.has_more && batch.error.is_none();
        session.entries.extend(batch.entries);
        if let Some(err) = batch.error {
            if session.error_code == 0 {
                session.error_code = err.code();
            }
            tracing::debug!(cookie, error = %err, "listing failed");
        }
        if !batch.has_more || session.error_code != 0 {
            session.has_more = false;
        }
        if empty_progress {
            session.empty_batches += 1;
        } else {
            session.empty_batches = 0;
        }

        if session.parked.is_none() {
            return;
        }
        if session.ready() {
            let page = session.take_page(cookie);
            if let Some(reply) = session.parked.take() {
                self.deliver(cookie, page, reply);
            }
        } else if heartbeat > 0 && session.empty_batches >= heartbeat {
            session.empty_batches = 0;
            if let Some(reply) = session.parked.take() {
                tracing::trace!(cookie, "listing heartbeat");
                let _ = reply.send(ReadDirResponse::page(cookie, Vec::new(), true));
            }
        }
    }

    /// Cancel every stream task; used at shutdown.
    pub fn cancel_all(&mut self) {
        for (_, session) in self.sessions.drain() {
            session.cancel.cancel();
            if let Some(parked) = session.parked {
                let _ = parked.send(ReadDirResponse::error(Errno::Ecanceled));
            }
        }
    }

    /// Send a page and drop the session if it was the last one.
    fn deliver(
        &mut self,
        cookie: u64,
        page: ReadDirResponse,
        reply: oneshot::Sender<ReadDirResponse>,
    ) {
        if page.is_terminal() {
            if let Some(session) = self.sessions.remove(&cookie) {
                session.cancel.cancel();
            }
        }
        let _ = reply.send(page);
    }
}
