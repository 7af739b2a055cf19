//! Single-threaded readiness multiplexer
//!
//! The reactor owns the connection table and is the only place allowed to
//! observe socket readiness. One call to [`Reactor::ready`] is the single
//! poll point of an iteration: it scans connections in registration
//! order, rotating the scan start past the previous winner so every
//! ready connection gets a turn.
//!
//! Connections are registered before the next poll and deregistered only
//! between iterations ([`Reactor::sweep`]), never while the table is
//! being iterated.

use std::collections::BTreeMap;
use std::future::poll_fn;
use std::task::Poll;
use std::time::Duration;
use tokio::net::TcpStream;

use crate::core::connection::{Connection, ConnectionId, ConnectionState};

/// Readiness of one connection, as returned by [`Reactor::ready`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Socket has bytes (or EOF) to read
    pub readable: bool,
    /// Socket accepts writes, or an in-progress connect finished
    pub writable: bool,
}

/// Connection table plus readiness polling
pub struct Reactor {
    /// Keyed by monotonically assigned id, so iteration follows
    /// registration order.
    conns: BTreeMap<u64, Connection>,
    next_id: u64,
    pending_close: Vec<ConnectionId>,
    /// Where the next readiness scan starts, one past the last winner.
    scan_cursor: u64,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    /// Create an empty reactor
    #[must_use]
    pub fn new() -> Self {
        Self {
            conns: BTreeMap::new(),
            next_id: 1,
            pending_close: Vec::new(),
            scan_cursor: 0,
        }
    }

    /// Register a new connection; effective before the next poll
    pub fn register(&mut self, stream: TcpStream, state: ConnectionState) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.conns.insert(id.0, Connection::new(id, stream, state));
        tracing::debug!("{} registered ({:?})", id, state);
        id
    }

    /// Number of live connections
    #[must_use]
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Borrow a connection
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.conns.get(&id.0)
    }

    /// Mutably borrow a connection
    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.conns.get_mut(&id.0)
    }

    /// Iterate all connections in registration order
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.conns.values()
    }

    /// Mutably iterate all connections in registration order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.conns.values_mut()
    }

    /// Mark a connection for removal between iterations.
    ///
    /// The connection stops participating in polling immediately but its
    /// record stays in the table until [`Reactor::sweep`], so cascade
    /// cleanup never mutates the table mid-iteration.
    pub fn defer_close(&mut self, id: ConnectionId) {
        if let Some(conn) = self.conns.get_mut(&id.0) {
            if conn.state() != ConnectionState::Closing {
                conn.begin_close();
                self.pending_close.push(id);
            }
        }
    }

    /// Remove every connection marked for closing; called between poll
    /// iterations. Returns the removed connections so the owner can run
    /// cascade cleanup on them.
    pub fn sweep(&mut self) -> Vec<Connection> {
        let mut removed = Vec::new();
        for id in self.pending_close.drain(..) {
            if let Some(conn) = self.conns.remove(&id.0) {
                tracing::debug!("{} deregistered", id);
                removed.push(conn);
            }
        }
        removed
    }

    /// Ids of connections whose registration or fusion handshake has
    /// outlived the configured window; driven by the housekeeping tick.
    #[must_use]
    pub fn expired_handshakes(&self, timeout: Duration) -> Vec<ConnectionId> {
        self.conns
            .values()
            .filter(|c| c.handshake_expired(timeout))
            .map(|c| c.id())
            .collect()
    }

    /// Wait until some connection is ready, and say which.
    ///
    /// Each scan starts one past the previous winner and wraps around,
    /// so a chatty low-id connection cannot starve higher ids. Read
    /// readiness is polled unless the connection is paused by flow
    /// control; write readiness is polled only when bytes are queued.
    /// Pends forever when no connection can make progress, which is why
    /// the caller multiplexes this with accept, command, and tick arms.
    pub async fn ready(&mut self) -> (ConnectionId, Readiness) {
        let start = self.scan_cursor;
        let (id, readiness) = poll_fn(|cx| {
            let rotated = self
                .conns
                .range(start..)
                .chain(self.conns.range(..start))
                .map(|(_, conn)| conn);
            for conn in rotated {
                if conn.state() == ConnectionState::Closing {
                    continue;
                }

                let mut readiness = Readiness::default();

                if conn.wants_write() {
                    if let Poll::Ready(res) = conn.stream().poll_write_ready(cx) {
                        // I/O errors surface through the pump itself.
                        let _ = res;
                        readiness.writable = true;
                    }
                }

                if !conn.is_paused() {
                    if let Poll::Ready(res) = conn.stream().poll_read_ready(cx) {
                        let _ = res;
                        readiness.readable = true;
                    }
                }

                if readiness.readable || readiness.writable {
                    return Poll::Ready((conn.id(), readiness));
                }
            }
            Poll::Pending
        })
        .await;
        self.scan_cursor = id.0 + 1;
        (id, readiness)
    }
}
