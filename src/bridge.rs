/*!
 * Watch Fan-out Bridge
 *
 * Shards never touch connection state. Anything destined for a client
 * (command replies, watch pushes, freshly accepted sockets) is handed to the
 * poller thread that owns the connection through that poller's inbox, and
 * the poller is woken through its `mio::Waker`.
 *
 * The connection registry is the only structure shared between shard and
 * poller threads besides the queues themselves.
 */

use crate::protocol::Frame;
use crate::shard::Response;
use crossbeam::channel::Sender;
use dashmap::DashMap;
use log::warn;
use mio::Waker;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A message for a poller thread.
#[derive(Debug)]
pub enum Outbound {
    /// Reply to the command with sequence number `seq` on `conn`
    Reply {
        conn: ConnId,
        seq: u64,
        response: Response,
    },
    /// Out-of-band watch notification
    Push { conn: ConnId, frame: Frame },
    /// A socket accepted by another poller, now owned by this one
    Accept(mio::net::TcpStream, SocketAddr),
}

/// Sending half of a poller inbox.
#[derive(Clone)]
pub struct PollerHandle {
    tx: Sender<Outbound>,
    waker: Arc<Waker>,
}

impl PollerHandle {
    pub fn new(tx: Sender<Outbound>, waker: Arc<Waker>) -> Self {
        Self { tx, waker }
    }

    /// Queue `msg` and wake the poller. Never blocks.
    ///
    /// # Returns
    /// * `false` if the poller has exited
    pub fn send(&self, msg: Outbound) -> bool {
        if self.tx.send(msg).is_err() {
            return false;
        }
        if let Err(e) = self.waker.wake() {
            warn!(target: "shardkv::bridge", "failed to wake poller: {}", e);
        }
        true
    }

    pub fn wake(&self) {
        let _ = self.waker.wake();
    }
}

/// Maps live connections to the poller that owns them.
pub struct ConnectionRegistry {
    conns: DashMap<ConnId, PollerHandle>,
    next_id: AtomicU64,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            conns: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh connection id.
    pub fn next_id(&self) -> ConnId {
        ConnId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register(&self, conn: ConnId, handle: PollerHandle) {
        self.conns.insert(conn, handle);
    }

    /// Remove `conn`. Later deliveries to it are silently discarded.
    pub fn unregister(&self, conn: ConnId) {
        self.conns.remove(&conn);
    }

    pub fn contains(&self, conn: ConnId) -> bool {
        self.conns.contains_key(&conn)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Hand `msg` to the poller owning `conn`.
    ///
    /// # Returns
    /// * `true` if the message was queued
    /// * `false` if the connection is gone (not an error)
    pub fn deliver(&self, conn: ConnId, msg: Outbound) -> bool {
        // clone the handle so the map shard is not held across the send
        let handle = match self.conns.get(&conn) {
            Some(h) => h.value().clone(),
            None => return false,
        };
        handle.send(msg)
    }
}
