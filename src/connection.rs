/*!
 * Client Connection State
 *
 * Owned by exactly one poller thread. Replies for pipelined commands may
 * come back from different shards out of order; each command gets a
 * sequence number on arrival and replies are written strictly in that
 * order. Watch pushes bypass the ordering and are written as soon as they
 * arrive.
 */

use crate::bridge::ConnId;
use crate::error::ProtocolError;
use crate::protocol::{parse_many, Frame};
use crate::shard::SubscriptionChange;
use crate::watch::SubscriptionId;
use bytes::{Buf, Bytes, BytesMut};
use mio::net::TcpStream;
use mio::Interest;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Instant;

/// Size of read buffer for incoming data
pub const READ_CHUNK: usize = 16 * 1024;

/// Result of draining the socket.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Socket would block; connection stays open
    Open,
    /// Stopped at the buffer limit with input possibly left on the socket;
    /// read again once parsing has made room
    Full,
    /// Peer closed its side
    Closed,
}

pub struct Connection {
    pub id: ConnId,
    pub sock: TcpStream,
    pub addr: SocketAddr,
    rbuf: BytesMut,
    wbuf: BytesMut,
    /// Sequence number for the next command
    next_seq: u64,
    /// Sequence number of the next reply to write
    next_out: u64,
    /// Replies that arrived ahead of an earlier one
    pending: BTreeMap<u64, Frame>,
    subscriptions: FxHashMap<SubscriptionId, Bytes>,
    pub authenticated: bool,
    reading: bool,
    /// Close once everything queued has been written
    closing: bool,
    last_activity: Instant,
    /// Last time pending output made progress
    last_write: Instant,
    interest: Interest,
}

impl Connection {
    pub fn new(id: ConnId, sock: TcpStream, addr: SocketAddr, authenticated: bool) -> Self {
        let now = Instant::now();
        Self {
            id,
            sock,
            addr,
            rbuf: BytesMut::with_capacity(READ_CHUNK),
            wbuf: BytesMut::with_capacity(READ_CHUNK),
            next_seq: 0,
            next_out: 0,
            pending: BTreeMap::new(),
            subscriptions: FxHashMap::default(),
            authenticated,
            reading: true,
            closing: false,
            last_activity: now,
            last_write: now,
            interest: Interest::READABLE,
        }
    }

    /// Read everything available on the socket.
    ///
    /// # Arguments
    /// * `scratch` - reusable read buffer
    /// * `limit` - maximum bytes of unparsed input to hold
    pub fn read_available(&mut self, scratch: &mut [u8], limit: usize) -> io::Result<ReadOutcome> {
        if !self.reading {
            return Ok(ReadOutcome::Open);
        }
        loop {
            match self.sock.read(scratch) {
                Ok(0) => return Ok(ReadOutcome::Closed),
                Ok(n) => {
                    self.rbuf.extend_from_slice(&scratch[..n]);
                    self.last_activity = Instant::now();
                    if self.rbuf.len() > limit {
                        return Ok(ReadOutcome::Full);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::Open),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Parse complete requests out of the read buffer.
    ///
    /// A request larger than `limit` is a protocol error.
    pub fn parse_requests(&mut self, out: &mut Vec<Vec<Bytes>>, limit: usize) -> Result<(), ProtocolError> {
        parse_many(&mut self.rbuf, out)?;
        if self.rbuf.len() > limit {
            return Err(ProtocolError::BufferLimit { limit });
        }
        Ok(())
    }

    /// Allocate the sequence number for a newly parsed command.
    pub fn next_seq(&mut self) -> u64 {
        let s = self.next_seq;
        self.next_seq += 1;
        s
    }

    /// Commands whose replies have not been written yet.
    pub fn in_flight(&self) -> u64 {
        self.next_seq - self.next_out
    }

    /// Record the reply to command `seq`, releasing every reply that is now
    /// in order into the output buffer.
    pub fn complete(&mut self, seq: u64, frame: Frame) {
        if seq < self.next_out {
            return;
        }
        self.pending.insert(seq, frame);
        while let Some(frame) = self.pending.remove(&self.next_out) {
            self.queue(&frame);
            self.next_out += 1;
        }
    }

    /// Queue an out-of-band push.
    pub fn push(&mut self, frame: &Frame) {
        self.queue(frame);
    }

    fn queue(&mut self, frame: &Frame) {
        if self.wbuf.is_empty() {
            self.last_write = Instant::now();
        }
        frame.encode(&mut self.wbuf);
    }

    pub fn apply(&mut self, change: SubscriptionChange) {
        match change {
            SubscriptionChange::Added(sub) => {
                self.subscriptions.insert(sub.id, sub.key);
            }
            SubscriptionChange::Removed(id) => {
                self.subscriptions.remove(&id);
            }
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Hand over every subscription, leaving none behind.
    pub fn take_subscriptions(&mut self) -> Vec<SubscriptionId> {
        self.subscriptions.drain().map(|(id, _)| id).collect()
    }

    /// Write as much buffered output as the socket accepts.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.wbuf.is_empty() {
            match self.sock.write(&self.wbuf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.wbuf.advance(n);
                    self.last_write = Instant::now();
                    self.last_activity = self.last_write;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn has_output(&self) -> bool {
        !self.wbuf.is_empty()
    }

    /// Stop reading new commands; replies already owed are still written.
    pub fn stop_reading(&mut self) {
        self.reading = false;
    }

    pub fn is_reading(&self) -> bool {
        self.reading
    }

    /// Close after every owed reply has been flushed.
    pub fn close_after_flush(&mut self) {
        self.reading = false;
        self.closing = true;
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// No reply owed and nothing left to write.
    pub fn is_drained(&self) -> bool {
        self.in_flight() == 0 && self.wbuf.is_empty()
    }

    /// Idle: nothing owed, nothing to write, no input for `timeout`.
    pub fn idle_for(&self, now: Instant) -> Option<std::time::Duration> {
        if !self.is_drained() {
            return None;
        }
        Some(now.saturating_duration_since(self.last_activity))
    }

    /// Time pending output has been stuck, if any is pending.
    pub fn write_stalled_for(&self, now: Instant) -> Option<std::time::Duration> {
        if self.wbuf.is_empty() {
            return None;
        }
        Some(now.saturating_duration_since(self.last_write))
    }

    /// Poll interest this connection needs, and whether it changed.
    pub fn update_interest(&mut self) -> Option<Interest> {
        let want = if self.has_output() {
            if self.reading {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::WRITABLE
            }
        } else {
            // keep READABLE so hang-ups are still noticed
            Interest::READABLE
        };
        if want == self.interest {
            None
        } else {
            self.interest = want;
            Some(want)
        }
    }
}
