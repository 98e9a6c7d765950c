/*!
 * Network Layer and Event Loop
 *
 * The RESP front end. `io_threads` poller threads each run a mio event loop
 * over the connections they own. Poller 0 also owns the listener and hands
 * accepted sockets to the pollers round-robin.
 *
 * A poller parses requests, answers connection-level commands (PING, ECHO,
 * AUTH, ABORT) itself and submits everything else to the shard manager
 * without waiting. Shards send replies and watch pushes back through the
 * poller's inbox; the poller writes them in command order.
 */

use crate::bridge::{ConnId, ConnectionRegistry, Outbound, PollerHandle};
use crate::command::{Cmd, Command};
use crate::config::{ConfigError, ServerConfig};
use crate::connection::{Connection, ReadOutcome, READ_CHUNK};
use crate::context::Context;
use crate::error::{BindError, ServerError};
use crate::manager::ShardManager;
use crate::protocol::Frame;
use crate::shard::{ReplyTo, SubscriptionChange};
use bytes::Bytes;
use crossbeam::channel::{unbounded, Receiver};
use log::{debug, info, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use slab::Slab;
use smol_str::SmolStr;
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const LISTENER: Token = Token(usize::MAX - 1);
const WAKER: Token = Token(usize::MAX);

/// Upper bound on how long a poller sleeps; timeouts are checked this often
const TICK: Duration = Duration::from_millis(100);

const MAX_CLIENTS_REPLY: &[u8] = b"-ERR max number of clients reached\r\n";

/// Bind a non-blocking TCP listener.
///
/// SO_REUSEADDR lets a restart bind over TIME_WAIT sockets, but a port with
/// a live listener is still reported as taken.
pub fn bind_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    #[cfg(unix)]
    socket.set_reuse_address(true)?;

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}

/// Bind `addr`, or the first free port among the `scan` ports after it.
///
/// # Returns
/// * The listener and the address it is bound to
pub fn find_port_and_bind(
    addr: SocketAddr,
    scan: u16,
) -> Result<(std::net::TcpListener, SocketAddr), BindError> {
    let mut attempts = 0;
    let mut last_err = None;
    for offset in 0..=scan {
        let Some(port) = addr.port().checked_add(offset) else { break };
        let candidate = SocketAddr::new(addr.ip(), port);
        attempts += 1;
        match bind_listener(candidate).and_then(|l| l.local_addr().map(|a| (l, a))) {
            Ok(bound) => return Ok(bound),
            Err(e) => {
                debug!(target: "shardkv::net", "bind {} failed: {}", candidate, e);
                last_err = Some(e);
            }
        }
        // an ephemeral request either works or nothing will
        if port == 0 {
            break;
        }
    }
    Err(BindError {
        addr,
        attempts,
        source: last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrInUse)),
    })
}

/// Shutdown flags shared by a server and its pollers.
#[derive(Default)]
struct Shutdown {
    requested: AtomicBool,
    aborted: AtomicBool,
    wakers: Mutex<Vec<Arc<Waker>>>,
}

impl Shutdown {
    fn request(&self) {
        self.requested.store(true, Ordering::Release);
        for w in self.wakers.lock().iter() {
            let _ = w.wake();
        }
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        self.request();
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

/// The RESP server.
pub struct AsyncServer {
    config: ServerConfig,
    addr: SocketAddr,
    manager: Arc<ShardManager>,
    listener: Mutex<Option<std::net::TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: Arc<Shutdown>,
}

impl AsyncServer {
    pub fn new(config: ServerConfig, manager: Arc<ShardManager>) -> Result<Self, ConfigError> {
        let addr = config.addr()?;
        Ok(Self {
            config,
            addr,
            manager,
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            shutdown: Arc::new(Shutdown::default()),
        })
    }

    /// Bind the configured address, scanning upward if allowed.
    ///
    /// Must succeed before `run`; the supervisor treats failure as fatal.
    pub fn find_port_and_bind(&self) -> Result<SocketAddr, BindError> {
        let (listener, bound) = find_port_and_bind(self.addr, self.config.port_scan)?;
        *self.listener.lock() = Some(listener);
        *self.local_addr.lock() = Some(bound);
        info!(target: "shardkv::net", "bound {}", bound);
        Ok(bound)
    }

    /// Address actually bound, once `find_port_and_bind` has succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Stop accepting; `run` returns once open connections have drained.
    pub fn initiate_shutdown(&self) {
        info!(target: "shardkv::net", "shutdown requested");
        self.shutdown.request();
    }

    /// Serve until shutdown is initiated, ABORT is received, or `ctx` is
    /// cancelled.
    ///
    /// # Returns
    /// * `Ok(())` after a requested shutdown has drained
    /// * `Err(ServerError::Aborted)` after an ABORT command
    /// * `Err(ServerError::Canceled)` when `ctx` was cancelled first
    pub fn run(&self, ctx: &Context) -> Result<(), ServerError> {
        let std_listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "server is not bound"))?;
        let mut shared_listener = Some(TcpListener::from_std(std_listener));
        let threads = self.config.io_threads().max(1);

        let mut polls = Vec::with_capacity(threads);
        let mut handles = Vec::with_capacity(threads);
        for _ in 0..threads {
            let poll = Poll::new()?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
            let (tx, rx) = unbounded();
            handles.push(PollerHandle::new(tx, waker.clone()));
            self.shutdown.wakers.lock().push(waker);
            polls.push((poll, rx));
        }
        {
            let handles = handles.clone();
            ctx.on_cancel(move || handles.iter().for_each(PollerHandle::wake));
        }

        info!(
            target: "shardkv::net",
            "serving on {} with {} poller(s)",
            self.local_addr().unwrap_or(self.addr),
            threads
        );

        let mut threads_running = Vec::with_capacity(threads);
        for (id, (poll, inbox)) in polls.into_iter().enumerate() {
            let mut listener = if id == 0 { shared_listener.take() } else { None };
            if let Some(l) = listener.as_mut() {
                poll.registry().register(l, LISTENER, Interest::READABLE)?;
            }
            let poller = Poller {
                id,
                poll,
                inbox,
                me: handles[id].clone(),
                peers: if id == 0 { handles.clone() } else { Vec::new() },
                next_peer: 0,
                listener,
                conns: Slab::new(),
                by_id: FxHashMap::default(),
                bridge: self.manager.bridge().clone(),
                manager: self.manager.clone(),
                config: self.config.clone(),
                shutdown: self.shutdown.clone(),
                ctx: ctx.clone(),
                grace_deadline: None,
                scratch: vec![0u8; READ_CHUNK],
                requests: Vec::with_capacity(32),
                dirty: Vec::new(),
            };
            let shutdown = self.shutdown.clone();
            let handle = std::thread::Builder::new()
                .name(format!("net-{id}"))
                .spawn(move || {
                    let r = poller.run();
                    if r.is_err() {
                        // take the siblings down with us
                        shutdown.request();
                    }
                    r
                })?;
            threads_running.push(handle);
        }

        let mut result = Ok(());
        for handle in threads_running {
            let r = handle
                .join()
                .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "poller panicked")));
            if let Err(e) = r {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        self.shutdown.wakers.lock().clear();
        result?;

        info!(target: "shardkv::net", "server stopped");
        if self.shutdown.is_aborted() {
            return Err(ServerError::Aborted);
        }
        if !self.shutdown.is_requested() && ctx.is_cancelled() {
            return Err(ServerError::Canceled);
        }
        Ok(())
    }
}

/// One event loop and the connections it owns.
struct Poller {
    id: usize,
    poll: Poll,
    inbox: Receiver<Outbound>,
    me: PollerHandle,
    /// Every poller's handle, for accept handoff (poller 0 only)
    peers: Vec<PollerHandle>,
    next_peer: usize,
    listener: Option<TcpListener>,
    conns: Slab<Connection>,
    by_id: FxHashMap<ConnId, usize>,
    bridge: Arc<ConnectionRegistry>,
    manager: Arc<ShardManager>,
    config: ServerConfig,
    shutdown: Arc<Shutdown>,
    ctx: Context,
    grace_deadline: Option<Instant>,
    scratch: Vec<u8>,
    requests: Vec<Vec<Bytes>>,
    /// Connections with new output since the last flush
    dirty: Vec<usize>,
}

impl Poller {
    fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);
        let mut last_reap = Instant::now();
        debug!(target: "shardkv::net", "poller {} running", self.id);

        loop {
            if let Err(e) = self.poll.poll(&mut events, Some(TICK)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for ev in events.iter() {
                match ev.token() {
                    LISTENER => self.accept_all(),
                    WAKER => {}
                    Token(key) => {
                        let readable = ev.is_readable() || ev.is_read_closed() || ev.is_error();
                        self.on_socket_event(key, readable);
                    }
                }
            }

            self.drain_inbox();
            self.flush_dirty();

            if last_reap.elapsed() >= TICK {
                self.reap_timeouts();
                last_reap = Instant::now();
            }

            if self.stopping() && self.shutdown_step() {
                break;
            }
        }

        debug!(target: "shardkv::net", "poller {} stopped", self.id);
        Ok(())
    }

    fn stopping(&self) -> bool {
        self.shutdown.is_requested() || self.ctx.is_cancelled()
    }

    fn accept_all(&mut self) {
        let Some(listener) = self.listener.as_ref() else { return };
        let mut accepted = Vec::new();
        loop {
            match listener.accept() {
                Ok(pair) => accepted.push(pair),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(target: "shardkv::net", "accept error: {}", e);
                    break;
                }
            }
        }

        for (mut sock, addr) in accepted {
            if self.bridge.len() >= self.config.max_clients {
                let _ = sock.write(MAX_CLIENTS_REPLY);
                warn!(target: "shardkv::net", "rejected {}: max clients reached", addr);
                continue;
            }
            let target = self.next_peer % self.peers.len().max(1);
            self.next_peer = self.next_peer.wrapping_add(1);
            if target == self.id || self.peers.is_empty() {
                self.adopt(sock, addr);
            } else if !self.peers[target].send(Outbound::Accept(sock, addr)) {
                warn!(target: "shardkv::net", "poller {} gone, dropping {}", target, addr);
            }
        }
    }

    /// Take ownership of an accepted socket.
    fn adopt(&mut self, sock: TcpStream, addr: SocketAddr) {
        if self.stopping() {
            return;
        }
        sock.set_nodelay(true).ok();
        let id = self.bridge.next_id();
        let entry = self.conns.vacant_entry();
        let key = entry.key();
        let mut conn = Connection::new(id, sock, addr, self.config.requirepass.is_none());
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut conn.sock, Token(key), Interest::READABLE)
        {
            warn!(target: "shardkv::net", "failed to register {}: {}", addr, e);
            return;
        }
        entry.insert(conn);
        self.by_id.insert(id, key);
        self.bridge.register(id, self.me.clone());
        debug!(target: "shardkv::net", "poller {} accepted {} from {}", self.id, id, addr);
    }

    fn on_socket_event(&mut self, key: usize, readable: bool) {
        if !self.conns.contains(key) {
            return;
        }
        if readable {
            // the socket is edge-triggered, so keep going until it would block
            loop {
                let Some(conn) = self.conns.get_mut(key) else { return };
                match conn.read_available(&mut self.scratch, self.config.max_read_buffer) {
                    Ok(ReadOutcome::Open) => {
                        self.process_requests(key);
                        break;
                    }
                    Ok(ReadOutcome::Full) => {
                        self.process_requests(key);
                        self.flush_conn(key);
                        match self.conns.get(key) {
                            Some(c) if c.is_reading() => continue,
                            _ => break,
                        }
                    }
                    Ok(ReadOutcome::Closed) => return self.close(key, "peer closed"),
                    Err(e) => return self.close(key, e),
                }
            }
        }
        self.flush_conn(key);
    }

    /// Execute or submit every complete request buffered on `key`.
    fn process_requests(&mut self, key: usize) {
        let Some(conn) = self.conns.get_mut(key) else { return };
        if !conn.is_reading() {
            return;
        }
        let mut requests = std::mem::take(&mut self.requests);
        let parsed = conn.parse_requests(&mut requests, self.config.max_read_buffer);

        for args in requests.drain(..) {
            let seq = conn.next_seq();
            let reply = match Cmd::parse(args) {
                Ok(cmd) => dispatch(&self.manager, &self.config, &self.shutdown, conn, seq, cmd),
                Err(e) => Some(Frame::error(e)),
            };
            if let Some(frame) = reply {
                conn.complete(seq, frame);
            }
        }

        if let Err(e) = parsed {
            debug!(target: "shardkv::net", "{} protocol error: {}", conn.id, e);
            let seq = conn.next_seq();
            conn.complete(seq, Frame::error(e));
            conn.close_after_flush();
        }
        self.requests = requests;
    }

    fn drain_inbox(&mut self) {
        while let Ok(msg) = self.inbox.try_recv() {
            match msg {
                Outbound::Accept(sock, addr) => self.adopt(sock, addr),
                Outbound::Reply { conn, seq, response } => {
                    let Some(&key) = self.by_id.get(&conn) else {
                        // closed while the command was in flight
                        if let Some(SubscriptionChange::Added(sub)) = response.subscription {
                            self.manager.unsubscribe(sub.id);
                        }
                        continue;
                    };
                    if let Some(c) = self.conns.get_mut(key) {
                        if let Some(change) = response.subscription {
                            c.apply(change);
                        }
                        c.complete(seq, response.frame);
                        self.dirty.push(key);
                    }
                }
                Outbound::Push { conn, frame } => {
                    let Some(&key) = self.by_id.get(&conn) else { continue };
                    if let Some(c) = self.conns.get_mut(key) {
                        c.push(&frame);
                        self.dirty.push(key);
                    }
                }
            }
        }
    }

    fn flush_dirty(&mut self) {
        let mut dirty = std::mem::take(&mut self.dirty);
        dirty.sort_unstable();
        dirty.dedup();
        for key in dirty.drain(..) {
            self.flush_conn(key);
        }
        self.dirty = dirty;
    }

    fn flush_conn(&mut self, key: usize) {
        let Some(conn) = self.conns.get_mut(key) else { return };
        if let Err(e) = conn.flush() {
            return self.close(key, e);
        }
        if conn.is_closing() && conn.is_drained() {
            return self.close(key, "protocol error");
        }
        if let Some(interest) = conn.update_interest() {
            if let Err(e) = self
                .poll
                .registry()
                .reregister(&mut conn.sock, Token(key), interest)
            {
                self.close(key, e);
            }
        }
    }

    fn reap_timeouts(&mut self) {
        let idle = self.config.idle_timeout();
        let write = self.config.write_timeout();
        if idle.is_none() && write.is_none() {
            return;
        }
        let now = Instant::now();
        let mut expired = Vec::new();
        for (key, c) in self.conns.iter() {
            if let (Some(limit), Some(for_)) = (idle, c.idle_for(now)) {
                if for_ >= limit {
                    expired.push((key, "idle timeout"));
                    continue;
                }
            }
            if let (Some(limit), Some(for_)) = (write, c.write_stalled_for(now)) {
                if for_ >= limit {
                    expired.push((key, "write timeout"));
                }
            }
        }
        for (key, why) in expired {
            self.close(key, why);
        }
    }

    /// Advance shutdown. Returns `true` once this poller owns nothing.
    fn shutdown_step(&mut self) -> bool {
        if let Some(mut l) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut l);
            info!(target: "shardkv::net", "stopped accepting connections");
        }
        let now = Instant::now();
        if self.ctx.is_cancelled() && self.grace_deadline.is_none() {
            self.grace_deadline = Some(now + self.config.shutdown_grace());
        }
        let force = self.grace_deadline.is_some_and(|d| now >= d);

        let keys: Vec<usize> = self.conns.iter().map(|(k, _)| k).collect();
        for key in keys {
            let conn = &mut self.conns[key];
            conn.stop_reading();
            if force || conn.is_drained() {
                self.close(key, if force { "shutdown grace expired" } else { "server shutting down" });
            } else {
                self.flush_conn(key);
            }
        }
        self.conns.is_empty()
    }

    /// Tear a connection down and release its subscriptions. A key that is
    /// already gone is ignored, so this runs at most once per connection.
    fn close(&mut self, key: usize, reason: impl fmt::Display) {
        let Some(mut conn) = self.conns.try_remove(key) else { return };
        let _ = self.poll.registry().deregister(&mut conn.sock);
        self.by_id.remove(&conn.id);
        self.bridge.unregister(conn.id);
        let subs = conn.take_subscriptions();
        let released = subs.len();
        for id in subs {
            self.manager.unsubscribe(id);
        }
        debug!(
            target: "shardkv::net",
            "closed {} ({}): {}, released {} watch(es)",
            conn.id,
            conn.addr,
            reason,
            released
        );
    }
}

/// Answer a command locally or submit it to its shard.
///
/// Returns the reply when it is known immediately; `None` means a shard
/// will deliver it through the inbox.
fn dispatch(
    manager: &ShardManager,
    config: &ServerConfig,
    shutdown: &Shutdown,
    conn: &mut Connection,
    seq: u64,
    cmd: Cmd,
) -> Option<Frame> {
    if !conn.authenticated && !matches!(cmd, Cmd::Auth(_) | Cmd::Ping(_)) {
        return Some(Frame::error("NOAUTH Authentication required."));
    }
    match cmd {
        Cmd::Ping(None) => Some(Frame::Simple(SmolStr::new_static("PONG"))),
        Cmd::Ping(Some(msg)) | Cmd::Echo(msg) => Some(Frame::Bulk(msg)),
        Cmd::Auth(password) => Some(match &config.requirepass {
            None => Frame::error("ERR AUTH called without any password configured"),
            Some(p) if p.as_bytes() == &password[..] => {
                conn.authenticated = true;
                Frame::ok()
            }
            Some(_) => Frame::error("WRONGPASS invalid username-password pair"),
        }),
        Cmd::Abort => {
            warn!(target: "shardkv::net", "ABORT received from {} ({})", conn.id, conn.addr);
            shutdown.abort();
            Some(Frame::ok())
        }
        cmd => {
            let command = Command::from_conn(cmd, conn.id);
            match manager.submit_to(command, ReplyTo::Connection { conn: conn.id, seq }) {
                Ok(_) => None,
                Err(e) => Some(Frame::error(e)),
            }
        }
    }
}
