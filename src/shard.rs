/*!
 * Command Execution Shard
 *
 * A shard is one thread that exclusively owns a partition of the keyspace:
 * its `Store` and the `WatchRegistry` for those keys. Commands arrive through
 * a bounded queue and run strictly one at a time in arrival order, so the
 * data needs no lock.
 *
 * Replies leave the shard either on a per-request channel (in-process
 * callers) or through the connection registry to the poller that owns the
 * client socket.
 */

use crate::bridge::{ConnId, ConnectionRegistry, Outbound};
use crate::command::{Cmd, Command, SetCond, TtlUnit};
use crate::error::{CommandError, StoreError, SubmitError};
use crate::protocol::Frame;
use crate::storage::{Store, Value};
use crate::time::{deadline_after, now_ms};
use crate::watch::{Subscription, SubscriptionId, WatchRegistry};
use bytes::Bytes;
use crossbeam::channel::{select, tick, Receiver, Sender};
use log::{debug, error, info, trace};
use smol_str::SmolStr;
use std::fmt;
use std::ops::AddAssign;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How a command changed the issuing connection's subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionChange {
    Added(Subscription),
    Removed(SubscriptionId),
}

/// The outcome of one command.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub frame: Frame,
    pub subscription: Option<SubscriptionChange>,
}

impl Response {
    pub fn error(e: impl fmt::Display) -> Self {
        Frame::error(e).into()
    }
}

impl From<Frame> for Response {
    fn from(frame: Frame) -> Self {
        Self {
            frame,
            subscription: None,
        }
    }
}

/// Where a shard sends the response to a command.
#[derive(Debug, Clone)]
pub enum ReplyTo {
    /// In-process caller waiting on a channel
    Channel(Sender<Response>),
    /// Client connection; `seq` restores pipeline order on the way out
    Connection { conn: ConnId, seq: u64 },
}

pub(crate) enum ShardMessage {
    Execute { command: Command, reply: ReplyTo },
    Unsubscribe(SubscriptionId),
    /// Everything queued before this marker is still processed
    Stop,
}

/// Lifecycle of a shard thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShardState {
    Idle = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShardState::Idle => "idle",
            ShardState::Running => "running",
            ShardState::Draining => "draining",
            ShardState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Atomically readable `ShardState`, shared with the manager.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ShardState::Idle as u8))
    }

    pub(crate) fn get(&self) -> ShardState {
        match self.0.load(Ordering::Acquire) {
            0 => ShardState::Idle,
            1 => ShardState::Running,
            2 => ShardState::Draining,
            _ => ShardState::Stopped,
        }
    }

    pub(crate) fn set(&self, s: ShardState) {
        self.0.store(s as u8, Ordering::Release);
    }

    /// Move to `to` only if currently `from`.
    pub(crate) fn advance(&self, from: ShardState, to: ShardState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Shutdown signal shared by every shard of a manager.
#[derive(Debug)]
pub(crate) struct DrainControl {
    draining: AtomicBool,
    /// Milliseconds on the process clock after which queued commands are dropped
    deadline: AtomicU64,
}

impl DrainControl {
    pub(crate) fn new() -> Self {
        Self {
            draining: AtomicBool::new(false),
            deadline: AtomicU64::new(u64::MAX),
        }
    }

    pub(crate) fn begin(&self, timeout: Duration) {
        self.deadline
            .store(deadline_after(now_ms(), timeout), Ordering::Release);
        self.draining.store(true, Ordering::Release);
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub(crate) fn expired(&self, now: u64) -> bool {
        self.is_draining() && now >= self.deadline.load(Ordering::Acquire)
    }
}

/// Commands executed and dropped by shards during their lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub executed: u64,
    pub dropped: u64,
}

impl AddAssign for DrainReport {
    fn add_assign(&mut self, rhs: Self) {
        self.executed += rhs.executed;
        self.dropped += rhs.dropped;
    }
}

/// A partition of the keyspace and the watches on it.
pub struct Shard {
    pub id: usize,
    pub store: Store,
    pub watches: WatchRegistry,
    bridge: Arc<ConnectionRegistry>,
}

impl Shard {
    /// Create an empty shard.
    ///
    /// # Arguments
    /// * `id` - index of this shard within its manager
    /// * `bridge` - registry used to reach client connections
    pub fn new(id: usize, bridge: Arc<ConnectionRegistry>) -> Self {
        Self {
            id,
            store: Store::new(),
            watches: WatchRegistry::new(id),
            bridge,
        }
    }

    /// Execute a command and publish the watch events it caused.
    pub fn exec(&mut self, command: Command) -> Response {
        self.exec_at(command, now_ms())
    }

    /// Like `exec`, with an explicit clock reading in milliseconds.
    pub fn exec_at(&mut self, command: Command, now: u64) -> Response {
        let response = self.apply(command, now);
        self.publish_events();
        response
    }

    /// Drop a subscription, as when its connection closes.
    ///
    /// Returns `false` if the id was unknown.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        match self.watches.unsubscribe(id) {
            Some(sub) => {
                self.release_key(&sub.key);
                true
            }
            None => false,
        }
    }

    /// Fan recorded mutations out to subscribers.
    pub fn publish_events(&mut self) {
        for event in self.store.take_events() {
            let n = self.watches.publish(&event, &self.bridge);
            trace!(target: "shardkv::shard", "shard {} pushed {:?} to {} watcher(s)", self.id, event.key, n);
            if !self.watches.has_subscribers(&event.key) {
                self.store.unwatch_key(&event.key);
            }
        }
    }

    fn apply(&mut self, command: Command, now: u64) -> Response {
        let Command { cmd, origin } = command;
        let frame = match cmd {
            Cmd::Ping(None) => Frame::Simple(SmolStr::new_static("PONG")),
            Cmd::Ping(Some(msg)) | Cmd::Echo(msg) => Frame::Bulk(msg),
            Cmd::Auth(_) => Frame::error(CommandError::NeedsConnection("AUTH")),
            Cmd::Abort => Frame::error(CommandError::NeedsConnection("ABORT")),

            Cmd::Get(k) => string_or_null(self.store.get(&k, now)),

            Cmd::Set { key, value, ttl, cond } => {
                let allowed = match cond {
                    SetCond::Always => true,
                    SetCond::IfAbsent => !self.store.exists(&key, now),
                    SetCond::IfPresent => self.store.exists(&key, now),
                };
                if allowed {
                    frame_or_error(
                        self.store.set(key, Value::from_bytes(value), ttl, now),
                        |_| Frame::ok(),
                    )
                } else {
                    Frame::Null
                }
            }

            Cmd::Del(keys) => {
                let n = keys
                    .iter()
                    .filter(|k| self.store.delete(k, now).is_ok())
                    .count();
                Frame::Integer(n as i64)
            }

            Cmd::Exists(keys) => {
                let n = keys.iter().filter(|k| self.store.exists(k, now)).count();
                Frame::Integer(n as i64)
            }

            Cmd::IncrBy(k, delta) => frame_or_error(self.store.incr_by(&k, delta, now), Frame::Integer),

            Cmd::Expire(k, ttl) => Frame::Integer(self.store.expire(&k, ttl, now).is_ok() as i64),

            // -2 absent, -1 no TTL
            Cmd::Ttl(k, unit) => Frame::Integer(match self.store.ttl(&k, now) {
                Err(_) => -2,
                Ok(None) => -1,
                Ok(Some(ms)) => match unit {
                    TtlUnit::Millis => ms as i64,
                    TtlUnit::Seconds => ((ms + 500) / 1000) as i64,
                },
            }),

            Cmd::Persist(k) => Frame::Integer(matches!(self.store.persist(&k, now), Ok(true)) as i64),

            Cmd::Type(k) => Frame::Simple(SmolStr::new_static(self.store.type_of(&k, now))),

            Cmd::Rename(from, to) => frame_or_error(self.store.rename(&from, to, now), |_| Frame::ok()),

            Cmd::MGet(keys) => Frame::Array(
                keys.iter()
                    .map(|k| match self.store.get(k, now) {
                        Ok(v @ (Value::Str(_) | Value::Int(_))) => v.to_frame(),
                        _ => Frame::Null,
                    })
                    .collect(),
            ),

            Cmd::MSet(pairs) => {
                let mut out = Frame::ok();
                for (k, v) in pairs {
                    if let Err(e) = self.store.set(k, Value::from_bytes(v), None, now) {
                        out = Frame::error(e);
                        break;
                    }
                }
                out
            }

            Cmd::Push { key, values, end } => {
                frame_or_error(self.store.push(&key, values, end, now), |n| Frame::Integer(n as i64))
            }

            Cmd::Pop(k, end) => match self.store.pop(&k, end, now) {
                Ok(v) => Frame::Bulk(v),
                Err(StoreError::WrongType) => Frame::error(StoreError::WrongType),
                Err(_) => Frame::Null,
            },

            Cmd::LRange(k, start, stop) => frame_or_error(self.store.lrange(&k, start, stop, now), |items| {
                Frame::Array(items.into_iter().map(Frame::Bulk).collect())
            }),

            Cmd::LLen(k) => frame_or_error(self.store.llen(&k, now), |n| Frame::Integer(n as i64)),

            Cmd::HSet(k, fields) => frame_or_error(self.store.hset(&k, fields, now), |n| Frame::Integer(n as i64)),

            Cmd::HGet(k, field) => frame_or_error(self.store.hget(&k, &field, now), |v| {
                v.map(Frame::Bulk).unwrap_or(Frame::Null)
            }),

            Cmd::HDel(k, fields) => frame_or_error(self.store.hdel(&k, &fields, now), |n| Frame::Integer(n as i64)),

            Cmd::HGetAll(k) => frame_or_error(self.store.hgetall(&k, now), |pairs| {
                Frame::Array(
                    pairs
                        .into_iter()
                        .flat_map(|(f, v)| [Frame::Bulk(f), Frame::Bulk(v)])
                        .collect(),
                )
            }),

            Cmd::Watch(k) => return self.watch(k, origin),
            Cmd::Unwatch(k) => return self.unwatch(k, origin),
        };
        frame.into()
    }

    fn watch(&mut self, key: Bytes, origin: Option<ConnId>) -> Response {
        let Some(conn) = origin else {
            return Response::error(CommandError::NeedsConnection("WATCH"));
        };
        let sub = self.watches.subscribe(key.clone(), conn);
        self.store.watch_key(key.clone());
        debug!(target: "shardkv::shard", "shard {}: {} watches {:?} ({})", self.id, conn, key, sub.id);
        Response {
            frame: Frame::Array(vec![
                Frame::bulk("watch"),
                Frame::Bulk(key),
                Frame::bulk(sub.id.to_string()),
            ]),
            subscription: Some(SubscriptionChange::Added(sub)),
        }
    }

    fn unwatch(&mut self, key: Bytes, origin: Option<ConnId>) -> Response {
        let Some(conn) = origin else {
            return Response::error(CommandError::NeedsConnection("UNWATCH"));
        };
        let removed = self.watches.unsubscribe_key(&key, conn);
        if removed.is_some() {
            self.release_key(&key);
        }
        Response {
            frame: Frame::Array(vec![
                Frame::bulk("unwatch"),
                Frame::Bulk(key),
                Frame::Integer(removed.is_some() as i64),
            ]),
            subscription: removed.map(|s| SubscriptionChange::Removed(s.id)),
        }
    }

    fn release_key(&mut self, key: &[u8]) {
        if !self.watches.has_subscribers(key) {
            self.store.unwatch_key(key);
        }
    }

    /// Hand `response` to whoever is waiting for it.
    ///
    /// A subscription created for a requester that is already gone is
    /// removed on the spot.
    pub(crate) fn send_reply(&mut self, to: ReplyTo, response: Response) {
        let orphan = match &response.subscription {
            Some(SubscriptionChange::Added(s)) => Some(s.id),
            _ => None,
        };
        let delivered = match to {
            ReplyTo::Channel(tx) => tx.send(response).is_ok(),
            ReplyTo::Connection { conn, seq } => self.bridge.deliver(
                conn,
                Outbound::Reply {
                    conn,
                    seq,
                    response,
                },
            ),
        };
        if !delivered {
            if let Some(id) = orphan {
                self.unsubscribe(id);
            }
        }
    }
}

fn frame_or_error<T>(r: Result<T, StoreError>, ok: impl FnOnce(T) -> Frame) -> Frame {
    match r {
        Ok(v) => ok(v),
        Err(e) => Frame::error(e),
    }
}

fn string_or_null(r: Result<&Value, StoreError>) -> Frame {
    match r {
        Ok(v @ (Value::Str(_) | Value::Int(_))) => v.to_frame(),
        Ok(_) => Frame::error(StoreError::WrongType),
        Err(_) => Frame::Null,
    }
}

/// Run `f`, turning a panic into an error reply.
///
/// The shard keeps serving after a panicking command.
pub(crate) fn guarded(shard: usize, name: &str, f: impl FnOnce() -> Response) -> Response {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(r) => r,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(target: "shardkv::shard", "shard {} panicked executing '{}': {}", shard, name, msg);
            Response::error(format!("ERR internal error executing '{name}'"))
        }
    }
}

/// Owns a `Shard` on its thread and feeds it from the queue.
pub(crate) struct ShardRunner {
    shard: Shard,
    rx: Receiver<ShardMessage>,
    state: Arc<StateCell>,
    control: Arc<DrainControl>,
    expiry_interval: Duration,
    report: DrainReport,
    apply: fn(&mut Shard, Command, u64) -> Response,
}

impl ShardRunner {
    pub(crate) fn new(
        shard: Shard,
        rx: Receiver<ShardMessage>,
        state: Arc<StateCell>,
        control: Arc<DrainControl>,
        expiry_interval: Duration,
    ) -> Self {
        Self {
            shard,
            rx,
            state,
            control,
            expiry_interval,
            report: DrainReport::default(),
            apply: Shard::apply,
        }
    }

    pub(crate) fn run(mut self) -> DrainReport {
        let id = self.shard.id;
        self.state.advance(ShardState::Idle, ShardState::Running);
        info!(target: "shardkv::shard", "shard {} running", id);

        let rx = self.rx.clone();
        let ticker = tick(self.expiry_interval);
        loop {
            let keep_going = select! {
                recv(rx) -> msg => match msg {
                    Ok(msg) => self.handle_batch(msg),
                    Err(_) => false,
                },
                recv(ticker) -> _ => {
                    self.sweep();
                    true
                }
            };
            if !keep_going {
                break;
            }
        }

        // senders that raced the stop marker still get an answer
        while let Ok(msg) = rx.try_recv() {
            match msg {
                ShardMessage::Execute { command, reply } => self.drop_command(command, reply),
                ShardMessage::Unsubscribe(sub) => {
                    self.shard.unsubscribe(sub);
                }
                ShardMessage::Stop => {}
            }
        }

        self.state.set(ShardState::Stopped);
        info!(
            target: "shardkv::shard",
            "shard {} stopped: {} executed, {} dropped, {} keys, {} watches",
            id,
            self.report.executed,
            self.report.dropped,
            self.shard.store.len(),
            self.shard.watches.len()
        );
        self.report
    }

    /// Handle `first` and everything else already queued.
    ///
    /// Returns `false` once the stop marker is reached.
    fn handle_batch(&mut self, first: ShardMessage) -> bool {
        if !self.handle(first) {
            return false;
        }
        while let Ok(msg) = self.rx.try_recv() {
            if !self.handle(msg) {
                return false;
            }
        }
        true
    }

    fn handle(&mut self, msg: ShardMessage) -> bool {
        match msg {
            ShardMessage::Stop => return false,
            ShardMessage::Unsubscribe(id) => {
                self.shard.unsubscribe(id);
            }
            ShardMessage::Execute { command, reply } => {
                if self.control.expired(now_ms()) {
                    self.drop_command(command, reply);
                } else {
                    self.execute(command, reply);
                }
            }
        }
        true
    }

    fn execute(&mut self, command: Command, reply: ReplyTo) {
        let name = command.cmd.name();
        let now = now_ms();
        let (shard, apply) = (&mut self.shard, self.apply);
        let response = guarded(shard.id, name, || apply(shard, command, now));
        // events recorded before a panic are still real mutations
        self.shard.publish_events();
        self.report.executed += 1;
        self.shard.send_reply(reply, response);
    }

    fn drop_command(&mut self, command: Command, reply: ReplyTo) {
        trace!(target: "shardkv::shard", "shard {} dropping '{}' after drain timeout", self.shard.id, command.cmd.name());
        self.report.dropped += 1;
        self.shard
            .send_reply(reply, Response::error(SubmitError::ShuttingDown));
    }

    fn sweep(&mut self) {
        let removed = self.shard.store.expire_sweep(now_ms());
        if removed > 0 {
            self.shard.publish_events();
            debug!(target: "shardkv::shard", "shard {} expired {} key(s)", self.shard.id, removed);
        }
    }
}
