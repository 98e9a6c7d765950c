/*!
 * Shard Manager
 *
 * Owns the shard threads and routes every command to the shard that owns
 * its key(s). Routing is a pure function of the key bytes and the shard
 * count, so the same key always lands on the same shard and per-key order
 * is the order of submission.
 *
 * The submit path takes no lock: a flag check, a hash, and a non-blocking
 * push onto the target shard's bounded queue.
 */

use crate::bridge::ConnectionRegistry;
use crate::command::{Cmd, Command};
use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::{RoutingError, SubmitError};
use crate::shard::{
    DrainControl, DrainReport, ReplyTo, Response, Shard, ShardMessage, ShardRunner, ShardState,
    StateCell,
};
use crate::watch::SubscriptionId;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use xxhash_rust::xxh3::xxh3_64;

/// How long releasing a watch may wait on a full shard queue.
const UNSUBSCRIBE_WAIT: Duration = Duration::from_secs(1);

/// Index of the shard owning `key` among `shards` shards.
///
/// Deterministic for the lifetime of the process (and across processes).
#[inline]
pub fn shard_index(key: &[u8], shards: usize) -> usize {
    if shards <= 1 {
        return 0;
    }
    (xxh3_64(key) % shards as u64) as usize
}

/// Pending result of a submitted command.
#[derive(Debug)]
pub struct ResponseHandle {
    shard: usize,
    rx: Receiver<Response>,
}

impl ResponseHandle {
    /// Block until the shard answers.
    pub fn wait(self) -> Result<Response, SubmitError> {
        self.rx
            .recv()
            .map_err(|_| SubmitError::ShardGone { shard: self.shard })
    }

    /// Block for at most `timeout`. `Ok(None)` means no answer yet.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<Response>, SubmitError> {
        match self.rx.recv_timeout(timeout) {
            Ok(r) => Ok(Some(r)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(SubmitError::ShardGone { shard: self.shard }),
        }
    }

    /// Non-blocking poll.
    pub fn try_get(&self) -> Result<Option<Response>, SubmitError> {
        match self.rx.try_recv() {
            Ok(r) => Ok(Some(r)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(SubmitError::ShardGone { shard: self.shard }),
        }
    }

    /// Shard the command was routed to.
    pub fn shard(&self) -> usize {
        self.shard
    }
}

pub struct ShardManager {
    config: EngineConfig,
    senders: Vec<Sender<ShardMessage>>,
    /// Taken by `start`
    receivers: Mutex<Vec<Option<Receiver<ShardMessage>>>>,
    states: Vec<Arc<StateCell>>,
    control: Arc<DrainControl>,
    accepting: AtomicBool,
    bridge: Arc<ConnectionRegistry>,
    handles: Mutex<Vec<JoinHandle<DrainReport>>>,
    /// Cached so repeated shutdowns report the same totals
    report: Mutex<Option<DrainReport>>,
}

impl ShardManager {
    /// Create a manager. No threads run until `start`.
    ///
    /// # Arguments
    /// * `config` - shard count, queue depth and timing
    /// * `bridge` - registry through which shards reach client connections
    pub fn new(config: EngineConfig, bridge: Arc<ConnectionRegistry>) -> Self {
        let n = config.shards();
        let mut senders = Vec::with_capacity(n);
        let mut receivers = Vec::with_capacity(n);
        for _ in 0..n {
            let (tx, rx) = bounded(config.queue_capacity.max(1));
            senders.push(tx);
            receivers.push(Some(rx));
        }
        Self {
            config,
            senders,
            receivers: Mutex::new(receivers),
            states: (0..n).map(|_| Arc::new(StateCell::new())).collect(),
            control: Arc::new(DrainControl::new()),
            accepting: AtomicBool::new(true),
            bridge,
            handles: Mutex::new(Vec::with_capacity(n)),
            report: Mutex::new(None),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.senders.len()
    }

    pub fn bridge(&self) -> &Arc<ConnectionRegistry> {
        &self.bridge
    }

    /// Spawn one thread per shard. Calling it again is a no-op.
    pub fn start(&self) -> std::io::Result<()> {
        let mut receivers = self.receivers.lock();
        let mut handles = self.handles.lock();
        for (id, slot) in receivers.iter_mut().enumerate() {
            let Some(rx) = slot.take() else { continue };
            let runner = ShardRunner::new(
                Shard::new(id, self.bridge.clone()),
                rx,
                self.states[id].clone(),
                self.control.clone(),
                self.config.expiry_interval(),
            );
            let handle = std::thread::Builder::new()
                .name(format!("shard-{id}"))
                .spawn(move || runner.run())?;
            handles.push(handle);
        }
        info!(target: "shardkv::manager", "started {} shard(s)", self.shard_count());
        Ok(())
    }

    /// Start the shards, serve until `ctx` is cancelled, then drain.
    pub fn run(&self, ctx: &Context) -> std::io::Result<DrainReport> {
        self.start()?;
        ctx.wait();
        Ok(self.shutdown())
    }

    /// Stop accepting commands, let queued ones drain, and join every shard.
    ///
    /// Commands queued before this call execute unless the drain timeout
    /// passes first; those still waiting afterwards are answered with an
    /// error and counted as dropped. Idempotent.
    pub fn shutdown(&self) -> DrainReport {
        let mut cached = self.report.lock();
        if let Some(r) = *cached {
            return r;
        }

        self.accepting.store(false, Ordering::Release);
        self.control.begin(self.config.drain_timeout());
        for s in &self.states {
            s.advance(ShardState::Running, ShardState::Draining);
        }
        info!(
            target: "shardkv::manager",
            "draining {} shard(s), timeout {:?}",
            self.shard_count(),
            self.config.drain_timeout()
        );

        // shards that never started still owe their queued commands an answer
        if let Err(e) = self.start() {
            error!(target: "shardkv::manager", "failed to start shard for drain: {}", e);
        }

        for (id, tx) in self.senders.iter().enumerate() {
            if tx.send(ShardMessage::Stop).is_err() {
                warn!(target: "shardkv::manager", "shard {} exited before stop", id);
            }
        }

        let mut report = DrainReport::default();
        for (id, handle) in self.handles.lock().drain(..).enumerate() {
            match handle.join() {
                Ok(r) => report += r,
                Err(_) => error!(target: "shardkv::manager", "shard {} thread panicked", id),
            }
        }
        info!(
            target: "shardkv::manager",
            "drained: {} executed, {} dropped",
            report.executed,
            report.dropped
        );
        *cached = Some(report);
        report
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn shard_states(&self) -> Vec<ShardState> {
        self.states.iter().map(|s| s.get()).collect()
    }

    pub fn shard_for_key(&self, key: &[u8]) -> usize {
        shard_index(key, self.shard_count())
    }

    /// Shard that must execute `cmd`.
    ///
    /// Keyless commands go to shard 0. Commands whose keys span shards are
    /// rejected.
    pub fn route(&self, cmd: &Cmd) -> Result<usize, RoutingError> {
        let mut keys = cmd.keys().into_iter();
        let Some(first) = keys.next() else {
            return Ok(0);
        };
        let shard = self.shard_for_key(first);
        if keys.any(|k| self.shard_for_key(k) != shard) {
            return Err(RoutingError::CrossShard);
        }
        Ok(shard)
    }

    /// Submit a command and get a handle to its response.
    pub fn submit(&self, command: Command) -> Result<ResponseHandle, SubmitError> {
        let (tx, rx) = bounded(1);
        let shard = self.submit_to(command, ReplyTo::Channel(tx))?;
        Ok(ResponseHandle { shard, rx })
    }

    /// Submit a command whose response goes to `reply`.
    ///
    /// Never blocks: a full queue is reported as `Busy`.
    ///
    /// # Returns
    /// * The shard the command was queued on
    pub fn submit_to(&self, command: Command, reply: ReplyTo) -> Result<usize, SubmitError> {
        if !self.is_accepting() {
            return Err(SubmitError::ShuttingDown);
        }
        let shard = self.route(&command.cmd)?;
        match self.senders[shard].try_send(ShardMessage::Execute { command, reply }) {
            Ok(()) => Ok(shard),
            Err(TrySendError::Full(_)) => {
                debug!(target: "shardkv::manager", "shard {} queue full", shard);
                Err(SubmitError::Busy { shard })
            }
            Err(TrySendError::Disconnected(_)) => Err(SubmitError::ShardGone { shard }),
        }
    }

    /// Submit and wait: the synchronous entry point for in-process callers.
    pub fn execute(&self, command: Command) -> Result<Response, SubmitError> {
        self.submit(command)?.wait()
    }

    /// Ask the owning shard to drop a subscription.
    ///
    /// Accepted during drain too, so closing connections release their
    /// watches. A full queue is waited on for up to `UNSUBSCRIBE_WAIT`.
    /// Returns `false` if the request still could not be queued; the shard
    /// then prunes the subscription on its next delivery attempt.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Some(tx) = self.senders.get(id.shard) else { return false };
        match tx.try_send(ShardMessage::Unsubscribe(id)) {
            Ok(()) => true,
            Err(TrySendError::Disconnected(_)) => false,
            Err(TrySendError::Full(msg)) => {
                if tx.send_timeout(msg, UNSUBSCRIBE_WAIT).is_ok() {
                    return true;
                }
                warn!(target: "shardkv::manager", "shard {} queue stayed full, {} left for lazy pruning", id.shard, id);
                false
            }
        }
    }
}

impl Drop for ShardManager {
    fn drop(&mut self) {
        if !self.handles.lock().is_empty() {
            self.shutdown();
        }
    }
}
