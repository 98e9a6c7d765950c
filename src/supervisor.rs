/*!
 * Process Supervisor
 *
 * Wires the shard manager, the RESP server and signal handling together and
 * owns the shutdown sequence:
 *
 *   bind (fatal on failure) → signal thread → shards → servers →
 *   wait for every server → cancel → join
 *
 * A server that returns `ServerError::Aborted` cancels the shared context,
 * which brings every sibling down as well.
 */

use crate::bridge::ConnectionRegistry;
use crate::config::Config;
use crate::context::Context;
use crate::error::ServerError;
use crate::manager::ShardManager;
use crate::net::AsyncServer;
use anyhow::Context as _;
use crossbeam::channel::{unbounded, Receiver, Sender};
use log::{debug, error, info};
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::signal;
use tokio::sync::oneshot;

type ServerResult = (&'static str, Result<(), ServerError>);

/// A set of server threads whose results are collected together.
///
/// The group counts what it spawns and waits for exactly that many results,
/// so no result can be missed or waited for twice.
pub struct ServerGroup {
    tx: Sender<ServerResult>,
    rx: Receiver<ServerResult>,
    handles: Vec<JoinHandle<()>>,
}

impl Default for ServerGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerGroup {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            handles: Vec::new(),
        }
    }

    /// Run `f` on its own thread as member `name` of the group.
    pub fn spawn<F>(&mut self, name: &'static str, f: F) -> io::Result<()>
    where
        F: FnOnce() -> Result<(), ServerError> + Send + 'static,
    {
        let tx = self.tx.clone();
        let handle = thread::Builder::new()
            .name(format!("server-{name}"))
            .spawn(move || {
                let result = catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
                    Err(ServerError::Io(io::Error::new(
                        io::ErrorKind::Other,
                        format!("{name} panicked"),
                    )))
                });
                let _ = tx.send((name, result));
            })?;
        self.handles.push(handle);
        Ok(())
    }

    /// Wait for every member to finish.
    ///
    /// An aborted member cancels `ctx` immediately so the others stop too.
    /// Returns the members that ended with an error.
    pub fn wait(self, ctx: &Context) -> Vec<(&'static str, ServerError)> {
        let mut failures = Vec::new();
        for _ in 0..self.handles.len() {
            let Ok((name, result)) = self.rx.recv() else { break };
            match result {
                Ok(()) => debug!(target: "shardkv::supervisor", "{} stopped without error", name),
                Err(ServerError::Canceled) => {
                    debug!(target: "shardkv::supervisor", "{} was canceled", name);
                    failures.push((name, ServerError::Canceled));
                }
                Err(ServerError::Aborted) => {
                    info!(target: "shardkv::supervisor", "{} received abort command", name);
                    ctx.cancel();
                    failures.push((name, ServerError::Aborted));
                }
                Err(e) => {
                    error!(target: "shardkv::supervisor", "{} error: {}", name, e);
                    failures.push((name, e));
                }
            }
        }
        for h in self.handles {
            let _ = h.join();
        }
        failures
    }
}

/// Handle to the thread waiting for SIGINT/SIGTERM.
struct SignalThread {
    stop: oneshot::Sender<()>,
    thread: JoinHandle<()>,
}

impl SignalThread {
    /// On the first signal, stop the server from accepting and cancel `ctx`.
    ///
    /// Handlers are installed before this returns.
    fn spawn(ctx: Context, server: Arc<AsyncServer>) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        #[cfg(unix)]
        let mut term = {
            let _rt = runtime.enter();
            signal::unix::signal(signal::unix::SignalKind::terminate())?
        };
        let (stop, stopped) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name("signals".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    #[cfg(unix)]
                    let terminated = term.recv();
                    #[cfg(not(unix))]
                    let terminated = std::future::pending::<Option<()>>();

                    let name = tokio::select! {
                        Ok(()) = signal::ctrl_c() => "SIGINT",
                        Some(()) = terminated => "SIGTERM",
                        _ = stopped => return,
                    };
                    info!(target: "shardkv::supervisor", "received {}, shutting down", name);
                    server.initiate_shutdown();
                    ctx.cancel();
                })
            })?;
        Ok(Self { stop, thread })
    }

    fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.thread.join();
    }
}

/// Run the whole process until a signal, an ABORT, or a fatal error.
///
/// A bind failure is returned before any shard starts.
pub fn run(config: Config) -> anyhow::Result<()> {
    let ctx = Context::new();
    let bridge = Arc::new(ConnectionRegistry::new());
    let manager = Arc::new(ShardManager::new(config.engine.clone(), bridge));
    let server = Arc::new(AsyncServer::new(config.server.clone(), manager.clone())?);

    server
        .find_port_and_bind()
        .context("error finding and binding port")?;

    let signals = SignalThread::spawn(ctx.clone(), server.clone())
        .context("failed to install signal handlers")?;

    let shards = {
        let manager = manager.clone();
        let ctx = ctx.clone();
        thread::Builder::new()
            .name("shard-manager".to_string())
            .spawn(move || manager.run(&ctx))
            .context("failed to start shard manager")?
    };

    let mut group = ServerGroup::new();
    {
        let server = server.clone();
        let ctx = ctx.clone();
        group.spawn("resp", move || server.run(&ctx))?;
    }

    let failures = group.wait(&ctx);
    signals.stop();
    ctx.cancel();

    match shards.join() {
        Ok(Ok(report)) => info!(
            target: "shardkv::supervisor",
            "shards drained: {} executed, {} dropped",
            report.executed,
            report.dropped
        ),
        Ok(Err(e)) => error!(target: "shardkv::supervisor", "shard manager failed: {}", e),
        Err(_) => error!(target: "shardkv::supervisor", "shard manager panicked"),
    }

    let fatal = failures
        .iter()
        .filter(|(_, e)| !matches!(e, ServerError::Aborted | ServerError::Canceled))
        .count();
    info!(
        target: "shardkv::supervisor",
        "shut down gracefully ({} server error(s))",
        fatal
    );
    Ok(())
}
