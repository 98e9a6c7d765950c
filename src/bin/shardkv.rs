/*!
 * shardkv Server Main Entry Point
 *
 * Resolves configuration (defaults → TOML file → flags), installs the
 * logger and hands over to the supervisor. Exits with status 1 when the
 * configuration is unusable or no port can be bound.
 */

use clap::Parser;
use shardkv::config::Config;
use shardkv::{logging, supervisor};
use std::path::PathBuf;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "shardkv", about = "sharded key-value server with WATCH subscriptions")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "SHARDKV_CONFIG")]
    config: Option<PathBuf>,

    /// write a default configuration file and exit
    #[arg(long)]
    init_config: bool,

    /// directory that --init-config writes shardkv.toml into
    #[arg(short = 'o', long, default_value = ".")]
    output: PathBuf,

    /// address to bind to
    #[arg(long, env = "SHARDKV_HOST")]
    host: Option<String>,

    /// port to listen on
    #[arg(short, long, env = "SHARDKV_PORT")]
    port: Option<u16>,

    /// number of shards. defaults to available CPU cores
    #[arg(long, env = "SHARDKV_SHARDS")]
    shards: Option<usize>,

    /// number of network poller threads. defaults to available CPU cores
    #[arg(long, env = "SHARDKV_IO_THREADS")]
    io_threads: Option<usize>,

    /// require clients to AUTH with this password
    #[arg(long, env = "SHARDKV_REQUIREPASS")]
    requirepass: Option<String>,

    /// log level: trace, debug, info, warn, error
    #[arg(long, env = "SHARDKV_LOG_LEVEL")]
    log_level: Option<String>,
}

/// Only flags that were given override the file.
fn apply_args(cfg: &mut Config, args: &Args) {
    if let Some(ref host) = args.host {
        cfg.server.host = host.clone();
    }
    if let Some(port) = args.port {
        cfg.server.port = port;
    }
    if let Some(n) = args.shards {
        cfg.engine.shards = n;
    }
    if let Some(n) = args.io_threads {
        cfg.server.io_threads = n;
    }
    if let Some(ref pass) = args.requirepass {
        cfg.server.requirepass = Some(pass.clone());
    }
    if let Some(ref level) = args.log_level {
        cfg.server.log_level = level.clone();
    }
}

fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

fn main() {
    let args = Args::parse();

    if args.init_config {
        match Config::default().write_to_dir(&args.output) {
            Ok(path) => {
                println!("wrote {}", path.display());
                return;
            }
            Err(e) => exit_err(format!("error: {e}")),
        }
    }

    let mut cfg = match &args.config {
        Some(path) => Config::from_file(path).unwrap_or_else(|e| exit_err(format!("error: {e}"))),
        None => Config::default(),
    };
    apply_args(&mut cfg, &args);
    if let Err(e) = cfg.validate() {
        exit_err(format!("error: {e}"));
    }

    logging::init(&cfg.server.log_level, cfg.server.pretty_logs);

    if let Err(e) = supervisor::run(cfg) {
        log::error!(target: "shardkv::supervisor", "{:#}", e);
        std::process::exit(1);
    }
}
