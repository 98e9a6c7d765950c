// Core modules for the shardkv server
pub mod time; // process clock for expiry deadlines
pub mod error; // error taxonomy, rendered as RESP error replies
pub mod protocol; // RESP parser + Frame encoder
pub mod command; // Cmd model, validation and key extraction
pub mod storage; // per-shard Store and Value types
pub mod watch; // per-shard WATCH subscriptions
pub mod bridge; // shard → poller delivery (ConnectionRegistry)
pub mod shard; // Shard::exec and the shard thread loop
pub mod manager; // ShardManager: routing, submit, drain
pub mod context; // cancellation shared by every long-running component
pub mod connection; // per-client buffers and reply ordering
pub mod net; // AsyncServer: mio pollers and the RESP front end
pub mod config; // TOML + defaults
pub mod logging; // env_logger setup
pub mod supervisor; // process wiring and shutdown sequence

pub use bridge::{ConnId, ConnectionRegistry};
pub use command::{Cmd, Command};
pub use config::{Config, EngineConfig, ServerConfig};
pub use context::Context;
pub use error::*;
pub use manager::{shard_index, ResponseHandle, ShardManager};
pub use net::AsyncServer;
pub use protocol::Frame;
pub use shard::{DrainReport, ReplyTo, Response, Shard, ShardState, SubscriptionChange};
pub use storage::{Store, Value};
pub use watch::{Subscription, SubscriptionId, WatchEvent};

// Default listening port, shared with Redis-compatible tooling
pub const DEFAULT_PORT: u16 = 7379;
