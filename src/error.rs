/*!
 * Error Taxonomy
 *
 * Every error that can reach a client renders as the text of a RESP error
 * reply (without the leading '-'). Only bind failures and aborts travel up
 * to the supervisor; everything else is turned into a reply locally.
 */

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Malformed input on the wire. The connection is closed after the reply.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("ERR Protocol error: expected '{expected}', got '{found}'")]
    UnexpectedByte { expected: char, found: char },
    #[error("ERR Protocol error: invalid length")]
    InvalidLength,
    #[error("ERR Protocol error: expected CRLF")]
    MissingCrlf,
    #[error("ERR Protocol error: unbalanced quotes in request")]
    UnbalancedQuotes,
    #[error("ERR Protocol error: request exceeds {limit} bytes")]
    BufferLimit { limit: usize },
}

/// A well-formed frame that does not describe a valid command.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("ERR unknown command '{0}'")]
    Unknown(String),
    #[error("ERR wrong number of arguments for '{0}' command")]
    Arity(&'static str),
    #[error("ERR syntax error")]
    Syntax,
    #[error("ERR value is not an integer or out of range")]
    NotInteger,
    #[error("ERR invalid expire time in '{0}' command")]
    InvalidExpire(&'static str),
    #[error("ERR {0} requires a client connection")]
    NeedsConnection(&'static str),
}

/// A multi-key command whose keys live on different shards.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RoutingError {
    #[error("CROSSSLOT Keys in request don't hash to the same shard")]
    CrossShard,
}

/// Errors returned by store operations. These are ordinary replies.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("ERR no such key")]
    NotFound,
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,
    #[error("ERR value is not an integer or out of range")]
    TypeMismatch,
}

/// Failure to submit a command to a shard.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("ERR server shutting down")]
    ShuttingDown,
    #[error("ERR server busy, shard {shard} queue is full")]
    Busy { shard: usize },
    #[error("ERR shard {shard} unavailable")]
    ShardGone { shard: usize },
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// No address in the configured range could be bound.
#[derive(Debug, Error)]
#[error("unable to bind {addr} (tried {attempts} port(s))")]
pub struct BindError {
    pub addr: SocketAddr,
    pub attempts: u16,
    #[source]
    pub source: io::Error,
}

/// Terminal outcome of a server's `run`.
#[derive(Debug, Error)]
pub enum ServerError {
    /// An operator issued ABORT; the supervisor cancels every sibling.
    #[error("server aborted")]
    Aborted,
    /// The process context was cancelled before the server drained.
    #[error("server canceled")]
    Canceled,
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error("server io error: {0}")]
    Io(#[from] io::Error),
}

impl ServerError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, ServerError::Aborted)
    }
}
