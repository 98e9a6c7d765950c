/*!
 * Command Model
 *
 * Turns a parsed RESP argument vector into a typed `Cmd`, validating arity
 * and options up front so shards only ever see well-formed commands. Also
 * answers the routing question: which keys does a command touch?
 */

use crate::bridge::ConnId;
use crate::error::CommandError;
use bytes::Bytes;
use std::time::Duration;

/// Which end of a list a push/pop operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum End {
    Left,
    Right,
}

/// SET condition flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetCond {
    #[default]
    Always,
    /// NX: only set if the key does not exist
    IfAbsent,
    /// XX: only set if the key already exists
    IfPresent,
}

/// Resolution of a TTL query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlUnit {
    Seconds,
    Millis,
}

/// Supported commands.
///
/// Keys and values are `Bytes` so they can be moved into the store
/// without copying.
#[derive(Debug, Clone, PartialEq)]
pub enum Cmd {
    Ping(Option<Bytes>),
    Echo(Bytes),
    Auth(Bytes),
    Abort,
    Get(Bytes),
    Set {
        key: Bytes,
        value: Bytes,
        ttl: Option<Duration>,
        cond: SetCond,
    },
    Del(Vec<Bytes>),
    Exists(Vec<Bytes>),
    /// INCR, DECR, INCRBY, DECRBY
    IncrBy(Bytes, i64),
    /// EXPIRE, PEXPIRE
    Expire(Bytes, Duration),
    /// TTL, PTTL
    Ttl(Bytes, TtlUnit),
    Persist(Bytes),
    Type(Bytes),
    Rename(Bytes, Bytes),
    MGet(Vec<Bytes>),
    MSet(Vec<(Bytes, Bytes)>),
    /// LPUSH, RPUSH
    Push {
        key: Bytes,
        values: Vec<Bytes>,
        end: End,
    },
    /// LPOP, RPOP
    Pop(Bytes, End),
    LRange(Bytes, i64, i64),
    LLen(Bytes),
    HSet(Bytes, Vec<(Bytes, Bytes)>),
    HGet(Bytes, Bytes),
    HDel(Bytes, Vec<Bytes>),
    HGetAll(Bytes),
    Watch(Bytes),
    Unwatch(Bytes),
}

impl Cmd {
    /// Parse and validate a request.
    ///
    /// # Arguments
    /// * `args` - command name followed by its arguments, as parsed off the wire
    pub fn parse(args: Vec<Bytes>) -> Result<Cmd, CommandError> {
        if args.is_empty() {
            return Err(CommandError::Syntax);
        }
        let name = args[0].to_ascii_uppercase();
        let argc = args.len();
        let mut rest = args.into_iter();
        rest.next();

        let cmd = match &name[..] {
            b"PING" if argc <= 2 => Cmd::Ping((argc == 2).then(|| next(&mut rest))),
            b"PING" => return Err(CommandError::Arity("ping")),
            b"ECHO" => {
                exact(argc, 2, "echo")?;
                Cmd::Echo(next(&mut rest))
            }
            b"AUTH" => match argc {
                // AUTH <password> or AUTH <username> <password>
                2 => Cmd::Auth(next(&mut rest)),
                3 => {
                    let _user = next(&mut rest);
                    Cmd::Auth(next(&mut rest))
                }
                _ => return Err(CommandError::Arity("auth")),
            },
            b"ABORT" => {
                exact(argc, 1, "abort")?;
                Cmd::Abort
            }
            b"GET" => {
                exact(argc, 2, "get")?;
                Cmd::Get(next(&mut rest))
            }
            b"SET" => {
                if argc < 3 {
                    return Err(CommandError::Arity("set"));
                }
                let key = next(&mut rest);
                let value = next(&mut rest);
                let opts: Vec<Bytes> = rest.collect();
                let (ttl, cond) = parse_set_options(&opts)?;
                Cmd::Set { key, value, ttl, cond }
            }
            b"DEL" => {
                at_least(argc, 2, "del")?;
                Cmd::Del(rest.collect())
            }
            b"EXISTS" => {
                at_least(argc, 2, "exists")?;
                Cmd::Exists(rest.collect())
            }
            b"INCR" => {
                exact(argc, 2, "incr")?;
                Cmd::IncrBy(next(&mut rest), 1)
            }
            b"DECR" => {
                exact(argc, 2, "decr")?;
                Cmd::IncrBy(next(&mut rest), -1)
            }
            b"INCRBY" => {
                exact(argc, 3, "incrby")?;
                let key = next(&mut rest);
                Cmd::IncrBy(key, parse_int(&next(&mut rest))?)
            }
            b"DECRBY" => {
                exact(argc, 3, "decrby")?;
                let key = next(&mut rest);
                let delta = parse_int(&next(&mut rest))?
                    .checked_neg()
                    .ok_or(CommandError::NotInteger)?;
                Cmd::IncrBy(key, delta)
            }
            b"EXPIRE" | b"PEXPIRE" => {
                let millis = name[0] == b'P';
                let label = if millis { "pexpire" } else { "expire" };
                exact(argc, 3, label)?;
                let key = next(&mut rest);
                let n = parse_int(&next(&mut rest))?.max(0);
                Cmd::Expire(key, ttl_from(n, millis, label)?)
            }
            b"TTL" => {
                exact(argc, 2, "ttl")?;
                Cmd::Ttl(next(&mut rest), TtlUnit::Seconds)
            }
            b"PTTL" => {
                exact(argc, 2, "pttl")?;
                Cmd::Ttl(next(&mut rest), TtlUnit::Millis)
            }
            b"PERSIST" => {
                exact(argc, 2, "persist")?;
                Cmd::Persist(next(&mut rest))
            }
            b"TYPE" => {
                exact(argc, 2, "type")?;
                Cmd::Type(next(&mut rest))
            }
            b"RENAME" => {
                exact(argc, 3, "rename")?;
                let from = next(&mut rest);
                Cmd::Rename(from, next(&mut rest))
            }
            b"MGET" => {
                at_least(argc, 2, "mget")?;
                Cmd::MGet(rest.collect())
            }
            b"MSET" => {
                if argc < 3 || argc % 2 == 0 {
                    return Err(CommandError::Arity("mset"));
                }
                Cmd::MSet(pairs(rest.collect()))
            }
            b"LPUSH" | b"RPUSH" => {
                let end = if name[0] == b'L' { End::Left } else { End::Right };
                at_least(argc, 3, if end == End::Left { "lpush" } else { "rpush" })?;
                let key = next(&mut rest);
                Cmd::Push {
                    key,
                    values: rest.collect(),
                    end,
                }
            }
            b"LPOP" => {
                exact(argc, 2, "lpop")?;
                Cmd::Pop(next(&mut rest), End::Left)
            }
            b"RPOP" => {
                exact(argc, 2, "rpop")?;
                Cmd::Pop(next(&mut rest), End::Right)
            }
            b"LRANGE" => {
                exact(argc, 4, "lrange")?;
                let key = next(&mut rest);
                let start = parse_int(&next(&mut rest))?;
                let stop = parse_int(&next(&mut rest))?;
                Cmd::LRange(key, start, stop)
            }
            b"LLEN" => {
                exact(argc, 2, "llen")?;
                Cmd::LLen(next(&mut rest))
            }
            b"HSET" => {
                if argc < 4 || argc % 2 != 0 {
                    return Err(CommandError::Arity("hset"));
                }
                let key = next(&mut rest);
                Cmd::HSet(key, pairs(rest.collect()))
            }
            b"HGET" => {
                exact(argc, 3, "hget")?;
                let key = next(&mut rest);
                Cmd::HGet(key, next(&mut rest))
            }
            b"HDEL" => {
                at_least(argc, 3, "hdel")?;
                let key = next(&mut rest);
                Cmd::HDel(key, rest.collect())
            }
            b"HGETALL" => {
                exact(argc, 2, "hgetall")?;
                Cmd::HGetAll(next(&mut rest))
            }
            b"WATCH" => {
                exact(argc, 2, "watch")?;
                Cmd::Watch(next(&mut rest))
            }
            b"UNWATCH" => {
                exact(argc, 2, "unwatch")?;
                Cmd::Unwatch(next(&mut rest))
            }
            _ => {
                return Err(CommandError::Unknown(
                    String::from_utf8_lossy(&name).into_owned(),
                ))
            }
        };
        Ok(cmd)
    }

    /// Keys touched by this command, in argument order.
    ///
    /// Empty for commands that never reach a shard.
    pub fn keys(&self) -> Vec<&Bytes> {
        match self {
            Cmd::Ping(_) | Cmd::Echo(_) | Cmd::Auth(_) | Cmd::Abort => Vec::new(),
            Cmd::Get(k)
            | Cmd::Set { key: k, .. }
            | Cmd::IncrBy(k, _)
            | Cmd::Expire(k, _)
            | Cmd::Ttl(k, _)
            | Cmd::Persist(k)
            | Cmd::Type(k)
            | Cmd::Push { key: k, .. }
            | Cmd::Pop(k, _)
            | Cmd::LRange(k, _, _)
            | Cmd::LLen(k)
            | Cmd::HSet(k, _)
            | Cmd::HGet(k, _)
            | Cmd::HDel(k, _)
            | Cmd::HGetAll(k)
            | Cmd::Watch(k)
            | Cmd::Unwatch(k) => vec![k],
            Cmd::Del(ks) | Cmd::Exists(ks) | Cmd::MGet(ks) => ks.iter().collect(),
            Cmd::Rename(a, b) => vec![a, b],
            Cmd::MSet(kvs) => kvs.iter().map(|(k, _)| k).collect(),
        }
    }

    /// Lowercase command name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Cmd::Ping(_) => "ping",
            Cmd::Echo(_) => "echo",
            Cmd::Auth(_) => "auth",
            Cmd::Abort => "abort",
            Cmd::Get(_) => "get",
            Cmd::Set { .. } => "set",
            Cmd::Del(_) => "del",
            Cmd::Exists(_) => "exists",
            Cmd::IncrBy(..) => "incrby",
            Cmd::Expire(..) => "expire",
            Cmd::Ttl(..) => "ttl",
            Cmd::Persist(_) => "persist",
            Cmd::Type(_) => "type",
            Cmd::Rename(..) => "rename",
            Cmd::MGet(_) => "mget",
            Cmd::MSet(_) => "mset",
            Cmd::Push { .. } => "push",
            Cmd::Pop(..) => "pop",
            Cmd::LRange(..) => "lrange",
            Cmd::LLen(_) => "llen",
            Cmd::HSet(..) => "hset",
            Cmd::HGet(..) => "hget",
            Cmd::HDel(..) => "hdel",
            Cmd::HGetAll(_) => "hgetall",
            Cmd::Watch(_) => "watch",
            Cmd::Unwatch(_) => "unwatch",
        }
    }
}

/// A parsed client request bound for exactly one shard.
///
/// Immutable once built; consumed by the shard that executes it.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub cmd: Cmd,
    /// Connection that issued the command. `None` for in-process callers.
    pub origin: Option<ConnId>,
}

impl Command {
    pub fn new(cmd: Cmd) -> Self {
        Self { cmd, origin: None }
    }

    pub fn from_conn(cmd: Cmd, conn: ConnId) -> Self {
        Self {
            cmd,
            origin: Some(conn),
        }
    }

    /// Parse raw arguments into an in-process command.
    pub fn parse(args: Vec<Bytes>) -> Result<Self, CommandError> {
        Cmd::parse(args).map(Self::new)
    }
}

fn next(it: &mut std::vec::IntoIter<Bytes>) -> Bytes {
    it.next().unwrap_or_default()
}

fn exact(argc: usize, n: usize, name: &'static str) -> Result<(), CommandError> {
    if argc == n {
        Ok(())
    } else {
        Err(CommandError::Arity(name))
    }
}

fn at_least(argc: usize, n: usize, name: &'static str) -> Result<(), CommandError> {
    if argc >= n {
        Ok(())
    } else {
        Err(CommandError::Arity(name))
    }
}

fn pairs(flat: Vec<Bytes>) -> Vec<(Bytes, Bytes)> {
    let mut it = flat.into_iter();
    let mut out = Vec::with_capacity(it.len() / 2);
    while let (Some(a), Some(b)) = (it.next(), it.next()) {
        out.push((a, b));
    }
    out
}

/// Parse a base-10 signed integer argument.
pub fn parse_int(b: &[u8]) -> Result<i64, CommandError> {
    std::str::from_utf8(b)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(CommandError::NotInteger)
}

/// A non-negative TTL in seconds or milliseconds; anything whose
/// millisecond value does not fit an i64 is rejected.
fn ttl_from(n: i64, millis: bool, label: &'static str) -> Result<Duration, CommandError> {
    let ms = if millis { Some(n) } else { n.checked_mul(1000) };
    match ms {
        Some(ms) if ms >= 0 => Ok(Duration::from_millis(ms as u64)),
        _ => Err(CommandError::InvalidExpire(label)),
    }
}

fn parse_set_options(opts: &[Bytes]) -> Result<(Option<Duration>, SetCond), CommandError> {
    let mut ttl = None;
    let mut cond = SetCond::Always;
    let mut i = 0;
    while i < opts.len() {
        let opt = opts[i].to_ascii_uppercase();
        match &opt[..] {
            b"EX" | b"PX" => {
                if ttl.is_some() {
                    return Err(CommandError::Syntax);
                }
                let n = opts.get(i + 1).ok_or(CommandError::Syntax)?;
                let n = parse_int(n)?;
                if n <= 0 {
                    return Err(CommandError::InvalidExpire("set"));
                }
                ttl = Some(ttl_from(n, opt[0] == b'P', "set")?);
                i += 2;
            }
            b"NX" | b"XX" => {
                if cond != SetCond::Always {
                    return Err(CommandError::Syntax);
                }
                cond = if opt[0] == b'N' {
                    SetCond::IfAbsent
                } else {
                    SetCond::IfPresent
                };
                i += 1;
            }
            _ => return Err(CommandError::Syntax),
        }
    }
    Ok((ttl, cond))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(words: &[&str]) -> Result<Cmd, CommandError> {
        Cmd::parse(
            words
                .iter()
                .map(|w| Bytes::copy_from_slice(w.as_bytes()))
                .collect(),
        )
    }

    #[test]
    fn names_are_case_insensitive() {
        assert_eq!(parse(&["get", "a"]).unwrap(), Cmd::Get(Bytes::from_static(b"a")));
        assert_eq!(parse(&["PiNg"]).unwrap(), Cmd::Ping(None));
    }

    #[test]
    fn set_options() {
        let cmd = parse(&["SET", "k", "v", "px", "1500", "NX"]).unwrap();
        assert_eq!(
            cmd,
            Cmd::Set {
                key: Bytes::from_static(b"k"),
                value: Bytes::from_static(b"v"),
                ttl: Some(Duration::from_millis(1500)),
                cond: SetCond::IfAbsent,
            }
        );
        assert_eq!(parse(&["SET", "k", "v", "EX"]), Err(CommandError::Syntax));
        assert_eq!(
            parse(&["SET", "k", "v", "EX", "0"]),
            Err(CommandError::InvalidExpire("set"))
        );
        assert_eq!(parse(&["SET", "k", "v", "NX", "XX"]), Err(CommandError::Syntax));
    }

    #[test]
    fn overflowing_ttls_are_rejected() {
        assert_eq!(
            parse(&["SET", "k", "v", "EX", "18446744073709552"]),
            Err(CommandError::InvalidExpire("set"))
        );
        assert_eq!(
            parse(&["EXPIRE", "k", "9223372036854776"]),
            Err(CommandError::InvalidExpire("expire"))
        );
        assert_eq!(
            parse(&["EXPIRE", "k", "9223372036854775"]).unwrap(),
            Cmd::Expire(Bytes::from_static(b"k"), Duration::from_secs(9_223_372_036_854_775))
        );
        assert_eq!(
            parse(&["PEXPIRE", "k", "9223372036854775807"]).unwrap(),
            Cmd::Expire(Bytes::from_static(b"k"), Duration::from_millis(i64::MAX as u64))
        );
    }

    #[test]
    fn arity_errors() {
        assert_eq!(parse(&["GET"]), Err(CommandError::Arity("get")));
        assert_eq!(parse(&["MSET", "a", "1", "b"]), Err(CommandError::Arity("mset")));
        assert_eq!(parse(&["HSET", "h", "f"]), Err(CommandError::Arity("hset")));
        assert_eq!(
            parse(&["NOPE"]),
            Err(CommandError::Unknown("NOPE".to_string()))
        );
    }

    #[test]
    fn decrby_negates() {
        assert_eq!(
            parse(&["DECRBY", "n", "5"]).unwrap(),
            Cmd::IncrBy(Bytes::from_static(b"n"), -5)
        );
        assert_eq!(
            parse(&["DECRBY", "n", &i64::MIN.to_string()]),
            Err(CommandError::NotInteger)
        );
    }

    #[test]
    fn keys_cover_every_key_argument() {
        let cmd = parse(&["MSET", "a", "1", "b", "2"]).unwrap();
        assert_eq!(cmd.keys(), vec![&Bytes::from_static(b"a"), &Bytes::from_static(b"b")]);
        let cmd = parse(&["RENAME", "x", "y"]).unwrap();
        assert_eq!(cmd.keys().len(), 2);
        assert!(parse(&["PING", "hi"]).unwrap().keys().is_empty());
    }
}
