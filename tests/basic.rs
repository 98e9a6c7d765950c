use bytes::Bytes;
use shardkv::*;
use std::sync::Arc;

fn shard() -> Shard {
    Shard::new(0, Arc::new(ConnectionRegistry::new()))
}

fn run(s: &mut Shard, words: &[&str]) -> Frame {
    let args = words.iter().map(|w| Bytes::copy_from_slice(w.as_bytes())).collect();
    s.exec(Command::parse(args).unwrap()).frame
}

fn bulk(s: &str) -> Frame {
    Frame::bulk(Bytes::copy_from_slice(s.as_bytes()))
}

#[test]
fn set_get_del_cycle() {
    let mut s = shard();
    assert_eq!(run(&mut s, &["SET", "a", "1"]), Frame::ok());
    assert_eq!(run(&mut s, &["GET", "a"]), bulk("1"));
    assert_eq!(run(&mut s, &["DEL", "a"]), Frame::Integer(1));
    assert_eq!(run(&mut s, &["GET", "a"]), Frame::Null);
    assert_eq!(run(&mut s, &["DEL", "a"]), Frame::Integer(0));
}

#[test]
fn rename_exists_incr() {
    let mut s = shard();
    run(&mut s, &["SET", "x", "41"]);
    assert_eq!(run(&mut s, &["EXISTS", "x"]), Frame::Integer(1));
    assert_eq!(run(&mut s, &["INCR", "x"]), Frame::Integer(42));
    assert_eq!(run(&mut s, &["RENAME", "x", "y"]), Frame::ok());
    assert_eq!(run(&mut s, &["GET", "y"]), bulk("42"));
    assert_eq!(run(&mut s, &["EXISTS", "x", "y"]), Frame::Integer(1));
    assert!(run(&mut s, &["RENAME", "missing", "z"]).is_error());
}

#[test]
fn counters_reject_non_integers() {
    let mut s = shard();
    assert_eq!(run(&mut s, &["DECRBY", "n", "5"]), Frame::Integer(-5));
    run(&mut s, &["SET", "word", "abc"]);
    assert!(run(&mut s, &["INCR", "word"]).is_error());
    assert_eq!(run(&mut s, &["GET", "word"]), bulk("abc"));
}

#[test]
fn lists_and_hashes() {
    let mut s = shard();
    assert_eq!(run(&mut s, &["RPUSH", "l", "a", "b", "c"]), Frame::Integer(3));
    assert_eq!(run(&mut s, &["LPUSH", "l", "z"]), Frame::Integer(4));
    assert_eq!(
        run(&mut s, &["LRANGE", "l", "0", "-1"]),
        Frame::Array(vec![bulk("z"), bulk("a"), bulk("b"), bulk("c")])
    );
    assert_eq!(run(&mut s, &["LRANGE", "l", "0", "-100"]), Frame::Array(vec![]));
    assert_eq!(
        run(&mut s, &["LRANGE", "l", "-100", "1"]),
        Frame::Array(vec![bulk("z"), bulk("a")])
    );
    assert_eq!(run(&mut s, &["RPOP", "l"]), bulk("c"));
    assert_eq!(run(&mut s, &["LLEN", "l"]), Frame::Integer(3));
    assert_eq!(run(&mut s, &["TYPE", "l"]), Frame::Simple("list".into()));
    assert!(run(&mut s, &["GET", "l"]).is_error());

    assert_eq!(run(&mut s, &["HSET", "h", "f1", "v1", "f2", "v2"]), Frame::Integer(2));
    assert_eq!(run(&mut s, &["HGET", "h", "f2"]), bulk("v2"));
    assert_eq!(run(&mut s, &["HDEL", "h", "f1", "nope"]), Frame::Integer(1));
    assert_eq!(run(&mut s, &["HGETALL", "h"]), Frame::Array(vec![bulk("f2"), bulk("v2")]));
    assert!(run(&mut s, &["LPUSH", "h", "x"]).is_error());
}

#[test]
fn expiry_is_lazy_and_persist_clears_it() {
    let mut s = shard();
    let now = shardkv::time::now_ms();
    let set = Command::parse(vec![
        Bytes::from_static(b"SET"),
        Bytes::from_static(b"k"),
        Bytes::from_static(b"v"),
        Bytes::from_static(b"PX"),
        Bytes::from_static(b"100"),
    ])
    .unwrap();
    assert_eq!(s.exec_at(set, now).frame, Frame::ok());
    let get = || Command::parse(vec![Bytes::from_static(b"GET"), Bytes::from_static(b"k")]).unwrap();
    assert_eq!(s.exec_at(get(), now + 50).frame, bulk("v"));
    assert_eq!(s.exec_at(get(), now + 100).frame, Frame::Null);

    run(&mut s, &["SET", "p", "v", "EX", "100"]);
    assert_eq!(run(&mut s, &["PERSIST", "p"]), Frame::Integer(1));
    assert_eq!(run(&mut s, &["TTL", "p"]), Frame::Integer(-1));
    assert_eq!(run(&mut s, &["TTL", "gone"]), Frame::Integer(-2));
}

#[test]
fn multi_key_commands_on_one_shard() {
    let mut s = shard();
    assert_eq!(run(&mut s, &["MSET", "a", "1", "b", "2"]), Frame::ok());
    assert_eq!(
        run(&mut s, &["MGET", "a", "missing", "b"]),
        Frame::Array(vec![bulk("1"), Frame::Null, bulk("2")])
    );
}

#[test]
fn huge_ttls_do_not_wrap() {
    let mut s = shard();
    let words = |w: &[&str]| -> Vec<Bytes> { w.iter().map(|x| Bytes::copy_from_slice(x.as_bytes())).collect() };
    assert!(Command::parse(words(&["SET", "k", "v", "EX", "18446744073709552"])).is_err());

    let now = shardkv::time::now_ms();
    let set = Command::parse(words(&["SET", "k", "v", "PX", "9223372036854775807"])).unwrap();
    assert_eq!(s.exec_at(set, now).frame, Frame::ok());
    let get = Command::parse(words(&["GET", "k"])).unwrap();
    assert_eq!(s.exec_at(get, now + 1000).frame, bulk("v"));
    match run(&mut s, &["PTTL", "k"]) {
        Frame::Integer(ms) => assert!(ms > 1_000_000_000_000),
        other => panic!("unexpected PTTL reply {other:?}"),
    }
}
