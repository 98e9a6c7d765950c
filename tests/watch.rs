use bytes::Bytes;
use crossbeam::channel::{unbounded, Receiver};
use mio::{Poll, Token, Waker};
use shardkv::bridge::{Outbound, PollerHandle};
use shardkv::*;
use std::sync::Arc;
use std::time::Duration;

/// A shard manager plus a fake poller inbox standing in for a client.
struct Harness {
    manager: ShardManager,
    bridge: Arc<ConnectionRegistry>,
    conn: ConnId,
    inbox: Receiver<Outbound>,
    _poll: Poll,
}

impl Harness {
    fn new() -> Self {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(0)).unwrap());
        let (tx, inbox) = unbounded();
        let bridge = Arc::new(ConnectionRegistry::new());
        let conn = bridge.next_id();
        bridge.register(conn, PollerHandle::new(tx, waker));
        let manager = ShardManager::new(EngineConfig::with_shards(4), bridge.clone());
        manager.start().unwrap();
        Self {
            manager,
            bridge,
            conn,
            inbox,
            _poll: poll,
        }
    }

    fn run(&self, words: &[&str]) -> Response {
        let args = words.iter().map(|w| Bytes::copy_from_slice(w.as_bytes())).collect();
        let cmd = Cmd::parse(args).unwrap();
        self.manager.execute(Command::from_conn(cmd, self.conn)).unwrap()
    }

    fn watch(&self, key: &str) -> Subscription {
        match self.run(&["WATCH", key]).subscription {
            Some(SubscriptionChange::Added(sub)) => sub,
            other => panic!("WATCH did not subscribe: {other:?}"),
        }
    }

    fn next_push(&self, timeout: Duration) -> Option<Frame> {
        match self.inbox.recv_timeout(timeout) {
            Ok(Outbound::Push { conn, frame }) => {
                assert_eq!(conn, self.conn);
                Some(frame)
            }
            Ok(_) => panic!("unexpected non-push delivery"),
            Err(_) => None,
        }
    }
}

fn push(parts: &[&'static str]) -> Frame {
    Frame::Push(parts.iter().map(|p| Frame::bulk(*p)).collect())
}

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(200);

#[test]
fn watch_is_owned_by_the_key_shard() {
    let h = Harness::new();
    let sub = h.watch("foo");
    assert_eq!(sub.id.shard, h.manager.shard_for_key(b"foo"));
    assert_eq!(sub.conn, h.conn);
    assert_eq!(&sub.key[..], b"foo");

    // watching again from the same connection keeps the subscription
    assert_eq!(h.watch("foo").id, sub.id);
}

#[test]
fn mutations_are_pushed_in_order() {
    let h = Harness::new();
    h.watch("foo");
    for v in ["v1", "v2", "v3"] {
        h.run(&["SET", "foo", v]);
    }
    h.run(&["DEL", "foo"]);
    assert_eq!(h.next_push(WAIT), Some(push(&["watch", "foo", "set", "v1"])));
    assert_eq!(h.next_push(WAIT), Some(push(&["watch", "foo", "set", "v2"])));
    assert_eq!(h.next_push(WAIT), Some(push(&["watch", "foo", "set", "v3"])));
    assert_eq!(h.next_push(WAIT), Some(push(&["watch", "foo", "del"])));

    // other keys stay quiet
    h.run(&["SET", "bar", "x"]);
    assert_eq!(h.next_push(QUIET), None);
}

#[test]
fn expiry_is_pushed_as_delete() {
    let h = Harness::new();
    h.watch("session");
    h.run(&["SET", "session", "token", "PX", "50"]);
    assert_eq!(h.next_push(WAIT), Some(push(&["watch", "session", "set", "token"])));
    assert_eq!(h.next_push(WAIT), Some(push(&["watch", "session", "del"])));
}

#[test]
fn unsubscribe_stops_pushes() {
    let h = Harness::new();
    let sub = h.watch("foo");
    assert!(h.manager.unsubscribe(sub.id));
    h.run(&["SET", "foo", "x"]);
    assert_eq!(h.next_push(QUIET), None);
}

#[test]
fn unwatch_reports_whether_it_removed_anything() {
    let h = Harness::new();
    h.watch("foo");
    let r = h.run(&["UNWATCH", "foo"]);
    assert!(matches!(r.subscription, Some(SubscriptionChange::Removed(_))));
    assert_eq!(
        r.frame,
        Frame::Array(vec![Frame::bulk("unwatch"), Frame::bulk("foo"), Frame::Integer(1)])
    );
    let again = h.run(&["UNWATCH", "foo"]);
    assert_eq!(again.subscription, None);
    assert_eq!(
        again.frame,
        Frame::Array(vec![Frame::bulk("unwatch"), Frame::bulk("foo"), Frame::Integer(0)])
    );
}

#[test]
fn departed_connection_gets_nothing() {
    let h = Harness::new();
    h.watch("foo");
    h.bridge.unregister(h.conn);
    assert!(!h.bridge.contains(h.conn));
    let r = h.manager.execute(Command::parse(vec!["SET".into(), "foo".into(), "x".into()]).unwrap());
    assert_eq!(r.unwrap().frame, Frame::ok());
    assert_eq!(h.next_push(QUIET), None);
}

#[test]
fn one_push_per_mutation_under_load_on_other_keys() {
    let h = Harness::new();
    h.watch("foo");
    const N: usize = 200;

    std::thread::scope(|s| {
        for t in 0..4 {
            let manager = &h.manager;
            s.spawn(move || {
                for i in 0..500 {
                    let key = format!("other-{t}-{i}");
                    let args = vec![
                        Bytes::from_static(b"SET"),
                        Bytes::from(key),
                        Bytes::from_static(b"x"),
                    ];
                    let r = manager.execute(Command::parse(args).unwrap()).unwrap();
                    assert_eq!(r.frame, Frame::ok());
                }
            });
        }
        for i in 0..N {
            let v = format!("v{i}");
            h.run(&["SET", "foo", &v]);
        }
    });

    for i in 0..N {
        let expected = Frame::Push(vec![
            Frame::bulk("watch"),
            Frame::bulk("foo"),
            Frame::bulk("set"),
            Frame::bulk(format!("v{i}")),
        ]);
        assert_eq!(h.next_push(WAIT), Some(expected));
    }
    assert_eq!(h.next_push(QUIET), None);
}
