mod common;

use common::*;
use shardkv::*;
use std::net::TcpListener;
use std::time::Duration;

#[test]
fn ping_set_get_over_the_wire() {
    let server = TestServer::start();
    let mut c = server.client();
    assert_eq!(c.cmd(&["PING"]), Reply::Simple("PONG".into()));
    assert_eq!(c.cmd(&["ECHO", "hi"]), Reply::bulk("hi"));
    assert_eq!(c.cmd(&["SET", "a", "1"]), Reply::ok());
    assert_eq!(c.cmd(&["GET", "a"]), Reply::bulk("1"));
    assert_eq!(c.cmd(&["GET", "nope"]), Reply::Bulk(None));
    assert!(c.cmd(&["FLY"]).is_error_starting("ERR unknown command"));
    assert_eq!(c.cmd(&["PING"]), Reply::Simple("PONG".into()));
}

#[test]
fn pipelined_replies_keep_request_order_across_shards() {
    let server = TestServer::start();
    let mut c = server.client();
    let mut batch = Vec::new();
    for i in 0..200 {
        let (k, v) = (format!("key-{i}"), i.to_string());
        batch.extend(Client::encode(&[b"SET", k.as_bytes(), v.as_bytes()]));
    }
    for i in 0..200 {
        let k = format!("key-{i}");
        batch.extend(Client::encode(&[b"GET", k.as_bytes()]));
        batch.extend(Client::encode(&[b"PING"]));
    }
    c.raw(&batch);

    for _ in 0..200 {
        assert_eq!(c.read(), Reply::ok());
    }
    for i in 0..200 {
        assert_eq!(c.read(), Reply::bulk(&i.to_string()));
        assert_eq!(c.read(), Reply::Simple("PONG".into()));
    }
}

#[test]
fn watcher_receives_pushes_from_other_clients() {
    let server = TestServer::start();
    let mut a = server.client();
    let mut b = server.client();

    match a.cmd(&["WATCH", "foo"]) {
        Reply::Array(items) => {
            assert_eq!(items[0], Reply::bulk("watch"));
            assert_eq!(items[1], Reply::bulk("foo"));
        }
        other => panic!("unexpected WATCH reply {other:?}"),
    }

    assert_eq!(b.cmd(&["SET", "foo", "bar"]), Reply::ok());
    assert_eq!(
        a.read(),
        Reply::Push(vec![Reply::bulk("watch"), Reply::bulk("foo"), Reply::bulk("set"), Reply::bulk("bar")])
    );

    assert_eq!(b.cmd(&["DEL", "foo"]), Reply::Integer(1));
    assert_eq!(
        a.read(),
        Reply::Push(vec![Reply::bulk("watch"), Reply::bulk("foo"), Reply::bulk("del")])
    );

    assert_eq!(
        a.cmd(&["UNWATCH", "foo"]),
        Reply::Array(vec![Reply::bulk("unwatch"), Reply::bulk("foo"), Reply::Integer(1)])
    );
    assert_eq!(b.cmd(&["SET", "foo", "again"]), Reply::ok());
    // no push queued ahead of the reply
    assert_eq!(a.cmd(&["PING"]), Reply::Simple("PONG".into()));
}

#[test]
fn closing_a_watcher_leaves_the_server_healthy() {
    let server = TestServer::start();
    {
        let mut a = server.client();
        assert!(matches!(a.cmd(&["WATCH", "foo"]), Reply::Array(_)));
    }
    let mut b = server.client();
    for i in 0..50 {
        assert_eq!(b.cmd(&["SET", "foo", &i.to_string()]), Reply::ok());
    }
    assert_eq!(b.cmd(&["GET", "foo"]), Reply::bulk("49"));
}

#[test]
fn cross_shard_request_is_rejected() {
    let server = TestServer::start();
    let n = server.manager.shard_count();
    let b = (0..)
        .map(|i| format!("other-{i}"))
        .find(|k| shard_index(k.as_bytes(), n) != shard_index(b"a", n))
        .unwrap();
    let mut c = server.client();
    assert!(c.cmd(&["MSET", "a", "1", &b, "2"]).is_error_starting("CROSSSLOT"));
    assert_eq!(c.cmd(&["GET", "a"]), Reply::Bulk(None));
}

#[test]
fn protocol_error_closes_the_connection() {
    let server = TestServer::start();
    let mut c = server.client();
    c.raw(b"*1\r\n:5\r\n");
    assert!(c.read().is_error_starting("ERR Protocol error"));
    assert!(c.is_closed());

    let mut other = server.client();
    assert_eq!(other.cmd(&["PING"]), Reply::Simple("PONG".into()));
}

#[test]
fn password_is_required_when_configured() {
    let config = ServerConfig {
        requirepass: Some("secret".into()),
        ..server_config()
    };
    let server = TestServer::with_config(config, EngineConfig::with_shards(2));
    let mut c = server.client();
    assert_eq!(c.cmd(&["PING"]), Reply::Simple("PONG".into()));
    assert!(c.cmd(&["GET", "a"]).is_error_starting("NOAUTH"));
    assert!(c.cmd(&["AUTH", "wrong"]).is_error_starting("WRONGPASS"));
    assert_eq!(c.cmd(&["AUTH", "secret"]), Reply::ok());
    assert_eq!(c.cmd(&["GET", "a"]), Reply::Bulk(None));
}

#[test]
fn abort_stops_the_server() {
    let mut server = TestServer::start();
    let mut c = server.client();
    assert_eq!(c.cmd(&["ABORT"]), Reply::ok());
    let result = server.join();
    assert!(matches!(result, Err(ServerError::Aborted)));
}

#[test]
fn initiated_shutdown_returns_cleanly() {
    let mut server = TestServer::start();
    let mut c = server.client();
    assert_eq!(c.cmd(&["SET", "k", "v"]), Reply::ok());
    assert!(server.shutdown().is_ok());
    assert!(c.is_closed());
}

#[test]
fn cancelled_context_reports_canceled() {
    let mut server = TestServer::start();
    server.ctx.cancel();
    assert!(matches!(server.join(), Err(ServerError::Canceled)));
}

#[test]
fn occupied_port_is_a_bind_error() {
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();
    let config = ServerConfig {
        port,
        ..server_config()
    };
    let manager = std::sync::Arc::new(ShardManager::new(
        EngineConfig::with_shards(1),
        std::sync::Arc::new(ConnectionRegistry::new()),
    ));
    let server = AsyncServer::new(config.clone(), manager.clone()).unwrap();
    let err = server.find_port_and_bind().unwrap_err();
    assert_eq!(err.attempts, 1);

    let scanning = AsyncServer::new(ServerConfig { port_scan: 16, ..config }, manager).unwrap();
    let addr = scanning.find_port_and_bind().unwrap();
    assert_ne!(addr.port(), port);
    assert_eq!(scanning.local_addr(), Some(addr));
}

#[test]
fn idle_connections_are_reaped() {
    let config = ServerConfig {
        idle_timeout_ms: 200,
        ..server_config()
    };
    let server = TestServer::with_config(config, EngineConfig::with_shards(1));
    let mut c = server.client();
    assert_eq!(c.cmd(&["PING"]), Reply::Simple("PONG".into()));
    std::thread::sleep(Duration::from_millis(600));
    assert!(c.is_closed());
}

#[test]
fn pipeline_larger_than_the_read_buffer_is_fully_served() {
    let config = ServerConfig {
        max_read_buffer: 1024,
        io_threads: 1,
        ..server_config()
    };
    let server = TestServer::with_config(config, EngineConfig::with_shards(2));
    let mut c = server.client();

    let ping = Client::encode(&[b"PING"]);
    let batch: Vec<u8> = ping.iter().copied().cycle().take(ping.len() * 10_000).collect();
    c.raw(&batch);

    for _ in 0..10_000 {
        assert_eq!(c.read(), Reply::Simple("PONG".into()));
    }
    assert_eq!(c.cmd(&["SET", "after", "1"]), Reply::ok());
}
