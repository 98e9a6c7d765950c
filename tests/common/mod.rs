#![allow(dead_code)]

use shardkv::*;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// A server on an ephemeral localhost port, torn down on drop.
pub struct TestServer {
    pub addr: SocketAddr,
    pub server: Arc<AsyncServer>,
    pub manager: Arc<ShardManager>,
    pub ctx: Context,
    thread: Option<JoinHandle<Result<(), ServerError>>>,
}

pub fn server_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        io_threads: 2,
        ..ServerConfig::default()
    }
}

impl TestServer {
    pub fn start() -> Self {
        Self::with_config(server_config(), EngineConfig::with_shards(4))
    }

    pub fn with_config(server: ServerConfig, engine: EngineConfig) -> Self {
        let bridge = Arc::new(ConnectionRegistry::new());
        let manager = Arc::new(ShardManager::new(engine, bridge));
        manager.start().expect("start shards");
        let server = Arc::new(AsyncServer::new(server, manager.clone()).expect("server config"));
        let addr = server.find_port_and_bind().expect("bind");
        let ctx = Context::new();
        let thread = {
            let server = server.clone();
            let ctx = ctx.clone();
            std::thread::spawn(move || server.run(&ctx))
        };
        Self {
            addr,
            server,
            manager,
            ctx,
            thread: Some(thread),
        }
    }

    pub fn client(&self) -> Client {
        Client::connect(self.addr)
    }

    /// Wait for `run` to return on its own.
    pub fn join(&mut self) -> Result<(), ServerError> {
        self.thread
            .take()
            .expect("already joined")
            .join()
            .expect("server thread panicked")
    }

    pub fn shutdown(&mut self) -> Result<(), ServerError> {
        self.server.initiate_shutdown();
        self.join()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.initiate_shutdown();
        self.ctx.cancel();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
        self.manager.shutdown();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Vec<Reply>),
    Push(Vec<Reply>),
}

impl Reply {
    pub fn bulk(s: &str) -> Reply {
        Reply::Bulk(Some(s.as_bytes().to_vec()))
    }

    pub fn ok() -> Reply {
        Reply::Simple("OK".to_string())
    }

    pub fn is_error_starting(&self, prefix: &str) -> bool {
        matches!(self, Reply::Error(e) if e.starts_with(prefix))
    }
}

pub struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Client {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect");
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        stream.set_write_timeout(Some(Duration::from_secs(10))).unwrap();
        stream.set_nodelay(true).unwrap();
        Self {
            reader: BufReader::new(stream.try_clone().unwrap()),
            writer: stream,
        }
    }

    pub fn encode(args: &[&[u8]]) -> Vec<u8> {
        let mut out = format!("*{}\r\n", args.len()).into_bytes();
        for a in args {
            out.extend_from_slice(format!("${}\r\n", a.len()).as_bytes());
            out.extend_from_slice(a);
            out.extend_from_slice(b"\r\n");
        }
        out
    }

    pub fn send(&mut self, args: &[&str]) {
        let args: Vec<&[u8]> = args.iter().map(|a| a.as_bytes()).collect();
        self.raw(&Self::encode(&args));
    }

    pub fn raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).expect("write");
    }

    pub fn cmd(&mut self, args: &[&str]) -> Reply {
        self.send(args);
        self.read()
    }

    pub fn read(&mut self) -> Reply {
        let line = self.line();
        let (tag, rest) = line.split_at(1);
        match tag {
            "+" => Reply::Simple(rest.to_string()),
            "-" => Reply::Error(rest.to_string()),
            ":" => Reply::Integer(rest.parse().expect("integer")),
            "$" => {
                let len: i64 = rest.parse().expect("bulk length");
                if len < 0 {
                    return Reply::Bulk(None);
                }
                let mut data = vec![0u8; len as usize + 2];
                self.reader.read_exact(&mut data).expect("bulk body");
                data.truncate(len as usize);
                Reply::Bulk(Some(data))
            }
            "*" | ">" => {
                let n: usize = rest.parse().expect("array length");
                let items = (0..n).map(|_| self.read()).collect();
                if tag == "*" {
                    Reply::Array(items)
                } else {
                    Reply::Push(items)
                }
            }
            other => panic!("unexpected reply tag {other:?} in {line:?}"),
        }
    }

    /// True once the server has closed the connection.
    pub fn is_closed(&mut self) -> bool {
        let mut buf = [0u8; 1];
        matches!(self.reader.read(&mut buf), Ok(0))
    }

    fn line(&mut self) -> String {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).expect("read reply");
        assert!(n > 0, "connection closed");
        line.trim_end_matches("\r\n").to_string()
    }
}
