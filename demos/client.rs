//! Minimal client: SET/GET, then WATCH a key and print the pushes caused by
//! a second connection.
//!
//! Start the server first (`cargo run --release`), then
//! `cargo run --example client`.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;

fn encode(args: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for a in args {
        out.extend_from_slice(format!("${}\r\n{}\r\n", a.len(), a).as_bytes());
    }
    out
}

/// Read one reply and return its raw RESP text.
fn read_reply(r: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    r.read_line(&mut line).expect("read");
    let mut out = line.clone();
    let body = line[1..].trim_end();
    match line.as_bytes().first() {
        Some(b'$') => {
            let len: i64 = body.parse().expect("bulk length");
            if len >= 0 {
                let mut data = vec![0u8; len as usize + 2];
                r.read_exact(&mut data).expect("bulk body");
                out.push_str(&String::from_utf8_lossy(&data));
            }
        }
        Some(b'*') | Some(b'>') => {
            let n: usize = body.parse().expect("array length");
            for _ in 0..n {
                out.push_str(&read_reply(r));
            }
        }
        _ => {}
    }
    out
}

fn main() {
    let addr = std::env::args().nth(1).unwrap_or_else(|| "127.0.0.1:7379".to_string());
    let mut watcher = TcpStream::connect(&addr).expect("connect");
    let mut writer = TcpStream::connect(&addr).expect("connect");
    let mut watcher_in = BufReader::new(watcher.try_clone().expect("clone"));
    let mut writer_in = BufReader::new(writer.try_clone().expect("clone"));

    writer.write_all(&encode(&["SET", "hello", "world"])).unwrap();
    print!("{}", read_reply(&mut writer_in));
    writer.write_all(&encode(&["GET", "hello"])).unwrap();
    print!("{}", read_reply(&mut writer_in));

    watcher.write_all(&encode(&["WATCH", "hello"])).unwrap();
    print!("{}", read_reply(&mut watcher_in));

    writer.write_all(&encode(&["SET", "hello", "again"])).unwrap();
    read_reply(&mut writer_in);
    writer.write_all(&encode(&["DEL", "hello"])).unwrap();
    read_reply(&mut writer_in);

    // one push per mutation
    print!("{}", read_reply(&mut watcher_in));
    print!("{}", read_reply(&mut watcher_in));
}
