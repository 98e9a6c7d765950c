use bytes::BytesMut;
use shardkv::*;

fn parse_all(input: &[u8]) -> Vec<Cmd> {
    let mut buf = BytesMut::from(input);
    let mut reqs = Vec::new();
    protocol::parse_many(&mut buf, &mut reqs).unwrap();
    assert!(buf.is_empty());
    reqs.into_iter().map(|r| Cmd::parse(r).unwrap()).collect()
}

#[test]
fn parse_ping_and_set_get() {
    let mut input = Vec::new();
    input.extend_from_slice(b"*1\r\n$4\r\nPING\r\n");
    input.extend_from_slice(b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n");
    input.extend_from_slice(b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n");
    let cmds = parse_all(&input);
    assert_eq!(cmds.len(), 3);
    assert!(matches!(cmds[0], Cmd::Ping(None)));
    assert!(matches!(cmds[1], Cmd::Set { .. }));
    assert!(matches!(cmds[2], Cmd::Get(_)));
}

#[test]
fn inline_commands_are_accepted() {
    let cmds = parse_all(b"PING\r\nset greeting \"hello\"\r\n");
    assert!(matches!(cmds[0], Cmd::Ping(None)));
    match &cmds[1] {
        Cmd::Set { key, value, .. } => {
            assert_eq!(&key[..], b"greeting");
            assert_eq!(&value[..], b"hello");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn partial_frame_waits_for_more_input() {
    let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$5\r\nhel"[..]);
    let mut reqs = Vec::new();
    protocol::parse_many(&mut buf, &mut reqs).unwrap();
    assert!(reqs.is_empty());
    buf.extend_from_slice(b"lo\r\n");
    protocol::parse_many(&mut buf, &mut reqs).unwrap();
    assert_eq!(reqs.len(), 1);
    assert!(buf.is_empty());
}

#[test]
fn malformed_frame_is_a_protocol_error() {
    let mut buf = BytesMut::from(&b"*1\r\n:5\r\n"[..]);
    let mut reqs = Vec::new();
    let err = protocol::parse_many(&mut buf, &mut reqs).unwrap_err();
    assert!(err.to_string().starts_with("ERR Protocol error"));
}

#[test]
fn command_errors_render_as_resp_errors() {
    let unknown = Command::parse(vec!["FLY".into()]).unwrap_err();
    assert!(Frame::error(unknown).to_bytes().starts_with(b"-ERR unknown command"));

    let arity = Command::parse(vec!["GET".into()]).unwrap_err();
    assert_eq!(arity.to_string(), "ERR wrong number of arguments for 'get' command");
}

#[test]
fn frames_encode_to_resp() {
    let frame = Frame::Array(vec![Frame::bulk("a"), Frame::Integer(3), Frame::Null]);
    assert_eq!(&frame.to_bytes()[..], b"*3\r\n$1\r\na\r\n:3\r\n$-1\r\n");
    let push = Frame::Push(vec![Frame::bulk("watch")]);
    assert_eq!(&push.to_bytes()[..], b">1\r\n$5\r\nwatch\r\n");
}
