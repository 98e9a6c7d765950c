/*!
 * RESP Protocol Implementation
 *
 * Incremental request parsing and reply encoding. Requests are RESP arrays
 * of bulk strings (or inline, whitespace-separated lines for telnet-style
 * clients). Replies are RESP2; watch notifications use the RESP3 push type
 * ('>') so clients can tell them apart from command replies.
 */

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use smol_str::SmolStr;

/// Largest bulk string accepted in a request (512 MiB, as Redis).
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Upper bound for pre-allocating argument vectors from an untrusted count.
const MAX_PREALLOC_ARGS: usize = 1024;

/// A reply value, produced by a shard or by the network layer.
///
/// Frames cross thread boundaries (shard → poller) and are only encoded to
/// bytes by the thread that owns the destination connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Status reply: `+OK\r\n`
    Simple(SmolStr),
    /// Error reply: `-ERR ...\r\n`
    Error(SmolStr),
    /// Integer reply: `:1\r\n`
    Integer(i64),
    /// Bulk string reply: `$3\r\nfoo\r\n`
    Bulk(Bytes),
    /// Null bulk string: `$-1\r\n`
    Null,
    /// Array reply: `*<n>\r\n...`
    Array(Vec<Frame>),
    /// Out-of-band push: `><n>\r\n...`
    Push(Vec<Frame>),
}

impl Frame {
    #[inline]
    pub fn ok() -> Frame {
        Frame::Simple(SmolStr::new_static("OK"))
    }

    /// Builds an error reply from anything that renders as RESP error text.
    pub fn error(e: impl std::fmt::Display) -> Frame {
        Frame::Error(SmolStr::new(e.to_string()))
    }

    #[inline]
    pub fn bulk(b: impl Into<Bytes>) -> Frame {
        Frame::Bulk(b.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error(_))
    }

    /// Encode this frame in RESP format, appending to `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Frame::Simple(s) => write_simple(s, out),
            Frame::Error(s) => write_error(s, out),
            Frame::Integer(i) => write_integer(*i, out),
            Frame::Bulk(b) => write_bulk(b, out),
            Frame::Null => write_null(out),
            Frame::Array(items) => {
                write_array_len(items.len(), out);
                for it in items {
                    it.encode(out);
                }
            }
            Frame::Push(items) => {
                write_push_len(items.len(), out);
                for it in items {
                    it.encode(out);
                }
            }
        }
    }

    /// Convenience for tests and in-process callers.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.encode(&mut out);
        out.freeze()
    }
}

/// Parse a single request from the front of `data`.
///
/// # Returns
/// * `Ok(Some((consumed, args)))` - one complete request; `args` is empty
///   for a blank inline line, which callers skip
/// * `Ok(None)` - incomplete data, keep buffering
/// * `Err(...)` - protocol error, the connection must be closed
pub fn parse_one(data: &[u8]) -> Result<Option<(usize, Vec<Bytes>)>, ProtocolError> {
    if data.is_empty() {
        return Ok(None);
    }
    if data[0] != b'*' {
        return parse_inline(data);
    }

    let (i, n) = match read_decimal_line(&data[1..])? {
        Some(x) => x,
        None => return Ok(None),
    };
    let mut cursor = 1 + i;

    // `*0` and `*-1` carry no command; consume and skip them
    if n <= 0 {
        return Ok(Some((cursor, Vec::new())));
    }

    let mut items: Vec<Bytes> = Vec::with_capacity((n as usize).min(MAX_PREALLOC_ARGS));

    for _ in 0..n {
        if cursor >= data.len() {
            return Ok(None);
        }
        if data[cursor] != b'$' {
            return Err(ProtocolError::UnexpectedByte {
                expected: '$',
                found: data[cursor] as char,
            });
        }

        let (i2, len) = match read_decimal_line(&data[cursor + 1..])? {
            Some(x) => x,
            None => return Ok(None),
        };
        if !(0..=MAX_BULK_LEN).contains(&len) {
            return Err(ProtocolError::InvalidLength);
        }
        cursor += 1 + i2;

        let len = len as usize;
        if cursor + len + 2 > data.len() {
            return Ok(None);
        }
        if &data[cursor + len..cursor + len + 2] != b"\r\n" {
            return Err(ProtocolError::MissingCrlf);
        }
        items.push(Bytes::copy_from_slice(&data[cursor..cursor + len]));
        cursor += len + 2;
    }

    Ok(Some((cursor, items)))
}

/// Inline request: a single line of whitespace-separated words.
fn parse_inline(data: &[u8]) -> Result<Option<(usize, Vec<Bytes>)>, ProtocolError> {
    let end = match data.iter().position(|&b| b == b'\n') {
        Some(p) => p,
        None => return Ok(None),
    };
    let line = &data[..end];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().filter(|&&b| b == b'"').count() % 2 != 0 {
        return Err(ProtocolError::UnbalancedQuotes);
    }
    let items = line
        .split(|b| b.is_ascii_whitespace())
        .filter(|w| !w.is_empty())
        .map(|w| {
            let w = w.strip_prefix(b"\"").unwrap_or(w);
            let w = w.strip_suffix(b"\"").unwrap_or(w);
            Bytes::copy_from_slice(w)
        })
        .collect();
    Ok(Some((end + 1, items)))
}

/// Parse every complete request in `buf`, leaving any partial frame behind.
///
/// Used for pipelined input: bytes of an unfinished request persist across
/// calls until the rest arrives.
pub fn parse_many(buf: &mut BytesMut, out: &mut Vec<Vec<Bytes>>) -> Result<(), ProtocolError> {
    loop {
        let (consumed, args) = match parse_one(&buf[..])? {
            Some(x) => x,
            None => break,
        };
        buf.advance(consumed);
        if !args.is_empty() {
            out.push(args);
        }
    }
    Ok(())
}

/// Read a decimal number followed by \r\n.
///
/// Returns `(bytes_consumed, number)`, or `None` when the line is not
/// complete yet.
fn read_decimal_line(s: &[u8]) -> Result<Option<(usize, i64)>, ProtocolError> {
    let mut i = 0;
    let mut sign: i64 = 1;
    if i < s.len() && s[i] == b'-' {
        sign = -1;
        i += 1;
    }

    let start = i;
    let mut num: i64 = 0;
    while i < s.len() && s[i].is_ascii_digit() {
        num = num
            .checked_mul(10)
            .and_then(|n| n.checked_add((s[i] - b'0') as i64))
            .ok_or(ProtocolError::InvalidLength)?;
        i += 1;
    }

    if i + 1 >= s.len() {
        return Ok(None);
    }
    if i == start {
        return Err(ProtocolError::InvalidLength);
    }
    if s[i] == b'\r' && s[i + 1] == b'\n' {
        Ok(Some((i + 2, num * sign)))
    } else {
        Err(ProtocolError::MissingCrlf)
    }
}

//
// RESP Encoders
//

/// Encode a simple string (+OK\r\n)
#[inline]
pub fn write_simple(s: &str, out: &mut BytesMut) {
    out.reserve(s.len() + 3);
    out.put_u8(b'+');
    out.put_slice(s.as_bytes());
    out.put_slice(b"\r\n");
}

/// Encode an error (-ERR message\r\n)
#[inline]
pub fn write_error(s: &str, out: &mut BytesMut) {
    out.reserve(s.len() + 3);
    out.put_u8(b'-');
    out.put_slice(s.as_bytes());
    out.put_slice(b"\r\n");
}

/// Encode a bulk string ($<len>\r\n<data>\r\n)
#[inline]
pub fn write_bulk(b: &[u8], out: &mut BytesMut) {
    write_header(b'$', b.len() as i64, out);
    out.reserve(b.len() + 2);
    out.put_slice(b);
    out.put_slice(b"\r\n");
}

/// Encode a null bulk string ($-1\r\n)
#[inline]
pub fn write_null(out: &mut BytesMut) {
    out.put_slice(b"$-1\r\n");
}

/// Encode an integer (:<number>\r\n)
#[inline]
pub fn write_integer(i: i64, out: &mut BytesMut) {
    write_header(b':', i, out);
}

/// Encode an array header (*<count>\r\n)
#[inline]
pub fn write_array_len(n: usize, out: &mut BytesMut) {
    write_header(b'*', n as i64, out);
}

/// Encode a RESP3 push header (><count>\r\n)
#[inline]
pub fn write_push_len(n: usize, out: &mut BytesMut) {
    write_header(b'>', n as i64, out);
}

#[inline]
fn write_header(tag: u8, n: i64, out: &mut BytesMut) {
    let s = n.to_string();
    out.reserve(1 + s.len() + 2);
    out.put_u8(tag);
    out.put_slice(s.as_bytes());
    out.put_slice(b"\r\n");
}
