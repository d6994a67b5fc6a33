//! RESP wire primitives: the reply value handlers build, and the streaming
//! command parser feeding dispatch.
//!
//! Two wire dialects are supported and selected per connection (HELLO):
//! the classic form encodes nulls as `$-1`/`*-1`, the typed form uses `_`
//! and marks pub/sub pushes with `>`.

use bytes::{Buf, Bytes, BytesMut};

/// Largest accepted bulk payload: 512 MB.
const BULK_MAX: i64 = 512 * 1024 * 1024;
/// Largest accepted argument vector.
const MULTIBULK_MAX: i64 = 1024 * 1024;

/// An outbound reply value.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Int(i64),
    Bulk(Vec<u8>),
    /// Null bulk: `$-1` / `_`.
    Null,
    /// Null array: `*-1` / `_`.
    NullArray,
    Array(Vec<Reply>),
    /// Out-of-band pub/sub message: `>` in the typed dialect.
    Push(Vec<Reply>),
    /// Several replies written back-to-back with no enclosing array.
    Multi(Vec<Reply>),
    /// Nothing at all (the connection is blocked or already served).
    None,
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Simple("OK".to_string())
    }

    pub fn queued() -> Self {
        Reply::Simple("QUEUED".to_string())
    }

    pub fn simple(s: impl Into<String>) -> Self {
        Reply::Simple(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        Reply::Error(s.into())
    }

    pub fn int(n: i64) -> Self {
        Reply::Int(n)
    }

    pub fn bulk(data: impl Into<Vec<u8>>) -> Self {
        Reply::Bulk(data.into())
    }

    pub fn array(items: Vec<Reply>) -> Self {
        Reply::Array(items)
    }

    pub fn write_to(&self, buf: &mut Vec<u8>, resp3: bool) {
        match self {
            Reply::Simple(s) => {
                buf.push(b'+');
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Reply::Error(s) => {
                buf.push(b'-');
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Reply::Int(n) => {
                buf.push(b':');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Reply::Bulk(data) => {
                buf.push(b'$');
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                buf.extend_from_slice(data);
                buf.extend_from_slice(b"\r\n");
            }
            Reply::Null => {
                buf.extend_from_slice(if resp3 { b"_\r\n" } else { b"$-1\r\n" });
            }
            Reply::NullArray => {
                buf.extend_from_slice(if resp3 { b"_\r\n" } else { b"*-1\r\n" });
            }
            Reply::Array(items) => {
                buf.push(b'*');
                buf.extend_from_slice(items.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                for item in items {
                    item.write_to(buf, resp3);
                }
            }
            Reply::Push(items) => {
                buf.push(if resp3 { b'>' } else { b'*' });
                buf.extend_from_slice(items.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                for item in items {
                    item.write_to(buf, resp3);
                }
            }
            Reply::Multi(items) => {
                for item in items {
                    item.write_to(buf, resp3);
                }
            }
            Reply::None => {}
        }
    }

    pub fn serialize(&self, resp3: bool) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_to(&mut buf, resp3);
        buf
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Protocol error: invalid multibulk length")]
    BadMultibulkLength,

    #[error("Protocol error: invalid bulk length")]
    BadBulkLength,

    #[error("Protocol error: expected '$', got '{}'", *.0 as char)]
    ExpectedBulk(u8),

    #[error("Protocol error: too big inline request")]
    InlineTooLong,

    #[error("Protocol error: unbalanced request")]
    Malformed,
}

/// Streaming command reader. Call `parse` repeatedly as bytes arrive; it
/// consumes nothing until a complete command is buffered.
pub struct CommandParser;

impl CommandParser {
    /// Extract one complete command as an argument vector, or `None` when
    /// more bytes are needed.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<Vec<Bytes>>, ProtocolError> {
        if buf.is_empty() {
            return Ok(None);
        }
        if buf[0] == b'*' {
            Self::parse_multibulk(buf)
        } else {
            Self::parse_inline(buf)
        }
    }

    fn parse_multibulk(buf: &mut BytesMut) -> Result<Option<Vec<Bytes>>, ProtocolError> {
        // First pass: walk the frame without consuming anything.
        let mut pos = 0;
        let count = match read_line_int(buf, &mut pos) {
            Some(n) => n,
            None => return Ok(None),
        };
        if count < 0 || count > MULTIBULK_MAX {
            return Err(ProtocolError::BadMultibulkLength);
        }
        let mut ranges = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if pos >= buf.len() {
                return Ok(None);
            }
            if buf[pos] != b'$' {
                return Err(ProtocolError::ExpectedBulk(buf[pos]));
            }
            let len = match read_line_int(buf, &mut pos) {
                Some(n) => n,
                None => return Ok(None),
            };
            if !(0..=BULK_MAX).contains(&len) {
                return Err(ProtocolError::BadBulkLength);
            }
            let len = len as usize;
            if buf.len() < pos + len + 2 {
                return Ok(None);
            }
            if &buf[pos + len..pos + len + 2] != b"\r\n" {
                return Err(ProtocolError::Malformed);
            }
            ranges.push((pos, len));
            pos += len + 2;
        }
        // Frame complete: copy the arguments out and consume it.
        let argv = ranges
            .iter()
            .map(|&(start, len)| Bytes::copy_from_slice(&buf[start..start + len]))
            .collect();
        buf.advance(pos);
        Ok(Some(argv))
    }

    /// Plain-text command line, split on whitespace. Empty lines are
    /// swallowed so a stray CRLF does not stall the connection.
    fn parse_inline(buf: &mut BytesMut) -> Result<Option<Vec<Bytes>>, ProtocolError> {
        let Some(nl) = buf.iter().position(|&b| b == b'\n') else {
            if buf.len() > 64 * 1024 {
                return Err(ProtocolError::InlineTooLong);
            }
            return Ok(None);
        };
        let mut line_end = nl;
        if line_end > 0 && buf[line_end - 1] == b'\r' {
            line_end -= 1;
        }
        let argv: Vec<Bytes> = buf[..line_end]
            .split(|b| b.is_ascii_whitespace())
            .filter(|part| !part.is_empty())
            .map(Bytes::copy_from_slice)
            .collect();
        buf.advance(nl + 1);
        Ok(Some(argv))
    }
}

/// Read a `<prefix><integer>\r\n` line starting at `*pos`, advancing it
/// past the line. Returns `None` when the line is incomplete.
fn read_line_int(buf: &[u8], pos: &mut usize) -> Option<i64> {
    let start = *pos + 1; // skip the type byte
    let mut i = start;
    while i + 1 < buf.len() {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            let s = std::str::from_utf8(&buf[start..i]).ok()?;
            let n = s.parse().ok()?;
            *pos = i + 2;
            return Some(n);
        }
        i += 1;
    }
    None
}
