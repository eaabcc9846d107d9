//! RESP Data Types
//!
//! Replies to clients and records in the append-only log share one wire
//! format. A log record is simply a command line serialized as an array of
//! bulk strings:
//!
//! ```text
//! SET user:1 Ariz   ──►   *3\r\n$3\r\nSET\r\n$6\r\nuser:1\r\n$4\r\nAriz\r\n
//! ```
//!
//! Prefixes: `+` simple string, `-` error, `:` integer, `$` bulk string,
//! `*` array. Every line ends with CRLF; `$-1\r\n` is the null reply.

use bytes::Bytes;

/// The CRLF terminator used in RESP protocol
pub const CRLF: &[u8] = b"\r\n";

/// RESP protocol type prefixes
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A command name followed by its arguments, e.g. `["SET", "k", "v"]`.
pub type CmdLine = Vec<Bytes>;

/// Builds a command line from string slices.
///
/// # Example
/// ```
/// use fluxkv::protocol::types::to_cmd_line;
/// let line = to_cmd_line(&["SET", "k", "v"]);
/// assert_eq!(line.len(), 3);
/// ```
pub fn to_cmd_line(parts: &[&str]) -> CmdLine {
    parts
        .iter()
        .map(|part| Bytes::copy_from_slice(part.as_bytes()))
        .collect()
}

/// Writes `<tag><body>\r\n`.
fn put_line(buf: &mut Vec<u8>, tag: u8, body: &[u8]) {
    buf.push(tag);
    buf.extend_from_slice(body);
    buf.extend_from_slice(CRLF);
}

/// Writes a length header such as `*3\r\n` or `$5\r\n`.
fn put_len(buf: &mut Vec<u8>, tag: u8, len: usize) {
    put_line(buf, tag, len.to_string().as_bytes());
}

fn put_bulk(buf: &mut Vec<u8>, data: &[u8]) {
    put_len(buf, prefix::BULK_STRING, data.len());
    buf.extend_from_slice(data);
    buf.extend_from_slice(CRLF);
}

/// Serializes a command line as an array of bulk strings, appending to `buf`.
pub fn encode_cmd_line_into(cmd_line: &[Bytes], buf: &mut Vec<u8>) {
    put_len(buf, prefix::ARRAY, cmd_line.len());
    cmd_line.iter().for_each(|arg| put_bulk(buf, arg));
}

/// Serializes a command line as an array of bulk strings.
pub fn encode_cmd_line(cmd_line: &[Bytes]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + cmd_line.iter().map(|a| a.len() + 16).sum::<usize>());
    encode_cmd_line_into(cmd_line, &mut buf);
    buf
}

/// Represents a value in the RESP protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+<string>\r\n`, never contains CRLF
    SimpleString(String),

    /// `-<message>\r\n`
    Error(String),

    /// `:<integer>\r\n`
    Integer(i64),

    /// `$<length>\r\n<data>\r\n`, binary safe
    BulkString(Bytes),

    /// `$-1\r\n` on the wire; also produced when parsing `*-1\r\n`
    Null,

    /// `*<count>\r\n<element1><element2>...`
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Creates a new simple string response.
    ///
    /// # Example
    /// ```
    /// use fluxkv::protocol::types::RespValue;
    /// let ok = RespValue::simple_string("OK");
    /// ```
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    /// Creates a new error response.
    ///
    /// # Example
    /// ```
    /// use fluxkv::protocol::types::RespValue;
    /// let err = RespValue::error("ERR unknown command");
    /// assert!(err.is_error());
    /// ```
    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    pub fn integer(n: i64) -> Self {
        RespValue::Integer(n)
    }

    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    pub fn null() -> Self {
        RespValue::Null
    }

    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    /// An array of bulk strings.
    pub fn bulk_array<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
    {
        RespValue::Array(items.into_iter().map(RespValue::BulkString).collect())
    }

    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    pub fn pong() -> Self {
        RespValue::SimpleString("PONG".to_string())
    }

    /// Reply to a command accepted into a transaction queue.
    pub fn queued() -> Self {
        RespValue::SimpleString("QUEUED".to_string())
    }

    /// Serializes the RESP value to bytes for sending over the wire.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes the RESP value into an existing buffer.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            RespValue::SimpleString(s) => put_line(buf, prefix::SIMPLE_STRING, s.as_bytes()),
            RespValue::Error(msg) => put_line(buf, prefix::ERROR, msg.as_bytes()),
            RespValue::Integer(n) => put_line(buf, prefix::INTEGER, n.to_string().as_bytes()),
            RespValue::BulkString(data) => put_bulk(buf, data),
            RespValue::Null => put_line(buf, prefix::BULK_STRING, b"-1"),
            RespValue::Array(items) => {
                put_len(buf, prefix::ARRAY, items.len());
                for item in items {
                    item.serialize_into(buf);
                }
            }
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Null)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Attempts to extract the inner string from SimpleString or BulkString.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::SimpleString(s) => Some(s),
            RespValue::BulkString(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::BulkString(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Converts a request array into a command line.
    ///
    /// Returns `None` for anything other than a non-empty array of bulk or
    /// simple strings.
    pub fn into_cmd_line(self) -> Option<CmdLine> {
        let items = match self {
            RespValue::Array(items) if !items.is_empty() => items,
            _ => return None,
        };

        items
            .into_iter()
            .map(|item| match item {
                RespValue::BulkString(data) => Some(data),
                RespValue::SimpleString(s) => Some(Bytes::from(s)),
                _ => None,
            })
            .collect()
    }
}
