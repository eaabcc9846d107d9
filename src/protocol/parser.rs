//! Incremental RESP Parser
//!
//! Serves two readers: client connections, which accept any RESP value plus
//! inline commands, and log replay, which accepts only arrays of bulk
//! strings ([`RespParser::parse_command`]).
//!
//! Every entry point returns:
//! - `Ok(Some((value, consumed)))` - a complete value, `consumed` bytes used
//! - `Ok(None)` - the buffer ends mid-value, read more and retry
//! - `Err(ParseError)` - the bytes are not valid RESP
//!
//! During log replay an `Ok(None)` at end of file means the last record was
//! torn by a crash; the caller discards it.
//!
//! ```text
//!   buf:  *2\r\n$3\r\nDEL\r\n$1\r\nk\r\n*1\r\n$4\r\nPI
//!         ├──────── record ──────────┤├── torn ──┤
//!         Cursor.pos ──────────────►  stops here, Ok(None) for the rest
//! ```

use crate::protocol::types::{prefix, CmdLine, RespValue, CRLF};
use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur during RESP parsing.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// Invalid integer or length header
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Invalid UTF-8 in a simple string or error message
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Bulk string length is negative (but not -1 for null)
    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    /// Array length is negative (but not -1 for null)
    #[error("invalid array length: {0}")]
    InvalidArrayLength(i64),

    /// Protocol violation (missing CRLF, etc.)
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The message exceeds maximum allowed size
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// A log record that is not an array of bulk strings
    #[error("not a command record: {0}")]
    NotACommand(String),
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size for a single bulk string (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum array nesting depth (prevent stack overflow)
pub const MAX_NESTING_DEPTH: usize = 32;

/// Maximum elements in one array header. Bounds preallocation.
pub const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// Read position over a borrowed buffer. `None` from any method means the
/// buffer ended before the frame did.
struct Cursor<'b> {
    buf: &'b [u8],
    pos: usize,
}

impl<'b> Cursor<'b> {
    fn new(buf: &'b [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    /// Bytes up to the next CRLF, consuming the CRLF too.
    fn line(&mut self) -> Option<&'b [u8]> {
        let buf = self.buf;
        let rest = &buf[self.pos..];
        let end = find_crlf(rest)?;
        self.pos += end + CRLF.len();
        Some(&rest[..end])
    }

    fn line_str(&mut self) -> ParseResult<Option<&'b str>> {
        match self.line() {
            Some(raw) => std::str::from_utf8(raw)
                .map(Some)
                .map_err(|e| ParseError::InvalidUtf8(e.to_string())),
            None => Ok(None),
        }
    }

    /// `<prefix><signed integer>\r\n`, prefix already peeked.
    fn header(&mut self) -> ParseResult<Option<i64>> {
        self.pos += 1;
        match self.line_str()? {
            Some(text) => text
                .parse()
                .map(Some)
                .map_err(|_| ParseError::InvalidInteger(text.to_string())),
            None => Ok(None),
        }
    }

    /// `<data>\r\n` of a bulk string whose length is known.
    fn bulk_body(&mut self, len: usize) -> ParseResult<Option<Bytes>> {
        let end = self.pos + len;
        if self.buf.len() < end + CRLF.len() {
            return Ok(None);
        }
        if &self.buf[end..end + CRLF.len()] != CRLF {
            return Err(ParseError::ProtocolError(
                "bulk string missing trailing CRLF".to_string(),
            ));
        }
        let data = Bytes::copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end + CRLF.len();
        Ok(Some(data))
    }

    /// Header of a `$` frame: `Some(None)` is the null bulk string.
    fn bulk_len(&mut self) -> ParseResult<Option<Option<usize>>> {
        let Some(len) = self.header()? else {
            return Ok(None);
        };
        match len {
            -1 => Ok(Some(None)),
            n if n < 0 => Err(ParseError::InvalidBulkLength(n)),
            n if n as usize > MAX_BULK_SIZE => Err(ParseError::MessageTooLarge {
                size: n as usize,
                max: MAX_BULK_SIZE,
            }),
            n => Ok(Some(Some(n as usize))),
        }
    }

    /// Header of a `*` frame: `Some(None)` is the null array.
    fn array_len(&mut self) -> ParseResult<Option<Option<usize>>> {
        let Some(len) = self.header()? else {
            return Ok(None);
        };
        match len {
            -1 => Ok(Some(None)),
            n if n < 0 => Err(ParseError::InvalidArrayLength(n)),
            n if n as usize > MAX_ARRAY_LEN => Err(ParseError::MessageTooLarge {
                size: n as usize,
                max: MAX_ARRAY_LEN,
            }),
            n => Ok(Some(Some(n as usize))),
        }
    }
}

/// A RESP parser.
///
/// # Example
///
/// ```
/// use fluxkv::protocol::RespParser;
///
/// let mut parser = RespParser::new();
/// let buf = b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n";
/// let (line, consumed) = parser.parse_command(buf).unwrap().unwrap();
/// assert_eq!(line[1].as_ref(), b"name");
/// assert_eq!(consumed, buf.len());
/// ```
#[derive(Debug, Default)]
pub struct RespParser {
    /// Records returned by `parse_command` so far
    records: u64,
}

impl RespParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Command records parsed by this parser.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Attempts to parse one RESP value (or inline command) from the buffer.
    pub fn parse(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let mut cursor = Cursor::new(buf);
        let value = match cursor.peek() {
            None => return Ok(None),
            Some(b) if is_prefix(b) => read_value(&mut cursor, 0)?,
            Some(_) => read_inline(&mut cursor)?,
        };
        Ok(value.map(|v| (v, cursor.pos)))
    }

    /// Attempts to parse one command record: an array of bulk strings.
    ///
    /// Builds the command line directly, without an intermediate
    /// [`RespValue`]. Inline commands and other value types are rejected, so
    /// garbage at the end of a log is never mistaken for a command.
    pub fn parse_command(&mut self, buf: &[u8]) -> ParseResult<Option<(CmdLine, usize)>> {
        let mut cursor = Cursor::new(buf);
        match cursor.peek() {
            None => return Ok(None),
            Some(prefix::ARRAY) => {}
            Some(other) => {
                return Err(ParseError::NotACommand(format!(
                    "unexpected prefix {:#04x}",
                    other
                )))
            }
        }

        let count = match cursor.array_len()? {
            None => return Ok(None),
            Some(Some(count)) if count > 0 => count,
            Some(_) => return Err(ParseError::NotACommand("empty or null array".to_string())),
        };

        let mut line = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            match cursor.peek() {
                None => return Ok(None),
                Some(prefix::BULK_STRING) => {}
                Some(other) => {
                    return Err(ParseError::NotACommand(format!(
                        "element with prefix {:#04x}",
                        other
                    )))
                }
            }
            let len = match cursor.bulk_len()? {
                None => return Ok(None),
                Some(Some(len)) => len,
                Some(None) => return Err(ParseError::NotACommand("null element".to_string())),
            };
            match cursor.bulk_body(len)? {
                Some(arg) => line.push(arg),
                None => return Ok(None),
            }
        }

        self.records += 1;
        Ok(Some((line, cursor.pos)))
    }
}

fn is_prefix(b: u8) -> bool {
    matches!(
        b,
        prefix::SIMPLE_STRING | prefix::ERROR | prefix::INTEGER | prefix::BULK_STRING | prefix::ARRAY
    )
}

fn read_value(cursor: &mut Cursor<'_>, depth: usize) -> ParseResult<Option<RespValue>> {
    if depth > MAX_NESTING_DEPTH {
        return Err(ParseError::ProtocolError(format!(
            "maximum nesting depth exceeded: {}",
            MAX_NESTING_DEPTH
        )));
    }

    let Some(kind) = cursor.peek() else {
        return Ok(None);
    };
    let value = match kind {
        prefix::SIMPLE_STRING | prefix::ERROR => {
            cursor.pos += 1;
            let Some(text) = cursor.line_str()? else {
                return Ok(None);
            };
            if kind == prefix::ERROR {
                RespValue::Error(text.to_string())
            } else {
                RespValue::SimpleString(text.to_string())
            }
        }
        prefix::INTEGER => match cursor.header()? {
            Some(n) => RespValue::Integer(n),
            None => return Ok(None),
        },
        prefix::BULK_STRING => match cursor.bulk_len()? {
            None => return Ok(None),
            Some(None) => RespValue::Null,
            Some(Some(len)) => match cursor.bulk_body(len)? {
                Some(data) => RespValue::BulkString(data),
                None => return Ok(None),
            },
        },
        prefix::ARRAY => {
            let count = match cursor.array_len()? {
                None => return Ok(None),
                Some(None) => return Ok(Some(RespValue::Null)),
                Some(Some(count)) => count,
            };
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                match read_value(cursor, depth + 1)? {
                    Some(item) => items.push(item),
                    None => return Ok(None),
                }
            }
            RespValue::Array(items)
        }
        other => {
            return Err(ParseError::ProtocolError(format!(
                "unknown type prefix {:#04x}",
                other
            )))
        }
    };
    Ok(Some(value))
}

/// `SET k v\r\n` typed by hand into telnet or `redis-cli --no-raw`.
fn read_inline(cursor: &mut Cursor<'_>) -> ParseResult<Option<RespValue>> {
    let Some(text) = cursor.line_str()? else {
        return Ok(None);
    };
    let words: Vec<RespValue> = text
        .split_whitespace()
        .map(|word| RespValue::BulkString(Bytes::copy_from_slice(word.as_bytes())))
        .collect();
    if words.is_empty() {
        return Err(ParseError::ProtocolError("empty inline command".to_string()));
    }
    Ok(Some(RespValue::Array(words)))
}

/// Position of the `\r` in the first CRLF, if any.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

/// Parses a single RESP message with a fresh parser.
pub fn parse_message(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    RespParser::new().parse(buf)
}
