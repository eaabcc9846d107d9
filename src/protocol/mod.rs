//! RESP Protocol
//!
//! - `types`: [`RespValue`] replies and the command-line encoding used for
//!   log records
//! - `parser`: incremental parser for client requests and log replay
//!
//! ```
//! use fluxkv::protocol::{encode_cmd_line, to_cmd_line, parse_message, RespValue};
//!
//! let record = encode_cmd_line(&to_cmd_line(&["DEL", "k"]));
//! let (value, consumed) = parse_message(&record).unwrap().unwrap();
//! assert_eq!(consumed, record.len());
//! assert_eq!(value.into_cmd_line(), Some(to_cmd_line(&["DEL", "k"])));
//! ```

pub mod parser;
pub mod types;

pub use parser::{parse_message, ParseError, ParseResult, RespParser};
pub use types::{encode_cmd_line, encode_cmd_line_into, to_cmd_line, CmdLine, RespValue};
