//! Keyspace Commands
//!
//! Each submodule registers its executors into the [`CommandTable`]. An
//! executor runs inside the lock region the keyspace built from the
//! command's key spec, reads and writes through [`LockedDb`], and forwards
//! whatever must be made durable with `LockedDb::add_aof`.
//!
//! ## Supported Commands
//!
//! | Family       | Commands                                                           |
//! |--------------|--------------------------------------------------------------------|
//! | keys         | DEL EXISTS EXPIRE PEXPIRE EXPIREAT PEXPIREAT TTL PTTL PERSIST TYPE RENAME KEYS DBSIZE FLUSHDB PING |
//! | strings      | SET SETNX GET GETSET MSET MGET INCR INCRBY DECR DECRBY APPEND STRLEN |
//! | lists        | LPUSH RPUSH LPOP RPOP LLEN LRANGE LINDEX                           |
//! | hashes       | HSET HMSET HGET HDEL HLEN HGETALL HEXISTS                          |
//! | sets         | SADD SREM SISMEMBER SCARD SMEMBERS                                 |
//! | sorted sets  | ZADD ZSCORE ZCARD ZREM ZRANGE ZRANK                                |
//!
//! Relative expirations (`EXPIRE`, `SET ... EX`) are logged as `PEXPIREAT`
//! with an absolute deadline, so replaying the log later does not extend
//! a key's life.
//!
//! [`LockedDb`]: crate::database::LockedDb

pub mod hashes;
pub mod keys;
pub mod lists;
pub mod sets;
pub mod sorted_sets;
pub mod strings;

use crate::database::CommandTable;
use crate::protocol::{CmdLine, RespValue};
use bytes::Bytes;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const WRONG_TYPE_MSG: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

/// Registers every command family.
pub fn register_all(table: &mut CommandTable) {
    keys::register(table);
    strings::register(table);
    lists::register(table);
    hashes::register(table);
    sets::register(table);
    sorted_sets::register(table);
}

// ============================================================================
// Shared replies
// ============================================================================

pub fn unknown_command(name: &str) -> RespValue {
    RespValue::error(format!("ERR unknown command '{}'", name))
}

pub fn wrong_arity(name: &str) -> RespValue {
    RespValue::error(format!("ERR wrong number of arguments for '{}' command", name))
}

pub fn wrong_type() -> RespValue {
    RespValue::error(WRONG_TYPE_MSG)
}

pub fn syntax_error() -> RespValue {
    RespValue::error("ERR syntax error")
}

pub fn not_integer() -> RespValue {
    RespValue::error("ERR value is not an integer or out of range")
}

pub fn not_float() -> RespValue {
    RespValue::error("ERR value is not a valid float")
}

// ============================================================================
// Argument helpers
// ============================================================================

pub(crate) fn parse_i64(arg: &[u8]) -> Option<i64> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}

/// Parses a score; NaN is rejected.
pub(crate) fn parse_f64(arg: &[u8]) -> Option<f64> {
    let value: f64 = std::str::from_utf8(arg).ok()?.trim().parse().ok()?;
    (!value.is_nan()).then_some(value)
}

/// `[NAME, args...]`
pub(crate) fn with_name(name: &'static str, args: &[Bytes]) -> CmdLine {
    let mut line = Vec::with_capacity(args.len() + 1);
    line.push(Bytes::from_static(name.as_bytes()));
    line.extend_from_slice(args);
    line
}

/// Milliseconds since the Unix epoch; times before it clamp to 0.
pub fn unix_millis(at: SystemTime) -> u128 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Absolute deadline from Unix milliseconds. `None` if unrepresentable.
pub(crate) fn from_unix_millis(ms: i64) -> Option<SystemTime> {
    if ms <= 0 {
        return Some(UNIX_EPOCH);
    }
    UNIX_EPOCH.checked_add(Duration::from_millis(ms as u64))
}

/// Deadline `ms` milliseconds from now. Non-positive values land in the past.
pub(crate) fn from_now_millis(ms: i64) -> Option<SystemTime> {
    if ms <= 0 {
        return Some(UNIX_EPOCH);
    }
    SystemTime::now().checked_add(Duration::from_millis(ms as u64))
}

/// Normalizes Redis-style inclusive `start..=stop` indices against `len`.
///
/// Negative indices count from the end. Returns `None` for an empty range.
pub(crate) fn normalize_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };

    if start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_range() {
        assert_eq!(normalize_range(0, -1, 3), Some((0, 2)));
        assert_eq!(normalize_range(-2, -1, 3), Some((1, 2)));
        assert_eq!(normalize_range(1, 100, 3), Some((1, 2)));
        assert_eq!(normalize_range(-100, 0, 3), Some((0, 0)));
        assert_eq!(normalize_range(2, 1, 3), None);
        assert_eq!(normalize_range(5, 10, 3), None);
        assert_eq!(normalize_range(0, -1, 0), None);
    }

    #[test]
    fn test_parse_numbers() {
        assert_eq!(parse_i64(b"-12"), Some(-12));
        assert_eq!(parse_i64(b"1.5"), None);
        assert_eq!(parse_f64(b"1.5"), Some(1.5));
        assert_eq!(parse_f64(b"-inf"), Some(f64::NEG_INFINITY));
        assert_eq!(parse_f64(b"nan"), None);
        assert_eq!(parse_f64(b"abc"), None);
    }

    #[test]
    fn test_deadlines() {
        assert_eq!(from_unix_millis(1_500), Some(UNIX_EPOCH + Duration::from_millis(1_500)));
        assert_eq!(from_unix_millis(-5), Some(UNIX_EPOCH));
        assert_eq!(unix_millis(UNIX_EPOCH + Duration::from_millis(42)), 42);
        assert!(from_now_millis(1_000).unwrap() > SystemTime::now());
        assert!(from_now_millis(0).unwrap() < SystemTime::now());
    }
}
