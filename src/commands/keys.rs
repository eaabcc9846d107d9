//! Generic keyspace commands: deletion, expiration, renaming, inspection.

use super::{from_now_millis, from_unix_millis, not_integer, parse_i64, syntax_error, with_name};
use crate::aof::marshal;
use crate::database::transaction::{rollback_expire, rollback_first_key, rollback_given_keys};
use crate::database::{Command, CommandTable, KeySpec, LockedDb};
use crate::protocol::RespValue;
use bytes::Bytes;
use std::time::{Duration, SystemTime};

pub fn register(table: &mut CommandTable) {
    table.register(
        Command::write("del", exec_del, -2)
            .keys(KeySpec::ALL)
            .undo(rollback_given_keys),
    );
    table.register(Command::read_only("exists", exec_exists, -2).keys(KeySpec::ALL));

    table.register(Command::write("expire", exec_expire, 3).undo(rollback_first_key));
    table.register(Command::write("pexpire", exec_pexpire, 3).undo(rollback_first_key));
    table.register(Command::write("expireat", exec_expireat, 3).undo(rollback_first_key));
    table.register(Command::write("pexpireat", exec_pexpireat, 3).undo(rollback_first_key));
    table.register(Command::write("persist", exec_persist, 2).undo(rollback_expire));
    table.register(Command::read_only("ttl", exec_ttl, 2));
    table.register(Command::read_only("pttl", exec_pttl, 2));

    table.register(Command::read_only("type", exec_type, 2));
    table.register(
        Command::write("rename", exec_rename, 3)
            .keys(KeySpec {
                first: 0,
                last: 1,
                step: 1,
            })
            .undo(rollback_given_keys),
    );

    table.register(Command::read_only("keys", exec_keys, 2).keyspace_wide());
    table.register(Command::read_only("dbsize", exec_dbsize, 1).keys(KeySpec::NONE));
    table.register(Command::write("flushdb", exec_flushdb, -1).keyspace_wide());
    table.register(Command::read_only("ping", exec_ping, -1).keys(KeySpec::NONE));
}

fn exec_del(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    let deleted = db.removes(args);
    if deleted > 0 {
        db.add_aof(with_name("DEL", args));
    }
    RespValue::integer(deleted as i64)
}

fn exec_exists(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    let count = args.iter().filter(|key| db.contains(key)).count();
    RespValue::integer(count as i64)
}

// ============================================================================
// Expiration
// ============================================================================

fn exec_expire(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    let Some(secs) = parse_i64(&args[1]) else {
        return not_integer();
    };
    expire_at(db, &args[0], secs.checked_mul(1000).and_then(from_now_millis))
}

fn exec_pexpire(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    let Some(ms) = parse_i64(&args[1]) else {
        return not_integer();
    };
    expire_at(db, &args[0], from_now_millis(ms))
}

fn exec_expireat(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    let Some(secs) = parse_i64(&args[1]) else {
        return not_integer();
    };
    expire_at(db, &args[0], secs.checked_mul(1000).and_then(from_unix_millis))
}

fn exec_pexpireat(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    let Some(ms) = parse_i64(&args[1]) else {
        return not_integer();
    };
    expire_at(db, &args[0], from_unix_millis(ms))
}

/// Sets an absolute deadline. A deadline already in the past deletes the key.
fn expire_at(db: &mut LockedDb<'_>, key: &Bytes, deadline: Option<SystemTime>) -> RespValue {
    let Some(at) = deadline else {
        return RespValue::error("ERR invalid expire time");
    };
    if !db.contains(key) {
        return RespValue::integer(0);
    }

    if at <= SystemTime::now() {
        db.remove(key);
        db.add_aof(with_name("DEL", std::slice::from_ref(key)));
    } else {
        db.expire(key, at);
        db.add_aof(marshal::expire_cmd(key, at));
    }
    RespValue::integer(1)
}

fn exec_persist(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    let key = &args[0];
    if !db.contains(key) || !db.persist(key) {
        return RespValue::integer(0);
    }
    db.add_aof(with_name("PERSIST", args));
    RespValue::integer(1)
}

/// `-2` for a missing key, `-1` for no deadline, otherwise the time left.
fn remaining(db: &mut LockedDb<'_>, key: &[u8]) -> Result<Duration, i64> {
    if !db.contains(key) {
        return Err(-2);
    }
    match db.ttl(key) {
        None => Err(-1),
        Some(at) => Ok(at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO)),
    }
}

fn exec_ttl(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    match remaining(db, &args[0]) {
        Ok(left) => RespValue::integer(((left.as_millis() + 500) / 1000) as i64),
        Err(code) => RespValue::integer(code),
    }
}

fn exec_pttl(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    match remaining(db, &args[0]) {
        Ok(left) => RespValue::integer(left.as_millis() as i64),
        Err(code) => RespValue::integer(code),
    }
}

// ============================================================================
// Inspection and renaming
// ============================================================================

fn exec_type(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    match db.get_entity(&args[0]) {
        Some(entity) => RespValue::simple_string(entity.type_name()),
        None => RespValue::simple_string("none"),
    }
}

fn exec_rename(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    let (src, dest) = (&args[0], &args[1]);
    let Some(entity) = db.get_entity(src).cloned() else {
        return RespValue::error("ERR no such key");
    };
    let deadline = db.ttl(src);

    db.remove(src);
    db.remove(dest);
    db.put_entity(dest.clone(), entity);
    if let Some(at) = deadline {
        db.expire(dest, at);
    }

    db.add_aof(with_name("RENAME", args));
    RespValue::ok()
}

fn exec_keys(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    let pattern = &args[0];
    let keys: Vec<Bytes> = db
        .db()
        .keys()
        .into_iter()
        .filter(|key| glob_match(pattern, key))
        .collect();
    RespValue::bulk_array(keys)
}

fn exec_dbsize(db: &mut LockedDb<'_>, _args: &[Bytes]) -> RespValue {
    RespValue::integer(db.db().size().0 as i64)
}

fn exec_flushdb(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    if !args.is_empty() {
        return syntax_error();
    }
    db.db().flush();
    RespValue::ok()
}

fn exec_ping(_db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    match args {
        [] => RespValue::pong(),
        [message] => RespValue::bulk_string(message.clone()),
        _ => super::wrong_arity("ping"),
    }
}

// ============================================================================
// Glob matching
// ============================================================================

/// Redis-style glob: `*`, `?`, `[abc]`, `[^a-z]` and `\` escapes.
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let Some((&first, rest)) = pattern.split_first() else {
        return text.is_empty();
    };

    match first {
        b'*' => {
            // Runs of stars behave like one
            let rest = rest.iter().position(|&c| c != b'*').map_or(&[][..], |i| &rest[i..]);
            if rest.is_empty() {
                return true;
            }
            (0..=text.len()).any(|i| glob_match(rest, &text[i..]))
        }
        b'?' => !text.is_empty() && glob_match(rest, &text[1..]),
        b'[' => {
            let Some(&c) = text.first() else {
                return false;
            };
            match match_class(rest, c) {
                Some((matched, after)) => matched && glob_match(after, &text[1..]),
                None => false,
            }
        }
        b'\\' if !rest.is_empty() => {
            !text.is_empty() && rest[0] == text[0] && glob_match(&rest[1..], &text[1..])
        }
        c => !text.is_empty() && c == text[0] && glob_match(rest, &text[1..]),
    }
}

/// Matches `c` against a class body (after `[`). Returns whether it matched
/// and the pattern following the closing `]`, or `None` if unterminated.
fn match_class(class: &[u8], c: u8) -> Option<(bool, &[u8])> {
    let negate = class.first() == Some(&b'^');
    let mut i = usize::from(negate);
    let mut matched = false;

    while i < class.len() && class[i] != b']' {
        if class[i] == b'\\' && i + 1 < class.len() {
            i += 1;
            matched |= class[i] == c;
        } else if i + 2 < class.len() && class[i + 1] == b'-' && class[i + 2] != b']' {
            let (lo, hi) = if class[i] <= class[i + 2] {
                (class[i], class[i + 2])
            } else {
                (class[i + 2], class[i])
            };
            matched |= (lo..=hi).contains(&c);
            i += 2;
        } else {
            matched |= class[i] == c;
        }
        i += 1;
    }

    if i >= class.len() {
        return None;
    }
    Some((matched != negate, &class[i + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::unix_millis;
    use crate::connection::ClientState;
    use crate::database::testing::{cmd, test_server};
    use crate::database::DbEngine;

    #[test]
    fn test_glob_match() {
        assert!(glob_match(b"*", b"anything"));
        assert!(glob_match(b"*", b""));
        assert!(glob_match(b"user:*", b"user:42"));
        assert!(!glob_match(b"user:*", b"session:42"));
        assert!(glob_match(b"h?llo", b"hello"));
        assert!(!glob_match(b"h?llo", b"hllo"));
        assert!(glob_match(b"h[ae]llo", b"hallo"));
        assert!(!glob_match(b"h[ae]llo", b"hillo"));
        assert!(glob_match(b"h[^e]llo", b"hallo"));
        assert!(!glob_match(b"h[^e]llo", b"hello"));
        assert!(glob_match(b"key[0-9]", b"key7"));
        assert!(!glob_match(b"key[0-9]", b"keyx"));
        assert!(glob_match(b"a\\*b", b"a*b"));
        assert!(!glob_match(b"a\\*b", b"axb"));
        assert!(glob_match(b"a**b", b"ab"));
        assert!(!glob_match(b"[abc", b"a"));
    }

    #[tokio::test]
    async fn test_del_and_exists() {
        let server = test_server();
        let mut conn = ClientState::new("test");
        server.exec(&mut conn, &cmd(&["SET", "a", "1"]));
        server.exec(&mut conn, &cmd(&["SET", "b", "2"]));

        assert_eq!(
            server.exec(&mut conn, &cmd(&["EXISTS", "a", "b", "c", "a"])),
            RespValue::integer(3)
        );
        assert_eq!(
            server.exec(&mut conn, &cmd(&["DEL", "a", "b", "c"])),
            RespValue::integer(2)
        );
        assert_eq!(
            server.exec(&mut conn, &cmd(&["EXISTS", "a"])),
            RespValue::integer(0)
        );
    }

    #[tokio::test]
    async fn test_expire_and_ttl() {
        let server = test_server();
        let mut conn = ClientState::new("test");

        assert_eq!(
            server.exec(&mut conn, &cmd(&["EXPIRE", "k", "10"])),
            RespValue::integer(0)
        );
        assert_eq!(server.exec(&mut conn, &cmd(&["TTL", "k"])), RespValue::integer(-2));

        server.exec(&mut conn, &cmd(&["SET", "k", "v"]));
        assert_eq!(server.exec(&mut conn, &cmd(&["TTL", "k"])), RespValue::integer(-1));

        assert_eq!(
            server.exec(&mut conn, &cmd(&["EXPIRE", "k", "100"])),
            RespValue::integer(1)
        );
        let ttl = server.exec(&mut conn, &cmd(&["TTL", "k"])).as_integer().unwrap();
        assert!((99..=100).contains(&ttl));
        let pttl = server.exec(&mut conn, &cmd(&["PTTL", "k"])).as_integer().unwrap();
        assert!(pttl > 99_000 && pttl <= 100_000);

        assert_eq!(
            server.exec(&mut conn, &cmd(&["PERSIST", "k"])),
            RespValue::integer(1)
        );
        assert_eq!(
            server.exec(&mut conn, &cmd(&["PERSIST", "k"])),
            RespValue::integer(0)
        );
        assert_eq!(server.exec(&mut conn, &cmd(&["TTL", "k"])), RespValue::integer(-1));

        assert!(server.exec(&mut conn, &cmd(&["EXPIRE", "k", "soon"])).is_error());
    }

    #[tokio::test]
    async fn test_expire_in_past_deletes() {
        let server = test_server();
        let mut conn = ClientState::new("test");
        server.exec(&mut conn, &cmd(&["SET", "a", "1"]));
        server.exec(&mut conn, &cmd(&["SET", "b", "1"]));

        assert_eq!(
            server.exec(&mut conn, &cmd(&["EXPIRE", "a", "-1"])),
            RespValue::integer(1)
        );
        assert_eq!(
            server.exec(&mut conn, &cmd(&["PEXPIREAT", "b", "1000"])),
            RespValue::integer(1)
        );
        assert_eq!(server.get_db_size(0), (0, 0));
    }

    #[tokio::test]
    async fn test_pexpire_fires() {
        let server = test_server();
        let mut conn = ClientState::new("test");
        server.exec(&mut conn, &cmd(&["SET", "k", "v"]));
        server.exec(&mut conn, &cmd(&["PEXPIRE", "k", "30"]));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(server.get_db_size(0), (0, 0));
        assert_eq!(server.exec(&mut conn, &cmd(&["GET", "k"])), RespValue::null());
    }

    #[tokio::test]
    async fn test_type() {
        let server = test_server();
        let mut conn = ClientState::new("test");
        server.exec(&mut conn, &cmd(&["SET", "s", "v"]));
        server.exec(&mut conn, &cmd(&["RPUSH", "l", "v"]));
        server.exec(&mut conn, &cmd(&["HSET", "h", "f", "v"]));
        server.exec(&mut conn, &cmd(&["SADD", "set", "m"]));
        server.exec(&mut conn, &cmd(&["ZADD", "z", "1", "m"]));

        for (key, expected) in [
            ("s", "string"),
            ("l", "list"),
            ("h", "hash"),
            ("set", "set"),
            ("z", "zset"),
            ("missing", "none"),
        ] {
            assert_eq!(
                server.exec(&mut conn, &cmd(&["TYPE", key])),
                RespValue::simple_string(expected)
            );
        }
    }

    #[tokio::test]
    async fn test_rename_moves_value_and_deadline() {
        let server = test_server();
        let mut conn = ClientState::new("test");
        server.exec(&mut conn, &cmd(&["SET", "src", "v", "EX", "100"]));
        server.exec(&mut conn, &cmd(&["SET", "dest", "old"]));

        assert_eq!(
            server.exec(&mut conn, &cmd(&["RENAME", "src", "dest"])),
            RespValue::ok()
        );
        assert_eq!(server.exec(&mut conn, &cmd(&["GET", "src"])), RespValue::null());
        assert_eq!(
            server.exec(&mut conn, &cmd(&["GET", "dest"])),
            RespValue::bulk_string("v")
        );
        let ttl = server.exec(&mut conn, &cmd(&["TTL", "dest"])).as_integer().unwrap();
        assert!(ttl > 90);

        assert_eq!(
            server.exec(&mut conn, &cmd(&["RENAME", "nope", "x"])),
            RespValue::error("ERR no such key")
        );
    }

    #[tokio::test]
    async fn test_rename_to_itself() {
        let server = test_server();
        let mut conn = ClientState::new("test");
        server.exec(&mut conn, &cmd(&["SET", "k", "v"]));
        assert_eq!(
            server.exec(&mut conn, &cmd(&["RENAME", "k", "k"])),
            RespValue::ok()
        );
        assert_eq!(
            server.exec(&mut conn, &cmd(&["GET", "k"])),
            RespValue::bulk_string("v")
        );
    }

    #[tokio::test]
    async fn test_keys_dbsize_flushdb() {
        let server = test_server();
        let mut conn = ClientState::new("test");
        for key in ["user:1", "user:2", "session:1"] {
            server.exec(&mut conn, &cmd(&["SET", key, "v"]));
        }

        let reply = server.exec(&mut conn, &cmd(&["KEYS", "user:*"]));
        let mut keys: Vec<&[u8]> = reply
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_bytes().unwrap())
            .collect();
        keys.sort();
        assert_eq!(keys, vec![&b"user:1"[..], &b"user:2"[..]]);

        assert_eq!(server.exec(&mut conn, &cmd(&["DBSIZE"])), RespValue::integer(3));
        assert_eq!(server.exec(&mut conn, &cmd(&["FLUSHDB"])), RespValue::ok());
        assert_eq!(server.exec(&mut conn, &cmd(&["DBSIZE"])), RespValue::integer(0));
    }

    #[tokio::test]
    async fn test_ping() {
        let server = test_server();
        let mut conn = ClientState::new("test");
        assert_eq!(server.exec(&mut conn, &cmd(&["PING"])), RespValue::pong());
        assert_eq!(
            server.exec(&mut conn, &cmd(&["PING", "hi"])),
            RespValue::bulk_string("hi")
        );
        assert!(server.exec(&mut conn, &cmd(&["PING", "a", "b"])).is_error());
    }

    #[test]
    fn test_expire_line_is_absolute() {
        let at = std::time::UNIX_EPOCH + Duration::from_millis(5_000);
        let line = marshal::expire_cmd(&Bytes::from("k"), at);
        assert_eq!(line, cmd(&["PEXPIREAT", "k", "5000"]));
        assert_eq!(unix_millis(at), 5_000);
    }
}
