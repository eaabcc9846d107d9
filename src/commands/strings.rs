//! String commands.

use super::{from_now_millis, not_integer, parse_i64, syntax_error, with_name, wrong_arity, wrong_type};
use crate::aof::marshal;
use crate::database::transaction::{rollback_first_key, rollback_given_keys};
use crate::database::{Command, CommandTable, KeySpec, LockedDb};
use crate::protocol::{CmdLine, RespValue};
use crate::storage::Entity;
use bytes::{Bytes, BytesMut};
use std::time::SystemTime;

pub fn register(table: &mut CommandTable) {
    table.register(Command::write("set", exec_set, -3).undo(rollback_first_key));
    table.register(Command::write("setnx", exec_setnx, 3).undo(rollback_first_key));
    table.register(Command::write("getset", exec_getset, 3).undo(rollback_first_key));
    table.register(Command::read_only("get", exec_get, 2));
    table.register(
        Command::write("mset", exec_mset, -3)
            .keys(KeySpec::PAIRS)
            .undo(undo_mset),
    );
    table.register(Command::read_only("mget", exec_mget, -2).keys(KeySpec::ALL));

    table.register(Command::write("incr", exec_incr, 2).undo(rollback_first_key));
    table.register(Command::write("incrby", exec_incrby, 3).undo(rollback_first_key));
    table.register(Command::write("decr", exec_decr, 2).undo(rollback_first_key));
    table.register(Command::write("decrby", exec_decrby, 3).undo(rollback_first_key));

    table.register(Command::write("append", exec_append, 3).undo(rollback_first_key));
    table.register(Command::read_only("strlen", exec_strlen, 2));
}

/// Reads a string value. `Err` carries the WRONGTYPE reply.
fn get_string(db: &mut LockedDb<'_>, key: &[u8]) -> Result<Option<Bytes>, RespValue> {
    match db.get_entity(key) {
        None => Ok(None),
        Some(Entity::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(wrong_type()),
    }
}

fn exec_get(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    match get_string(db, &args[0]) {
        Ok(Some(value)) => RespValue::bulk_string(value),
        Ok(None) => RespValue::null(),
        Err(reply) => reply,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetPolicy {
    Always,
    IfAbsent,
    IfExists,
}

/// SET key value [EX seconds | PX milliseconds] [NX | XX]
fn exec_set(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    let key = &args[0];
    let value = &args[1];

    let mut policy = SetPolicy::Always;
    let mut deadline: Option<SystemTime> = None;

    let mut i = 2;
    while i < args.len() {
        let opt = String::from_utf8_lossy(&args[i]).to_uppercase();
        match opt.as_str() {
            "EX" | "PX" => {
                if deadline.is_some() {
                    return syntax_error();
                }
                i += 1;
                let Some(raw) = args.get(i) else {
                    return syntax_error();
                };
                let amount = match parse_i64(raw) {
                    Some(n) if n > 0 => n,
                    Some(_) => return RespValue::error("ERR invalid expire time in 'set' command"),
                    None => return not_integer(),
                };
                let ms = if opt == "EX" { amount.checked_mul(1000) } else { Some(amount) };
                match ms.and_then(from_now_millis) {
                    Some(at) => deadline = Some(at),
                    None => return RespValue::error("ERR invalid expire time in 'set' command"),
                }
            }
            "NX" | "XX" => {
                if policy != SetPolicy::Always {
                    return syntax_error();
                }
                policy = if opt == "NX" { SetPolicy::IfAbsent } else { SetPolicy::IfExists };
            }
            _ => return syntax_error(),
        }
        i += 1;
    }

    let entity = Entity::String(value.clone());
    let stored = match policy {
        SetPolicy::Always => {
            db.put_entity(key.clone(), entity);
            true
        }
        SetPolicy::IfAbsent => db.put_if_absent(key.clone(), entity),
        SetPolicy::IfExists => db.put_if_exists(key, entity),
    };
    if !stored {
        return RespValue::null();
    }

    let set_line: CmdLine = vec![Bytes::from_static(b"SET"), key.clone(), value.clone()];
    match deadline {
        Some(at) => {
            db.expire(key, at);
            db.add_aof(set_line);
            db.add_aof(marshal::expire_cmd(key, at));
        }
        None => {
            db.persist(key);
            db.add_aof(set_line);
        }
    }
    RespValue::ok()
}

fn exec_setnx(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    let key = &args[0];
    if !db.put_if_absent(key.clone(), Entity::String(args[1].clone())) {
        return RespValue::integer(0);
    }
    db.add_aof(with_name("SET", args));
    RespValue::integer(1)
}

fn exec_getset(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    let key = &args[0];
    let old = match get_string(db, key) {
        Ok(old) => old,
        Err(reply) => return reply,
    };

    db.put_entity(key.clone(), Entity::String(args[1].clone()));
    db.persist(key);
    db.add_aof(with_name("SET", args));

    match old {
        Some(value) => RespValue::bulk_string(value),
        None => RespValue::null(),
    }
}

fn exec_mset(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    if args.len() % 2 != 0 {
        return wrong_arity("mset");
    }
    for pair in args.chunks_exact(2) {
        db.put_entity(pair[0].clone(), Entity::String(pair[1].clone()));
        db.persist(&pair[0]);
    }
    db.add_aof(with_name("MSET", args));
    RespValue::ok()
}

fn undo_mset(locked: &LockedDb<'_>, args: &[Bytes]) -> Vec<CmdLine> {
    rollback_given_keys(locked, &KeySpec::PAIRS.keys(args))
}

fn exec_mget(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    let values = args
        .iter()
        .map(|key| match db.get_entity(key) {
            Some(Entity::String(value)) => RespValue::bulk_string(value.clone()),
            _ => RespValue::null(),
        })
        .collect();
    RespValue::array(values)
}

// ============================================================================
// Counters
// ============================================================================

fn exec_incr(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    incr_by(db, "INCR", args, 1)
}

fn exec_decr(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    incr_by(db, "DECR", args, -1)
}

fn exec_incrby(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    match parse_i64(&args[1]) {
        Some(delta) => incr_by(db, "INCRBY", args, delta),
        None => not_integer(),
    }
}

fn exec_decrby(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    match parse_i64(&args[1]).and_then(i64::checked_neg) {
        Some(delta) => incr_by(db, "DECRBY", args, delta),
        None => not_integer(),
    }
}

/// Adds `delta` to the integer at `args[0]`, keeping any deadline.
fn incr_by(db: &mut LockedDb<'_>, name: &'static str, args: &[Bytes], delta: i64) -> RespValue {
    let key = &args[0];
    let current = match get_string(db, key) {
        Ok(None) => 0,
        Ok(Some(value)) => match parse_i64(&value) {
            Some(n) => n,
            None => return not_integer(),
        },
        Err(reply) => return reply,
    };

    let Some(next) = current.checked_add(delta) else {
        return RespValue::error("ERR increment or decrement would overflow");
    };

    db.put_entity(key.clone(), Entity::String(Bytes::from(next.to_string())));
    db.add_aof(with_name(name, args));
    RespValue::integer(next)
}

// ============================================================================
// Byte operations
// ============================================================================

fn exec_append(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    let key = &args[0];
    let current = match get_string(db, key) {
        Ok(current) => current.unwrap_or_default(),
        Err(reply) => return reply,
    };

    let mut joined = BytesMut::with_capacity(current.len() + args[1].len());
    joined.extend_from_slice(&current);
    joined.extend_from_slice(&args[1]);
    let len = joined.len();

    db.put_entity(key.clone(), Entity::String(joined.freeze()));
    db.add_aof(with_name("APPEND", args));
    RespValue::integer(len as i64)
}

fn exec_strlen(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    match get_string(db, &args[0]) {
        Ok(value) => RespValue::integer(value.map_or(0, |v| v.len()) as i64),
        Err(reply) => reply,
    }
}

#[cfg(test)]
mod tests {
    use crate::connection::ClientState;
    use crate::database::testing::{cmd, test_server};
    use crate::database::DbEngine;
    use crate::protocol::RespValue;

    #[tokio::test]
    async fn test_set_get() {
        let server = test_server();
        let mut conn = ClientState::new("test");

        assert_eq!(server.exec(&mut conn, &cmd(&["SET", "k", "v"])), RespValue::ok());
        assert_eq!(
            server.exec(&mut conn, &cmd(&["GET", "k"])),
            RespValue::bulk_string("v")
        );
        assert_eq!(server.exec(&mut conn, &cmd(&["GET", "missing"])), RespValue::null());
    }

    #[tokio::test]
    async fn test_set_options() {
        let server = test_server();
        let mut conn = ClientState::new("test");

        assert_eq!(
            server.exec(&mut conn, &cmd(&["SET", "k", "v", "XX"])),
            RespValue::null()
        );
        assert_eq!(
            server.exec(&mut conn, &cmd(&["SET", "k", "v", "NX"])),
            RespValue::ok()
        );
        assert_eq!(
            server.exec(&mut conn, &cmd(&["SET", "k", "w", "nx"])),
            RespValue::null()
        );
        assert_eq!(
            server.exec(&mut conn, &cmd(&["SET", "k", "w", "XX", "EX", "100"])),
            RespValue::ok()
        );
        let ttl = server.exec(&mut conn, &cmd(&["TTL", "k"])).as_integer().unwrap();
        assert!((99..=100).contains(&ttl));

        // A plain SET clears the deadline
        server.exec(&mut conn, &cmd(&["SET", "k", "x"]));
        assert_eq!(server.exec(&mut conn, &cmd(&["TTL", "k"])), RespValue::integer(-1));

        assert_eq!(
            server.exec(&mut conn, &cmd(&["SET", "k", "v", "NX", "XX"])),
            RespValue::error("ERR syntax error")
        );
        assert_eq!(
            server.exec(&mut conn, &cmd(&["SET", "k", "v", "EX"])),
            RespValue::error("ERR syntax error")
        );
        assert!(server.exec(&mut conn, &cmd(&["SET", "k", "v", "EX", "0"])).is_error());
        assert!(server.exec(&mut conn, &cmd(&["SET", "k", "v", "BOGUS"])).is_error());
    }

    #[tokio::test]
    async fn test_set_px() {
        let server = test_server();
        let mut conn = ClientState::new("test");
        server.exec(&mut conn, &cmd(&["SET", "k", "v", "PX", "20"]));
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        assert_eq!(server.exec(&mut conn, &cmd(&["GET", "k"])), RespValue::null());
    }

    #[tokio::test]
    async fn test_setnx_getset() {
        let server = test_server();
        let mut conn = ClientState::new("test");

        assert_eq!(
            server.exec(&mut conn, &cmd(&["SETNX", "k", "a"])),
            RespValue::integer(1)
        );
        assert_eq!(
            server.exec(&mut conn, &cmd(&["SETNX", "k", "b"])),
            RespValue::integer(0)
        );
        assert_eq!(
            server.exec(&mut conn, &cmd(&["GETSET", "k", "c"])),
            RespValue::bulk_string("a")
        );
        assert_eq!(
            server.exec(&mut conn, &cmd(&["GETSET", "new", "x"])),
            RespValue::null()
        );
        assert_eq!(
            server.exec(&mut conn, &cmd(&["GET", "k"])),
            RespValue::bulk_string("c")
        );
    }

    #[tokio::test]
    async fn test_mset_mget() {
        let server = test_server();
        let mut conn = ClientState::new("test");

        assert_eq!(
            server.exec(&mut conn, &cmd(&["MSET", "a", "1", "b", "2"])),
            RespValue::ok()
        );
        assert!(server.exec(&mut conn, &cmd(&["MSET", "a", "1", "b"])).is_error());
        server.exec(&mut conn, &cmd(&["RPUSH", "list", "x"]));

        assert_eq!(
            server.exec(&mut conn, &cmd(&["MGET", "a", "missing", "b", "list"])),
            RespValue::array(vec![
                RespValue::bulk_string("1"),
                RespValue::null(),
                RespValue::bulk_string("2"),
                RespValue::null(),
            ])
        );
    }

    #[tokio::test]
    async fn test_counters() {
        let server = test_server();
        let mut conn = ClientState::new("test");

        assert_eq!(server.exec(&mut conn, &cmd(&["INCR", "n"])), RespValue::integer(1));
        assert_eq!(
            server.exec(&mut conn, &cmd(&["INCRBY", "n", "10"])),
            RespValue::integer(11)
        );
        assert_eq!(server.exec(&mut conn, &cmd(&["DECR", "n"])), RespValue::integer(10));
        assert_eq!(
            server.exec(&mut conn, &cmd(&["DECRBY", "n", "15"])),
            RespValue::integer(-5)
        );

        server.exec(&mut conn, &cmd(&["SET", "s", "abc"]));
        assert_eq!(
            server.exec(&mut conn, &cmd(&["INCR", "s"])),
            RespValue::error("ERR value is not an integer or out of range")
        );

        server.exec(&mut conn, &cmd(&["SET", "max", i64::MAX.to_string().as_str()]));
        assert!(server.exec(&mut conn, &cmd(&["INCR", "max"])).is_error());
    }

    #[tokio::test]
    async fn test_incr_keeps_deadline() {
        let server = test_server();
        let mut conn = ClientState::new("test");
        server.exec(&mut conn, &cmd(&["SET", "n", "1", "EX", "100"]));
        server.exec(&mut conn, &cmd(&["INCR", "n"]));
        let ttl = server.exec(&mut conn, &cmd(&["TTL", "n"])).as_integer().unwrap();
        assert!(ttl > 90);
    }

    #[tokio::test]
    async fn test_append_strlen() {
        let server = test_server();
        let mut conn = ClientState::new("test");

        assert_eq!(
            server.exec(&mut conn, &cmd(&["APPEND", "k", "Hello"])),
            RespValue::integer(5)
        );
        assert_eq!(
            server.exec(&mut conn, &cmd(&["APPEND", "k", " World"])),
            RespValue::integer(11)
        );
        assert_eq!(server.exec(&mut conn, &cmd(&["STRLEN", "k"])), RespValue::integer(11));
        assert_eq!(
            server.exec(&mut conn, &cmd(&["STRLEN", "missing"])),
            RespValue::integer(0)
        );
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let server = test_server();
        let mut conn = ClientState::new("test");
        server.exec(&mut conn, &cmd(&["LPUSH", "l", "a"]));

        for line in [
            cmd(&["GET", "l"]),
            cmd(&["APPEND", "l", "x"]),
            cmd(&["INCR", "l"]),
            cmd(&["GETSET", "l", "x"]),
            cmd(&["STRLEN", "l"]),
        ] {
            assert_eq!(server.exec(&mut conn, &line), crate::commands::wrong_type());
        }

        // SET overwrites regardless of type
        assert_eq!(server.exec(&mut conn, &cmd(&["SET", "l", "v"])), RespValue::ok());
    }
}
