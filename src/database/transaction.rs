//! MULTI / EXEC / DISCARD / WATCH / UNWATCH
//!
//! A transaction is queued on the connection and executed in one lock
//! region covering every key any queued command touches, plus the watched
//! keys. Before each command runs its undo log is captured; if a command
//! replies with an error, the undo logs of the commands that already ran
//! are replayed newest first and the client gets `EXECABORT`.
//!
//! ```text
//!   MULTI ──► SET a 1 ──► INCR b ──► EXEC
//!             QUEUED      QUEUED      │
//!                                     ├─ watched version changed ─► (nil)
//!                                     ├─ all ok ──────────────────► [OK, 1]
//!                                     └─ error ─► undo in reverse ► EXECABORT
//! ```
//!
//! Undo lines go through the same executors, so they reach the append-only
//! log like any other write.

use crate::aof::marshal;
use crate::commands::{unknown_command, wrong_arity};
use crate::connection::Connection;
use crate::database::db::{Db, LockedDb};
use crate::database::registry::command_name;
use crate::protocol::{CmdLine, RespValue};
use bytes::Bytes;
use std::collections::HashMap;
use tracing::debug;

pub(crate) fn start_multi(conn: &mut dyn Connection, cmd_line: &[Bytes]) -> RespValue {
    if cmd_line.len() != 1 {
        return wrong_arity("multi");
    }
    if conn.in_multi_state() {
        return RespValue::error("ERR MULTI calls can not be nested");
    }
    conn.set_multi_state(true);
    RespValue::ok()
}

pub(crate) fn discard(conn: &mut dyn Connection, cmd_line: &[Bytes]) -> RespValue {
    if cmd_line.len() != 1 {
        return wrong_arity("discard");
    }
    if !conn.in_multi_state() {
        return RespValue::error("ERR DISCARD without MULTI");
    }
    conn.set_multi_state(false);
    RespValue::ok()
}

pub(crate) fn watch(db: &Db, conn: &mut dyn Connection, cmd_line: &[Bytes]) -> RespValue {
    if cmd_line.len() < 2 {
        return wrong_arity("watch");
    }
    if conn.in_multi_state() {
        return RespValue::error("ERR WATCH inside MULTI is not allowed");
    }
    for key in &cmd_line[1..] {
        db.expire_if_needed(key);
        let version = db.get_version(key);
        conn.watching().insert((db.index(), key.clone()), version);
    }
    RespValue::ok()
}

pub(crate) fn unwatch(conn: &mut dyn Connection, cmd_line: &[Bytes]) -> RespValue {
    if cmd_line.len() != 1 {
        return wrong_arity("unwatch");
    }
    if conn.in_multi_state() {
        return RespValue::error("ERR UNWATCH inside MULTI is not allowed");
    }
    conn.watching().clear();
    RespValue::ok()
}

/// Validates a command and appends it to the connection's queue.
///
/// Validation errors are remembered so EXEC can refuse the whole batch.
pub(crate) fn enqueue(db: &Db, conn: &mut dyn Connection, cmd_line: &[Bytes]) -> RespValue {
    let looked_up = db.lookup(cmd_line).and_then(|command| {
        if command.keyspace_wide {
            Err(RespValue::error(format!(
                "ERR {} is not allowed in MULTI",
                command.name.to_ascii_uppercase()
            )))
        } else {
            Ok(command)
        }
    });
    match looked_up {
        Ok(_) => {
            conn.enqueue_cmd(cmd_line.to_vec());
            RespValue::queued()
        }
        Err(reply) => {
            if let RespValue::Error(message) = &reply {
                conn.add_tx_error(message.clone());
            }
            reply
        }
    }
}

/// EXEC: leaves MULTI and runs the queue.
pub(crate) fn exec_queued(db: &Db, conn: &mut dyn Connection, cmd_line: &[Bytes]) -> RespValue {
    if cmd_line.len() != 1 {
        return wrong_arity("exec");
    }
    if !conn.in_multi_state() {
        return RespValue::error("ERR EXEC without MULTI");
    }

    if !conn.tx_errors().is_empty() {
        conn.set_multi_state(false);
        return RespValue::error("EXECABORT Transaction discarded because of previous errors.");
    }

    // Keys watched in other databases are checked by the server before
    // EXEC reaches this database.
    let cmd_lines = conn.queued_cmd_lines().to_vec();
    let watching: HashMap<Bytes, u32> = conn
        .watching()
        .iter()
        .filter(|((index, _), _)| *index == db.index())
        .map(|((_, key), version)| (key.clone(), *version))
        .collect();
    conn.set_multi_state(false);

    db.exec_multi(&watching, &cmd_lines)
}

/// Runs `cmd_lines` in one region, aborting if any watched version moved.
pub(crate) fn exec_multi(db: &Db, watching: &HashMap<Bytes, u32>, cmd_lines: &[CmdLine]) -> RespValue {
    let mut write_keys = Vec::new();
    let mut read_keys: Vec<Bytes> = watching.keys().cloned().collect();

    for cmd_line in cmd_lines {
        match db.lookup(cmd_line) {
            Ok(cmd) => {
                let (write, read) = cmd.lock_keys(&cmd_line[1..]);
                write_keys.extend(write);
                read_keys.extend(read);
            }
            Err(_) => {
                let name = cmd_line.first().map(|n| command_name(n)).unwrap_or_default();
                debug!(command = %name, "Queued command no longer valid");
                return unknown_command(&name);
            }
        }
    }

    for key in write_keys.iter().chain(&read_keys) {
        db.expire_if_needed(key);
    }

    let mut locked = db.rw_locks(&write_keys, &read_keys);

    if is_watching_changed(db, watching) {
        return RespValue::null();
    }

    let mut results = Vec::with_capacity(cmd_lines.len());
    let mut undo_logs: Vec<Vec<CmdLine>> = Vec::with_capacity(cmd_lines.len());
    let mut aborted = false;

    for cmd_line in cmd_lines {
        let undo = db.get_undo_logs(&locked, cmd_line);
        let reply = db.exec_with_lock(&mut locked, cmd_line);
        if reply.is_error() {
            debug!(
                command = %command_name(&cmd_line[0]),
                reply = ?reply,
                "Transaction command failed, rolling back"
            );
            aborted = true;
            break;
        }
        undo_logs.push(undo);
        results.push(reply);
    }

    if !aborted {
        return RespValue::array(results);
    }

    for undo in undo_logs.iter().rev() {
        for line in undo {
            db.exec_with_lock(&mut locked, line);
        }
    }
    RespValue::error("EXECABORT Transaction rollback because of errors")
}

fn is_watching_changed(db: &Db, watching: &HashMap<Bytes, u32>) -> bool {
    watching
        .iter()
        .any(|(key, version)| db.get_version(key) != *version)
}

// ============================================================================
// Undo helpers
// ============================================================================

/// Command lines that restore `key` to its current state (or delete it if
/// it does not exist).
pub fn rollback_key(locked: &LockedDb<'_>, key: &Bytes) -> Vec<CmdLine> {
    let mut lines = vec![vec![Bytes::from_static(b"DEL"), key.clone()]];

    let Some(entity) = locked.peek_entity(key) else {
        return lines;
    };
    lines.push(marshal::entity_to_cmd(key, entity));

    if let Some(at) = locked.ttl(key) {
        lines.push(marshal::expire_cmd(key, at));
    }
    lines
}

/// Undo for commands whose only key is the first argument.
pub fn rollback_first_key(locked: &LockedDb<'_>, args: &[Bytes]) -> Vec<CmdLine> {
    match args.first() {
        Some(key) => rollback_key(locked, key),
        None => Vec::new(),
    }
}

/// Undo covering every key in `keys`.
pub fn rollback_given_keys(locked: &LockedDb<'_>, keys: &[Bytes]) -> Vec<CmdLine> {
    keys.iter().flat_map(|key| rollback_key(locked, key)).collect()
}

/// Undo for expiration commands: restores the previous deadline, or
/// clears the one the command is about to set.
pub fn rollback_expire(locked: &LockedDb<'_>, args: &[Bytes]) -> Vec<CmdLine> {
    let Some(key) = args.first() else {
        return Vec::new();
    };
    if locked.peek_entity(key).is_none() {
        return Vec::new();
    }
    match locked.ttl(key) {
        Some(at) => vec![marshal::expire_cmd(key, at)],
        None => vec![vec![Bytes::from_static(b"PERSIST"), key.clone()]],
    }
}

#[cfg(test)]
mod tests {
    use crate::connection::{ClientState, Connection};
    use crate::database::testing::{cmd, test_server};
    use crate::database::DbEngine;
    use crate::protocol::RespValue;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_multi_exec() {
        let server = test_server();
        let mut conn = ClientState::new("test");

        assert_eq!(server.exec(&mut conn, &cmd(&["MULTI"])), RespValue::ok());
        assert_eq!(server.exec(&mut conn, &cmd(&["SET", "a", "1"])), RespValue::queued());
        assert_eq!(server.exec(&mut conn, &cmd(&["INCR", "a"])), RespValue::queued());
        assert_eq!(server.exec(&mut conn, &cmd(&["GET", "a"])), RespValue::queued());

        let reply = server.exec(&mut conn, &cmd(&["EXEC"]));
        assert_eq!(
            reply,
            RespValue::array(vec![
                RespValue::ok(),
                RespValue::integer(2),
                RespValue::bulk_string(Bytes::from("2")),
            ])
        );
        assert!(!conn.in_multi_state());
    }

    #[tokio::test]
    async fn test_multi_errors() {
        let server = test_server();
        let mut conn = ClientState::new("test");

        assert_eq!(
            server.exec(&mut conn, &cmd(&["EXEC"])),
            RespValue::error("ERR EXEC without MULTI")
        );
        assert_eq!(
            server.exec(&mut conn, &cmd(&["DISCARD"])),
            RespValue::error("ERR DISCARD without MULTI")
        );

        server.exec(&mut conn, &cmd(&["MULTI"]));
        assert_eq!(
            server.exec(&mut conn, &cmd(&["MULTI"])),
            RespValue::error("ERR MULTI calls can not be nested")
        );
        assert_eq!(
            server.exec(&mut conn, &cmd(&["WATCH", "a"])),
            RespValue::error("ERR WATCH inside MULTI is not allowed")
        );
    }

    #[tokio::test]
    async fn test_queue_error_discards_transaction() {
        let server = test_server();
        let mut conn = ClientState::new("test");

        server.exec(&mut conn, &cmd(&["MULTI"]));
        server.exec(&mut conn, &cmd(&["SET", "a", "1"]));
        assert!(server.exec(&mut conn, &cmd(&["GET"])).is_error());
        assert!(server.exec(&mut conn, &cmd(&["NOSUCHCMD"])).is_error());

        assert_eq!(
            server.exec(&mut conn, &cmd(&["EXEC"])),
            RespValue::error("EXECABORT Transaction discarded because of previous errors.")
        );
        assert_eq!(server.exec(&mut conn, &cmd(&["GET", "a"])), RespValue::null());
    }

    #[tokio::test]
    async fn test_discard() {
        let server = test_server();
        let mut conn = ClientState::new("test");

        server.exec(&mut conn, &cmd(&["MULTI"]));
        server.exec(&mut conn, &cmd(&["SET", "a", "1"]));
        assert_eq!(server.exec(&mut conn, &cmd(&["DISCARD"])), RespValue::ok());
        assert_eq!(server.exec(&mut conn, &cmd(&["GET", "a"])), RespValue::null());
    }

    #[tokio::test]
    async fn test_watch_aborts_on_conflict() {
        let server = test_server();
        let mut alice = ClientState::new("alice");
        let mut bob = ClientState::new("bob");

        server.exec(&mut alice, &cmd(&["SET", "balance", "10"]));
        assert_eq!(server.exec(&mut alice, &cmd(&["WATCH", "balance"])), RespValue::ok());
        server.exec(&mut alice, &cmd(&["MULTI"]));
        server.exec(&mut alice, &cmd(&["INCRBY", "balance", "5"]));

        server.exec(&mut bob, &cmd(&["SET", "balance", "100"]));

        assert_eq!(server.exec(&mut alice, &cmd(&["EXEC"])), RespValue::null());
        assert_eq!(
            server.exec(&mut alice, &cmd(&["GET", "balance"])),
            RespValue::bulk_string(Bytes::from("100"))
        );
    }

    #[tokio::test]
    async fn test_watch_without_conflict_commits() {
        let server = test_server();
        let mut conn = ClientState::new("test");

        server.exec(&mut conn, &cmd(&["WATCH", "k"]));
        server.exec(&mut conn, &cmd(&["MULTI"]));
        server.exec(&mut conn, &cmd(&["SET", "k", "v"]));
        assert_eq!(
            server.exec(&mut conn, &cmd(&["EXEC"])),
            RespValue::array(vec![RespValue::ok()])
        );
    }

    #[tokio::test]
    async fn test_unwatch() {
        let server = test_server();
        let mut alice = ClientState::new("alice");
        let mut bob = ClientState::new("bob");

        server.exec(&mut alice, &cmd(&["WATCH", "k"]));
        assert_eq!(server.exec(&mut alice, &cmd(&["UNWATCH"])), RespValue::ok());
        server.exec(&mut bob, &cmd(&["SET", "k", "other"]));

        server.exec(&mut alice, &cmd(&["MULTI"]));
        server.exec(&mut alice, &cmd(&["SET", "k", "mine"]));
        assert_eq!(
            server.exec(&mut alice, &cmd(&["EXEC"])),
            RespValue::array(vec![RespValue::ok()])
        );
    }

    #[tokio::test]
    async fn test_runtime_error_rolls_back() {
        let server = test_server();
        let mut conn = ClientState::new("test");

        server.exec(&mut conn, &cmd(&["SET", "a", "old"]));
        server.exec(&mut conn, &cmd(&["RPUSH", "list", "x"]));

        server.exec(&mut conn, &cmd(&["MULTI"]));
        server.exec(&mut conn, &cmd(&["SET", "a", "new"]));
        server.exec(&mut conn, &cmd(&["SET", "b", "fresh"]));
        server.exec(&mut conn, &cmd(&["RPUSH", "list", "y"]));
        // Wrong type: fails at run time, not at queue time.
        server.exec(&mut conn, &cmd(&["INCR", "list"]));

        assert_eq!(
            server.exec(&mut conn, &cmd(&["EXEC"])),
            RespValue::error("EXECABORT Transaction rollback because of errors")
        );

        assert_eq!(
            server.exec(&mut conn, &cmd(&["GET", "a"])),
            RespValue::bulk_string(Bytes::from("old"))
        );
        assert_eq!(server.exec(&mut conn, &cmd(&["GET", "b"])), RespValue::null());
        assert_eq!(
            server.exec(&mut conn, &cmd(&["LRANGE", "list", "0", "-1"])),
            RespValue::bulk_array(vec![Bytes::from("x")])
        );
    }

    #[tokio::test]
    async fn test_rollback_restores_ttl() {
        let server = test_server();
        let mut conn = ClientState::new("test");

        server.exec(&mut conn, &cmd(&["SET", "k", "v", "EX", "100"]));

        server.exec(&mut conn, &cmd(&["MULTI"]));
        server.exec(&mut conn, &cmd(&["PERSIST", "k"]));
        server.exec(&mut conn, &cmd(&["LPUSH", "k", "x"]));
        assert!(server.exec(&mut conn, &cmd(&["EXEC"])).is_error());

        let ttl = server.exec(&mut conn, &cmd(&["TTL", "k"])).as_integer().unwrap();
        assert!(ttl > 90 && ttl <= 100, "ttl was {}", ttl);
    }
}
