//! Set commands.

use super::{with_name, wrong_type};
use crate::database::transaction::rollback_first_key;
use crate::database::{Command, CommandTable, LockedDb};
use crate::protocol::RespValue;
use crate::storage::Entity;
use bytes::Bytes;
use std::collections::HashSet;

pub fn register(table: &mut CommandTable) {
    table.register(Command::write("sadd", exec_sadd, -3).undo(rollback_first_key));
    table.register(Command::write("srem", exec_srem, -3).undo(rollback_first_key));
    table.register(Command::read_only("sismember", exec_sismember, 3));
    table.register(Command::read_only("scard", exec_scard, 2));
    table.register(Command::read_only("smembers", exec_smembers, 2));
}

fn exec_sadd(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    let key = &args[0];
    let members = &args[1..];
    let insert = |set: &mut HashSet<Bytes>| members.iter().filter(|m| set.insert((*m).clone())).count();

    let added = match db.get_entity_mut(key) {
        Some(Entity::Set(set)) => insert(set),
        Some(_) => return wrong_type(),
        None => {
            let mut set = HashSet::with_capacity(members.len());
            let added = insert(&mut set);
            db.put_entity(key.clone(), Entity::Set(set));
            added
        }
    };

    if added > 0 {
        db.add_aof(with_name("SADD", args));
    }
    RespValue::integer(added as i64)
}

fn exec_srem(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    let key = &args[0];
    let (removed, now_empty) = match db.get_entity_mut(key) {
        Some(Entity::Set(set)) => {
            let removed = args[1..].iter().filter(|m| set.remove(*m)).count();
            (removed, set.is_empty())
        }
        Some(_) => return wrong_type(),
        None => return RespValue::integer(0),
    };

    if now_empty {
        db.remove(key);
    }
    if removed > 0 {
        db.add_aof(with_name("SREM", args));
    }
    RespValue::integer(removed as i64)
}

fn exec_sismember(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    match db.get_entity(&args[0]) {
        Some(Entity::Set(set)) => RespValue::integer(set.contains(&args[1]) as i64),
        Some(_) => wrong_type(),
        None => RespValue::integer(0),
    }
}

fn exec_scard(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    match db.get_entity(&args[0]) {
        Some(Entity::Set(set)) => RespValue::integer(set.len() as i64),
        Some(_) => wrong_type(),
        None => RespValue::integer(0),
    }
}

fn exec_smembers(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    match db.get_entity(&args[0]) {
        Some(Entity::Set(set)) => RespValue::bulk_array(set.iter().cloned().collect::<Vec<_>>()),
        Some(_) => wrong_type(),
        None => RespValue::array(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use crate::connection::ClientState;
    use crate::database::testing::{cmd, test_server};
    use crate::database::DbEngine;
    use crate::protocol::RespValue;

    #[tokio::test]
    async fn test_sadd_srem() {
        let server = test_server();
        let mut conn = ClientState::new("test");

        assert_eq!(
            server.exec(&mut conn, &cmd(&["SADD", "s", "a", "b", "a"])),
            RespValue::integer(2)
        );
        assert_eq!(server.exec(&mut conn, &cmd(&["SCARD", "s"])), RespValue::integer(2));
        assert_eq!(
            server.exec(&mut conn, &cmd(&["SISMEMBER", "s", "a"])),
            RespValue::integer(1)
        );
        assert_eq!(
            server.exec(&mut conn, &cmd(&["SREM", "s", "a", "zz"])),
            RespValue::integer(1)
        );
        assert_eq!(
            server.exec(&mut conn, &cmd(&["SISMEMBER", "s", "a"])),
            RespValue::integer(0)
        );

        server.exec(&mut conn, &cmd(&["SREM", "s", "b"]));
        assert_eq!(server.exec(&mut conn, &cmd(&["TYPE", "s"])), RespValue::simple_string("none"));
    }

    #[tokio::test]
    async fn test_smembers() {
        let server = test_server();
        let mut conn = ClientState::new("test");
        server.exec(&mut conn, &cmd(&["SADD", "s", "x", "y", "z"]));

        let reply = server.exec(&mut conn, &cmd(&["SMEMBERS", "s"]));
        let mut members: Vec<&str> = reply
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        members.sort();
        assert_eq!(members, vec!["x", "y", "z"]);

        assert_eq!(
            server.exec(&mut conn, &cmd(&["SMEMBERS", "missing"])),
            RespValue::array(vec![])
        );
    }
}
