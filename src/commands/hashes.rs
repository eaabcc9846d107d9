//! Hash commands.

use super::{with_name, wrong_arity, wrong_type};
use crate::database::transaction::rollback_first_key;
use crate::database::{Command, CommandTable, LockedDb};
use crate::protocol::RespValue;
use crate::storage::Entity;
use bytes::Bytes;
use std::collections::HashMap;

pub fn register(table: &mut CommandTable) {
    table.register(Command::write("hset", exec_hset, -4).undo(rollback_first_key));
    table.register(Command::write("hmset", exec_hmset, -4).undo(rollback_first_key));
    table.register(Command::write("hdel", exec_hdel, -3).undo(rollback_first_key));
    table.register(Command::read_only("hget", exec_hget, 3));
    table.register(Command::read_only("hlen", exec_hlen, 2));
    table.register(Command::read_only("hgetall", exec_hgetall, 2));
    table.register(Command::read_only("hexists", exec_hexists, 3));
}

/// Stores the field/value pairs in `args[1..]` and returns how many fields
/// were new.
fn store_fields(db: &mut LockedDb<'_>, args: &[Bytes]) -> Result<usize, RespValue> {
    let key = &args[0];
    let pairs = &args[1..];

    let insert = |hash: &mut HashMap<Bytes, Bytes>| {
        pairs
            .chunks_exact(2)
            .filter(|pair| hash.insert(pair[0].clone(), pair[1].clone()).is_none())
            .count()
    };

    match db.get_entity_mut(key) {
        Some(Entity::Hash(hash)) => Ok(insert(hash)),
        Some(_) => Err(wrong_type()),
        None => {
            let mut hash = HashMap::with_capacity(pairs.len() / 2);
            let added = insert(&mut hash);
            db.put_entity(key.clone(), Entity::Hash(hash));
            Ok(added)
        }
    }
}

fn exec_hset(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    if (args.len() - 1) % 2 != 0 {
        return wrong_arity("hset");
    }
    match store_fields(db, args) {
        Ok(added) => {
            db.add_aof(with_name("HSET", args));
            RespValue::integer(added as i64)
        }
        Err(reply) => reply,
    }
}

fn exec_hmset(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    if (args.len() - 1) % 2 != 0 {
        return wrong_arity("hmset");
    }
    match store_fields(db, args) {
        Ok(_) => {
            db.add_aof(with_name("HMSET", args));
            RespValue::ok()
        }
        Err(reply) => reply,
    }
}

fn exec_hdel(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    let key = &args[0];
    let (removed, now_empty) = match db.get_entity_mut(key) {
        Some(Entity::Hash(hash)) => {
            let removed = args[1..]
                .iter()
                .filter(|field| hash.remove(*field).is_some())
                .count();
            (removed, hash.is_empty())
        }
        Some(_) => return wrong_type(),
        None => return RespValue::integer(0),
    };

    if now_empty {
        db.remove(key);
    }
    if removed > 0 {
        db.add_aof(with_name("HDEL", args));
    }
    RespValue::integer(removed as i64)
}

fn exec_hget(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    match db.get_entity(&args[0]) {
        Some(Entity::Hash(hash)) => match hash.get(&args[1]) {
            Some(value) => RespValue::bulk_string(value.clone()),
            None => RespValue::null(),
        },
        Some(_) => wrong_type(),
        None => RespValue::null(),
    }
}

fn exec_hlen(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    match db.get_entity(&args[0]) {
        Some(Entity::Hash(hash)) => RespValue::integer(hash.len() as i64),
        Some(_) => wrong_type(),
        None => RespValue::integer(0),
    }
}

fn exec_hgetall(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    match db.get_entity(&args[0]) {
        Some(Entity::Hash(hash)) => RespValue::bulk_array(
            hash.iter()
                .flat_map(|(field, value)| [field.clone(), value.clone()])
                .collect::<Vec<_>>(),
        ),
        Some(_) => wrong_type(),
        None => RespValue::array(Vec::new()),
    }
}

fn exec_hexists(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    match db.get_entity(&args[0]) {
        Some(Entity::Hash(hash)) => RespValue::integer(hash.contains_key(&args[1]) as i64),
        Some(_) => wrong_type(),
        None => RespValue::integer(0),
    }
}
