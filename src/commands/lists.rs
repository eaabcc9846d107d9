//! List commands.

use super::{normalize_range, not_integer, parse_i64, with_name, wrong_type};
use crate::database::transaction::rollback_first_key;
use crate::database::{Command, CommandTable, LockedDb};
use crate::protocol::RespValue;
use crate::storage::Entity;
use bytes::Bytes;
use std::collections::VecDeque;

pub fn register(table: &mut CommandTable) {
    table.register(Command::write("lpush", exec_lpush, -3).undo(rollback_first_key));
    table.register(Command::write("rpush", exec_rpush, -3).undo(rollback_first_key));
    table.register(Command::write("lpop", exec_lpop, 2).undo(rollback_first_key));
    table.register(Command::write("rpop", exec_rpop, 2).undo(rollback_first_key));
    table.register(Command::read_only("llen", exec_llen, 2));
    table.register(Command::read_only("lrange", exec_lrange, 4));
    table.register(Command::read_only("lindex", exec_lindex, 3));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum End {
    Front,
    Back,
}

fn exec_lpush(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    push(db, End::Front, args)
}

fn exec_rpush(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    push(db, End::Back, args)
}

/// Pushes `args[1..]` one by one, so `LPUSH k a b` leaves `b` at the head.
fn push(db: &mut LockedDb<'_>, end: End, args: &[Bytes]) -> RespValue {
    let key = &args[0];
    let values = &args[1..];

    let extend = |list: &mut VecDeque<Bytes>| {
        for value in values {
            match end {
                End::Front => list.push_front(value.clone()),
                End::Back => list.push_back(value.clone()),
            }
        }
        list.len()
    };

    let len = match db.get_entity_mut(key) {
        Some(Entity::List(list)) => extend(list),
        Some(_) => return wrong_type(),
        None => {
            let mut list = VecDeque::with_capacity(values.len());
            let len = extend(&mut list);
            db.put_entity(key.clone(), Entity::List(list));
            len
        }
    };

    let name = match end {
        End::Front => "LPUSH",
        End::Back => "RPUSH",
    };
    db.add_aof(with_name(name, args));
    RespValue::integer(len as i64)
}

fn exec_lpop(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    pop(db, End::Front, args)
}

fn exec_rpop(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    pop(db, End::Back, args)
}

/// Pops one element; the key goes away with its last element.
fn pop(db: &mut LockedDb<'_>, end: End, args: &[Bytes]) -> RespValue {
    let key = &args[0];
    let (value, now_empty) = match db.get_entity_mut(key) {
        Some(Entity::List(list)) => {
            let value = match end {
                End::Front => list.pop_front(),
                End::Back => list.pop_back(),
            };
            (value, list.is_empty())
        }
        Some(_) => return wrong_type(),
        None => return RespValue::null(),
    };

    if now_empty {
        db.remove(key);
    }

    match value {
        Some(value) => {
            let name = match end {
                End::Front => "LPOP",
                End::Back => "RPOP",
            };
            db.add_aof(with_name(name, args));
            RespValue::bulk_string(value)
        }
        None => RespValue::null(),
    }
}

fn exec_llen(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    match db.get_entity(&args[0]) {
        Some(Entity::List(list)) => RespValue::integer(list.len() as i64),
        Some(_) => wrong_type(),
        None => RespValue::integer(0),
    }
}

fn exec_lrange(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    let (Some(start), Some(stop)) = (parse_i64(&args[1]), parse_i64(&args[2])) else {
        return not_integer();
    };

    match db.get_entity(&args[0]) {
        Some(Entity::List(list)) => match normalize_range(start, stop, list.len()) {
            Some((from, to)) => {
                RespValue::bulk_array(list.range(from..=to).cloned().collect::<Vec<_>>())
            }
            None => RespValue::array(Vec::new()),
        },
        Some(_) => wrong_type(),
        None => RespValue::array(Vec::new()),
    }
}

fn exec_lindex(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    let Some(index) = parse_i64(&args[1]) else {
        return not_integer();
    };

    match db.get_entity(&args[0]) {
        Some(Entity::List(list)) => {
            let len = list.len() as i64;
            let index = if index < 0 { len + index } else { index };
            if !(0..len).contains(&index) {
                return RespValue::null();
            }
            match list.get(index as usize) {
                Some(value) => RespValue::bulk_string(value.clone()),
                None => RespValue::null(),
            }
        }
        Some(_) => wrong_type(),
        None => RespValue::null(),
    }
}
