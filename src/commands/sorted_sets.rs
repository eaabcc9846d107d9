//! Sorted set commands.

use super::{
    normalize_range, not_float, not_integer, parse_f64, parse_i64, syntax_error, with_name,
    wrong_arity, wrong_type,
};
use crate::database::transaction::rollback_first_key;
use crate::database::{Command, CommandTable, LockedDb};
use crate::protocol::RespValue;
use crate::storage::{Entity, SortedSet};
use bytes::Bytes;

pub fn register(table: &mut CommandTable) {
    table.register(Command::write("zadd", exec_zadd, -4).undo(rollback_first_key));
    table.register(Command::write("zrem", exec_zrem, -3).undo(rollback_first_key));
    table.register(Command::read_only("zscore", exec_zscore, 3));
    table.register(Command::read_only("zcard", exec_zcard, 2));
    table.register(Command::read_only("zrange", exec_zrange, -4));
    table.register(Command::read_only("zrank", exec_zrank, 3));
}

/// Text form of a score, as replied to clients and written to the log.
pub fn format_score(score: f64) -> String {
    score.to_string()
}

/// ZADD key score member [score member ...]
fn exec_zadd(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    if (args.len() - 1) % 2 != 0 {
        return wrong_arity("zadd");
    }

    // Validate every score before touching the key
    let mut pairs = Vec::with_capacity((args.len() - 1) / 2);
    for pair in args[1..].chunks_exact(2) {
        let Some(score) = parse_f64(&pair[0]) else {
            return not_float();
        };
        pairs.push((score, pair[1].clone()));
    }

    let key = &args[0];
    let insert = |zset: &mut SortedSet| {
        pairs
            .iter()
            .filter(|(score, member)| zset.add(member.clone(), *score))
            .count()
    };

    let added = match db.get_entity_mut(key) {
        Some(Entity::SortedSet(zset)) => insert(zset),
        Some(_) => return wrong_type(),
        None => {
            let mut zset = SortedSet::new();
            let added = insert(&mut zset);
            db.put_entity(key.clone(), Entity::SortedSet(zset));
            added
        }
    };

    db.add_aof(with_name("ZADD", args));
    RespValue::integer(added as i64)
}

fn exec_zrem(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    let key = &args[0];
    let (removed, now_empty) = match db.get_entity_mut(key) {
        Some(Entity::SortedSet(zset)) => {
            let removed = args[1..].iter().filter(|m| zset.remove(m)).count();
            (removed, zset.is_empty())
        }
        Some(_) => return wrong_type(),
        None => return RespValue::integer(0),
    };

    if now_empty {
        db.remove(key);
    }
    if removed > 0 {
        db.add_aof(with_name("ZREM", args));
    }
    RespValue::integer(removed as i64)
}

fn exec_zscore(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    match db.get_entity(&args[0]) {
        Some(Entity::SortedSet(zset)) => match zset.score(&args[1]) {
            Some(score) => RespValue::bulk_string(format_score(score)),
            None => RespValue::null(),
        },
        Some(_) => wrong_type(),
        None => RespValue::null(),
    }
}

fn exec_zcard(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    match db.get_entity(&args[0]) {
        Some(Entity::SortedSet(zset)) => RespValue::integer(zset.len() as i64),
        Some(_) => wrong_type(),
        None => RespValue::integer(0),
    }
}

/// ZRANGE key start stop [WITHSCORES]
fn exec_zrange(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    let with_scores = match args.get(3) {
        None => false,
        Some(opt) if opt.eq_ignore_ascii_case(b"WITHSCORES") && args.len() == 4 => true,
        Some(_) => return syntax_error(),
    };
    let (Some(start), Some(stop)) = (parse_i64(&args[1]), parse_i64(&args[2])) else {
        return not_integer();
    };

    let zset = match db.get_entity(&args[0]) {
        Some(Entity::SortedSet(zset)) => zset,
        Some(_) => return wrong_type(),
        None => return RespValue::array(Vec::new()),
    };
    let Some((from, to)) = normalize_range(start, stop, zset.len()) else {
        return RespValue::array(Vec::new());
    };

    let mut reply = Vec::with_capacity((to - from + 1) * if with_scores { 2 } else { 1 });
    for (member, score) in zset.iter().skip(from).take(to - from + 1) {
        reply.push(RespValue::bulk_string(member.clone()));
        if with_scores {
            reply.push(RespValue::bulk_string(format_score(score)));
        }
    }
    RespValue::array(reply)
}

fn exec_zrank(db: &mut LockedDb<'_>, args: &[Bytes]) -> RespValue {
    match db.get_entity(&args[0]) {
        Some(Entity::SortedSet(zset)) => match zset.rank(&args[1]) {
            Some(rank) => RespValue::integer(rank as i64),
            None => RespValue::null(),
        },
        Some(_) => wrong_type(),
        None => RespValue::null(),
    }
}
