//! Entity → command line conversion.
//!
//! Produces the single command that rebuilds a stored value from nothing,
//! used by the log rewrite and by transaction undo logs.
//!
//! | Entity      | Command                          |
//! |-------------|----------------------------------|
//! | string      | `SET key value`                  |
//! | list        | `RPUSH key v1 v2 ...`            |
//! | hash        | `HMSET key f1 v1 f2 v2 ...`      |
//! | set         | `SADD key m1 m2 ...`             |
//! | sorted set  | `ZADD key s1 m1 s2 m2 ...`       |

use crate::commands::sorted_sets::format_score;
use crate::commands::unix_millis;
use crate::protocol::CmdLine;
use crate::storage::Entity;
use bytes::Bytes;
use std::time::SystemTime;

fn line_with_capacity(name: &'static [u8], key: &Bytes, extra: usize) -> CmdLine {
    let mut line = Vec::with_capacity(2 + extra);
    line.push(Bytes::from_static(name));
    line.push(key.clone());
    line
}

pub fn entity_to_cmd(key: &Bytes, entity: &Entity) -> CmdLine {
    match entity {
        Entity::String(value) => vec![Bytes::from_static(b"SET"), key.clone(), value.clone()],
        Entity::List(list) => {
            let mut line = line_with_capacity(b"RPUSH", key, list.len());
            line.extend(list.iter().cloned());
            line
        }
        Entity::Hash(hash) => {
            let mut line = line_with_capacity(b"HMSET", key, hash.len() * 2);
            for (field, value) in hash {
                line.push(field.clone());
                line.push(value.clone());
            }
            line
        }
        Entity::Set(set) => {
            let mut line = line_with_capacity(b"SADD", key, set.len());
            line.extend(set.iter().cloned());
            line
        }
        Entity::SortedSet(zset) => {
            let mut line = line_with_capacity(b"ZADD", key, zset.len() * 2);
            for (member, score) in zset.iter() {
                line.push(Bytes::from(format_score(score)));
                line.push(member.clone());
            }
            line
        }
    }
}

/// `PEXPIREAT key <unix ms>`
pub fn expire_cmd(key: &Bytes, at: SystemTime) -> CmdLine {
    vec![
        Bytes::from_static(b"PEXPIREAT"),
        key.clone(),
        Bytes::from(unix_millis(at).to_string()),
    ]
}

/// `SELECT <index>`
pub fn select_cmd(index: usize) -> CmdLine {
    vec![Bytes::from_static(b"SELECT"), Bytes::from(index.to_string())]
}
