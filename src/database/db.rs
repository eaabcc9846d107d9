//! Keyspace
//!
//! One logical database. Three sharded maps share the same keys:
//!
//! ```text
//! ┌──────────────────────── Db ────────────────────────┐
//! │  data      ShardedMap<Entity>      the values      │
//! │  ttl       ShardedMap<SystemTime>  deadlines       │
//! │  versions  ShardedMap<u32>         WATCH counters  │
//! └────────────────────────────────────────────────────┘
//!          │ expire(key, at)
//!          ▼
//!   DelayScheduler  "expire:<db>:<key>"  ──►  lock key, re-check, remove, log DEL
//! ```
//!
//! Commands run inside a [`LockedDb`], the lock region over the `data`
//! shards their keys hash to. Only `data` shards form the region. The `ttl`
//! and `versions` maps lock themselves per call and are never held while a
//! `data` shard is being acquired, so they cannot close a lock cycle.
//!
//! Expiration is enforced twice. Passively, every read checks the deadline
//! and treats an expired key as absent. Actively, the scheduler job deletes
//! the key even if nobody reads it again.

use crate::commands::{unknown_command, wrong_arity};
use crate::connection::Connection;
use crate::database::registry::{command_name, Command, CommandTable};
use crate::database::transaction;
use crate::protocol::{CmdLine, RespValue};
use crate::storage::{DelayScheduler, Entity, PutOutcome, ShardLocks, ShardedMap};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};
use std::time::SystemTime;
use tracing::{debug, trace};

/// Shards backing the value and version maps.
pub const DATA_SHARD_COUNT: usize = 1 << 10;

/// Shards backing the deadline map.
pub const TTL_SHARD_COUNT: usize = 1 << 8;

/// Receives every command line that must reach the append-only log.
pub type AofHook = Arc<dyn Fn(CmdLine) + Send + Sync>;

/// A single numbered database.
pub struct Db {
    index: usize,
    data: ShardedMap<Entity>,
    ttl: ShardedMap<SystemTime>,
    versions: ShardedMap<u32>,
    registry: Arc<CommandTable>,
    scheduler: Arc<DelayScheduler>,
    aof_hook: RwLock<Option<AofHook>>,
    this: Weak<Db>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("index", &self.index)
            .field("keys", &self.data.len())
            .field("volatile", &self.ttl.len())
            .finish()
    }
}

impl Db {
    /// Creates database number `index`. Expiration jobs go to `scheduler`.
    pub fn new(
        index: usize,
        registry: Arc<CommandTable>,
        scheduler: Arc<DelayScheduler>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            index,
            data: ShardedMap::new(DATA_SHARD_COUNT),
            ttl: ShardedMap::new(TTL_SHARD_COUNT),
            versions: ShardedMap::new(DATA_SHARD_COUNT),
            registry,
            scheduler,
            aof_hook: RwLock::new(None),
            this: this.clone(),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Installs (or removes) the durability hook.
    pub fn set_aof_hook(&self, hook: Option<AofHook>) {
        *self.aof_hook.write().unwrap() = hook;
    }

    fn add_aof(&self, cmd_line: CmdLine) {
        let hook = self.aof_hook.read().unwrap().clone();
        if let Some(hook) = hook {
            hook(cmd_line);
        }
    }

    // ========================================================================
    // Command execution
    // ========================================================================

    /// Executes one client command line.
    ///
    /// MULTI, EXEC, DISCARD, WATCH and UNWATCH drive the connection's
    /// transaction state. While the connection is inside MULTI every other
    /// command is validated and queued instead of run.
    pub fn exec(&self, conn: &mut dyn Connection, cmd_line: &[Bytes]) -> RespValue {
        let Some(first) = cmd_line.first() else {
            return RespValue::error("ERR empty command");
        };

        match command_name(first).as_str() {
            "multi" => transaction::start_multi(conn, cmd_line),
            "discard" => transaction::discard(conn, cmd_line),
            "exec" => transaction::exec_queued(self, conn, cmd_line),
            "watch" => transaction::watch(self, conn, cmd_line),
            "unwatch" => transaction::unwatch(conn, cmd_line),
            _ if conn.in_multi_state() => transaction::enqueue(self, conn, cmd_line),
            _ => self.exec_normal(cmd_line),
        }
    }

    /// Looks up and validates a command line, returning the descriptor.
    pub(crate) fn lookup(&self, cmd_line: &[Bytes]) -> Result<&Command, RespValue> {
        let Some(first) = cmd_line.first() else {
            return Err(RespValue::error("ERR empty command"));
        };
        let name = command_name(first);
        let cmd = self
            .registry
            .get(&name)
            .ok_or_else(|| unknown_command(&name))?;
        if !cmd.validate_arity(cmd_line.len()) {
            return Err(wrong_arity(&name));
        }
        Ok(cmd)
    }

    fn exec_normal(&self, cmd_line: &[Bytes]) -> RespValue {
        let cmd = match self.lookup(cmd_line) {
            Ok(cmd) => cmd,
            Err(reply) => return reply,
        };

        let args = &cmd_line[1..];
        let (write_keys, read_keys) = cmd.lock_keys(args);
        for key in write_keys.iter().chain(&read_keys) {
            self.expire_if_needed(key);
        }

        let mut locked = self.rw_locks(&write_keys, &read_keys);
        run_command(&mut locked, cmd, args, &write_keys)
    }

    /// Executes a command inside a region the caller already holds.
    ///
    /// Used by transactions. Every key the command touches must be covered
    /// by `locked`.
    pub fn exec_with_lock(&self, locked: &mut LockedDb<'_>, cmd_line: &[Bytes]) -> RespValue {
        let cmd = match self.lookup(cmd_line) {
            Ok(cmd) => cmd,
            Err(reply) => return reply,
        };

        let args = &cmd_line[1..];
        let (write_keys, _) = cmd.lock_keys(args);
        run_command(locked, cmd, args, &write_keys)
    }

    /// Runs queued commands atomically with rollback. See [`transaction`].
    pub fn exec_multi(&self, watching: &HashMap<Bytes, u32>, cmd_lines: &[CmdLine]) -> RespValue {
        transaction::exec_multi(self, watching, cmd_lines)
    }

    /// Command lines that would undo `cmd_line` given the current state.
    pub fn get_undo_logs(&self, locked: &LockedDb<'_>, cmd_line: &[Bytes]) -> Vec<CmdLine> {
        match self.lookup(cmd_line) {
            Ok(Command {
                undo: Some(undo), ..
            }) => undo(locked, &cmd_line[1..]),
            _ => Vec::new(),
        }
    }

    /// Locks the shards for a multi-key operation; released on drop.
    pub fn rw_locks<K: AsRef<[u8]>>(&self, write_keys: &[K], read_keys: &[K]) -> LockedDb<'_> {
        LockedDb {
            db: self,
            shards: self.data.rw_locks(write_keys, read_keys),
            changed: HashSet::new(),
            logged: false,
        }
    }

    fn lock_key(&self, key: &[u8]) -> LockedDb<'_> {
        self.rw_locks(&[key], &[])
    }

    // ========================================================================
    // Auto-locking keyspace operations
    // ========================================================================

    /// Reads `key`, deleting it first if its deadline has passed.
    pub fn get_entity(&self, key: &[u8]) -> Option<Entity> {
        let mut locked = self.lock_key(key);
        locked.get_entity(key).cloned()
    }

    /// Runs `op` in a write region over `keys`. Every key it changed gets
    /// its version bumped before the region is released.
    fn write_region<K, R>(&self, keys: &[K], op: impl FnOnce(&mut LockedDb<'_>) -> R) -> R
    where
        K: AsRef<[u8]>,
    {
        let mut locked = self.rw_locks(keys, &[]);
        let result = op(&mut locked);
        let changed: Vec<Bytes> = locked.changed.drain().collect();
        self.add_version(&changed);
        result
    }

    pub fn put_entity(&self, key: Bytes, entity: Entity) -> PutOutcome {
        self.write_region(&[key.clone()], |locked| locked.put_entity(key, entity))
    }

    pub fn put_if_absent(&self, key: Bytes, entity: Entity) -> bool {
        self.write_region(&[key.clone()], |locked| locked.put_if_absent(key, entity))
    }

    pub fn put_if_exists(&self, key: &[u8], entity: Entity) -> bool {
        self.write_region(&[key], |locked| locked.put_if_exists(key, entity))
    }

    /// Deletes `key` along with its deadline and pending expiration job.
    pub fn remove(&self, key: &[u8]) -> bool {
        self.write_region(&[key], |locked| locked.remove(key))
    }

    /// Deletes every key in `keys`, returning how many existed.
    pub fn removes(&self, keys: &[Bytes]) -> usize {
        self.write_region(keys, |locked| locked.removes(keys))
    }

    /// Sets the deadline of `key` and schedules its expiration job.
    pub fn expire(&self, key: &Bytes, at: SystemTime) {
        self.ttl.put(key.clone(), at);
        self.schedule_expiration(key, at);
    }

    /// Clears the deadline of `key`. Returns `true` if it had one.
    pub fn persist(&self, key: &[u8]) -> bool {
        if self.ttl.remove(key).is_some() {
            self.scheduler.cancel(self.expire_task_key(key));
            true
        } else {
            false
        }
    }

    /// The deadline of `key`, if it has one.
    pub fn ttl(&self, key: &[u8]) -> Option<SystemTime> {
        self.ttl.get(key)
    }

    pub fn is_expired(&self, key: &[u8]) -> bool {
        matches!(self.ttl.get(key), Some(at) if SystemTime::now() >= at)
    }

    /// Version counter of `key`; 0 if never written (or deleted by expiry).
    pub fn get_version(&self, key: &[u8]) -> u32 {
        self.versions.get(key).unwrap_or(0)
    }

    /// Increments the version of every key in `keys`.
    ///
    /// Callers hold the write lock on each key's data shard.
    pub(crate) fn add_version(&self, keys: &[Bytes]) {
        for key in keys {
            let next = self.get_version(key).wrapping_add(1);
            self.versions.put(key.clone(), next);
        }
    }

    /// Visits every live key with its entity and deadline.
    pub fn for_each(&self, visitor: &mut dyn FnMut(&Bytes, &Entity, Option<SystemTime>) -> bool) {
        let now = SystemTime::now();
        self.data.for_each(|key, entity| {
            let deadline = self.ttl.get(key);
            match deadline {
                Some(at) if now >= at => true,
                _ => visitor(key, entity, deadline),
            }
        });
    }

    /// Every live key. Used by KEYS.
    pub fn keys(&self) -> Vec<Bytes> {
        let mut keys = Vec::with_capacity(self.data.len());
        self.for_each(&mut |key, _, _| {
            keys.push(key.clone());
            true
        });
        keys
    }

    /// Removes every key, cancels pending expiration jobs and logs
    /// `FLUSHDB`.
    ///
    /// Runs inside a region over every data shard, so a concurrent write
    /// lands entirely before the flush (memory and log) or entirely after.
    /// Flushing an empty database logs nothing.
    pub fn flush(&self) {
        let mut all = self.data.lock_all();
        let keys = all.keys();
        let removed = all.clear();
        for key in self.ttl.keys() {
            self.scheduler.cancel(self.expire_task_key(&key));
        }
        self.ttl.clear();
        self.add_version(&keys);
        if removed > 0 {
            self.add_aof(vec![Bytes::from_static(b"FLUSHDB")]);
        }
        drop(all);
        debug!(db = self.index, keys = removed, "Database flushed");
    }

    /// `(key count, keys with a deadline)`.
    pub fn size(&self) -> (usize, usize) {
        (self.data.len(), self.ttl.len())
    }

    // ========================================================================
    // Expiration
    // ========================================================================

    fn expire_task_key(&self, key: &[u8]) -> String {
        format!("expire:{}:{}", self.index, key.escape_ascii())
    }

    /// Lazily deletes `key` under its own write lock if its deadline passed.
    pub(crate) fn expire_if_needed(&self, key: &[u8]) {
        if self.is_expired(key) {
            let mut locked = self.lock_key(key);
            locked.expire_if_needed(key);
        }
    }

    fn schedule_expiration(&self, key: &Bytes, at: SystemTime) {
        let this = self.this.clone();
        let job_key = key.clone();
        self.scheduler
            .schedule_at(at, self.expire_task_key(key), move || {
                if let Some(db) = this.upgrade() {
                    db.run_expire_job(&job_key);
                }
            });
    }

    fn run_expire_job(&self, key: &Bytes) {
        let mut locked = self.lock_key(key);
        match self.ttl.get(key) {
            // Persisted or removed since the job was queued.
            None => {}
            Some(at) if SystemTime::now() >= at => {
                if locked.remove_expired(key) {
                    trace!(db = self.index, key = %key.escape_ascii(), "Key expired");
                }
            }
            Some(at) => self.schedule_expiration(key, at),
        }
    }
}

/// Runs one executor. A write command bumps the versions of the keys it
/// actually changed, and only if it logged something: a write that leaves
/// the keyspace as it was (`SET .. NX` on an existing key, `DEL` of a
/// missing key) does not disturb WATCH.
fn run_command(
    locked: &mut LockedDb<'_>,
    cmd: &Command,
    args: &[Bytes],
    write_keys: &[Bytes],
) -> RespValue {
    locked.changed.clear();
    locked.logged = false;

    let reply = (cmd.executor)(locked, args);
    if cmd.is_write() && locked.logged {
        let changed: Vec<Bytes> = write_keys
            .iter()
            .filter(|key| locked.changed.contains(*key))
            .cloned()
            .collect();
        locked.db.add_version(&changed);
    }
    reply
}

/// A held lock region over one database's data shards.
///
/// All keyspace access from command executors goes through here. Reads of
/// an expired key report it as absent; if the region holds the key's shard
/// for writing, the key is deleted on the spot.
#[derive(Debug)]
pub struct LockedDb<'a> {
    db: &'a Db,
    shards: ShardLocks<'a, Entity>,
    /// Keys written, removed or handed out mutably in this region.
    changed: HashSet<Bytes>,
    /// Whether anything went to the append-only log.
    logged: bool,
}

impl<'a> LockedDb<'a> {
    pub fn db(&self) -> &'a Db {
        self.db
    }

    /// Returns `true` if `key` is expired, deleting it when write-locked.
    fn expire_if_needed(&mut self, key: &[u8]) -> bool {
        if !self.db.is_expired(key) {
            return false;
        }
        if self.shards.is_write_locked(key) {
            self.remove_expired(key);
        }
        true
    }

    /// Deletes an expired key, dropping its version and logging a DEL.
    ///
    /// Not counted as a change by the command that tripped over it.
    fn remove_expired(&mut self, key: &[u8]) -> bool {
        let existed = self.shards.remove(key).is_some();
        self.db.persist(key);
        self.db.versions.remove(key);
        if existed {
            self.db
                .add_aof(vec![Bytes::from_static(b"DEL"), Bytes::copy_from_slice(key)]);
        }
        existed
    }

    fn mark_changed(&mut self, key: &[u8]) {
        if !self.changed.contains(key) {
            self.changed.insert(Bytes::copy_from_slice(key));
        }
    }

    pub fn get_entity(&mut self, key: &[u8]) -> Option<&Entity> {
        if self.expire_if_needed(key) {
            return None;
        }
        self.shards.get(key)
    }

    /// Read without side effects; expired keys report absent.
    pub fn peek_entity(&self, key: &[u8]) -> Option<&Entity> {
        if self.db.is_expired(key) {
            return None;
        }
        self.shards.get(key)
    }

    pub fn get_entity_mut(&mut self, key: &[u8]) -> Option<&mut Entity> {
        if self.expire_if_needed(key) {
            return None;
        }
        if self.shards.contains_key(key) {
            self.mark_changed(key);
        }
        self.shards.get_mut(key)
    }

    pub fn contains(&mut self, key: &[u8]) -> bool {
        self.get_entity(key).is_some()
    }

    pub fn put_entity(&mut self, key: Bytes, entity: Entity) -> PutOutcome {
        self.mark_changed(&key);
        self.shards.put(key, entity)
    }

    pub fn put_if_absent(&mut self, key: Bytes, entity: Entity) -> bool {
        self.expire_if_needed(&key);
        let inserted = self.shards.put_if_absent(key.clone(), entity);
        if inserted {
            self.mark_changed(&key);
        }
        inserted
    }

    pub fn put_if_exists(&mut self, key: &[u8], entity: Entity) -> bool {
        if self.expire_if_needed(key) {
            return false;
        }
        let stored = self.shards.put_if_exists(key, entity);
        if stored {
            self.mark_changed(key);
        }
        stored
    }

    /// Deletes `key`, its deadline and its pending job. The version counter
    /// is kept so a concurrent WATCH still sees the change.
    pub fn remove(&mut self, key: &[u8]) -> bool {
        let existed = self.shards.remove(key).is_some();
        self.db.persist(key);
        if existed {
            self.mark_changed(key);
        }
        existed
    }

    pub fn removes(&mut self, keys: &[Bytes]) -> usize {
        let mut deleted = 0;
        for key in keys {
            let live = !self.expire_if_needed(key);
            if self.remove(key) && live {
                deleted += 1;
            }
        }
        deleted
    }

    pub fn expire(&mut self, key: &Bytes, at: SystemTime) {
        self.mark_changed(key);
        self.db.expire(key, at);
    }

    pub fn persist(&mut self, key: &[u8]) -> bool {
        let cleared = self.db.persist(key);
        if cleared {
            self.mark_changed(key);
        }
        cleared
    }

    pub fn ttl(&self, key: &[u8]) -> Option<SystemTime> {
        self.db.ttl(key)
    }

    /// Forwards a command line to the append-only log, if one is attached.
    pub fn add_aof(&mut self, cmd_line: CmdLine) {
        self.logged = true;
        self.db.add_aof(cmd_line);
    }
}
