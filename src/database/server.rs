//! Multi-Database Server
//!
//! Routes command lines to the selected [`Db`], handles the few commands
//! that span databases (SELECT, FLUSHALL, the rewrite triggers), and owns
//! the shared delay scheduler and the optional [`Persister`].
//!
//! ```text
//!            conn.db_index()
//!                 │
//!   exec ──► Server ──► dbs[0]  dbs[1]  ...  dbs[n-1]
//!               │         │       │
//!               │         └───────┴──► aof hook ──► Persister::save_cmd_line(db, line)
//!               └──► DelayScheduler (one wheel for every database)
//! ```

use crate::aof::{Persister, TmpDbMaker};
use crate::connection::Connection;
use crate::database::db::{Db, LockedDb};
use crate::database::registry::{command_name, CommandTable};
use crate::protocol::{CmdLine, RespValue};
use crate::storage::{DelayScheduler, Entity, TimeWheelConfig};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{error, info};

/// Visitor over `(key, entity, deadline)`; return `false` to stop.
pub type EntityVisitor<'a> = &'a mut dyn FnMut(&Bytes, &Entity, Option<SystemTime>) -> bool;

/// The storage engine as seen by connections and the persister.
pub trait DbEngine: Send + Sync {
    /// Executes one command line for `conn`.
    fn exec(&self, conn: &mut dyn Connection, cmd_line: &[Bytes]) -> RespValue;

    /// Locks `write_keys`/`read_keys` in database `db_index`.
    ///
    /// # Panics
    ///
    /// Panics if `db_index` is out of range.
    fn rw_locks<'a>(&'a self, db_index: usize, write_keys: &[Bytes], read_keys: &[Bytes]) -> LockedDb<'a>;

    /// Executes a command inside a region from [`DbEngine::rw_locks`].
    fn exec_with_lock(&self, locked: &mut LockedDb<'_>, cmd_line: &[Bytes]) -> RespValue;

    /// Runs queued commands in the connection's database as one transaction.
    fn exec_multi(
        &self,
        conn: &mut dyn Connection,
        watching: &HashMap<Bytes, u32>,
        cmd_lines: &[CmdLine],
    ) -> RespValue;

    /// Undo lines for `cmd_line` against the current state of `db_index`.
    fn get_undo_logs(&self, db_index: usize, cmd_line: &[Bytes]) -> Vec<CmdLine>;

    /// Visits every live key of database `db_index`.
    fn for_each(&self, db_index: usize, visitor: EntityVisitor<'_>);

    /// `(key count, keys with a deadline)` of database `db_index`.
    fn get_db_size(&self, db_index: usize) -> (usize, usize);

    fn db_count(&self) -> usize;

    /// Stops background work. The engine stays readable.
    fn close(&self);
}

/// Settings for a [`Server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Number of databases (default: 16)
    pub databases: usize,

    /// Delay scheduler used for active expiration
    pub timewheel: TimeWheelConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            databases: 16,
            timewheel: TimeWheelConfig::default(),
        }
    }
}

/// The multi-database engine.
pub struct Server {
    dbs: Vec<Arc<Db>>,
    scheduler: Arc<DelayScheduler>,
    persister: RwLock<Option<Arc<Persister>>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("dbs", &self.dbs)
            .field("aof", &self.persister.read().unwrap().is_some())
            .finish()
    }
}

impl Server {
    /// Creates the databases and starts the delay scheduler.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(CommandTable::with_default_commands());
        let scheduler = Arc::new(DelayScheduler::start(config.timewheel.clone()));
        let dbs = (0..config.databases.max(1))
            .map(|index| Db::new(index, Arc::clone(&registry), Arc::clone(&scheduler)))
            .collect();

        Self {
            dbs,
            scheduler,
            persister: RwLock::new(None),
        }
    }

    /// Factory for the throwaway engines a rewrite replays into.
    ///
    /// Captures the current Tokio runtime so the factory can run on any
    /// thread. Must be called from within a Tokio runtime.
    pub fn tmp_db_maker(config: ServerConfig) -> TmpDbMaker {
        let handle = Handle::current();
        Arc::new(move || {
            let _guard = handle.enter();
            let engine: Arc<dyn DbEngine> = Arc::new(Server::new(config.clone()));
            engine
        })
    }

    /// The database at `index`, if it exists.
    pub fn db(&self, index: usize) -> Option<&Arc<Db>> {
        self.dbs.get(index)
    }

    /// Routes every database's writes to `persister`.
    ///
    /// Call after the log has been replayed, so replay does not re-append.
    pub fn bind_persister(&self, persister: Arc<Persister>) {
        for db in &self.dbs {
            let sink = Arc::clone(&persister);
            let index = db.index();
            db.set_aof_hook(Some(Arc::new(move |line| sink.save_cmd_line(index, line))));
        }
        *self.persister.write().unwrap() = Some(persister);
    }

    pub fn persister(&self) -> Option<Arc<Persister>> {
        self.persister.read().unwrap().clone()
    }

    fn select(&self, conn: &mut dyn Connection, cmd_line: &[Bytes]) -> RespValue {
        if cmd_line.len() != 2 {
            return crate::commands::wrong_arity("select");
        }
        if conn.in_multi_state() {
            return RespValue::error("ERR SELECT is not allowed in MULTI");
        }
        let index = std::str::from_utf8(&cmd_line[1])
            .ok()
            .and_then(|s| s.parse::<i64>().ok());
        match index {
            None => crate::commands::not_integer(),
            Some(index) if index < 0 || index as usize >= self.dbs.len() => {
                RespValue::error("ERR DB index is out of range")
            }
            Some(index) => {
                conn.select_db(index as usize);
                RespValue::ok()
            }
        }
    }

    fn flush_all(&self, cmd_line: &[Bytes]) -> RespValue {
        if cmd_line.len() != 1 {
            return crate::commands::wrong_arity("flushall");
        }
        // Each database logs its own FLUSHDB under its own all-shard region.
        for db in &self.dbs {
            db.flush();
        }
        RespValue::ok()
    }

    /// Whether a key watched in a database other than the selected one has
    /// moved. The selected database checks its own keys inside the EXEC
    /// region.
    fn watched_elsewhere_changed(&self, conn: &mut dyn Connection) -> bool {
        let current = conn.db_index();
        conn.watching().iter().any(|((index, key), version)| {
            *index != current
                && self
                    .dbs
                    .get(*index)
                    .is_some_and(|db| db.get_version(key) != *version)
        })
    }

    fn rewrite_aof(&self, background: bool) -> RespValue {
        let Some(persister) = self.persister() else {
            return RespValue::error("ERR append only file is not enabled");
        };

        if !background {
            return match off_runtime(|| persister.rewrite()) {
                Ok(()) => RespValue::ok(),
                Err(e) => RespValue::error(format!("ERR {}", e)),
            };
        }

        let spawned = std::thread::Builder::new()
            .name("aof-rewrite".to_string())
            .spawn(move || {
                if let Err(e) = persister.rewrite() {
                    error!(error = %e, "Background AOF rewrite failed");
                }
            });
        match spawned {
            Ok(_) => RespValue::simple_string("Background append only file rewriting started"),
            Err(e) => RespValue::error(format!("ERR {}", e)),
        }
    }
}

/// Runs blocking work from a command handler. On a multi-threaded runtime
/// the worker hands its other tasks off first.
fn off_runtime<R>(op: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(op)
        }
        _ => op(),
    }
}

impl DbEngine for Server {
    fn exec(&self, conn: &mut dyn Connection, cmd_line: &[Bytes]) -> RespValue {
        let Some(first) = cmd_line.first() else {
            return RespValue::error("ERR empty command");
        };

        let name = command_name(first);
        if conn.in_multi_state() && matches!(name.as_str(), "flushall" | "bgrewriteaof" | "rewriteaof") {
            let message = format!("ERR {} is not allowed in MULTI", name.to_ascii_uppercase());
            conn.add_tx_error(message.clone());
            return RespValue::Error(message);
        }

        if name == "exec"
            && conn.in_multi_state()
            && conn.tx_errors().is_empty()
            && self.watched_elsewhere_changed(conn)
        {
            conn.set_multi_state(false);
            return RespValue::null();
        }

        match name.as_str() {
            "select" => self.select(conn, cmd_line),
            "flushall" => self.flush_all(cmd_line),
            "bgrewriteaof" => self.rewrite_aof(true),
            "rewriteaof" => self.rewrite_aof(false),
            _ => match self.dbs.get(conn.db_index()) {
                Some(db) => db.exec(conn, cmd_line),
                None => RespValue::error("ERR DB index is out of range"),
            },
        }
    }

    fn rw_locks<'a>(&'a self, db_index: usize, write_keys: &[Bytes], read_keys: &[Bytes]) -> LockedDb<'a> {
        self.dbs[db_index].rw_locks(write_keys, read_keys)
    }

    fn exec_with_lock(&self, locked: &mut LockedDb<'_>, cmd_line: &[Bytes]) -> RespValue {
        let db = locked.db();
        db.exec_with_lock(locked, cmd_line)
    }

    fn exec_multi(
        &self,
        conn: &mut dyn Connection,
        watching: &HashMap<Bytes, u32>,
        cmd_lines: &[CmdLine],
    ) -> RespValue {
        match self.dbs.get(conn.db_index()) {
            Some(db) => db.exec_multi(watching, cmd_lines),
            None => RespValue::error("ERR DB index is out of range"),
        }
    }

    fn get_undo_logs(&self, db_index: usize, cmd_line: &[Bytes]) -> Vec<CmdLine> {
        let Some(db) = self.dbs.get(db_index) else {
            return Vec::new();
        };
        let Ok(cmd) = db.lookup(cmd_line) else {
            return Vec::new();
        };
        let (write_keys, read_keys) = cmd.lock_keys(&cmd_line[1..]);
        let locked = db.rw_locks(&write_keys, &read_keys);
        db.get_undo_logs(&locked, cmd_line)
    }

    fn for_each(&self, db_index: usize, visitor: EntityVisitor<'_>) {
        if let Some(db) = self.dbs.get(db_index) {
            db.for_each(visitor);
        }
    }

    fn get_db_size(&self, db_index: usize) -> (usize, usize) {
        self.dbs.get(db_index).map(|db| db.size()).unwrap_or((0, 0))
    }

    fn db_count(&self) -> usize {
        self.dbs.len()
    }

    fn close(&self) {
        self.scheduler.stop();
        if let Some(persister) = self.persister.write().unwrap().take() {
            for db in &self.dbs {
                db.set_aof_hook(None);
            }
            persister.close();
            info!("Engine closed");
        }
    }
}
