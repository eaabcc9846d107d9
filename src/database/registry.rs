//! Command Table
//!
//! Maps a lowercase command name to everything the keyspace needs to run it:
//!
//! ```text
//!   Command
//!   ├── executor   fn(&mut LockedDb, args) -> RespValue   runs inside the lock region
//!   ├── prepare    fn(args) -> (write_keys, read_keys)     which shards to lock
//!   ├── undo       fn(&LockedDb, args) -> Vec<CmdLine>     inverse, for EXEC rollback
//!   ├── arity      n >= 0: exactly n words, n < 0: at least -n words
//!   ├── flags      write or read-only
//!   ├── key_spec   where keys sit in the argument list
//!   └── keyspace   touches every key (KEYS, FLUSHDB); refused inside MULTI
//! ```
//!
//! Arity counts the command name itself, so `GET key` has arity 2 and
//! `DEL key [key ...]` has arity -2. `args` handed to executors, prepare and
//! undo functions exclude the name.

use crate::database::db::LockedDb;
use crate::protocol::{CmdLine, RespValue};
use bytes::Bytes;
use std::collections::HashMap;

/// Runs a command inside an already held lock region.
pub type ExecFn = fn(&mut LockedDb<'_>, &[Bytes]) -> RespValue;

/// Computes `(write_keys, read_keys)` from the arguments.
pub type PrepareFn = fn(&[Bytes]) -> (Vec<Bytes>, Vec<Bytes>);

/// Produces the command lines that restore the touched keys.
pub type UndoFn = fn(&LockedDb<'_>, &[Bytes]) -> Vec<CmdLine>;

/// Whether a command mutates the keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandFlags {
    Write,
    ReadOnly,
}

/// Positions of keys within `args`: `first`, then every `step`, up to
/// `last` (negative counts from the end, `-1` is the last argument).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySpec {
    pub first: usize,
    pub last: isize,
    pub step: usize,
}

impl KeySpec {
    /// No keys (PING, KEYS, DBSIZE, ...).
    pub const NONE: KeySpec = KeySpec {
        first: 0,
        last: -1,
        step: 0,
    };

    /// Only the first argument.
    pub const FIRST: KeySpec = KeySpec {
        first: 0,
        last: 0,
        step: 1,
    };

    /// Every argument.
    pub const ALL: KeySpec = KeySpec {
        first: 0,
        last: -1,
        step: 1,
    };

    /// Keys at even positions of key/value pairs (MSET).
    pub const PAIRS: KeySpec = KeySpec {
        first: 0,
        last: -1,
        step: 2,
    };

    pub fn keys(&self, args: &[Bytes]) -> Vec<Bytes> {
        if self.step == 0 || args.is_empty() {
            return Vec::new();
        }

        let last = if self.last < 0 {
            args.len() as isize + self.last
        } else {
            self.last.min(args.len() as isize - 1)
        };
        if last < self.first as isize {
            return Vec::new();
        }

        (self.first..=last as usize)
            .step_by(self.step)
            .map(|i| args[i].clone())
            .collect()
    }
}

/// One registered command.
#[derive(Clone)]
pub struct Command {
    pub name: &'static str,
    pub executor: ExecFn,
    pub prepare: Option<PrepareFn>,
    pub undo: Option<UndoFn>,
    pub arity: i32,
    pub flags: CommandFlags,
    pub key_spec: KeySpec,
    pub keyspace_wide: bool,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("flags", &self.flags)
            .field("key_spec", &self.key_spec)
            .field("undo", &self.undo.is_some())
            .field("keyspace_wide", &self.keyspace_wide)
            .finish()
    }
}

impl Command {
    pub fn write(name: &'static str, executor: ExecFn, arity: i32) -> Self {
        Self {
            name,
            executor,
            prepare: None,
            undo: None,
            arity,
            flags: CommandFlags::Write,
            key_spec: KeySpec::FIRST,
            keyspace_wide: false,
        }
    }

    pub fn read_only(name: &'static str, executor: ExecFn, arity: i32) -> Self {
        Self {
            flags: CommandFlags::ReadOnly,
            ..Self::write(name, executor, arity)
        }
    }

    pub fn keys(mut self, key_spec: KeySpec) -> Self {
        self.key_spec = key_spec;
        self
    }

    pub fn prepare(mut self, prepare: PrepareFn) -> Self {
        self.prepare = Some(prepare);
        self
    }

    pub fn undo(mut self, undo: UndoFn) -> Self {
        self.undo = Some(undo);
        self
    }

    /// Marks a command that walks the whole keyspace instead of a key set.
    pub fn keyspace_wide(mut self) -> Self {
        self.key_spec = KeySpec::NONE;
        self.keyspace_wide = true;
        self
    }

    pub fn is_write(&self) -> bool {
        self.flags == CommandFlags::Write
    }

    /// `word_count` includes the command name.
    pub fn validate_arity(&self, word_count: usize) -> bool {
        validate_arity(self.arity, word_count)
    }

    /// Keys to lock for `args`, as `(write_keys, read_keys)`.
    pub fn lock_keys(&self, args: &[Bytes]) -> (Vec<Bytes>, Vec<Bytes>) {
        if let Some(prepare) = self.prepare {
            return prepare(args);
        }
        let keys = self.key_spec.keys(args);
        match self.flags {
            CommandFlags::Write => (keys, Vec::new()),
            CommandFlags::ReadOnly => (Vec::new(), keys),
        }
    }
}

/// Normalizes a raw command name for table lookup.
pub fn command_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).to_ascii_lowercase()
}

/// `arity >= 0` demands exactly that many words, `arity < 0` at least `-arity`.
pub fn validate_arity(arity: i32, word_count: usize) -> bool {
    if arity >= 0 {
        word_count == arity as usize
    } else {
        word_count >= arity.unsigned_abs() as usize
    }
}

/// Registered commands, keyed by lowercase name.
#[derive(Debug, Default)]
pub struct CommandTable {
    commands: HashMap<&'static str, Command>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table holding every keyspace command this crate implements.
    pub fn with_default_commands() -> Self {
        let mut table = Self::new();
        crate::commands::register_all(&mut table);
        table
    }

    pub fn register(&mut self, command: Command) {
        self.commands.insert(command.name, command);
    }

    /// Looks up a command; `name` must already be lowercase.
    pub fn get(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
