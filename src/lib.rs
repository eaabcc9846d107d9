//! # FluxKV - An In-Memory, Redis-Style Key-Value Engine
//!
//! FluxKV keeps several numbered keyspaces in memory, executes Redis-style
//! command lines against them with fine-grained shard locking, expires keys
//! lazily and through a time wheel, and makes every write durable through an
//! append-only log that can be compacted while the server keeps running.
//!
//! ## Features
//!
//! - **Sharded Keyspaces**: power-of-two shards, FNV-1a routing, multi-key
//!   regions locked in ascending shard order
//! - **Typed Values**: strings, lists, hashes, sets and sorted sets
//! - **TTL Support**: lazy expiry on access plus a time-wheel scheduler
//! - **Transactions**: MULTI/EXEC with WATCH versions and undo-log rollback
//! - **Append-Only Log**: `always` / `everysec` / `no` fsync, startup replay,
//!   online rewrite
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               FluxKV                                    │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────────────────────┐  │
//! │  │ TCP Server  │───>│ Connection  │───>│ Server (DbEngine)           │  │
//! │  │ (Listener)  │    │  Handler    │    │ SELECT / FLUSHALL / rewrite │  │
//! │  └─────────────┘    └─────────────┘    └──────────────┬──────────────┘  │
//! │                                                       │ conn.db_index() │
//! │                                                       ▼                 │
//! │  ┌─────────────┐    ┌──────────────────────────────────────────────┐    │
//! │  │ Command     │───>│ Db 0 .. Db n-1                               │    │
//! │  │ Table       │    │  ┌────────┐ ┌────────┐ ┌────────┐ ┌────────┐ │    │
//! │  └─────────────┘    │  │Shard 0 │ │Shard 1 │ │Shard 2 │ │...2^k  │ │    │
//! │                     │  │RwLock  │ │RwLock  │ │RwLock  │ │shards  │ │    │
//! │                     │  └────────┘ └────────┘ └────────┘ └────────┘ │    │
//! │                     └──────┬───────────────────────────────▲───────┘    │
//! │                            │ writes                        │ expire     │
//! │                            ▼                               │            │
//! │  ┌──────────────────────────────────┐   ┌──────────────────┴─────────┐  │
//! │  │ Persister (AOF writer thread,    │   │ DelayScheduler             │  │
//! │  │ fsync ticker, rewrite)           │   │ (time wheel, tokio task)   │  │
//! │  └──────────────────────────────────┘   └────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use fluxkv::aof::{AofConfig, Persister};
//! use fluxkv::connection::{handle_connection, ConnectionStats};
//! use fluxkv::database::{DbEngine, Server, ServerConfig};
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServerConfig::default();
//!     let server = Arc::new(Server::new(config.clone()));
//!
//!     // Replay the log, then start appending to it
//!     let persister = Persister::new(
//!         AofConfig::default(),
//!         server.as_ref(),
//!         Server::tmp_db_maker(config),
//!     )?;
//!     server.bind_persister(Arc::new(persister));
//!
//!     let engine: Arc<dyn DbEngine> = server;
//!     let stats = Arc::new(ConnectionStats::new());
//!     let listener = TcpListener::bind("127.0.0.1:6379").await?;
//!
//!     loop {
//!         let (stream, addr) = listener.accept().await?;
//!         tokio::spawn(handle_connection(stream, addr, Arc::clone(&engine), Arc::clone(&stats)));
//!     }
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: sharded map, value types, time wheel
//! - [`database`]: keyspaces, command table, transactions, the multi-db server
//! - [`commands`]: per-type command executors
//! - [`aof`]: append-only persistence and rewrite
//! - [`protocol`]: RESP types, encoder and parser (wire and log format)
//! - [`connection`]: client session state and the TCP handler
//!
//! ## Design Highlights
//!
//! ### Lock Regions
//!
//! A command declares its write and read keys up front. The keyspace locks
//! the shards those keys map to, in ascending index order, and the whole
//! command runs inside that region. Two commands touching overlapping shards
//! can never deadlock, and a MULTI block is atomic because EXEC holds the
//! union of every queued command's shards.
//!
//! ### Lazy + Scheduled Expiry
//!
//! Keys with a deadline are removed in two ways:
//! 1. **Lazy**: a write region that touches an expired key deletes it first
//! 2. **Scheduled**: the time wheel fires a removal job at the deadline
//!
//! Both paths log `DEL key`, so a replayed log never resurrects an expired key.

pub mod aof;
pub mod commands;
pub mod connection;
pub mod database;
pub mod protocol;
pub mod storage;

// Re-export commonly used types for convenience
pub use aof::{AofConfig, AofError, FsyncPolicy, Persister};
pub use connection::{handle_connection, ClientState, Connection, ConnectionStats};
pub use database::{DbEngine, Server, ServerConfig};
pub use protocol::{CmdLine, ParseError, RespParser, RespValue};
pub use storage::{Entity, ShardedMap};

/// The default port FluxKV listens on (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// The default host FluxKV binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of FluxKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
