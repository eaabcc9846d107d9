//! Command Execution Layer
//!
//! - [`registry`]: the command table (executor, key extraction, undo, arity)
//! - [`db`]: one keyspace and its lock regions
//! - [`transaction`]: MULTI/EXEC/WATCH and rollback
//! - [`server`]: the multi-database engine behind the [`DbEngine`] trait
//!
//! ## Example
//!
//! ```
//! use fluxkv::connection::ClientState;
//! use fluxkv::database::{DbEngine, Server, ServerConfig};
//! use fluxkv::protocol::{to_cmd_line, RespValue};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let server = Server::new(ServerConfig::default());
//! let mut conn = ClientState::new("doc");
//!
//! server.exec(&mut conn, &to_cmd_line(&["SET", "name", "Ariz"]));
//! let reply = server.exec(&mut conn, &to_cmd_line(&["GET", "name"]));
//! assert_eq!(reply, RespValue::bulk_string("Ariz"));
//! # }
//! ```

pub mod db;
pub mod registry;
pub mod server;
pub mod transaction;

pub use db::{AofHook, Db, LockedDb};
pub use registry::{Command, CommandFlags, CommandTable, KeySpec};
pub use server::{DbEngine, EntityVisitor, Server, ServerConfig};
