//! Connection Module
//!
//! Client sessions as the engine sees them, and the TCP handler that
//! feeds them.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TCP Listener                            │
//! │                    (main.rs)                                │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │
//!                        │ accept()
//!                        ▼
//!           ┌────────────────────────┐
//!           │   For each client...   │
//!           │   tokio::spawn(...)    │
//!           └───────────┬────────────┘
//!                       │
//!                       ▼
//!           ┌────────────────────────┐
//!           │  ConnectionHandler     │
//!           │  ┌──────────────────┐  │
//!           │  │ ClientState      │  │  selected db, MULTI queue,
//!           │  │ (dyn Connection) │  │  watched keys
//!           │  └────────┬─────────┘  │
//!           └───────────┼────────────┘
//!                       ▼
//!              Arc<dyn DbEngine>::exec
//! ```
//!
//! The AOF loader drives the engine with a [`ClientState`] too, so replayed
//! `SELECT` records move it between databases exactly as a client would.
//!
//! ## Example
//!
//! ```ignore
//! use fluxkv::connection::{handle_connection, ConnectionStats};
//! use fluxkv::database::{DbEngine, Server, ServerConfig};
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! let engine: Arc<dyn DbEngine> = Arc::new(Server::new(ServerConfig::default()));
//! let stats = Arc::new(ConnectionStats::new());
//! let listener = TcpListener::bind("127.0.0.1:6379").await?;
//!
//! loop {
//!     let (stream, addr) = listener.accept().await?;
//!     tokio::spawn(handle_connection(stream, addr, Arc::clone(&engine), Arc::clone(&stats)));
//! }
//! ```

pub mod client;
pub mod handler;

pub use client::{ClientState, Connection, WatchedKeys};
pub use handler::{handle_connection, ConnectionError, ConnectionHandler, ConnectionStats, StatsSnapshot};
