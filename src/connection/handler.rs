//! Connection Handler Module
//!
//! Drives one TCP client: reads RESP requests, runs them against the
//! engine with this client's [`ClientState`], and writes the replies back.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Client connects (TCP handshake)
//!        │
//!        ▼
//! 2. ConnectionHandler spawned with a fresh ClientState (db 0, no MULTI)
//!        │
//!        ▼
//! 3. ┌──────────────────────────────┐
//!    │  Read bytes from socket      │
//!    │  Parse RESP array            │◄──┐
//!    │  engine.exec(state, line)    │   │ pipelined requests are
//!    │  Buffer reply                │───┘ answered in one flush
//!    │  Flush                       │
//!    └──────────────────────────────┘
//!        │
//!        ▼
//! 4. QUIT / client disconnects / error
//!        │
//!        ▼
//! 5. Handler task ends; an open MULTI is dropped with the state
//! ```
//!
//! ## Buffer Management
//!
//! We use a BytesMut buffer to accumulate incoming data. TCP is a stream
//! protocol, so a read may hold part of a request or several of them.

use super::client::{ClientState, Connection};
use crate::database::DbEngine;
use crate::protocol::{ParseError, RespParser, RespValue};
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, error, info, trace, warn};

/// Maximum size for the read buffer (64 MB, enough for one large bulk value)
const MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Server-wide traffic counters shared by every connection task.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    accepted: AtomicU64,
    active: AtomicU64,
    commands: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

/// Point-in-time copy of [`ConnectionStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub active: u64,
    pub commands: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn opened(&self) {
        bump(&self.accepted, 1);
        bump(&self.active, 1);
    }

    fn closed(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            commands: self.commands.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

/// What the loop should do after answering a request.
enum Flow {
    Continue,
    Quit,
}

/// Handles a single client connection.
pub struct ConnectionHandler {
    stream: BufWriter<TcpStream>,

    /// Client's address (for logging)
    addr: SocketAddr,

    /// Incoming bytes not yet parsed
    buffer: BytesMut,

    /// Serialized replies waiting for the next flush
    out: Vec<u8>,

    engine: Arc<dyn DbEngine>,

    /// Selected database and transaction state
    state: ClientState,

    parser: RespParser,

    stats: Arc<ConnectionStats>,
}

impl ConnectionHandler {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        engine: Arc<dyn DbEngine>,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.opened();

        Self {
            stream: BufWriter::new(stream),
            addr,
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            out: Vec::with_capacity(INITIAL_BUFFER_SIZE),
            engine,
            state: ClientState::new(addr.to_string()),
            parser: RespParser::new(),
            stats,
        }
    }

    /// Runs the read-execute-respond loop until the client leaves.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, "Client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => info!(client = %self.addr, "Client disconnected gracefully"),
            Err(ConnectionError::Disconnected) => {
                debug!(client = %self.addr, "Client disconnected")
            }
            Err(ConnectionError::Io(io_err))
                if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                debug!(client = %self.addr, "Connection reset by client")
            }
            Err(e) => warn!(client = %self.addr, error = %e, "Connection error"),
        }

        if self.state.in_multi_state() {
            debug!(client = %self.addr, queued = self.state.queued_cmd_lines().len(), "Dropping open transaction");
        }
        self.stats.closed();
        result
    }

    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            let mut flow = Flow::Continue;
            while let Some(request) = self.try_parse_request()? {
                flow = self.handle_request(request);
                bump(&self.stats.commands, 1);
                if matches!(flow, Flow::Quit) {
                    break;
                }
            }

            self.flush_replies().await?;
            if matches!(flow, Flow::Quit) {
                return Ok(());
            }

            self.read_more_data().await?;
        }
    }

    /// Executes one request and buffers its reply.
    fn handle_request(&mut self, request: RespValue) -> Flow {
        let Some(cmd_line) = request.into_cmd_line() else {
            RespValue::error("ERR Protocol error: expected array of bulk strings")
                .serialize_into(&mut self.out);
            return Flow::Continue;
        };

        if cmd_line[0].eq_ignore_ascii_case(b"QUIT") {
            RespValue::ok().serialize_into(&mut self.out);
            return Flow::Quit;
        }

        let reply = self.engine.exec(&mut self.state, &cmd_line);
        reply.serialize_into(&mut self.out);
        Flow::Continue
    }

    /// Frames one request off the front of the read buffer, if complete.
    fn try_parse_request(&mut self) -> Result<Option<RespValue>, ConnectionError> {
        let parsed = self.parser.parse(&self.buffer).map_err(|e| {
            warn!(client = %self.addr, error = %e, "Malformed request");
            ConnectionError::Protocol(e)
        })?;

        Ok(parsed.map(|(request, used)| {
            self.buffer.advance(used);
            trace!(client = %self.addr, used, pending = self.buffer.len(), "Request framed");
            request
        }))
    }

    /// Pulls more bytes off the socket, refusing to grow past the limit.
    async fn read_more_data(&mut self) -> Result<(), ConnectionError> {
        if self.buffer.len() >= MAX_BUFFER_SIZE {
            error!(client = %self.addr, pending = self.buffer.len(), "Request exceeds buffer limit");
            return Err(ConnectionError::RequestTooLarge);
        }
        self.buffer.reserve(INITIAL_BUFFER_SIZE);

        match self.stream.get_mut().read_buf(&mut self.buffer).await? {
            0 if self.buffer.is_empty() => Err(ConnectionError::Disconnected),
            0 => Err(ConnectionError::TruncatedRequest),
            n => {
                bump(&self.stats.bytes_in, n as u64);
                Ok(())
            }
        }
    }

    async fn flush_replies(&mut self) -> Result<(), ConnectionError> {
        if self.out.is_empty() {
            return Ok(());
        }
        self.stream.write_all(&self.out).await?;
        self.stream.flush().await?;
        bump(&self.stats.bytes_out, self.out.len() as u64);
        trace!(client = %self.addr, bytes = self.out.len(), "Sent replies");
        self.out.clear();
        Ok(())
    }
}

/// Why a connection loop stopped.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ParseError),

    /// Peer closed the socket between requests
    #[error("Client disconnected")]
    Disconnected,

    /// Peer closed the socket halfway through a request
    #[error("Connection closed mid-request")]
    TruncatedRequest,

    #[error("Request exceeds the read buffer limit")]
    RequestTooLarge,
}

/// Creates a [`ConnectionHandler`] and runs it to completion.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    engine: Arc<dyn DbEngine>,
    stats: Arc<ConnectionStats>,
) {
    let handler = ConnectionHandler::new(stream, addr, engine, stats);
    if let Err(e) = handler.run().await {
        match e {
            ConnectionError::Disconnected => {}
            ConnectionError::Io(ref io_err)
                if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
            _ => {
                debug!(client = %addr, error = %e, "Connection ended with error");
            }
        }
    }
}
