//! Append-Only File Persistence
//!
//! Every write a keyspace accepts is handed to the [`Persister`], which
//! appends it to the log in the same RESP array framing clients use. A
//! `SELECT <db>` record is written whenever the target database differs
//! from the previous record's.
//!
//! ## Write Path
//!
//! ```text
//!   executor ──► Db aof hook ──► Persister::save_cmd_line(db, line)
//!                                   │
//!              fsync = always ──────┼──► write + fsync on the calling thread
//!                                   │
//!              everysec / no ───────┴──► bounded queue (64k) ──► "aof-writer" thread
//!                                                                   │
//!                                                     write ◄───────┘
//!                                                       │
//!                                      everysec: tokio ticker fsyncs once a second
//! ```
//!
//! The queue is bounded: when it is full the caller blocks until the writer
//! catches up. Commands are never dropped while the log is open.
//!
//! The state mutex doubles as the pause lock for [`Persister::rewrite`]:
//! while it is held, nothing reaches the file.
//!
//! ## Startup Replay
//!
//! [`Persister::new`] with `load = true` replays the existing file through
//! [`DbEngine::exec`] before the persister is bound to the engine, so
//! replayed commands are not appended again. A truncated or corrupt tail is
//! logged and discarded.

pub mod marshal;
mod rewrite;

use crate::connection::ClientState;
use crate::database::DbEngine;
use crate::protocol::{encode_cmd_line_into, CmdLine, RespParser, RespValue};
use bytes::{Buf, BytesMut};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Capacity of the queue between command execution and the writer thread.
pub const AOF_QUEUE_SIZE: usize = 1 << 16;

const FSYNC_INTERVAL: Duration = Duration::from_secs(1);

const READ_CHUNK_SIZE: usize = 64 * 1024;

// ============================================================================
// Configuration
// ============================================================================

/// When the log is flushed to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsyncPolicy {
    /// fsync after every write, on the calling thread
    Always,
    /// fsync once per second from a background task
    #[default]
    EverySec,
    /// leave flushing to the operating system
    No,
}

impl FsyncPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsyncPolicy::Always => "always",
            FsyncPolicy::EverySec => "everysec",
            FsyncPolicy::No => "no",
        }
    }
}

impl FromStr for FsyncPolicy {
    type Err = AofError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "always" => Ok(FsyncPolicy::Always),
            "everysec" => Ok(FsyncPolicy::EverySec),
            "no" => Ok(FsyncPolicy::No),
            _ => Err(AofError::InvalidFsync(s.to_string())),
        }
    }
}

impl fmt::Display for FsyncPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings for a [`Persister`].
#[derive(Debug, Clone)]
pub struct AofConfig {
    /// Path of the log file (default: `appendonly.aof`)
    pub filename: PathBuf,

    /// Replay the existing file on startup (default: true)
    pub load: bool,

    pub fsync: FsyncPolicy,

    /// Scratch directory for rewrites. Defaults to the log's own directory
    /// so the final rename never crosses filesystems.
    pub tmp_dir: Option<PathBuf>,
}

impl Default for AofConfig {
    fn default() -> Self {
        Self {
            filename: PathBuf::from("appendonly.aof"),
            load: true,
            fsync: FsyncPolicy::default(),
            tmp_dir: None,
        }
    }
}

impl AofConfig {
    fn resolved_tmp_dir(&self) -> PathBuf {
        if let Some(dir) = &self.tmp_dir {
            return dir.clone();
        }
        match self.filename.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

/// Notified with every batch of command lines after it reaches the file.
pub trait Listener: Send + Sync {
    fn callback(&self, cmd_lines: &[CmdLine]);
}

/// Builds the throwaway engine a rewrite replays into.
pub type TmpDbMaker = Arc<dyn Fn() -> Arc<dyn DbEngine> + Send + Sync>;

/// Errors from the append-only file.
#[derive(Debug, Error)]
pub enum AofError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid appendfsync policy '{0}' (expected always, everysec or no)")]
    InvalidFsync(String),

    #[error("a rewrite is already in progress")]
    RewriteInProgress,

    #[error("append only file is closed")]
    Closed,

    #[error("failed to replace the append only file: {0}")]
    Persist(#[from] tempfile::PersistError),
}

// ============================================================================
// Shared state
// ============================================================================

struct Payload {
    db_index: usize,
    cmd_line: CmdLine,
}

struct AofState {
    file: Option<File>,
    /// Database of the last record written; `None` forces a SELECT.
    current_db: Option<usize>,
    listeners: Vec<Arc<dyn Listener>>,
    buffer: Vec<u8>,
}

impl AofState {
    fn append(&mut self, payload: &Payload) -> io::Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };

        let mut lines = Vec::with_capacity(2);
        if self.current_db != Some(payload.db_index) {
            lines.push(marshal::select_cmd(payload.db_index));
        }
        lines.push(payload.cmd_line.clone());

        self.buffer.clear();
        for line in &lines {
            encode_cmd_line_into(line, &mut self.buffer);
        }
        file.write_all(&self.buffer)?;
        self.current_db = Some(payload.db_index);

        for listener in &self.listeners {
            listener.callback(&lines);
        }
        Ok(())
    }

    fn sync(&self) -> io::Result<()> {
        match &self.file {
            Some(file) => file.sync_all(),
            None => Ok(()),
        }
    }
}

struct Shared {
    filename: PathBuf,
    fsync: FsyncPolicy,
    tmp_dir: PathBuf,
    state: Mutex<AofState>,
}

impl Shared {
    fn fsync(&self) {
        if let Err(e) = self.state.lock().unwrap().sync() {
            error!(error = %e, "AOF fsync failed");
        }
    }
}

// ============================================================================
// Persister
// ============================================================================

/// Owner of the append-only file.
pub struct Persister {
    shared: Arc<Shared>,
    sender: Mutex<Option<SyncSender<Payload>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    ticker: Mutex<Option<FsyncTicker>>,
    tmp_db_maker: TmpDbMaker,
    rewriting: AtomicBool,
}

impl fmt::Debug for Persister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persister")
            .field("filename", &self.shared.filename)
            .field("fsync", &self.shared.fsync)
            .finish()
    }
}

impl Persister {
    /// Replays the existing log into `engine` (when `config.load`), then
    /// opens the log for appending and starts the background writer.
    ///
    /// With [`FsyncPolicy::EverySec`] this must be called from within a
    /// Tokio runtime.
    pub fn new(
        config: AofConfig,
        engine: &dyn DbEngine,
        tmp_db_maker: TmpDbMaker,
    ) -> Result<Self, AofError> {
        if config.load && config.filename.exists() {
            let replayed = replay(&config.filename, engine, None)?;
            info!(
                file = %config.filename.display(),
                commands = replayed.commands,
                "Append only file loaded"
            );

            // Cut the bad tail so new records do not land after it
            let file = OpenOptions::new().write(true).open(&config.filename)?;
            let len = file.metadata()?.len();
            if replayed.valid_len < len {
                warn!(
                    discarded_bytes = len - replayed.valid_len,
                    "Truncating append only file to its last complete record"
                );
                file.set_len(replayed.valid_len)?;
            }
        }

        let file = open_append(&config.filename)?;
        let shared = Arc::new(Shared {
            filename: config.filename.clone(),
            fsync: config.fsync,
            tmp_dir: config.resolved_tmp_dir(),
            state: Mutex::new(AofState {
                file: Some(file),
                current_db: None,
                listeners: Vec::new(),
                buffer: Vec::new(),
            }),
        });

        let (sender, receiver) = sync_channel(AOF_QUEUE_SIZE);
        let writer = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("aof-writer".to_string())
                .spawn(move || writer_loop(shared, receiver))?
        };

        let ticker = match config.fsync {
            FsyncPolicy::EverySec => Some(FsyncTicker::start(Arc::clone(&shared))),
            _ => None,
        };

        info!(
            file = %config.filename.display(),
            fsync = %config.fsync,
            "Append only file opened"
        );

        Ok(Self {
            shared,
            sender: Mutex::new(Some(sender)),
            writer: Mutex::new(Some(writer)),
            ticker: Mutex::new(ticker),
            tmp_db_maker,
            rewriting: AtomicBool::new(false),
        })
    }

    pub fn filename(&self) -> &Path {
        &self.shared.filename
    }

    pub fn fsync_policy(&self) -> FsyncPolicy {
        self.shared.fsync
    }

    /// Appends one write command executed against database `db_index`.
    ///
    /// Blocks while the queue is full. After [`Persister::close`] the
    /// command is dropped.
    pub fn save_cmd_line(&self, db_index: usize, cmd_line: CmdLine) {
        let payload = Payload { db_index, cmd_line };

        if self.shared.fsync == FsyncPolicy::Always {
            let mut state = self.shared.state.lock().unwrap();
            if let Err(e) = state.append(&payload).and_then(|_| state.sync()) {
                error!(db = db_index, error = %e, "AOF append failed");
            }
            return;
        }

        let sender = self.sender.lock().unwrap().clone();
        match sender {
            Some(sender) => {
                if sender.send(payload).is_err() {
                    error!(db = db_index, "AOF writer has stopped, command not persisted");
                }
            }
            None => debug!(db = db_index, "Append only file closed, command not persisted"),
        }
    }

    /// Flushes the log to stable storage now.
    pub fn fsync(&self) {
        self.shared.fsync();
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        self.shared.state.lock().unwrap().listeners.push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn Listener>) {
        self.shared
            .state
            .lock()
            .unwrap()
            .listeners
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Drains the queue, stops the ticker, fsyncs and closes the file.
    ///
    /// Idempotent.
    pub fn close(&self) {
        if let Some(ticker) = self.ticker.lock().unwrap().take() {
            ticker.stop();
        }

        // Dropping the last sender ends the writer loop once the queue is empty
        drop(self.sender.lock().unwrap().take());
        if let Some(writer) = self.writer.lock().unwrap().take() {
            if writer.join().is_err() {
                error!("AOF writer thread panicked");
            }
        }

        let mut state = self.shared.state.lock().unwrap();
        if let Some(file) = state.file.take() {
            if let Err(e) = file.sync_all() {
                error!(error = %e, "Final AOF fsync failed");
            }
            info!(file = %self.shared.filename.display(), "Append only file closed");
        }
    }
}

impl Drop for Persister {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn writer_loop(shared: Arc<Shared>, receiver: Receiver<Payload>) {
    for payload in receiver {
        let mut state = shared.state.lock().unwrap();
        if let Err(e) = state.append(&payload) {
            error!(db = payload.db_index, error = %e, "AOF append failed");
        }
    }
    debug!("AOF writer drained");
}

/// Outcome of [`replay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Replayed {
    pub commands: usize,
    /// Length of the prefix made of complete, well-formed records
    pub valid_len: u64,
}

/// Replays the log at `path` into `engine`, reading at most `limit` bytes.
///
/// A record cut off at the end, or anything that does not parse as a
/// command, ends the replay.
pub(crate) fn replay(
    path: &Path,
    engine: &dyn DbEngine,
    limit: Option<u64>,
) -> Result<Replayed, AofError> {
    let mut reader = File::open(path)?.take(limit.unwrap_or(u64::MAX));
    let mut parser = RespParser::new();
    let mut conn = ClientState::new("aof-replay");
    let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    let mut offset = 0u64;
    let mut replayed = 0;

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        buf.extend_from_slice(&chunk[..n]);

        loop {
            match parser.parse_command(&buf) {
                Ok(Some((cmd_line, consumed))) => {
                    buf.advance(consumed);
                    offset += consumed as u64;
                    if let RespValue::Error(message) = engine.exec(&mut conn, &cmd_line) {
                        debug!(offset, error = %message, "Replayed command failed");
                    }
                    replayed += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        offset,
                        error = %e,
                        "Unparsable record in append only file, discarding the rest"
                    );
                    return Ok(Replayed {
                        commands: replayed,
                        valid_len: offset,
                    });
                }
            }
        }
    }

    if !buf.is_empty() {
        warn!(
            offset,
            bytes = buf.len(),
            "Truncated record at end of append only file discarded"
        );
    }
    Ok(Replayed {
        commands: replayed,
        valid_len: offset,
    })
}

// ============================================================================
// everysec ticker
// ============================================================================

/// Background task that fsyncs the log once per second.
///
/// Stopped by [`FsyncTicker::stop`] or on drop.
struct FsyncTicker {
    shutdown_tx: watch::Sender<bool>,
}

impl FsyncTicker {
    fn start(shared: Arc<Shared>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(fsync_loop(shared, shutdown_rx));
        debug!("AOF fsync ticker started");
        Self { shutdown_tx }
    }

    fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for FsyncTicker {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn fsync_loop(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + FSYNC_INTERVAL,
        FSYNC_INTERVAL,
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let shared = Arc::clone(&shared);
                if let Err(e) = tokio::task::spawn_blocking(move || shared.fsync()).await {
                    error!(error = %e, "AOF fsync task failed");
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("AOF fsync ticker received shutdown signal");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::database::testing::{cmd, test_config, test_server};
    use crate::database::Server;
    use crate::protocol::encode_cmd_line;
    use bytes::Bytes;
    use tempfile::TempDir;

    pub(crate) fn aof_config(dir: &TempDir, fsync: FsyncPolicy) -> AofConfig {
        AofConfig {
            filename: dir.path().join("appendonly.aof"),
            load: true,
            fsync,
            tmp_dir: None,
        }
    }

    /// A server with a persister bound to it, replaying whatever is on disk.
    pub(crate) fn open_server(config: AofConfig) -> (Arc<Server>, Arc<Persister>) {
        let server = test_server();
        let persister = Arc::new(
            Persister::new(config, server.as_ref(), Server::tmp_db_maker(test_config())).unwrap(),
        );
        server.bind_persister(Arc::clone(&persister));
        (server, persister)
    }

    #[test]
    fn test_fsync_policy_parse() {
        assert_eq!("always".parse::<FsyncPolicy>().unwrap(), FsyncPolicy::Always);
        assert_eq!("EverySec".parse::<FsyncPolicy>().unwrap(), FsyncPolicy::EverySec);
        assert_eq!("NO".parse::<FsyncPolicy>().unwrap(), FsyncPolicy::No);
        assert!(matches!(
            "sometimes".parse::<FsyncPolicy>(),
            Err(AofError::InvalidFsync(_))
        ));
        assert_eq!(FsyncPolicy::EverySec.to_string(), "everysec");
    }

    #[test]
    fn test_tmp_dir_defaults_to_log_dir() {
        let config = AofConfig {
            filename: PathBuf::from("/data/redis/appendonly.aof"),
            ..AofConfig::default()
        };
        assert_eq!(config.resolved_tmp_dir(), PathBuf::from("/data/redis"));
        assert_eq!(AofConfig::default().resolved_tmp_dir(), PathBuf::from("."));
    }

    #[tokio::test]
    async fn test_write_then_replay() {
        let dir = TempDir::new().unwrap();
        let (server, _persister) = open_server(aof_config(&dir, FsyncPolicy::Always));
        let mut conn = ClientState::new("test");

        server.exec(&mut conn, &cmd(&["SET", "a", "1"]));
        server.exec(&mut conn, &cmd(&["RPUSH", "list", "x", "y"]));
        server.exec(&mut conn, &cmd(&["SELECT", "2"]));
        server.exec(&mut conn, &cmd(&["HSET", "h", "f", "v"]));
        server.exec(&mut conn, &cmd(&["SET", "ttl", "v", "EX", "100"]));
        server.exec(&mut conn, &cmd(&["GET", "a"]));
        server.close();

        let (restored, _persister) = open_server(aof_config(&dir, FsyncPolicy::Always));
        let mut conn = ClientState::new("check");
        assert_eq!(
            restored.exec(&mut conn, &cmd(&["GET", "a"])),
            RespValue::bulk_string("1")
        );
        assert_eq!(
            restored.exec(&mut conn, &cmd(&["LLEN", "list"])),
            RespValue::integer(2)
        );
        restored.exec(&mut conn, &cmd(&["SELECT", "2"]));
        assert_eq!(
            restored.exec(&mut conn, &cmd(&["HGET", "h", "f"])),
            RespValue::bulk_string("v")
        );
        let ttl = restored.exec(&mut conn, &cmd(&["TTL", "ttl"])).as_integer().unwrap();
        assert!((90..=100).contains(&ttl));
        assert_eq!(restored.get_db_size(0), (2, 0));
        restored.close();
    }

    #[tokio::test]
    async fn test_log_format() {
        let dir = TempDir::new().unwrap();
        let config = aof_config(&dir, FsyncPolicy::No);
        let filename = config.filename.clone();
        let (server, _persister) = open_server(config);
        let mut conn = ClientState::new("test");

        server.exec(&mut conn, &cmd(&["SET", "a", "1"]));
        server.exec(&mut conn, &cmd(&["DEL", "a"]));
        server.exec(&mut conn, &cmd(&["DEL", "missing"]));
        server.close();

        let mut expected = Vec::new();
        expected.extend(encode_cmd_line(&cmd(&["SELECT", "0"])));
        expected.extend(encode_cmd_line(&cmd(&["SET", "a", "1"])));
        expected.extend(encode_cmd_line(&cmd(&["DEL", "a"])));
        assert_eq!(std::fs::read(&filename).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_flushall_logs_each_nonempty_database() {
        let dir = TempDir::new().unwrap();
        let config = aof_config(&dir, FsyncPolicy::Always);
        let filename = config.filename.clone();
        let (server, _persister) = open_server(config);
        let mut conn = ClientState::new("test");

        server.exec(&mut conn, &cmd(&["SET", "a", "1"]));
        server.exec(&mut conn, &cmd(&["SELECT", "3"]));
        server.exec(&mut conn, &cmd(&["SET", "b", "2"]));
        server.exec(&mut conn, &cmd(&["FLUSHALL"]));
        server.exec(&mut conn, &cmd(&["SET", "c", "3"]));
        server.close();

        let mut expected = Vec::new();
        for line in [
            &["SELECT", "0"][..],
            &["SET", "a", "1"],
            &["SELECT", "3"],
            &["SET", "b", "2"],
            &["SELECT", "0"],
            &["FLUSHDB"],
            &["SELECT", "3"],
            &["FLUSHDB"],
            &["SET", "c", "3"],
        ] {
            expected.extend(encode_cmd_line(&cmd(line)));
        }
        assert_eq!(std::fs::read(&filename).unwrap(), expected);

        let (restored, _persister) = open_server(aof_config(&dir, FsyncPolicy::No));
        assert_eq!(restored.get_db_size(0), (0, 0));
        assert_eq!(restored.get_db_size(3), (1, 0));
        restored.close();
    }

    #[tokio::test]
    async fn test_everysec_drains_on_close() {
        let dir = TempDir::new().unwrap();
        let (server, _persister) = open_server(aof_config(&dir, FsyncPolicy::EverySec));
        let mut conn = ClientState::new("test");
        for i in 0..1000 {
            server.exec(&mut conn, &cmd(&["INCR", "counter"]));
            server.exec(&mut conn, &cmd(&["SET", format!("key:{}", i).as_str(), "v"]));
        }
        server.close();

        let (restored, _persister) = open_server(aof_config(&dir, FsyncPolicy::No));
        let mut conn = ClientState::new("check");
        assert_eq!(
            restored.exec(&mut conn, &cmd(&["GET", "counter"])),
            RespValue::bulk_string("1000")
        );
        assert_eq!(restored.get_db_size(0).0, 1001);
        restored.close();
    }

    #[tokio::test]
    async fn test_truncated_tail_is_discarded() {
        let dir = TempDir::new().unwrap();
        let config = aof_config(&dir, FsyncPolicy::No);

        let mut contents = Vec::new();
        contents.extend(encode_cmd_line(&cmd(&["SET", "a", "1"])));
        contents.extend(encode_cmd_line(&cmd(&["SET", "b", "2"])));
        let partial = encode_cmd_line(&cmd(&["SET", "c", "3"]));
        contents.extend_from_slice(&partial[..partial.len() - 4]);
        std::fs::write(&config.filename, &contents).unwrap();

        let filename = config.filename.clone();
        let (server, _persister) = open_server(config.clone());
        let mut conn = ClientState::new("check");
        assert_eq!(
            server.exec(&mut conn, &cmd(&["GET", "b"])),
            RespValue::bulk_string("2")
        );
        assert_eq!(server.exec(&mut conn, &cmd(&["GET", "c"])), RespValue::null());

        // New records follow the last complete one
        server.exec(&mut conn, &cmd(&["SET", "d", "4"]));
        server.close();
        let written = std::fs::read(&filename).unwrap();
        assert!(written.starts_with(&contents[..contents.len() - (partial.len() - 4)]));

        let (restored, _persister) = open_server(config);
        let mut conn = ClientState::new("check");
        assert_eq!(
            restored.exec(&mut conn, &cmd(&["GET", "d"])),
            RespValue::bulk_string("4")
        );
        restored.close();
    }

    #[tokio::test]
    async fn test_garbage_tail_is_discarded() {
        let dir = TempDir::new().unwrap();
        let config = aof_config(&dir, FsyncPolicy::No);

        let mut contents = encode_cmd_line(&cmd(&["SET", "a", "1"]));
        contents.extend_from_slice(b"this is not resp\r\n");
        std::fs::write(&config.filename, &contents).unwrap();

        let server = test_server();
        let first = encode_cmd_line(&cmd(&["SET", "a", "1"])).len() as u64;
        let replayed = replay(&config.filename, server.as_ref(), None).unwrap();
        assert_eq!(
            replayed,
            Replayed {
                commands: 1,
                valid_len: first
            }
        );
        assert_eq!(server.get_db_size(0), (1, 0));
    }

    #[tokio::test]
    async fn test_replay_limit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("limited.aof");
        let first = encode_cmd_line(&cmd(&["SET", "a", "1"]));
        let mut contents = first.clone();
        contents.extend(encode_cmd_line(&cmd(&["SET", "b", "2"])));
        std::fs::write(&path, &contents).unwrap();

        let server = test_server();
        let replayed = replay(&path, server.as_ref(), Some(first.len() as u64)).unwrap();
        assert_eq!(replayed.commands, 1);
        assert_eq!(server.get_db_size(0), (1, 0));
    }

    struct Recorder(Mutex<Vec<CmdLine>>);

    impl Listener for Recorder {
        fn callback(&self, cmd_lines: &[CmdLine]) {
            self.0.lock().unwrap().extend_from_slice(cmd_lines);
        }
    }

    #[tokio::test]
    async fn test_listeners() {
        let dir = TempDir::new().unwrap();
        let (server, persister) = open_server(aof_config(&dir, FsyncPolicy::Always));
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let listener: Arc<dyn Listener> = recorder.clone();
        persister.add_listener(Arc::clone(&listener));

        let mut conn = ClientState::new("test");
        server.exec(&mut conn, &cmd(&["SET", "a", "1"]));
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![cmd(&["SELECT", "0"]), cmd(&["SET", "a", "1"])]
        );

        persister.remove_listener(&listener);
        server.exec(&mut conn, &cmd(&["SET", "b", "2"]));
        assert_eq!(recorder.0.lock().unwrap().len(), 2);
        server.close();
    }

    #[tokio::test]
    async fn test_expiry_is_logged_as_delete() {
        let dir = TempDir::new().unwrap();
        let (server, _persister) = open_server(aof_config(&dir, FsyncPolicy::Always));
        let mut conn = ClientState::new("test");

        server.exec(&mut conn, &cmd(&["SET", "k", "v", "PX", "20"]));
        tokio::time::sleep(Duration::from_millis(100)).await;
        server.close();

        let contents = std::fs::read(dir.path().join("appendonly.aof")).unwrap();
        let del = encode_cmd_line(&[Bytes::from("DEL"), Bytes::from("k")]);
        assert!(contents.ends_with(&del));
    }

    #[tokio::test]
    async fn test_save_after_close_is_dropped() {
        let dir = TempDir::new().unwrap();
        let config = aof_config(&dir, FsyncPolicy::No);
        let filename = config.filename.clone();
        let (_server, persister) = open_server(config);

        persister.close();
        persister.save_cmd_line(0, cmd(&["SET", "a", "1"]));
        persister.close();
        assert!(std::fs::read(&filename).unwrap().is_empty());
    }
}
