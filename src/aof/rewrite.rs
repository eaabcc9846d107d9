//! Log Rewrite (compaction)
//!
//! Replaces the log with the shortest command sequence that rebuilds the
//! current data, without stopping writers for more than two short pauses.
//!
//! ```text
//!   1. start    [pause] fsync, boundary = file length, remember current db
//!   2. build             replay [0, boundary) into a throwaway engine,
//!                        dump it as SELECT / SET / RPUSH / ... / PEXPIREAT
//!                        into a temp file
//!   3. finish   [pause] append SELECT <db at boundary> + bytes [boundary, EOF)
//!   4. swap     [pause] fsync temp, rename over the log, reopen for append
//! ```
//!
//! Until the rename succeeds the original log is untouched, so a failed or
//! interrupted rewrite loses nothing.

use super::marshal::{entity_to_cmd, expire_cmd, select_cmd};
use super::{open_append, replay, AofError, Persister};
use crate::database::DbEngine;
use crate::protocol::encode_cmd_line_into;
use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::sync::atomic::Ordering;
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Buffered snapshot bytes are flushed to the temp file past this size.
const SNAPSHOT_FLUSH_THRESHOLD: usize = 64 * 1024;

/// State carried from the first pause to the second.
pub(crate) struct RewriteCtx {
    tmp_file: NamedTempFile,
    /// Length of the log when the rewrite started
    file_size: u64,
    /// Database of the last record before the boundary
    db_index: Option<usize>,
}

impl Persister {
    /// Compacts the log. Only one rewrite runs at a time.
    pub fn rewrite(&self) -> Result<(), AofError> {
        if self.rewriting.swap(true, Ordering::AcqRel) {
            return Err(AofError::RewriteInProgress);
        }
        let result = self.run_rewrite();
        self.rewriting.store(false, Ordering::Release);
        result
    }

    fn run_rewrite(&self) -> Result<(), AofError> {
        info!(file = %self.shared.filename.display(), "AOF rewrite started");
        let mut ctx = self.start_rewrite()?;
        self.build_snapshot(&mut ctx)?;
        self.finish_rewrite(ctx)?;
        info!(file = %self.shared.filename.display(), "AOF rewrite finished");
        Ok(())
    }

    /// Phase 1: fix the boundary.
    pub(crate) fn start_rewrite(&self) -> Result<RewriteCtx, AofError> {
        let state = self.shared.state.lock().unwrap();
        let file = state.file.as_ref().ok_or(AofError::Closed)?;
        file.sync_all()?;
        let file_size = file.metadata()?.len();

        let tmp_file = tempfile::Builder::new()
            .prefix("rewrite-")
            .suffix(".aof")
            .tempfile_in(&self.shared.tmp_dir)?;

        debug!(boundary = file_size, tmp = %tmp_file.path().display(), "AOF rewrite boundary fixed");
        Ok(RewriteCtx {
            tmp_file,
            file_size,
            db_index: state.current_db,
        })
    }

    /// Phase 2: rebuild the data up to the boundary and dump it. Runs
    /// without the pause lock.
    pub(crate) fn build_snapshot(&self, ctx: &mut RewriteCtx) -> Result<(), AofError> {
        let engine = (self.tmp_db_maker)();
        let result = replay(&self.shared.filename, engine.as_ref(), Some(ctx.file_size))
            .and_then(|_| write_snapshot(engine.as_ref(), ctx.tmp_file.as_file_mut()));
        engine.close();
        result
    }

    /// Phases 3 and 4: copy the tail written since the boundary, then swap.
    pub(crate) fn finish_rewrite(&self, ctx: RewriteCtx) -> Result<(), AofError> {
        let RewriteCtx {
            mut tmp_file,
            file_size,
            db_index,
        } = ctx;

        let mut state = self.shared.state.lock().unwrap();
        if state.file.is_none() {
            return Err(AofError::Closed);
        }

        let mut src = File::open(&self.shared.filename)?;
        src.seek(SeekFrom::Start(file_size))?;

        let out = tmp_file.as_file_mut();
        if let Some(index) = db_index {
            let mut select = Vec::new();
            encode_cmd_line_into(&select_cmd(index), &mut select);
            out.write_all(&select)?;
        }
        let tail_bytes = io::copy(&mut src, out)?;
        out.sync_all()?;

        tmp_file.persist(&self.shared.filename)?;
        state.file = Some(open_append(&self.shared.filename)?);

        debug!(tail_bytes, "AOF rewrite tail copied");
        Ok(())
    }
}

/// Writes `SELECT` plus one reconstructing command (and a `PEXPIREAT` where
/// a deadline exists) for every live key of every non-empty database.
fn write_snapshot(engine: &dyn DbEngine, out: &mut impl Write) -> Result<(), AofError> {
    let mut buf = Vec::with_capacity(SNAPSHOT_FLUSH_THRESHOLD);

    for index in 0..engine.db_count() {
        if engine.get_db_size(index).0 == 0 {
            continue;
        }
        encode_cmd_line_into(&select_cmd(index), &mut buf);

        let mut failed: Option<io::Error> = None;
        engine.for_each(index, &mut |key, entity, deadline| {
            encode_cmd_line_into(&entity_to_cmd(key, entity), &mut buf);
            if let Some(at) = deadline {
                encode_cmd_line_into(&expire_cmd(key, at), &mut buf);
            }
            if buf.len() >= SNAPSHOT_FLUSH_THRESHOLD {
                if let Err(e) = out.write_all(&buf) {
                    failed = Some(e);
                    return false;
                }
                buf.clear();
            }
            true
        });
        if let Some(e) = failed {
            return Err(e.into());
        }
    }

    out.write_all(&buf)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::tests::{aof_config, open_server};
    use super::super::FsyncPolicy;
    use super::*;
    use crate::connection::ClientState;
    use crate::database::testing::cmd;
    use crate::protocol::{encode_cmd_line, RespValue};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_rewrite_compacts_and_preserves_state() {
        let dir = TempDir::new().unwrap();
        let config = aof_config(&dir, FsyncPolicy::Always);
        let filename = config.filename.clone();
        let (server, persister) = open_server(config.clone());
        let mut conn = ClientState::new("test");

        for _ in 0..100 {
            server.exec(&mut conn, &cmd(&["INCR", "counter"]));
        }
        server.exec(&mut conn, &cmd(&["RPUSH", "list", "a", "b"]));
        server.exec(&mut conn, &cmd(&["LPOP", "list"]));
        server.exec(&mut conn, &cmd(&["SET", "gone", "x"]));
        server.exec(&mut conn, &cmd(&["DEL", "gone"]));
        server.exec(&mut conn, &cmd(&["SELECT", "1"]));
        server.exec(&mut conn, &cmd(&["ZADD", "z", "1.5", "m"]));
        server.exec(&mut conn, &cmd(&["SET", "ttl", "v", "EX", "100"]));

        let before = std::fs::metadata(&filename).unwrap().len();
        persister.rewrite().unwrap();
        let after = std::fs::metadata(&filename).unwrap().len();
        assert!(after < before, "rewrite should shrink the log: {} -> {}", before, after);

        // Writes after the swap land in the new file
        server.exec(&mut conn, &cmd(&["SADD", "s", "x"]));
        server.close();

        let (restored, _persister) = open_server(config);
        let mut conn = ClientState::new("check");
        assert_eq!(
            restored.exec(&mut conn, &cmd(&["GET", "counter"])),
            RespValue::bulk_string("100")
        );
        assert_eq!(
            restored.exec(&mut conn, &cmd(&["LRANGE", "list", "0", "-1"])),
            RespValue::array(vec![RespValue::bulk_string("b")])
        );
        assert_eq!(restored.get_db_size(0), (2, 0));

        restored.exec(&mut conn, &cmd(&["SELECT", "1"]));
        assert_eq!(
            restored.exec(&mut conn, &cmd(&["ZSCORE", "z", "m"])),
            RespValue::bulk_string("1.5")
        );
        let ttl = restored.exec(&mut conn, &cmd(&["TTL", "ttl"])).as_integer().unwrap();
        assert!((90..=100).contains(&ttl));
        assert_eq!(
            restored.exec(&mut conn, &cmd(&["SISMEMBER", "s", "x"])),
            RespValue::integer(1)
        );
        restored.close();
    }

    #[tokio::test]
    async fn test_writes_during_rewrite_survive() {
        let dir = TempDir::new().unwrap();
        let config = aof_config(&dir, FsyncPolicy::Always);
        let (server, persister) = open_server(config.clone());
        let mut conn = ClientState::new("test");

        server.exec(&mut conn, &cmd(&["SET", "a", "1"]));
        server.exec(&mut conn, &cmd(&["SELECT", "3"]));
        server.exec(&mut conn, &cmd(&["SET", "b", "1"]));

        let mut ctx = persister.start_rewrite().unwrap();

        // Lands after the boundary, in database 3 with no SELECT of its own
        server.exec(&mut conn, &cmd(&["SET", "c", "1"]));
        persister.build_snapshot(&mut ctx).unwrap();
        server.exec(&mut conn, &cmd(&["INCR", "b"]));
        persister.finish_rewrite(ctx).unwrap();
        server.close();

        let (restored, _persister) = open_server(config);
        let mut conn = ClientState::new("check");
        assert_eq!(
            restored.exec(&mut conn, &cmd(&["GET", "a"])),
            RespValue::bulk_string("1")
        );
        restored.exec(&mut conn, &cmd(&["SELECT", "3"]));
        assert_eq!(
            restored.exec(&mut conn, &cmd(&["GET", "b"])),
            RespValue::bulk_string("2")
        );
        assert_eq!(
            restored.exec(&mut conn, &cmd(&["GET", "c"])),
            RespValue::bulk_string("1")
        );
        assert_eq!(restored.get_db_size(0), (1, 0));
        assert_eq!(restored.get_db_size(3), (2, 0));
        restored.close();
    }

    #[tokio::test]
    async fn test_rewrite_through_command() {
        let dir = TempDir::new().unwrap();
        let config = aof_config(&dir, FsyncPolicy::Always);
        let filename = config.filename.clone();
        let (server, _persister) = open_server(config);
        let mut conn = ClientState::new("test");

        server.exec(&mut conn, &cmd(&["SET", "k", "v1"]));
        server.exec(&mut conn, &cmd(&["SET", "k", "v2"]));
        assert_eq!(
            server.exec(&mut conn, &cmd(&["REWRITEAOF"])),
            RespValue::ok()
        );

        let mut expected = Vec::new();
        expected.extend(encode_cmd_line(&cmd(&["SELECT", "0"])));
        expected.extend(encode_cmd_line(&cmd(&["SET", "k", "v2"])));
        expected.extend(encode_cmd_line(&cmd(&["SELECT", "0"])));
        assert_eq!(std::fs::read(&filename).unwrap(), expected);
        server.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rewrite_command_on_multi_thread_runtime() {
        let dir = TempDir::new().unwrap();
        let (server, _persister) = open_server(aof_config(&dir, FsyncPolicy::No));
        let mut conn = ClientState::new("test");

        for i in 0..50 {
            server.exec(&mut conn, &cmd(&["INCR", "n"]));
            server.exec(&mut conn, &cmd(&["SET", format!("k{}", i).as_str(), "v"]));
        }
        assert_eq!(
            server.exec(&mut conn, &cmd(&["REWRITEAOF"])),
            RespValue::ok()
        );
        server.exec(&mut conn, &cmd(&["INCR", "n"]));
        server.close();

        let (restored, _persister) = open_server(aof_config(&dir, FsyncPolicy::No));
        let mut conn = ClientState::new("check");
        assert_eq!(
            restored.exec(&mut conn, &cmd(&["GET", "n"])),
            RespValue::bulk_string("51")
        );
        assert_eq!(restored.get_db_size(0).0, 51);
        restored.close();
    }

    #[tokio::test]
    async fn test_rewrite_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let (_server, persister) = open_server(aof_config(&dir, FsyncPolicy::No));
        persister.close();
        assert!(matches!(persister.rewrite(), Err(AofError::Closed)));
    }

    #[tokio::test]
    async fn test_rewrite_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let (server, persister) = open_server(aof_config(&dir, FsyncPolicy::No));

        persister.rewriting.store(true, Ordering::Release);
        assert!(matches!(persister.rewrite(), Err(AofError::RewriteInProgress)));
        persister.rewriting.store(false, Ordering::Release);
        assert!(persister.rewrite().is_ok());
        server.close();
    }
}
