//! Per-client session state.
//!
//! The engine never sees sockets. It sees a [`Connection`]: the selected
//! database, plus the transaction bookkeeping for MULTI/EXEC/WATCH.

use crate::protocol::CmdLine;
use bytes::Bytes;
use std::collections::HashMap;

/// Watched `(database, key)` pairs and the version each had when WATCH ran.
pub type WatchedKeys = HashMap<(usize, Bytes), u32>;

/// Session state the engine reads and updates while executing commands.
pub trait Connection: Send {
    /// Human-readable identity, used in logs.
    fn name(&self) -> &str;

    fn in_multi_state(&self) -> bool;

    /// Enters or leaves MULTI. Leaving also drops the queue, the watched
    /// keys and any recorded queueing errors.
    fn set_multi_state(&mut self, state: bool);

    fn queued_cmd_lines(&self) -> &[CmdLine];

    fn enqueue_cmd(&mut self, cmd_line: CmdLine);

    fn clear_queued_cmds(&mut self);

    fn watching(&mut self) -> &mut WatchedKeys;

    fn add_tx_error(&mut self, err: String);

    fn tx_errors(&self) -> &[String];

    fn db_index(&self) -> usize;

    fn select_db(&mut self, index: usize);
}

/// The plain in-memory [`Connection`]: used for network clients and for
/// replaying the append-only log.
#[derive(Debug, Default)]
pub struct ClientState {
    name: String,
    multi: bool,
    queue: Vec<CmdLine>,
    watching: WatchedKeys,
    tx_errors: Vec<String>,
    db_index: usize,
}

impl ClientState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

impl Connection for ClientState {
    fn name(&self) -> &str {
        &self.name
    }

    fn in_multi_state(&self) -> bool {
        self.multi
    }

    fn set_multi_state(&mut self, state: bool) {
        if !state {
            self.watching.clear();
            self.queue.clear();
            self.tx_errors.clear();
        }
        self.multi = state;
    }

    fn queued_cmd_lines(&self) -> &[CmdLine] {
        &self.queue
    }

    fn enqueue_cmd(&mut self, cmd_line: CmdLine) {
        self.queue.push(cmd_line);
    }

    fn clear_queued_cmds(&mut self) {
        self.queue.clear();
    }

    fn watching(&mut self) -> &mut WatchedKeys {
        &mut self.watching
    }

    fn add_tx_error(&mut self, err: String) {
        self.tx_errors.push(err);
    }

    fn tx_errors(&self) -> &[String] {
        &self.tx_errors
    }

    fn db_index(&self) -> usize {
        self.db_index
    }

    fn select_db(&mut self, index: usize) {
        self.db_index = index;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::to_cmd_line;

    #[test]
    fn test_leaving_multi_resets_transaction_state() {
        let mut client = ClientState::new("test");
        client.set_multi_state(true);
        client.enqueue_cmd(to_cmd_line(&["SET", "a", "1"]));
        client.watching().insert((0, Bytes::from("a")), 3);
        client.add_tx_error("ERR unknown command 'foo'".to_string());
        client.select_db(2);

        client.set_multi_state(false);

        assert!(!client.in_multi_state());
        assert!(client.queued_cmd_lines().is_empty());
        assert!(client.watching().is_empty());
        assert!(client.tx_errors().is_empty());
        assert_eq!(client.db_index(), 2);
    }
}
