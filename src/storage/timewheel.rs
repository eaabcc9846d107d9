//! Delay Scheduler (Time Wheel)
//!
//! Runs keyed one-shot jobs after a delay. Active expiration is built on
//! top of it: every key with a TTL owns exactly one pending job.
//!
//! ## Design
//!
//! ```text
//!                 cursor
//!                   │
//!   ┌────┬────┬────┬▼───┬────┬────┬─── ─ ─ ──┬────┐
//!   │ 0  │ 1  │ 2  │ 3  │ 4  │ 5  │   ...    │N-1 │   one slot per tick
//!   └────┴────┴─┬──┴────┴────┴────┴─── ─ ─ ──┴────┘
//!               │
//!               └─► { seq → Task { key, laps, job } }
//! ```
//!
//! A job delayed by `d` waits `t = max(1, ceil(d / interval))` ticks: it goes
//! into slot `(cursor + t) mod N` with `laps = (t - 1) / N` full rotations to
//! wait. Each tick advances the cursor and scans the slot under it: tasks
//! with laps left are decremented, the rest fire. An index from key to slot
//! makes cancel and replace O(1).
//!
//! The wheel itself is plain data owned by one Tokio task. Callers talk to
//! it over a channel, so scheduling never blocks and never takes a lock.
//! Jobs run on the blocking pool and a panicking job is logged, not fatal.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

/// A scheduled unit of work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Configuration for the delay scheduler.
#[derive(Debug, Clone)]
pub struct TimeWheelConfig {
    /// Time covered by one slot (default: 1s)
    pub interval: Duration,

    /// Number of slots in one rotation (default: 3600)
    pub slots: usize,
}

impl Default for TimeWheelConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            slots: 3600,
        }
    }
}

struct Task {
    key: String,
    laps: usize,
    job: Job,
}

/// The wheel's bookkeeping, independent of any runtime.
pub(crate) struct Wheel {
    interval: Duration,
    slots: Vec<BTreeMap<u64, Task>>,
    index: HashMap<String, (usize, u64)>,
    cursor: usize,
    next_seq: u64,
}

impl Wheel {
    pub(crate) fn new(config: &TimeWheelConfig) -> Self {
        let slot_count = config.slots.max(1);
        let interval = if config.interval.is_zero() {
            Duration::from_millis(1)
        } else {
            config.interval
        };

        Self {
            interval,
            slots: (0..slot_count).map(|_| BTreeMap::new()).collect(),
            index: HashMap::new(),
            cursor: 0,
            next_seq: 0,
        }
    }

    /// Slot and remaining laps for a job delayed by `delay`.
    fn position(&self, delay: Duration) -> (usize, usize) {
        let interval = self.interval.as_nanos();
        let ticks = delay.as_nanos().div_ceil(interval).max(1);
        let ticks = usize::try_from(ticks).unwrap_or(usize::MAX);
        let slot_count = self.slots.len();

        (
            (self.cursor + ticks % slot_count) % slot_count,
            (ticks - 1) / slot_count,
        )
    }

    pub(crate) fn schedule(&mut self, delay: Duration, key: String, job: Job) {
        self.cancel(&key);

        let (slot, laps) = self.position(delay);
        let seq = self.next_seq;
        self.next_seq += 1;

        self.index.insert(key.clone(), (slot, seq));
        self.slots[slot].insert(seq, Task { key, laps, job });
    }

    pub(crate) fn cancel(&mut self, key: &str) -> bool {
        match self.index.remove(key) {
            Some((slot, seq)) => self.slots[slot].remove(&seq).is_some(),
            None => false,
        }
    }

    /// Advances one tick, returning the tasks that are due.
    fn tick(&mut self) -> Vec<Task> {
        self.cursor = (self.cursor + 1) % self.slots.len();
        let slot = self.cursor;

        let pending = std::mem::take(&mut self.slots[slot]);
        let mut due = Vec::new();

        for (seq, mut task) in pending {
            if task.laps > 0 {
                task.laps -= 1;
                self.slots[slot].insert(seq, task);
            } else {
                self.index.remove(&task.key);
                due.push(task);
            }
        }
        due
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }
}

enum Request {
    Schedule {
        delay: Duration,
        key: String,
        job: Job,
    },
    Cancel(String),
}

/// A handle to the running delay scheduler.
///
/// When this handle is dropped, the wheel task is stopped and pending jobs
/// are discarded.
#[derive(Debug)]
pub struct DelayScheduler {
    requests: mpsc::UnboundedSender<Request>,
    shutdown_tx: watch::Sender<bool>,
}

impl DelayScheduler {
    /// Starts the wheel as a background task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: TimeWheelConfig) -> Self {
        let (requests, request_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let wheel = Wheel::new(&config);
        tokio::spawn(wheel_loop(wheel, request_rx, shutdown_rx));

        debug!(
            interval_ms = config.interval.as_millis() as u64,
            slots = config.slots,
            "Delay scheduler started"
        );

        Self {
            requests,
            shutdown_tx,
        }
    }

    /// Runs `job` after `delay`, replacing any pending job under `key`.
    pub fn schedule<F>(&self, delay: Duration, key: impl Into<String>, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _ = self.requests.send(Request::Schedule {
            delay,
            key: key.into(),
            job: Box::new(job),
        });
    }

    /// Runs `job` at wall-clock time `at`. A time in the past fires on the
    /// next tick.
    pub fn schedule_at<F>(&self, at: SystemTime, key: impl Into<String>, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let delay = at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        self.schedule(delay, key, job);
    }

    /// Drops the pending job under `key`, if any.
    pub fn cancel(&self, key: impl Into<String>) {
        let _ = self.requests.send(Request::Cancel(key.into()));
    }

    /// Stops the wheel. This is called automatically when the handle is dropped.
    pub fn stop(&self) {
        if !*self.shutdown_tx.borrow() {
            let _ = self.shutdown_tx.send(true);
            info!("Delay scheduler stopped");
        }
    }
}

impl Drop for DelayScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn wheel_loop(
    mut wheel: Wheel,
    mut requests: mpsc::UnboundedReceiver<Request>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + wheel.interval,
        wheel.interval,
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for task in wheel.tick() {
                    run_task(task);
                }
            }
            request = requests.recv() => match request {
                Some(Request::Schedule { delay, key, job }) => wheel.schedule(delay, key, job),
                Some(Request::Cancel(key)) => {
                    wheel.cancel(&key);
                }
                None => return,
            },
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!(pending = wheel.len(), "Delay scheduler received shutdown signal");
                    return;
                }
            }
        }
    }
}

fn run_task(task: Task) {
    let Task { key, job, .. } = task;
    tokio::task::spawn_blocking(move || {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(key = %key, panic = %message, "Scheduled job panicked");
        }
    });
}
